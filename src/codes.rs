#![forbid(unsafe_code)]

use log::*;

use crate::bits::{BitBuf, InputCursor};
use crate::error::CodecError;
use crate::huffman::{Entry, Table, OP_END, OP_EXTRA, OP_LINK};
use crate::window::Window;

////////////////////////////////////////////////////////////////////////////////

/// Fast-path entry margins: 258 is the maximum match length, 10 input bytes
/// cover the worst-case bit consumption of one full symbol (15+5+15+13 bits)
/// without per-step refill checks.
const FAST_MIN_SPACE: usize = 258;
const FAST_MIN_INPUT: usize = 10;

/// Outcome of running the symbol decoder until it can't continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodesStatus {
    /// Mid-symbol, input exhausted; all partial progress is saved.
    NeedInput,
    /// The window has no room for the next byte; flush and come back.
    WindowFull,
    /// The end-of-block symbol was consumed.
    BlockDone,
}

#[derive(Debug, Clone, Copy)]
enum CodeMode {
    /// Decoding the next literal/length symbol.
    Len,
    /// Have a length base, reading its extra bits.
    LenExt { base: u16, extra: u8 },
    /// Have a complete length, decoding the distance symbol.
    Dist { len: usize },
    /// Have a distance base, reading its extra bits.
    DistExt { len: usize, base: u16, extra: u8 },
    /// Copying a match, possibly across several window flushes.
    Copy { len: usize, dist: usize },
    /// End-of-block seen.
    End,
    Bad(&'static str),
}

/// Literal/length/distance decode loop for one block's code tables.
///
/// The tables live in the block arena; this struct only holds offsets, so it
/// stays trivially copyable across suspend points.
pub struct CodeState {
    mode: CodeMode,
    litlen: Table,
    dist: Table,
}

impl CodeState {
    pub fn new(litlen: Table, dist: Table) -> Self {
        Self {
            mode: CodeMode::Len,
            litlen,
            dist,
        }
    }

    /// Placeholder until a block installs real tables.
    pub fn idle() -> Self {
        Self::new(Table::default(), Table::default())
    }

    pub fn run(
        &mut self,
        bits: &mut BitBuf,
        input: &mut InputCursor,
        window: &mut Window,
        arena: &[Entry],
    ) -> Result<CodesStatus, CodecError> {
        loop {
            match self.mode {
                CodeMode::Len => {
                    if window.space() == 0 {
                        return Ok(CodesStatus::WindowFull);
                    }
                    if input.remaining() >= FAST_MIN_INPUT && window.space() >= FAST_MIN_SPACE {
                        self.fast(bits, input, window, arena)?;
                        continue;
                    }
                    let here = match read_code(bits, input, arena, self.litlen) {
                        Some(entry) => entry,
                        None => return Ok(CodesStatus::NeedInput),
                    };
                    if here.op == 0 {
                        trace!("literal {:#04x}", here.val);
                        window.push_byte(here.val as u8);
                    } else if here.op & OP_EXTRA != 0 {
                        self.mode = CodeMode::LenExt {
                            base: here.val,
                            extra: here.op & 15,
                        };
                    } else if here.op == OP_END {
                        trace!("end of block");
                        self.mode = CodeMode::End;
                    } else {
                        self.mode = CodeMode::Bad("invalid literal/length code");
                    }
                }
                CodeMode::LenExt { base, extra } => {
                    if !bits.need(extra as u32, input) {
                        return Ok(CodesStatus::NeedInput);
                    }
                    let len = base as usize + bits.take(extra as u32) as usize;
                    self.mode = CodeMode::Dist { len };
                }
                CodeMode::Dist { len } => {
                    let here = match read_code(bits, input, arena, self.dist) {
                        Some(entry) => entry,
                        None => return Ok(CodesStatus::NeedInput),
                    };
                    if here.op & OP_EXTRA != 0 {
                        self.mode = CodeMode::DistExt {
                            len,
                            base: here.val,
                            extra: here.op & 15,
                        };
                    } else {
                        self.mode = CodeMode::Bad("invalid distance code");
                    }
                }
                CodeMode::DistExt { len, base, extra } => {
                    if !bits.need(extra as u32, input) {
                        return Ok(CodesStatus::NeedInput);
                    }
                    let dist = base as usize + bits.take(extra as u32) as usize;
                    if dist > window.have() {
                        self.mode = CodeMode::Bad("invalid distance too far back");
                    } else {
                        trace!("match len {} dist {}", len, dist);
                        self.mode = CodeMode::Copy { len, dist };
                    }
                }
                CodeMode::Copy { len, dist } => {
                    let copied = window.copy_match(dist, len);
                    if copied < len {
                        self.mode = CodeMode::Copy {
                            len: len - copied,
                            dist,
                        };
                        return Ok(CodesStatus::WindowFull);
                    }
                    self.mode = CodeMode::Len;
                }
                CodeMode::End => return Ok(CodesStatus::BlockDone),
                CodeMode::Bad(msg) => return Err(CodecError::Data(msg)),
            }
        }
    }

    /// Inlined decode-and-copy loop. Entered only with the margins above, so
    /// bit refills never have to check for input exhaustion and match copies
    /// never split across a window flush. Semantically identical to the
    /// general path; it bows out as soon as either margin is violated.
    fn fast(
        &mut self,
        bits: &mut BitBuf,
        input: &mut InputCursor,
        window: &mut Window,
        arena: &[Entry],
    ) -> Result<(), CodecError> {
        loop {
            if input.remaining() < FAST_MIN_INPUT || window.space() < FAST_MIN_SPACE {
                return Ok(());
            }

            refill(bits, input, 15);
            let mut here = arena[self.litlen.offset + bits.peek(self.litlen.root) as usize];
            if here.op & OP_LINK != 0 && here.op & OP_END == 0 {
                let idx =
                    (bits.peek(here.bits as u32 + (here.op & 15) as u32) >> here.bits) as usize;
                bits.drop_bits(here.bits as u32);
                here = arena[here.val as usize + idx];
            }
            bits.drop_bits(here.bits as u32);

            if here.op == 0 {
                window.push_byte(here.val as u8);
                continue;
            }
            if here.op == OP_END {
                self.mode = CodeMode::End;
                return Ok(());
            }
            if here.op & OP_EXTRA == 0 {
                self.mode = CodeMode::Bad("invalid literal/length code");
                return Err(CodecError::Data("invalid literal/length code"));
            }

            let extra = (here.op & 15) as u32;
            refill(bits, input, extra);
            let len = here.val as usize + bits.take(extra) as usize;

            refill(bits, input, 15);
            let mut dist_ent = arena[self.dist.offset + bits.peek(self.dist.root) as usize];
            if dist_ent.op & OP_LINK != 0 && dist_ent.op & OP_END == 0 {
                let idx = (bits.peek(dist_ent.bits as u32 + (dist_ent.op & 15) as u32)
                    >> dist_ent.bits) as usize;
                bits.drop_bits(dist_ent.bits as u32);
                dist_ent = arena[dist_ent.val as usize + idx];
            }
            bits.drop_bits(dist_ent.bits as u32);

            if dist_ent.op & OP_EXTRA == 0 {
                self.mode = CodeMode::Bad("invalid distance code");
                return Err(CodecError::Data("invalid distance code"));
            }
            let dextra = (dist_ent.op & 15) as u32;
            refill(bits, input, dextra);
            let dist = dist_ent.val as usize + bits.take(dextra) as usize;
            if dist > window.have() {
                self.mode = CodeMode::Bad("invalid distance too far back");
                return Err(CodecError::Data("invalid distance too far back"));
            }

            // Space margin guarantees the whole match fits.
            let copied = window.copy_match(dist, len);
            debug_assert_eq!(copied, len);
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Decode one complete code, following a sub-table link if present, and drop
/// its bits. Returns None with no bits consumed beyond accumulation when the
/// input runs out mid-code: the retried call picks the decode back up at the
/// same bit position.
pub fn read_code(
    bits: &mut BitBuf,
    input: &mut InputCursor,
    arena: &[Entry],
    table: Table,
) -> Option<Entry> {
    let mut here;
    loop {
        here = arena[table.offset + bits.peek(table.root) as usize];
        if (here.bits as u32) <= bits.available() {
            break;
        }
        if !bits.need(bits.available() + 8, input) {
            return None;
        }
    }
    if here.op & OP_LINK != 0 && here.op & OP_END == 0 {
        let link = here;
        let sub_bits = (link.op & 15) as u32;
        loop {
            let idx = (bits.peek(link.bits as u32 + sub_bits) >> link.bits) as usize;
            here = arena[link.val as usize + idx];
            if link.bits as u32 + here.bits as u32 <= bits.available() {
                break;
            }
            if !bits.need(bits.available() + 8, input) {
                return None;
            }
        }
        bits.drop_bits(link.bits as u32);
    }
    bits.drop_bits(here.bits as u32);
    Some(here)
}

fn refill(bits: &mut BitBuf, input: &mut InputCursor, n: u32) {
    while bits.available() < n {
        match input.next() {
            Some(byte) => bits.load_byte(byte),
            None => break,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
