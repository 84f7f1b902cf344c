#![forbid(unsafe_code)]

use log::*;

use crate::bits::{BitBuf, InputCursor, OutputCursor};
use crate::checksum::Checksum;
use crate::codes::{read_code, CodeState, CodesStatus};
use crate::error::CodecError;
use crate::huffman::{
    self, build, Entry, Table, TableError, TableKind, ROOT_CLEN, ROOT_DIST, ROOT_LITLEN,
};
use crate::window::Window;

////////////////////////////////////////////////////////////////////////////////

/// Transmission order of the code-length-code lengths (RFC 1951 §3.2.7).
pub(crate) const CLEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

const MAX_LITLEN_SYMBOLS: usize = 286;
const MAX_DIST_SYMBOLS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Input exhausted; state saved, call again with more bytes.
    NeedInput,
    /// Pending window bytes could not all be committed; call again with
    /// output space.
    OutputFull,
    /// Final block decoded and window fully drained.
    StreamEnd,
}

#[derive(Debug, Clone, Copy)]
enum BlockMode {
    /// Reading the 3-bit block header.
    Type,
    /// Reading a stored block's LEN/NLEN fields.
    Lens,
    /// Copying stored bytes through the window.
    Stored,
    /// Reading the 14-bit dynamic table header.
    Table,
    /// Reading the code-length-code lengths.
    BTree,
    /// Decoding the literal/length and distance code lengths.
    DTree,
    /// Delegating to the symbol decoder.
    Codes,
    /// Final block done, draining the window.
    Dry,
    Done,
    Bad(&'static str),
}

/// The DEFLATE block state machine.
///
/// Owns the sliding window and the Huffman table arena; the bit accumulator
/// is lent in by the envelope layer so that header/trailer parsing and block
/// parsing share one byte-consumption model.
pub struct BlockState {
    mode: BlockMode,
    last: bool,
    window: Window,
    arena: Vec<Entry>,
    codes: CodeState,
    // Dynamic header progress.
    hlit: usize,
    hdist: usize,
    hclen: usize,
    index: usize,
    clen_lens: [u16; 19],
    clen: Table,
    lens: Vec<u16>,
    // Stored block progress.
    stored_left: usize,
}

impl BlockState {
    pub fn new(window_bits: u32) -> Self {
        Self {
            mode: BlockMode::Type,
            last: false,
            window: Window::new(window_bits),
            arena: Vec::with_capacity(huffman::ENOUGH),
            codes: CodeState::idle(),
            hlit: 0,
            hdist: 0,
            hclen: 0,
            index: 0,
            clen_lens: [0; 19],
            clen: Table::default(),
            lens: Vec::with_capacity(MAX_LITLEN_SYMBOLS + MAX_DIST_SYMBOLS),
            stored_left: 0,
        }
    }

    pub fn window_mut(&mut self) -> &mut Window {
        &mut self.window
    }

    pub fn reset(&mut self) {
        self.mode = BlockMode::Type;
        self.last = false;
        self.window.reset();
        self.arena.clear();
        self.codes = CodeState::idle();
        self.stored_left = 0;
        self.index = 0;
    }

    /// Re-arm at block-type state after a sync scan. Window contents and the
    /// last-block flag from before the error are deliberately left alone;
    /// data between the error and the marker is lost by contract.
    pub fn resync(&mut self) {
        self.mode = BlockMode::Type;
        self.last = false;
        self.stored_left = 0;
    }

    pub fn process(
        &mut self,
        bits: &mut BitBuf,
        input: &mut InputCursor,
        output: &mut OutputCursor,
        check: &mut Checksum,
    ) -> Result<BlockStatus, CodecError> {
        loop {
            match self.mode {
                BlockMode::Type => {
                    if self.last {
                        self.mode = BlockMode::Dry;
                        continue;
                    }
                    if !bits.need(3, input) {
                        return self.suspend(output, check);
                    }
                    self.last = bits.take(1) == 1;
                    let kind = bits.take(2);
                    debug!("block type {} (last: {})", kind, self.last);
                    match kind {
                        0 => {
                            bits.align();
                            self.mode = BlockMode::Lens;
                        }
                        1 => {
                            let fixed = huffman::fixed_tables();
                            self.arena.clear();
                            self.arena.extend_from_slice(&fixed.arena);
                            self.codes = CodeState::new(fixed.litlen, fixed.dist);
                            self.mode = BlockMode::Codes;
                        }
                        2 => self.mode = BlockMode::Table,
                        _ => return self.fail("invalid block type"),
                    }
                }
                BlockMode::Lens => {
                    if !bits.need(32, input) {
                        return self.suspend(output, check);
                    }
                    let fields = bits.take(32);
                    let len = fields & 0xffff;
                    let nlen = fields >> 16;
                    if len != !nlen & 0xffff {
                        return self.fail("invalid stored block lengths");
                    }
                    debug!("stored block of {} bytes", len);
                    self.stored_left = len as usize;
                    self.mode = if len > 0 {
                        BlockMode::Stored
                    } else {
                        BlockMode::Type
                    };
                }
                BlockMode::Stored => {
                    while self.stored_left > 0 {
                        if self.window.space() == 0 {
                            self.window.flush(output, check);
                            if self.window.space() == 0 {
                                return Ok(BlockStatus::OutputFull);
                            }
                        }
                        // Whole bytes may still sit in the accumulator from a
                        // previous over-read; drain them first.
                        if bits.available() >= 8 {
                            self.window.push_byte(bits.take(8) as u8);
                            self.stored_left -= 1;
                            continue;
                        }
                        if input.remaining() == 0 {
                            return self.suspend(output, check);
                        }
                        let run = self
                            .stored_left
                            .min(self.window.space())
                            .min(input.remaining());
                        self.window.push_slice(input.take(run));
                        self.stored_left -= run;
                    }
                    self.mode = BlockMode::Type;
                }
                BlockMode::Table => {
                    if !bits.need(14, input) {
                        return self.suspend(output, check);
                    }
                    self.hlit = bits.take(5) as usize + 257;
                    self.hdist = bits.take(5) as usize + 1;
                    self.hclen = bits.take(4) as usize + 4;
                    debug!(
                        "dynamic header: hlit {} hdist {} hclen {}",
                        self.hlit, self.hdist, self.hclen
                    );
                    if self.hlit > MAX_LITLEN_SYMBOLS || self.hdist > MAX_DIST_SYMBOLS {
                        return self.fail("too many length or distance symbols");
                    }
                    self.clen_lens = [0; 19];
                    self.index = 0;
                    self.mode = BlockMode::BTree;
                }
                BlockMode::BTree => {
                    while self.index < self.hclen {
                        if !bits.need(3, input) {
                            return self.suspend(output, check);
                        }
                        self.clen_lens[CLEN_ORDER[self.index]] = bits.take(3) as u16;
                        self.index += 1;
                    }
                    self.arena.clear();
                    self.clen = match build(
                        TableKind::CodeLengths,
                        &self.clen_lens,
                        ROOT_CLEN,
                        &mut self.arena,
                    ) {
                        Ok(table) => table,
                        Err(_) => return self.fail("invalid code lengths set"),
                    };
                    self.lens.clear();
                    self.mode = BlockMode::DTree;
                }
                BlockMode::DTree => {
                    let expected = self.hlit + self.hdist;
                    while self.lens.len() < expected {
                        // Peek the symbol but consume nothing until its extra
                        // bits are also available, so a suspension mid-repeat
                        // loses no state.
                        let mut here;
                        loop {
                            here = self.arena[self.clen.offset + bits.peek(self.clen.root) as usize];
                            if (here.bits as u32) <= bits.available() {
                                break;
                            }
                            if !bits.need(bits.available() + 8, input) {
                                return self.suspend(output, check);
                            }
                        }
                        match here.val {
                            0..=15 => {
                                bits.drop_bits(here.bits as u32);
                                self.lens.push(here.val);
                            }
                            16 => {
                                if !bits.need(here.bits as u32 + 2, input) {
                                    return self.suspend(output, check);
                                }
                                bits.drop_bits(here.bits as u32);
                                let reps = 3 + bits.take(2) as usize;
                                let prev = match self.lens.last() {
                                    Some(&len) => len,
                                    None => return self.fail("invalid bit length repeat"),
                                };
                                if self.lens.len() + reps > expected {
                                    return self.fail("invalid bit length repeat");
                                }
                                self.lens.resize(self.lens.len() + reps, prev);
                            }
                            17 | 18 => {
                                let extra = if here.val == 17 { 3 } else { 7 };
                                let base = if here.val == 17 { 3 } else { 11 };
                                if !bits.need(here.bits as u32 + extra, input) {
                                    return self.suspend(output, check);
                                }
                                bits.drop_bits(here.bits as u32);
                                let reps = base + bits.take(extra) as usize;
                                if self.lens.len() + reps > expected {
                                    return self.fail("invalid bit length repeat");
                                }
                                self.lens.resize(self.lens.len() + reps, 0);
                            }
                            _ => return self.fail("invalid bit length repeat"),
                        }
                    }
                    if self.lens[256] == 0 {
                        return self.fail("invalid code -- missing end-of-block");
                    }
                    self.arena.clear();
                    let litlen = match build(
                        TableKind::LitLen,
                        &self.lens[..self.hlit],
                        ROOT_LITLEN,
                        &mut self.arena,
                    ) {
                        Ok(table) => table,
                        Err(_) => return self.fail("invalid literal/lengths set"),
                    };
                    let dist = match build(
                        TableKind::Dist,
                        &self.lens[self.hlit..self.hlit + self.hdist],
                        ROOT_DIST,
                        &mut self.arena,
                    ) {
                        Ok(table) => table,
                        Err(TableError::Oversubscribed) => {
                            return self.fail("invalid distances set")
                        }
                        // The one-symbol degenerate distance tree already
                        // passed the builder; any other incompleteness fails.
                        Err(TableError::Incomplete) => return self.fail("invalid distances set"),
                    };
                    self.codes = CodeState::new(litlen, dist);
                    self.mode = BlockMode::Codes;
                }
                BlockMode::Codes => {
                    let BlockState {
                        ref mut codes,
                        ref mut window,
                        ref arena,
                        ..
                    } = *self;
                    match codes.run(bits, input, window, arena) {
                        Ok(CodesStatus::NeedInput) => return self.suspend(output, check),
                        Ok(CodesStatus::WindowFull) => {
                            self.window.flush(output, check);
                            if self.window.space() == 0 {
                                return Ok(BlockStatus::OutputFull);
                            }
                        }
                        Ok(CodesStatus::BlockDone) => self.mode = BlockMode::Type,
                        Err(err) => {
                            if let CodecError::Data(msg) = err {
                                self.mode = BlockMode::Bad(msg);
                            }
                            self.window.flush(output, check);
                            return Err(err);
                        }
                    }
                }
                BlockMode::Dry => {
                    self.window.flush(output, check);
                    if self.window.pending() > 0 {
                        return Ok(BlockStatus::OutputFull);
                    }
                    self.mode = BlockMode::Done;
                }
                BlockMode::Done => return Ok(BlockStatus::StreamEnd),
                BlockMode::Bad(msg) => return Err(CodecError::Data(msg)),
            }
        }
    }

    fn suspend(
        &mut self,
        output: &mut OutputCursor,
        check: &mut Checksum,
    ) -> Result<BlockStatus, CodecError> {
        self.window.flush(output, check);
        Ok(BlockStatus::NeedInput)
    }

    fn fail(&mut self, msg: &'static str) -> Result<BlockStatus, CodecError> {
        warn!("block decode failed: {}", msg);
        self.mode = BlockMode::Bad(msg);
        Err(CodecError::Data(msg))
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn run_blocks(data: &[u8], out: &mut [u8]) -> Result<(BlockStatus, usize), CodecError> {
        let mut state = BlockState::new(15);
        let mut bits = BitBuf::new();
        let mut input = InputCursor::new(data);
        let mut output = OutputCursor::new(out);
        let mut check = Checksum::None;
        let status = state.process(&mut bits, &mut input, &mut output, &mut check)?;
        Ok((status, output.produced()))
    }

    #[test]
    fn stored_block_roundtrip() {
        // bfinal=1, type=00, align, LEN=5/NLEN, then the raw bytes.
        let mut data = vec![0b0000_0001, 0x05, 0x00, 0xfa, 0xff];
        data.extend_from_slice(b"hello");

        let mut out = [0u8; 16];
        let (status, produced) = run_blocks(&data, &mut out).unwrap();
        assert_eq!(status, BlockStatus::StreamEnd);
        assert_eq!(&out[..produced], b"hello");
    }

    #[test]
    fn stored_length_check_enforced() {
        let data = vec![0b0000_0001, 0x05, 0x00, 0x00, 0x00];
        let mut out = [0u8; 16];
        assert_eq!(
            run_blocks(&data, &mut out),
            Err(CodecError::Data("invalid stored block lengths"))
        );
    }

    #[test]
    fn reserved_block_type_rejected() {
        // bfinal=1, type=11.
        let data = [0b0000_0111];
        let mut out = [0u8; 16];
        assert_eq!(
            run_blocks(&data, &mut out),
            Err(CodecError::Data("invalid block type"))
        );
    }

    #[test]
    fn fixed_block_end_of_block_only() {
        // bfinal=1, type=01, then the 7-bit end-of-block code: 0x03 0x00.
        let data = [0x03, 0x00];
        let mut out = [0u8; 16];
        let (status, produced) = run_blocks(&data, &mut out).unwrap();
        assert_eq!(status, BlockStatus::StreamEnd);
        assert_eq!(produced, 0);
    }

    #[test]
    fn error_state_is_sticky() {
        let mut state = BlockState::new(15);
        let mut bits = BitBuf::new();
        let mut check = Checksum::None;
        let mut out = [0u8; 16];

        let mut input = InputCursor::new(&[0b0000_0111]);
        let mut output = OutputCursor::new(&mut out);
        assert!(state
            .process(&mut bits, &mut input, &mut output, &mut check)
            .is_err());

        // Perfectly valid data afterwards still reports the stored error.
        let mut input = InputCursor::new(&[0x03, 0x00]);
        let mut output = OutputCursor::new(&mut out);
        assert_eq!(
            state.process(&mut bits, &mut input, &mut output, &mut check),
            Err(CodecError::Data("invalid block type"))
        );
    }
}
