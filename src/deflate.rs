#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::blocks::CLEN_ORDER;
use crate::checksum::{Adler32, Checksum, CRC32};
use crate::huffman::{DBASE, DEXT, LBASE, LEXT};
use crate::inflate::Wrapper;

////////////////////////////////////////////////////////////////////////////////

const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 258;
const MAX_DIST: usize = 32768;
const HASH_BITS: u32 = 15;
const MAX_CHAIN: usize = 128;

const LITLEN_SYMBOLS: usize = 286;
const DIST_SYMBOLS: usize = 30;
const EOB: usize = 256;

////////////////////////////////////////////////////////////////////////////////

/// LSB-first bit accumulator over a growing byte buffer.
pub(crate) struct BitWriter {
    out: Vec<u8>,
    hold: u64,
    count: u32,
}

impl BitWriter {
    pub(crate) fn new() -> Self {
        Self {
            out: Vec::new(),
            hold: 0,
            count: 0,
        }
    }

    pub(crate) fn write_bits(&mut self, value: u32, count: u32) {
        debug_assert!(count <= 16);
        self.hold |= (value as u64 & ((1u64 << count) - 1)) << self.count;
        self.count += count;
        while self.count >= 8 {
            self.out.push(self.hold as u8);
            self.hold >>= 8;
            self.count -= 8;
        }
    }

    /// Pad with zero bits to the next byte boundary.
    pub(crate) fn align(&mut self) {
        if self.count > 0 {
            self.out.push(self.hold as u8);
            self.hold = 0;
            self.count = 0;
        }
    }

    /// Whole bytes only; the writer must be aligned.
    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(self.count, 0);
        self.out.extend_from_slice(bytes);
    }

    pub(crate) fn into_bytes(mut self) -> Vec<u8> {
        self.align();
        self.out
    }
}

////////////////////////////////////////////////////////////////////////////////

/// How each flushed segment is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Uncompressed blocks of at most 65535 bytes.
    Stored,
    /// The fixed RFC 1951 tables, no header cost.
    Fixed,
    /// Per-block Huffman tables built from symbol frequencies.
    Dynamic,
}

#[derive(Debug, Clone, Copy)]
enum Token {
    Literal(u8),
    Match { len: u16, dist: u16 },
}

/// Streaming compressor. Input accumulates across `write` calls and is
/// encoded as one segment per `sync_flush` or at `finish`; matches never
/// cross a flush boundary.
pub struct Deflater {
    strategy: Strategy,
    wrapper: Wrapper,
    bits: BitWriter,
    check: Checksum,
    pending: Vec<u8>,
    total_in: u64,
    finished: bool,
}

impl Deflater {
    pub fn new(wrapper: Wrapper, strategy: Strategy) -> Self {
        let mut bits = BitWriter::new();
        match wrapper {
            Wrapper::Raw => {}
            Wrapper::Zlib => {
                let cmf = 0x78u8;
                let mut flg = 2u8 << 6;
                let rem = (((cmf as u32) << 8) | flg as u32) % 31;
                if rem != 0 {
                    flg += (31 - rem) as u8;
                }
                bits.write_bytes(&[cmf, flg]);
            }
            Wrapper::Gzip => {
                bits.write_bytes(&[0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 255]);
            }
        }
        let check = match wrapper {
            Wrapper::Raw => Checksum::None,
            Wrapper::Zlib => Checksum::Adler(Adler32::new()),
            Wrapper::Gzip => Checksum::Crc(CRC32.digest()),
        };
        Self {
            strategy,
            wrapper,
            bits,
            check,
            pending: Vec::new(),
            total_in: 0,
            finished: false,
        }
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn write(&mut self, data: &[u8]) {
        debug_assert!(!self.finished);
        self.check.update(data);
        self.total_in += data.len() as u64;
        self.pending.extend_from_slice(data);
    }

    /// Encode everything buffered so far and append an empty stored block,
    /// leaving the output byte-aligned with a trailing `00 00 FF FF` marker.
    pub fn sync_flush(&mut self) {
        self.flush_pending(false);
        self.bits.write_bits(0, 3);
        self.bits.align();
        self.bits.write_bytes(&[0x00, 0x00, 0xff, 0xff]);
    }

    /// Encode the rest as the final block and append the wrapper trailer.
    pub fn finish(mut self) -> Vec<u8> {
        self.flush_pending(true);
        self.bits.align();
        match self.wrapper {
            Wrapper::Raw => {}
            Wrapper::Zlib => {
                self.bits.write_bytes(&self.check.value().to_be_bytes());
            }
            Wrapper::Gzip => {
                self.bits.write_bytes(&self.check.value().to_le_bytes());
                self.bits.write_bytes(&(self.total_in as u32).to_le_bytes());
            }
        }
        self.finished = true;
        self.bits.into_bytes()
    }

    fn flush_pending(&mut self, last: bool) {
        let data = std::mem::take(&mut self.pending);
        match self.strategy {
            Strategy::Stored => self.emit_stored(&data, last),
            Strategy::Fixed => {
                if !data.is_empty() || last {
                    self.emit_coded(&data, last, false);
                }
            }
            Strategy::Dynamic => {
                if !data.is_empty() || last {
                    self.emit_coded(&data, last, true);
                }
            }
        }
    }

    fn emit_stored(&mut self, data: &[u8], last: bool) {
        if data.is_empty() {
            if last {
                self.bits.write_bits(1, 1);
                self.bits.write_bits(0b00, 2);
                self.bits.align();
                self.bits.write_bytes(&[0x00, 0x00, 0xff, 0xff]);
            }
            return;
        }
        let mut chunks = data.chunks(0xffff).peekable();
        while let Some(chunk) = chunks.next() {
            let is_last = chunks.peek().is_none();
            self.bits.write_bits((last && is_last) as u32, 1);
            self.bits.write_bits(0b00, 2);
            self.bits.align();
            let len = chunk.len() as u16;
            self.bits.write_bytes(&len.to_le_bytes());
            self.bits.write_bytes(&(!len).to_le_bytes());
            self.bits.write_bytes(chunk);
        }
    }

    fn emit_coded(&mut self, data: &[u8], last: bool, dynamic: bool) {
        let tokens = tokenize(data);
        self.bits.write_bits(last as u32, 1);
        self.bits.write_bits(if dynamic { 0b10 } else { 0b01 }, 2);

        let (lit_lens, dist_lens) = if dynamic {
            let (lit_lens, dist_lens) = dynamic_lengths(&tokens);
            self.emit_dynamic_header(&lit_lens, &dist_lens);
            (lit_lens, dist_lens)
        } else {
            (fixed_litlen_lengths(), fixed_dist_lengths())
        };
        let lit_codes = assign_codes(&lit_lens);
        let dist_codes = assign_codes(&dist_lens);

        for token in &tokens {
            match *token {
                Token::Literal(byte) => {
                    self.put_code(&lit_codes, &lit_lens, byte as usize);
                }
                Token::Match { len, dist } => {
                    let (sym, ebits, eval) = length_code(len);
                    self.put_code(&lit_codes, &lit_lens, sym);
                    self.bits.write_bits(eval, ebits);
                    let (dsym, debits, deval) = dist_code(dist);
                    self.put_code(&dist_codes, &dist_lens, dsym);
                    self.bits.write_bits(deval, debits);
                }
            }
        }
        self.put_code(&lit_codes, &lit_lens, EOB);
    }

    fn put_code(&mut self, codes: &[u16], lens: &[u8], sym: usize) {
        debug_assert!(lens[sym] > 0);
        self.bits.write_bits(codes[sym] as u32, lens[sym] as u32);
    }

    fn emit_dynamic_header(&mut self, lit_lens: &[u8], dist_lens: &[u8]) {
        let hlit = trimmed_len(lit_lens, 257);
        let hdist = trimmed_len(dist_lens, 1);

        let mut clen_tokens = rle_lengths(&lit_lens[..hlit]);
        clen_tokens.extend(rle_lengths(&dist_lens[..hdist]));

        let mut clen_freqs = [0u32; 19];
        for token in &clen_tokens {
            clen_freqs[token.sym as usize] += 1;
        }
        let clen_lens = build_lengths(&clen_freqs, 7);
        let clen_codes = assign_codes(&clen_lens);

        let mut hclen = 19;
        while hclen > 4 && clen_lens[CLEN_ORDER[hclen - 1]] == 0 {
            hclen -= 1;
        }

        self.bits.write_bits((hlit - 257) as u32, 5);
        self.bits.write_bits((hdist - 1) as u32, 5);
        self.bits.write_bits((hclen - 4) as u32, 4);
        for &sym in CLEN_ORDER.iter().take(hclen) {
            self.bits.write_bits(clen_lens[sym] as u32, 3);
        }
        for token in &clen_tokens {
            let sym = token.sym as usize;
            self.bits
                .write_bits(clen_codes[sym] as u32, clen_lens[sym] as u32);
            self.bits.write_bits(token.val as u32, token.extra as u32);
        }
    }
}

/// One-shot convenience over [`Deflater`].
pub fn compress(data: &[u8], wrapper: Wrapper, strategy: Strategy) -> Vec<u8> {
    let mut deflater = Deflater::new(wrapper, strategy);
    deflater.write(data);
    deflater.finish()
}

////////////////////////////////////////////////////////////////////////////////

fn hash(window: &[u8]) -> usize {
    let key = (window[0] as u32) << 16 | (window[1] as u32) << 8 | window[2] as u32;
    (key.wrapping_mul(0x9e37_79b1) >> (32 - HASH_BITS)) as usize
}

fn match_len(data: &[u8], cand: usize, pos: usize) -> usize {
    let limit = MAX_MATCH.min(data.len() - pos);
    let mut n = 0;
    while n < limit && data[cand + n] == data[pos + n] {
        n += 1;
    }
    n
}

/// Greedy hash-chain matcher over a single segment.
fn tokenize(data: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::new();
    if data.is_empty() {
        return tokens;
    }
    let mut head = vec![usize::MAX; 1 << HASH_BITS];
    let mut prev = vec![usize::MAX; data.len()];

    let mut pos = 0;
    while pos < data.len() {
        let mut best_len = 0;
        let mut best_dist = 0;
        if pos + MIN_MATCH <= data.len() {
            let mut cand = head[hash(&data[pos..])];
            let mut chain = 0;
            while cand != usize::MAX && chain < MAX_CHAIN {
                if pos - cand > MAX_DIST {
                    break;
                }
                let len = match_len(data, cand, pos);
                if len > best_len {
                    best_len = len;
                    best_dist = pos - cand;
                    if len >= MAX_MATCH {
                        break;
                    }
                }
                cand = prev[cand];
                chain += 1;
            }
        }
        if best_len >= MIN_MATCH {
            tokens.push(Token::Match {
                len: best_len as u16,
                dist: best_dist as u16,
            });
            let stop = (pos + best_len).min(data.len() + 1 - MIN_MATCH);
            for i in pos..stop {
                let h = hash(&data[i..]);
                prev[i] = head[h];
                head[h] = i;
            }
            pos += best_len;
        } else {
            tokens.push(Token::Literal(data[pos]));
            if pos + MIN_MATCH <= data.len() {
                let h = hash(&data[pos..]);
                prev[pos] = head[h];
                head[h] = pos;
            }
            pos += 1;
        }
    }
    tokens
}

fn length_code(len: u16) -> (usize, u32, u32) {
    let i = LBASE.iter().rposition(|&base| base <= len).unwrap_or(0);
    (257 + i, (LEXT[i] & 15) as u32, (len - LBASE[i]) as u32)
}

fn dist_code(dist: u16) -> (usize, u32, u32) {
    let i = DBASE.iter().rposition(|&base| base <= dist).unwrap_or(0);
    (i, (DEXT[i] & 15) as u32, (dist - DBASE[i]) as u32)
}

////////////////////////////////////////////////////////////////////////////////

fn fixed_litlen_lengths() -> Vec<u8> {
    let mut lens = vec![0u8; 288];
    lens[..144].fill(8);
    lens[144..256].fill(9);
    lens[256..280].fill(7);
    lens[280..].fill(8);
    lens
}

fn fixed_dist_lengths() -> Vec<u8> {
    vec![5u8; 32]
}

fn dynamic_lengths(tokens: &[Token]) -> (Vec<u8>, Vec<u8>) {
    let mut lit_freqs = vec![0u32; LITLEN_SYMBOLS];
    let mut dist_freqs = vec![0u32; DIST_SYMBOLS];
    lit_freqs[EOB] = 1;
    for token in tokens {
        match *token {
            Token::Literal(byte) => lit_freqs[byte as usize] += 1,
            Token::Match { len, dist } => {
                lit_freqs[length_code(len).0] += 1;
                dist_freqs[dist_code(dist).0] += 1;
            }
        }
    }
    (build_lengths(&lit_freqs, 15), build_lengths(&dist_freqs, 15))
}

/// Huffman code lengths for `freqs`, none longer than `limit` bits, forming
/// an exactly complete code. At least two symbols always get a code so the
/// resulting tree is never degenerate.
fn build_lengths(freqs: &[u32], limit: u8) -> Vec<u8> {
    let n = freqs.len();
    let mut freqs = freqs.to_vec();
    for i in 0..n {
        if freqs.iter().filter(|&&f| f > 0).count() >= 2 {
            break;
        }
        if freqs[i] == 0 {
            freqs[i] = 1;
        }
    }
    let mut used: Vec<usize> = (0..n).filter(|&i| freqs[i] > 0).collect();

    // Plain Huffman tree first.
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = used
        .iter()
        .map(|&sym| Reverse((freqs[sym] as u64, sym)))
        .collect();
    let mut children: Vec<(usize, usize)> = Vec::new();
    while heap.len() > 1 {
        let Reverse((f1, a)) = heap.pop().unwrap_or(Reverse((0, 0)));
        let Reverse((f2, b)) = heap.pop().unwrap_or(Reverse((0, 0)));
        let id = n + children.len();
        children.push((a, b));
        heap.push(Reverse((f1 + f2, id)));
    }
    let root = heap.pop().map(|Reverse((_, id))| id).unwrap_or(0);
    let mut lens = vec![0u8; n];
    let mut stack = vec![(root, 0u8)];
    while let Some((id, depth)) = stack.pop() {
        if id < n {
            lens[id] = depth;
        } else {
            let (a, b) = children[id - n];
            stack.push((a, depth + 1));
            stack.push((b, depth + 1));
        }
    }

    // Cap at the limit and repair the Kraft sum, moving the cheapest codes
    // down one level per step (the gen_bitlen fixup).
    let mut bl_count = vec![0i32; limit as usize + 2];
    let mut overflow = 0i32;
    for &sym in &used {
        if lens[sym] > limit {
            lens[sym] = limit;
            overflow += 1;
        }
        bl_count[lens[sym] as usize] += 1;
    }
    while overflow > 0 {
        let mut bits = limit as usize - 1;
        while bl_count[bits] == 0 {
            bits -= 1;
        }
        bl_count[bits] -= 1;
        bl_count[bits + 1] += 2;
        bl_count[limit as usize] -= 1;
        overflow -= 2;
    }

    // Reassign lengths: rarest symbols take the longest codes.
    used.sort_by_key(|&sym| (freqs[sym], sym));
    let mut idx = 0;
    for bits in (1..=limit as usize).rev() {
        for _ in 0..bl_count[bits] {
            lens[used[idx]] = bits as u8;
            idx += 1;
        }
    }
    lens
}

/// Canonical code values per RFC 1951 §3.2.2, pre-reversed for the LSB-first
/// bit writer.
fn assign_codes(lens: &[u8]) -> Vec<u16> {
    let mut bl_count = [0u16; 16];
    for &len in lens {
        bl_count[len as usize] += 1;
    }
    bl_count[0] = 0;
    let mut next = [0u16; 16];
    let mut code = 0u16;
    for bits in 1..16 {
        code = (code + bl_count[bits - 1]) << 1;
        next[bits] = code;
    }
    lens.iter()
        .map(|&len| {
            if len == 0 {
                0
            } else {
                let value = next[len as usize];
                next[len as usize] += 1;
                reverse_bits(value, len)
            }
        })
        .collect()
}

fn reverse_bits(value: u16, len: u8) -> u16 {
    value.reverse_bits() >> (16 - len as u32)
}

fn trimmed_len(lens: &[u8], min: usize) -> usize {
    let mut n = lens.len();
    while n > min && lens[n - 1] == 0 {
        n -= 1;
    }
    n
}

struct ClenToken {
    sym: u8,
    extra: u8,
    val: u16,
}

/// Run-length encode one tree's lengths with the 16/17/18 repeat codes.
fn rle_lengths(lens: &[u8]) -> Vec<ClenToken> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < lens.len() {
        let value = lens[i];
        let mut run = 1;
        while i + run < lens.len() && lens[i + run] == value {
            run += 1;
        }
        i += run;
        if value == 0 {
            while run >= 11 {
                let n = run.min(138);
                out.push(ClenToken {
                    sym: 18,
                    extra: 7,
                    val: (n - 11) as u16,
                });
                run -= n;
            }
            if run >= 3 {
                out.push(ClenToken {
                    sym: 17,
                    extra: 3,
                    val: (run - 3) as u16,
                });
                run = 0;
            }
            for _ in 0..run {
                out.push(ClenToken {
                    sym: 0,
                    extra: 0,
                    val: 0,
                });
            }
        } else {
            out.push(ClenToken {
                sym: value,
                extra: 0,
                val: 0,
            });
            run -= 1;
            while run >= 3 {
                let n = run.min(6);
                out.push(ClenToken {
                    sym: 16,
                    extra: 2,
                    val: (n - 3) as u16,
                });
                run -= n;
            }
            for _ in 0..run {
                out.push(ClenToken {
                    sym: value,
                    extra: 0,
                    val: 0,
                });
            }
        }
    }
    out
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use crate::inflate::{InflateConfig, Inflater};

    fn inflate_all(stream: &[u8], wrapper: Wrapper) -> Vec<u8> {
        let mut inf = Inflater::new(InflateConfig {
            wrapper,
            window_bits: 15,
        })
        .unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let mut offset = 0;
        loop {
            let decoded = inf.decompress(&stream[offset..], &mut buf).unwrap();
            offset += decoded.consumed;
            out.extend_from_slice(&buf[..decoded.produced]);
            if decoded.status == Status::StreamEnd {
                return out;
            }
        }
    }

    #[test]
    fn empty_fixed_block_is_canonical() {
        assert_eq!(compress(&[], Wrapper::Raw, Strategy::Fixed), [0x03, 0x00]);
    }

    #[test]
    fn round_trip_all_strategies_and_wrappers() {
        let mut data = Vec::new();
        for i in 0..40_000u32 {
            data.push((i % 251) as u8);
            if i % 7 == 0 {
                data.extend_from_slice(b"the quick brown fox ");
            }
        }
        for strategy in [Strategy::Stored, Strategy::Fixed, Strategy::Dynamic] {
            for wrapper in [Wrapper::Raw, Wrapper::Zlib, Wrapper::Gzip] {
                let stream = compress(&data, wrapper, strategy);
                assert_eq!(inflate_all(&stream, wrapper), data, "{:?}", strategy);
            }
        }
    }

    #[test]
    fn repeated_text_compresses() {
        let data = b"badger ".repeat(2000);
        let stream = compress(&data, Wrapper::Zlib, Strategy::Dynamic);
        assert!(stream.len() < data.len() / 10);
        assert_eq!(inflate_all(&stream, Wrapper::Zlib), data);
    }

    #[test]
    fn short_inputs_round_trip() {
        for data in [&b""[..], b"a", b"AAAAAAAAAA", b"abcabcabcabc"] {
            for strategy in [Strategy::Stored, Strategy::Fixed, Strategy::Dynamic] {
                let stream = compress(data, Wrapper::Zlib, strategy);
                assert_eq!(inflate_all(&stream, Wrapper::Zlib), data);
            }
        }
    }

    #[test]
    fn sync_flush_emits_marker_and_stream_continues() {
        let mut deflater = Deflater::new(Wrapper::Raw, Strategy::Fixed);
        deflater.write(b"first part");
        deflater.sync_flush();
        assert_eq!(
            &deflater.bits.out[deflater.bits.out.len() - 4..],
            &[0x00, 0x00, 0xff, 0xff]
        );
        deflater.write(b"second part");
        let stream = deflater.finish();
        assert_eq!(inflate_all(&stream, Wrapper::Raw), b"first partsecond part");
    }

    #[test]
    fn stored_splits_large_input() {
        let data = vec![0x5au8; 0x1_0000 + 10];
        let stream = compress(&data, Wrapper::Raw, Strategy::Stored);
        assert_eq!(inflate_all(&stream, Wrapper::Raw), data);
    }

    #[test]
    fn length_and_distance_codes() {
        assert_eq!(length_code(3), (257, 0, 0));
        assert_eq!(length_code(10), (264, 0, 0));
        assert_eq!(length_code(11), (265, 1, 0));
        assert_eq!(length_code(258), (285, 0, 0));
        assert_eq!(dist_code(1), (0, 0, 0));
        assert_eq!(dist_code(5), (4, 1, 0));
        assert_eq!(dist_code(6), (4, 1, 1));
        assert_eq!(dist_code(32768), (29, 13, 8191));
    }

    #[test]
    fn limited_lengths_stay_complete() {
        // Fibonacci-like frequencies force deep trees that need the fixup.
        let mut freqs = vec![0u32; 40];
        let (mut a, mut b) = (1u32, 1u32);
        for freq in freqs.iter_mut() {
            *freq = a;
            let next = a.saturating_add(b);
            a = b;
            b = next;
        }
        let lens = build_lengths(&freqs, 15);
        let kraft: u64 = lens
            .iter()
            .filter(|&&len| len > 0)
            .map(|&len| 1u64 << (15 - len as u32))
            .sum();
        assert_eq!(kraft, 1 << 15);
        assert!(lens.iter().all(|&len| len <= 15));
    }
}
