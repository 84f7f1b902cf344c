#![forbid(unsafe_code)]

////////////////////////////////////////////////////////////////////////////////

/// Read position inside the caller's input buffer for one decompress call.
///
/// The session never owns the buffer; it only remembers how many bits of the
/// last partially-consumed byte are still pending (see [`BitBuf`]).
pub struct InputCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> InputCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn next(&mut self) -> Option<u8> {
        let byte = self.buf.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    /// Take up to `n` bytes as a slice, advancing the cursor.
    pub fn take(&mut self, n: usize) -> &'a [u8] {
        let end = (self.pos + n).min(self.buf.len());
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        slice
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Write position inside the caller's output buffer.
pub struct OutputCursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> OutputCursor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Copy as much of `src` as fits; returns the number of bytes taken.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.space());
        self.buf[self.pos..self.pos + n].copy_from_slice(&src[..n]);
        self.pos += n;
        n
    }

    pub fn space(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn produced(&self) -> usize {
        self.pos
    }
}

////////////////////////////////////////////////////////////////////////////////

/// LSB-first bit accumulator that survives across decompress calls.
///
/// Huffman codes may span input refill points, so the accumulator together
/// with the state-machine mode is the whole suspend image: when `need`
/// cannot be satisfied the caller returns to the host with everything intact
/// and retries once more bytes arrive.
#[derive(Debug, Default, Clone, Copy)]
pub struct BitBuf {
    hold: u64,
    count: u32,
}

impl BitBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate bytes until `n` bits are available. Returns false when the
    /// input runs dry first; no bits are lost in that case.
    pub fn need(&mut self, n: u32, input: &mut InputCursor) -> bool {
        debug_assert!(n <= 32);
        while self.count < n {
            match input.next() {
                Some(byte) => {
                    self.hold |= (byte as u64) << self.count;
                    self.count += 8;
                }
                None => return false,
            }
        }
        true
    }

    pub fn peek(&self, n: u32) -> u32 {
        debug_assert!(n <= 32);
        (self.hold & ((1u64 << n) - 1)) as u32
    }

    pub fn drop_bits(&mut self, n: u32) {
        debug_assert!(n <= self.count);
        self.hold >>= n;
        self.count -= n;
    }

    pub fn take(&mut self, n: u32) -> u32 {
        let bits = self.peek(n);
        self.drop_bits(n);
        bits
    }

    /// Discard bits up to the next byte boundary (stored blocks, trailers).
    pub fn align(&mut self) {
        self.drop_bits(self.count & 7);
    }

    pub fn available(&self) -> u32 {
        self.count
    }

    pub fn clear(&mut self) {
        self.hold = 0;
        self.count = 0;
    }

    /// Direct refill used by the fast path, which guarantees the bytes exist.
    pub fn load_byte(&mut self, byte: u8) {
        self.hold |= (byte as u64) << self.count;
        self.count += 8;
    }
}

////////////////////////////////////////////////////////////////////////////////
