#![forbid(unsafe_code)]

use crate::bits::OutputCursor;
use crate::checksum::Checksum;

////////////////////////////////////////////////////////////////////////////////

/// The circular output window.
///
/// `write` is the next slot to fill, `read` the next slot to hand to the
/// caller. `pending` bytes (write ahead of read) must not be overwritten
/// until flushed; `filled` is how much real history the ring holds, which
/// bounds how far back a match may reach.
pub struct Window {
    buf: Vec<u8>,
    size: usize,
    write: usize,
    read: usize,
    pending: usize,
    filled: usize,
}

impl Window {
    pub fn new(window_bits: u32) -> Self {
        debug_assert!((8..=15).contains(&window_bits));
        let size = 1usize << window_bits;
        Self {
            buf: vec![0; size],
            size,
            write: 0,
            read: 0,
            pending: 0,
            filled: 0,
        }
    }

    /// Bytes that can be written before a flush is required.
    pub fn space(&self) -> usize {
        self.size - self.pending
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// History available for back-references.
    pub fn have(&self) -> usize {
        self.filled
    }

    pub fn push_byte(&mut self, byte: u8) {
        debug_assert!(self.space() > 0);
        self.buf[self.write] = byte;
        self.write += 1;
        if self.write == self.size {
            self.write = 0;
        }
        self.pending += 1;
        self.filled = (self.filled + 1).min(self.size);
    }

    /// Copy from a linear slice (stored blocks). Returns bytes taken.
    pub fn push_slice(&mut self, src: &[u8]) -> usize {
        let total = src.len().min(self.space());
        let mut copied = 0;
        while copied < total {
            let run = (total - copied).min(self.size - self.write);
            self.buf[self.write..self.write + run].copy_from_slice(&src[copied..copied + run]);
            self.write += run;
            if self.write == self.size {
                self.write = 0;
            }
            copied += run;
        }
        self.pending += total;
        self.filled = (self.filled + total).min(self.size);
        total
    }

    /// Copy `len` bytes of history from `dist` bytes back, limited by window
    /// space; returns the number actually copied. The caller has already
    /// validated `dist <= self.have()`.
    ///
    /// Runs are capped at `dist` so the source range never extends past the
    /// write head: overlapping sources (dist < len) replicate by re-reading
    /// just-written bytes on the next run, which is the LZ77 semantic.
    pub fn copy_match(&mut self, dist: usize, len: usize) -> usize {
        debug_assert!(dist >= 1 && dist <= self.filled);
        let total = len.min(self.space());
        let mut src = (self.write + self.size - dist) % self.size;
        let mut remaining = total;
        while remaining > 0 {
            let run = remaining
                .min(self.size - src)
                .min(self.size - self.write)
                .min(dist);
            self.buf.copy_within(src..src + run, self.write);
            src += run;
            if src == self.size {
                src = 0;
            }
            self.write += run;
            if self.write == self.size {
                self.write = 0;
            }
            remaining -= run;
        }
        self.pending += total;
        self.filled = (self.filled + total).min(self.size);
        total
    }

    /// Commit pending bytes to the caller's buffer, updating the running
    /// checksum over exactly the committed range. All output leaves the
    /// session through here, so every byte is checksummed once, in order.
    pub fn flush(&mut self, out: &mut OutputCursor, check: &mut Checksum) -> usize {
        let mut total = 0;
        while self.pending > 0 && out.space() > 0 {
            let run = self.pending.min(self.size - self.read);
            let taken = out.push(&self.buf[self.read..self.read + run]);
            check.update(&self.buf[self.read..self.read + taken]);
            self.read += taken;
            if self.read == self.size {
                self.read = 0;
            }
            self.pending -= taken;
            total += taken;
            if taken < run {
                break;
            }
        }
        total
    }

    /// Seed the window with the tail of a preset dictionary.
    pub fn preset(&mut self, dict: &[u8]) {
        let tail = if dict.len() > self.size {
            &dict[dict.len() - self.size..]
        } else {
            dict
        };
        self.buf[..tail.len()].copy_from_slice(tail);
        self.filled = tail.len();
        self.write = tail.len() % self.size;
        self.read = self.write;
        self.pending = 0;
    }

    pub fn reset(&mut self) {
        self.write = 0;
        self.read = 0;
        self.pending = 0;
        self.filled = 0;
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::adler32;
    use crate::checksum::{Adler32, Checksum};

    #[test]
    fn copy_match_wraps_and_replicates() {
        let mut window = Window::new(8); // 256-byte ring
        let mut check = Checksum::None;

        for i in 0..250u32 {
            window.push_byte(i as u8);
        }
        let mut out = vec![0u8; 512];
        let mut cursor = OutputCursor::new(&mut out);
        window.flush(&mut cursor, &mut check);

        // dist 4, len 10 replicates the last four bytes across the ring edge.
        assert_eq!(window.copy_match(4, 10), 10);
        let mut cursor = OutputCursor::new(&mut out);
        window.flush(&mut cursor, &mut check);
        let expect: Vec<u8> = (0..10).map(|i| 246 + (i % 4) as u8).collect();
        assert_eq!(&out[..10], &expect[..]);
    }

    #[test]
    fn full_distance_match() {
        // A match with distance exactly the window size copies the oldest
        // surviving bytes.
        let mut window = Window::new(8);
        let mut check = Checksum::None;
        let mut sink = vec![0u8; 1024];

        for i in 0..256u32 {
            window.push_byte(i as u8);
        }
        let mut cursor = OutputCursor::new(&mut sink);
        window.flush(&mut cursor, &mut check);

        assert_eq!(window.copy_match(256, 8), 8);
        let mut cursor = OutputCursor::new(&mut sink);
        window.flush(&mut cursor, &mut check);
        assert_eq!(&sink[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn flush_checksums_each_byte_once() {
        let mut window = Window::new(8);
        let mut check = Checksum::Adler(Adler32::new());
        let data = b"checksum exactly once, in order";
        window.push_slice(data);

        // Flush through a sequence of tiny output buffers.
        let mut collected = Vec::new();
        while window.pending() > 0 {
            let mut buf = [0u8; 5];
            let mut cursor = OutputCursor::new(&mut buf);
            let n = window.flush(&mut cursor, &mut check);
            collected.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&collected[..], &data[..]);
        assert_eq!(check.value(), adler32(data));
    }

    #[test]
    fn space_accounts_for_unflushed_bytes() {
        let mut window = Window::new(8);
        assert_eq!(window.space(), 256);
        window.push_slice(&[0u8; 200]);
        assert_eq!(window.space(), 56);
        assert_eq!(window.push_slice(&[1u8; 100]), 56);
        assert_eq!(window.space(), 0);
    }

    #[test]
    fn preset_dictionary_becomes_history() {
        let mut window = Window::new(8);
        window.preset(b"abcdef");
        assert_eq!(window.have(), 6);
        assert_eq!(window.pending(), 0);

        let mut check = Checksum::None;
        assert_eq!(window.copy_match(6, 3), 3);
        let mut buf = [0u8; 8];
        let mut cursor = OutputCursor::new(&mut buf);
        let n = window.flush(&mut cursor, &mut check);
        assert_eq!(&buf[..n], b"abc");
    }
}
