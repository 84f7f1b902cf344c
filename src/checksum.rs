#![forbid(unsafe_code)]

use crc::{Crc, Digest};

////////////////////////////////////////////////////////////////////////////////

pub static CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

////////////////////////////////////////////////////////////////////////////////

const ADLER_BASE: u32 = 65521;
/// Largest n such that 255 * n * (n + 1) / 2 + (n + 1) * (BASE - 1) fits in
/// a u32, letting the modulo be deferred across a whole chunk (RFC 1950 §8.2).
const ADLER_NMAX: usize = 5552;

/// Rolling Adler-32, the zlib envelope checksum.
#[derive(Debug, Clone, Copy)]
pub struct Adler32 {
    a: u32,
    b: u32,
}

impl Default for Adler32 {
    fn default() -> Self {
        Self { a: 1, b: 0 }
    }
}

impl Adler32 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        for chunk in data.chunks(ADLER_NMAX) {
            for &byte in chunk {
                self.a += byte as u32;
                self.b += self.a;
            }
            self.a %= ADLER_BASE;
            self.b %= ADLER_BASE;
        }
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// One-shot helper for dictionary identifiers.
pub fn adler32(data: &[u8]) -> u32 {
    let mut sum = Adler32::new();
    sum.update(data);
    sum.value()
}

////////////////////////////////////////////////////////////////////////////////

/// The running check over decompressed bytes, selected by the envelope.
///
/// Updated exactly once per byte, at the moment the byte crosses from the
/// window into the caller's output buffer.
pub enum Checksum {
    Adler(Adler32),
    Crc(Digest<'static, u32>),
    None,
}

impl Checksum {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksum::Adler(sum) => sum.update(data),
            Checksum::Crc(digest) => digest.update(data),
            Checksum::None => {}
        }
    }

    pub fn value(&self) -> u32 {
        match self {
            Checksum::Adler(sum) => sum.value(),
            Checksum::Crc(digest) => digest.clone().finalize(),
            Checksum::None => 0,
        }
    }

    pub fn reset(&mut self) {
        match self {
            Checksum::Adler(sum) => *sum = Adler32::new(),
            Checksum::Crc(digest) => *digest = CRC32.digest(),
            Checksum::None => {}
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler_known_values() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"a"), 0x00620062);
        assert_eq!(adler32(b"Wikipedia"), 0x11E60398);
    }

    #[test]
    fn adler_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..20000u32).map(|i| (i * 7) as u8).collect();
        let mut sum = Adler32::new();
        for chunk in data.chunks(13) {
            sum.update(chunk);
        }
        assert_eq!(sum.value(), adler32(&data));
    }

    #[test]
    fn checksum_value_does_not_consume() {
        let mut check = Checksum::Crc(CRC32.digest());
        check.update(b"123456789");
        assert_eq!(check.value(), 0xCBF43926);
        // A second read and further updates still work.
        assert_eq!(check.value(), 0xCBF43926);
        check.reset();
        check.update(b"123456789");
        assert_eq!(check.value(), 0xCBF43926);
    }
}
