use std::io::Cursor;

use flatezip::deflate::compress as compress_bytes;
use flatezip::{
    CodecError, Deflater, InflateConfig, Inflater, Status, Strategy, Wrapper,
};

////////////////////////////////////////////////////////////////////////////////

/// LSB-first bit assembler for hand-built streams.
struct BitVec {
    out: Vec<u8>,
    hold: u64,
    count: u32,
}

impl BitVec {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            hold: 0,
            count: 0,
        }
    }

    fn push(&mut self, value: u32, count: u32) {
        self.hold |= (value as u64) << self.count;
        self.count += count;
        while self.count >= 8 {
            self.out.push(self.hold as u8);
            self.hold >>= 8;
            self.count -= 8;
        }
    }

    /// Huffman codes go out most significant bit first.
    fn push_code(&mut self, value: u32, count: u32) {
        for i in (0..count).rev() {
            self.push((value >> i) & 1, 1);
        }
    }

    fn align(&mut self) {
        if self.count > 0 {
            self.out.push(self.hold as u8);
            self.hold = 0;
            self.count = 0;
        }
    }

    fn bytes(&mut self, data: &[u8]) {
        assert_eq!(self.count, 0);
        self.out.extend_from_slice(data);
    }

    fn finish(mut self) -> Vec<u8> {
        self.align();
        self.out
    }
}

fn inflate_all(stream: &[u8], wrapper: Wrapper) -> Vec<u8> {
    inflate_chunked(stream, wrapper, stream.len().max(1), 64 * 1024)
}

fn inflate_chunked(
    stream: &[u8],
    wrapper: Wrapper,
    in_step: usize,
    out_cap: usize,
) -> Vec<u8> {
    let mut inflater = Inflater::new(InflateConfig {
        wrapper,
        window_bits: 15,
    })
    .unwrap();
    let mut out = Vec::new();
    let mut outbuf = vec![0u8; out_cap];
    let mut pos = 0;
    loop {
        let end = (pos + in_step).min(stream.len());
        let decoded = inflater.decompress(&stream[pos..end], &mut outbuf).unwrap();
        pos += decoded.consumed;
        out.extend_from_slice(&outbuf[..decoded.produced]);
        if decoded.status == Status::StreamEnd {
            return out;
        }
    }
}

fn sample_data() -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..30_000u32 {
        data.push((i.wrapping_mul(31) % 256) as u8);
        if i % 11 == 0 {
            data.extend_from_slice(b"a moderately compressible phrase, ");
        }
    }
    data
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn byte_at_a_time_matches_whole_buffer() {
    let data = sample_data();
    let stream = compress_bytes(&data, Wrapper::Zlib, Strategy::Dynamic);
    let whole = inflate_all(&stream, Wrapper::Zlib);
    let trickled = inflate_chunked(&stream, Wrapper::Zlib, 1, 7);
    assert_eq!(whole, data);
    assert_eq!(trickled, data);
}

#[test]
fn match_across_the_whole_window() {
    // 32 KiB of stored data followed by a fixed block holding a single
    // length-258 match at the maximum distance of 32768.
    let data: Vec<u8> = (0..32768u32).map(|i| (i % 251) as u8).collect();
    let mut bv = BitVec::new();
    bv.push(0, 1); // not final
    bv.push(0b00, 2); // stored
    bv.align();
    bv.bytes(&0x8000u16.to_le_bytes());
    bv.bytes(&(!0x8000u16).to_le_bytes());
    bv.bytes(&data);
    bv.push(1, 1); // final
    bv.push(0b01, 2); // fixed
    bv.push_code(0b11000101, 8); // symbol 285, length 258
    bv.push_code(29, 5); // distance symbol 29
    bv.push(8191, 13); // extra bits: 24577 + 8191 = 32768
    bv.push_code(0, 7); // end of block
    let stream = bv.finish();

    let out = inflate_all(&stream, Wrapper::Raw);
    assert_eq!(out.len(), 32768 + 258);
    assert_eq!(&out[..32768], &data[..]);
    assert_eq!(&out[32768..], &data[..258]);
}

#[test]
fn sync_recovers_after_corrupt_block() {
    let mut deflater = Deflater::new(Wrapper::Raw, Strategy::Fixed);
    deflater.write(b"this part is lost to corruption");
    deflater.sync_flush();
    deflater.write(b"this part survives");
    let mut stream = deflater.finish();
    stream[0] |= 0x06; // reserved block type

    let mut inflater = Inflater::new(InflateConfig::raw()).unwrap();
    let mut outbuf = [0u8; 4096];
    assert_eq!(
        inflater.decompress(&stream, &mut outbuf),
        Err(CodecError::Data("invalid block type"))
    );

    let resume_at = inflater.total_in() as usize;
    let skipped = inflater.sync(&stream[resume_at..]).unwrap();
    let mut out = Vec::new();
    let mut pos = resume_at + skipped;
    loop {
        let decoded = inflater
            .decompress(&stream[pos..], &mut outbuf)
            .unwrap();
        pos += decoded.consumed;
        out.extend_from_slice(&outbuf[..decoded.produced]);
        if decoded.status == Status::StreamEnd {
            break;
        }
    }
    assert_eq!(out, b"this part survives");
}

#[test]
fn sync_requires_an_error_first() {
    let mut inflater = Inflater::new(InflateConfig::raw()).unwrap();
    assert!(matches!(
        inflater.sync(&[0, 0, 0xff, 0xff]),
        Err(CodecError::Stream(_))
    ));
}

#[test]
fn preset_dictionary_protocol() {
    // zlib stream with FDICT set: the window starts as "hello " and the one
    // fixed block copies five bytes from distance six.
    let dict = b"hello ";
    let mut bv = BitVec::new();
    bv.bytes(&[0x78, 0x20]); // CMF/FLG with FDICT, check already zero
    bv.bytes(&[0x08, 0x61, 0x02, 0x35]); // adler32("hello "), big endian
    bv.push(1, 1); // final
    bv.push(0b01, 2); // fixed
    bv.push_code(3, 7); // symbol 259, length 5
    bv.push_code(4, 5); // distance symbol 4
    bv.push(1, 1); // extra bit: 5 + 1 = 6
    bv.push_code(0, 7); // end of block
    bv.align();
    bv.bytes(&[0x06, 0x2c, 0x02, 0x15]); // adler32("hello"), big endian
    let stream = bv.finish();

    let mut inflater = Inflater::new(InflateConfig::zlib()).unwrap();
    let mut outbuf = [0u8; 64];
    let decoded = inflater.decompress(&stream, &mut outbuf).unwrap();
    assert_eq!(decoded.status, Status::NeedDict);
    assert_eq!(decoded.produced, 0);

    assert_eq!(
        inflater.set_dictionary(b"goodbye"),
        Err(CodecError::Data("incorrect dictionary check"))
    );
    inflater.set_dictionary(dict).unwrap();

    let rest = &stream[decoded.consumed..];
    let decoded = inflater.decompress(rest, &mut outbuf).unwrap();
    assert_eq!(decoded.status, Status::StreamEnd);
    assert_eq!(&outbuf[..decoded.produced], b"hello");
}

#[test]
fn dictionary_outside_handshake_rejected() {
    let mut inflater = Inflater::new(InflateConfig::zlib()).unwrap();
    assert!(matches!(
        inflater.set_dictionary(b"abc"),
        Err(CodecError::Stream(_))
    ));
}

#[test]
fn oversubscribed_code_lengths_rejected() {
    // Dynamic block whose code-length alphabet claims 19 one-bit codes.
    let mut bv = BitVec::new();
    bv.push(1, 1); // final
    bv.push(0b10, 2); // dynamic
    bv.push(0, 5); // hlit = 257
    bv.push(0, 5); // hdist = 1
    bv.push(15, 4); // hclen = 19
    for _ in 0..19 {
        bv.push(1, 3);
    }
    let stream = bv.finish();

    let mut inflater = Inflater::new(InflateConfig::raw()).unwrap();
    let mut outbuf = [0u8; 64];
    assert_eq!(
        inflater.decompress(&stream, &mut outbuf),
        Err(CodecError::Data("invalid code lengths set"))
    );
}

#[test]
fn multi_member_gzip_stream() {
    let mut stream = compress_bytes(b"first", Wrapper::Gzip, Strategy::Fixed);
    stream.extend(compress_bytes(b" second", Wrapper::Gzip, Strategy::Dynamic));
    let mut out = Vec::new();
    let written =
        flatezip::decompress(Cursor::new(stream), &mut out, Wrapper::Gzip).unwrap();
    assert_eq!(out, b"first second");
    assert_eq!(written, out.len() as u64);
}

#[test]
fn truncated_stream_reported() {
    let stream = compress_bytes(&sample_data(), Wrapper::Gzip, Strategy::Dynamic);
    let cut = &stream[..stream.len() - 6];
    let mut out = Vec::new();
    let err = flatezip::decompress(Cursor::new(cut), &mut out, Wrapper::Gzip).unwrap_err();
    assert!(err.to_string().contains("unexpected end of stream"));
}

#[test]
fn gzip_member_name_is_captured() {
    let mut stream = vec![0x1f, 0x8b, 0x08, 0x08, 0, 0, 0, 0, 0, 0xff];
    stream.extend_from_slice(b"file.txt\0");
    stream.extend_from_slice(&[0x03, 0x00]); // empty fixed block
    stream.extend_from_slice(&[0; 8]); // crc32 and isize of nothing

    let mut inflater = Inflater::new(InflateConfig::gzip()).unwrap();
    let mut outbuf = [0u8; 64];
    let decoded = inflater.decompress(&stream, &mut outbuf).unwrap();
    assert_eq!(decoded.status, Status::StreamEnd);
    let header = inflater.gzip_header().unwrap();
    assert_eq!(header.name.as_deref(), Some("file.txt"));
    assert_eq!(header.os, 0xff);
}

#[test]
fn fixed_and_dynamic_agree() {
    let data = sample_data();
    let fixed = compress_bytes(&data, Wrapper::Zlib, Strategy::Fixed);
    let dynamic = compress_bytes(&data, Wrapper::Zlib, Strategy::Dynamic);
    assert_eq!(inflate_all(&fixed, Wrapper::Zlib), data);
    assert_eq!(inflate_all(&dynamic, Wrapper::Zlib), data);
    assert!(dynamic.len() <= fixed.len());
}
