#![forbid(unsafe_code)]

use crc::Digest;
use log::*;

use crate::bits::{BitBuf, InputCursor, OutputCursor};
use crate::blocks::{BlockState, BlockStatus};
use crate::checksum::{adler32, Adler32, Checksum, CRC32};
use crate::error::{CodecError, Decoded, Status};

////////////////////////////////////////////////////////////////////////////////

const GZ_ID1: u8 = 0x1f;
const GZ_ID2: u8 = 0x8b;
const CM_DEFLATE: u8 = 8;

const FTEXT: u8 = 0x01;
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xe0;

const ZLIB_FDICT: u32 = 0x20;

////////////////////////////////////////////////////////////////////////////////

/// Envelope framing around the raw DEFLATE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    /// No framing, no checksum (the ZIP entry format).
    Raw,
    /// RFC 1950: 2-byte header + big-endian Adler-32 trailer.
    Zlib,
    /// RFC 1952: 10-byte header + CRC-32 and length trailer.
    Gzip,
}

#[derive(Debug, Clone, Copy)]
pub struct InflateConfig {
    pub wrapper: Wrapper,
    pub window_bits: u32,
}

impl InflateConfig {
    pub fn raw() -> Self {
        Self {
            wrapper: Wrapper::Raw,
            window_bits: 15,
        }
    }

    pub fn zlib() -> Self {
        Self {
            wrapper: Wrapper::Zlib,
            window_bits: 15,
        }
    }

    pub fn gzip() -> Self {
        Self {
            wrapper: Wrapper::Gzip,
            window_bits: 15,
        }
    }
}

/// Metadata captured from a gzip member header.
#[derive(Debug, Default, Clone)]
pub struct GzipHeader {
    pub modification_time: u32,
    pub extra_flags: u8,
    pub os: u8,
    pub extra: Option<Vec<u8>>,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub is_text: bool,
    pub has_crc: bool,
}

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy)]
enum WrapMode {
    ZlibHeader,
    DictId,
    Dict,
    GzMagic,
    GzMtime,
    GzXflOs,
    GzExtraLen,
    GzExtra,
    GzName,
    GzComment,
    GzHcrc,
    Blocks,
    ZlibCheck,
    GzCrc,
    GzLen,
    Done,
    Bad(&'static str),
}

/// One decompression session: fully resumable at bit granularity.
///
/// The caller owns the input and output buffers and may swap them between
/// calls; the session owns everything that has to survive a suspension (bit
/// accumulator, block machine, window, running checksum, totals).
pub struct Inflater {
    wrapper: Wrapper,
    window_bits: u32,
    mode: WrapMode,
    bits: BitBuf,
    blocks: BlockState,
    check: Checksum,
    total_in: u64,
    total_out: u64,
    dict_id: u32,
    gz_flags: u8,
    gz_extra_left: usize,
    gz_field: Vec<u8>,
    gz_header: GzipHeader,
    header_ready: bool,
    hdr_digest: Option<Digest<'static, u32>>,
    sync_got: usize,
}

impl Inflater {
    pub fn new(config: InflateConfig) -> Result<Self, CodecError> {
        if !(8..=15).contains(&config.window_bits) {
            return Err(CodecError::Stream("window bits must be between 8 and 15"));
        }
        Ok(Self {
            wrapper: config.wrapper,
            window_bits: config.window_bits,
            mode: initial_mode(config.wrapper),
            bits: BitBuf::new(),
            blocks: BlockState::new(config.window_bits),
            check: initial_check(config.wrapper),
            total_in: 0,
            total_out: 0,
            dict_id: 0,
            gz_flags: 0,
            gz_extra_left: 0,
            gz_field: Vec::new(),
            gz_header: GzipHeader::default(),
            header_ready: false,
            hdr_digest: gz_digest(config.wrapper),
            sync_got: 0,
        })
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    /// The gzip member header, once fully parsed.
    pub fn gzip_header(&self) -> Option<&GzipHeader> {
        (self.wrapper == Wrapper::Gzip && self.header_ready).then_some(&self.gz_header)
    }

    /// Back to the initial state; window size and wrapper are retained.
    pub fn reset(&mut self) {
        self.mode = initial_mode(self.wrapper);
        self.bits.clear();
        self.blocks.reset();
        self.check = initial_check(self.wrapper);
        self.total_in = 0;
        self.total_out = 0;
        self.dict_id = 0;
        self.gz_flags = 0;
        self.gz_extra_left = 0;
        self.gz_field.clear();
        self.gz_header = GzipHeader::default();
        self.header_ready = false;
        self.hdr_digest = gz_digest(self.wrapper);
        self.sync_got = 0;
    }

    /// Push a chunk of compressed bytes, pull decompressed bytes.
    ///
    /// Any split of the stream across calls produces output byte-identical
    /// to a single whole-buffer call. `Err(Buf)` means this particular call
    /// had no room to make progress and is not fatal.
    pub fn decompress(
        &mut self,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<Decoded, CodecError> {
        let mut inp = InputCursor::new(input);
        let mut out = OutputCursor::new(&mut *output);
        let result = self.run(&mut inp, &mut out);
        let consumed = inp.consumed();
        let produced = out.produced();
        self.total_in += consumed as u64;
        self.total_out += produced as u64;
        let status = result?;
        if status == Status::Ok && consumed == 0 && produced == 0 {
            return Err(CodecError::Buf);
        }
        Ok(Decoded {
            consumed,
            produced,
            status,
        })
    }

    /// Supply the preset dictionary a zlib header asked for.
    pub fn set_dictionary(&mut self, dict: &[u8]) -> Result<(), CodecError> {
        if !matches!(self.mode, WrapMode::Dict) {
            return Err(CodecError::Stream(
                "set_dictionary is only valid when a dictionary was requested",
            ));
        }
        if adler32(dict) != self.dict_id {
            return Err(CodecError::Data("incorrect dictionary check"));
        }
        debug!("preset dictionary accepted ({} bytes)", dict.len());
        self.blocks.window_mut().preset(dict);
        self.mode = WrapMode::Blocks;
        Ok(())
    }

    /// Scan forward for a sync-flush marker (`00 00 FF FF`) after a data
    /// error, re-arming the session at the next block boundary. Returns the
    /// bytes consumed through the marker; `Err(Buf)` means the whole input
    /// was scanned without finding it (the partial match survives to the
    /// next call). Data between the error and the marker is not recovered.
    pub fn sync(&mut self, input: &[u8]) -> Result<usize, CodecError> {
        if !matches!(self.mode, WrapMode::Bad(_)) {
            return Err(CodecError::Stream("sync requires a preceding data error"));
        }
        let mut got = self.sync_got;
        for (pos, &byte) in input.iter().enumerate() {
            let want = if got < 2 { 0x00 } else { 0xff };
            if byte == want {
                got += 1;
            } else if byte != 0 {
                got = 0;
            } else {
                got = 4 - got;
            }
            if got == 4 {
                info!("sync marker found after {} bytes", pos + 1);
                self.sync_got = 0;
                self.bits.clear();
                self.blocks.resync();
                self.mode = WrapMode::Blocks;
                self.total_in += (pos + 1) as u64;
                return Ok(pos + 1);
            }
        }
        self.sync_got = got;
        self.total_in += input.len() as u64;
        Err(CodecError::Buf)
    }

    fn run(
        &mut self,
        input: &mut InputCursor,
        output: &mut OutputCursor,
    ) -> Result<Status, CodecError> {
        loop {
            match self.mode {
                WrapMode::ZlibHeader => {
                    if !self.bits.need(16, input) {
                        return Ok(Status::Ok);
                    }
                    let fields = self.bits.take(16);
                    let cmf = fields & 0xff;
                    let flg = fields >> 8;
                    if cmf & 0x0f != CM_DEFLATE as u32 {
                        return self.fail("unknown compression method");
                    }
                    if (cmf >> 4) + 8 > self.window_bits {
                        return self.fail("invalid window size");
                    }
                    if (cmf << 8 | flg) % 31 != 0 {
                        return self.fail("incorrect header check");
                    }
                    self.mode = if flg & ZLIB_FDICT != 0 {
                        WrapMode::DictId
                    } else {
                        WrapMode::Blocks
                    };
                }
                WrapMode::DictId => {
                    if !self.bits.need(32, input) {
                        return Ok(Status::Ok);
                    }
                    self.dict_id = self.bits.take(32).swap_bytes();
                    debug!("stream wants preset dictionary {:#010x}", self.dict_id);
                    self.mode = WrapMode::Dict;
                }
                WrapMode::Dict => return Ok(Status::NeedDict),

                WrapMode::GzMagic => {
                    if !self.bits.need(32, input) {
                        return Ok(Status::Ok);
                    }
                    let fields = self.bits.take(32);
                    let bytes = fields.to_le_bytes();
                    if bytes[0] != GZ_ID1 || bytes[1] != GZ_ID2 {
                        return self.fail("incorrect header check");
                    }
                    if bytes[2] != CM_DEFLATE {
                        return self.fail("unknown compression method");
                    }
                    if bytes[3] & FRESERVED != 0 {
                        return self.fail("unknown header flags set");
                    }
                    self.gz_flags = bytes[3];
                    self.gz_header.is_text = bytes[3] & FTEXT != 0;
                    self.gz_header.has_crc = bytes[3] & FHCRC != 0;
                    self.hash_header(&bytes);
                    self.mode = WrapMode::GzMtime;
                }
                WrapMode::GzMtime => {
                    if !self.bits.need(32, input) {
                        return Ok(Status::Ok);
                    }
                    let mtime = self.bits.take(32);
                    self.gz_header.modification_time = mtime;
                    self.hash_header(&mtime.to_le_bytes());
                    self.mode = WrapMode::GzXflOs;
                }
                WrapMode::GzXflOs => {
                    if !self.bits.need(16, input) {
                        return Ok(Status::Ok);
                    }
                    let fields = self.bits.take(16);
                    self.gz_header.extra_flags = (fields & 0xff) as u8;
                    self.gz_header.os = (fields >> 8) as u8;
                    self.hash_header(&[(fields & 0xff) as u8, (fields >> 8) as u8]);
                    self.mode = if self.gz_flags & FEXTRA != 0 {
                        WrapMode::GzExtraLen
                    } else {
                        self.after_extra()
                    };
                }
                WrapMode::GzExtraLen => {
                    if !self.bits.need(16, input) {
                        return Ok(Status::Ok);
                    }
                    let len = self.bits.take(16);
                    self.gz_extra_left = len as usize;
                    self.hash_header(&[(len & 0xff) as u8, (len >> 8) as u8]);
                    self.gz_field.clear();
                    self.mode = WrapMode::GzExtra;
                }
                WrapMode::GzExtra => {
                    while self.gz_extra_left > 0 {
                        if !self.bits.need(8, input) {
                            return Ok(Status::Ok);
                        }
                        let byte = self.bits.take(8) as u8;
                        self.hash_header(&[byte]);
                        self.gz_field.push(byte);
                        self.gz_extra_left -= 1;
                    }
                    self.gz_header.extra = Some(std::mem::take(&mut self.gz_field));
                    self.mode = self.after_extra();
                }
                WrapMode::GzName => {
                    loop {
                        if !self.bits.need(8, input) {
                            return Ok(Status::Ok);
                        }
                        let byte = self.bits.take(8) as u8;
                        self.hash_header(&[byte]);
                        if byte == 0 {
                            break;
                        }
                        self.gz_field.push(byte);
                    }
                    let name = std::mem::take(&mut self.gz_field);
                    self.gz_header.name = Some(String::from_utf8_lossy(&name).into_owned());
                    debug!("gzip member name: {:?}", self.gz_header.name);
                    self.mode = self.after_name();
                }
                WrapMode::GzComment => {
                    loop {
                        if !self.bits.need(8, input) {
                            return Ok(Status::Ok);
                        }
                        let byte = self.bits.take(8) as u8;
                        self.hash_header(&[byte]);
                        if byte == 0 {
                            break;
                        }
                        self.gz_field.push(byte);
                    }
                    let comment = std::mem::take(&mut self.gz_field);
                    self.gz_header.comment = Some(String::from_utf8_lossy(&comment).into_owned());
                    self.mode = self.after_comment();
                }
                WrapMode::GzHcrc => {
                    if !self.bits.need(16, input) {
                        return Ok(Status::Ok);
                    }
                    let stored = self.bits.take(16);
                    let computed = self
                        .hdr_digest
                        .as_ref()
                        .map(|digest| digest.clone().finalize() & 0xffff)
                        .unwrap_or(0);
                    if stored != computed {
                        return self.fail("header crc mismatch");
                    }
                    self.header_ready = true;
                    self.mode = WrapMode::Blocks;
                }

                WrapMode::Blocks => {
                    self.header_ready = true;
                    let Inflater {
                        ref mut blocks,
                        ref mut bits,
                        ref mut check,
                        ..
                    } = *self;
                    match blocks.process(bits, input, output, check) {
                        Ok(BlockStatus::NeedInput) | Ok(BlockStatus::OutputFull) => {
                            return Ok(Status::Ok)
                        }
                        Ok(BlockStatus::StreamEnd) => {
                            self.bits.align();
                            self.mode = match self.wrapper {
                                Wrapper::Raw => WrapMode::Done,
                                Wrapper::Zlib => WrapMode::ZlibCheck,
                                Wrapper::Gzip => WrapMode::GzCrc,
                            };
                        }
                        Err(err) => {
                            if let CodecError::Data(msg) = err {
                                self.mode = WrapMode::Bad(msg);
                            }
                            return Err(err);
                        }
                    }
                }

                WrapMode::ZlibCheck => {
                    if !self.bits.need(32, input) {
                        return Ok(Status::Ok);
                    }
                    let stored = self.bits.take(32).swap_bytes();
                    if stored != self.check.value() {
                        return self.fail("incorrect data check");
                    }
                    self.mode = WrapMode::Done;
                }
                WrapMode::GzCrc => {
                    if !self.bits.need(32, input) {
                        return Ok(Status::Ok);
                    }
                    if self.bits.take(32) != self.check.value() {
                        return self.fail("incorrect data check");
                    }
                    self.mode = WrapMode::GzLen;
                }
                WrapMode::GzLen => {
                    if !self.bits.need(32, input) {
                        return Ok(Status::Ok);
                    }
                    let expected = (self.total_out + output.produced() as u64) as u32;
                    if self.bits.take(32) != expected {
                        return self.fail("incorrect length check");
                    }
                    self.mode = WrapMode::Done;
                }
                WrapMode::Done => return Ok(Status::StreamEnd),
                WrapMode::Bad(msg) => return Err(CodecError::Data(msg)),
            }
        }
    }

    fn after_extra(&mut self) -> WrapMode {
        if self.gz_flags & FNAME != 0 {
            self.gz_field.clear();
            WrapMode::GzName
        } else {
            self.after_name()
        }
    }

    fn after_name(&mut self) -> WrapMode {
        if self.gz_flags & FCOMMENT != 0 {
            self.gz_field.clear();
            WrapMode::GzComment
        } else {
            self.after_comment()
        }
    }

    fn after_comment(&mut self) -> WrapMode {
        if self.gz_flags & FHCRC != 0 {
            WrapMode::GzHcrc
        } else {
            self.header_ready = true;
            WrapMode::Blocks
        }
    }

    fn hash_header(&mut self, bytes: &[u8]) {
        if let Some(digest) = self.hdr_digest.as_mut() {
            digest.update(bytes);
        }
    }

    fn fail(&mut self, msg: &'static str) -> Result<Status, CodecError> {
        warn!("stream error: {}", msg);
        self.mode = WrapMode::Bad(msg);
        Err(CodecError::Data(msg))
    }
}

fn initial_mode(wrapper: Wrapper) -> WrapMode {
    match wrapper {
        Wrapper::Raw => WrapMode::Blocks,
        Wrapper::Zlib => WrapMode::ZlibHeader,
        Wrapper::Gzip => WrapMode::GzMagic,
    }
}

fn initial_check(wrapper: Wrapper) -> Checksum {
    match wrapper {
        Wrapper::Raw => Checksum::None,
        Wrapper::Zlib => Checksum::Adler(Adler32::new()),
        Wrapper::Gzip => Checksum::Crc(CRC32.digest()),
    }
}

fn gz_digest(wrapper: Wrapper) -> Option<Digest<'static, u32>> {
    matches!(wrapper, Wrapper::Gzip).then(|| CRC32.digest())
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// The canonical zlib stream for the empty string.
    const EMPTY_ZLIB: [u8; 8] = [0x78, 0x9c, 0x03, 0x00, 0x00, 0x00, 0x00, 0x01];

    #[test]
    fn empty_zlib_reference_stream() {
        let mut inf = Inflater::new(InflateConfig::zlib()).unwrap();
        let mut out = [0u8; 16];
        let decoded = inf.decompress(&EMPTY_ZLIB, &mut out).unwrap();
        assert_eq!(decoded.status, Status::StreamEnd);
        assert_eq!(decoded.produced, 0);
        assert_eq!(decoded.consumed, 8);
    }

    #[test]
    fn zlib_header_check_enforced() {
        let mut inf = Inflater::new(InflateConfig::zlib()).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(
            inf.decompress(&[0x78, 0x9d, 0x03, 0x00], &mut out),
            Err(CodecError::Data("incorrect header check"))
        );
    }

    #[test]
    fn trailer_corruption_detected() {
        let mut stream = EMPTY_ZLIB;
        stream[7] = 0x02;
        let mut inf = Inflater::new(InflateConfig::zlib()).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(
            inf.decompress(&stream, &mut out),
            Err(CodecError::Data("incorrect data check"))
        );
    }

    #[test]
    fn window_bits_validated() {
        assert!(Inflater::new(InflateConfig {
            wrapper: Wrapper::Raw,
            window_bits: 16,
        })
        .is_err());
    }

    #[test]
    fn buf_error_when_no_progress() {
        let mut inf = Inflater::new(InflateConfig::zlib()).unwrap();
        let mut out = [0u8; 16];
        assert_eq!(inf.decompress(&[], &mut out), Err(CodecError::Buf));
        // Not sticky: real input afterwards is fine.
        let decoded = inf.decompress(&EMPTY_ZLIB, &mut out).unwrap();
        assert_eq!(decoded.status, Status::StreamEnd);
    }

    #[test]
    fn gzip_header_crc_verified() {
        let mut header = vec![0x1f, 0x8b, 0x08, FHCRC | FNAME, 0, 0, 0, 0, 0, 0xff];
        header.extend_from_slice(b"a\0");
        let crc16 = (CRC32.checksum(&header) & 0xffff) as u16;

        let mut stream = header.clone();
        stream.extend_from_slice(&crc16.to_le_bytes());
        stream.extend_from_slice(&[0x03, 0x00]);
        stream.extend_from_slice(&[0; 8]);
        let mut inf = Inflater::new(InflateConfig::gzip()).unwrap();
        let mut out = [0u8; 16];
        let decoded = inf.decompress(&stream, &mut out).unwrap();
        assert_eq!(decoded.status, Status::StreamEnd);
        assert!(inf.gzip_header().unwrap().has_crc);

        let mut bad = header;
        bad.extend_from_slice(&(crc16 ^ 1).to_le_bytes());
        bad.extend_from_slice(&[0x03, 0x00]);
        let mut inf = Inflater::new(InflateConfig::gzip()).unwrap();
        assert_eq!(
            inf.decompress(&bad, &mut out),
            Err(CodecError::Data("header crc mismatch"))
        );
    }

    #[test]
    fn reset_allows_reuse() {
        let mut inf = Inflater::new(InflateConfig::zlib()).unwrap();
        let mut out = [0u8; 16];
        inf.decompress(&EMPTY_ZLIB, &mut out).unwrap();
        assert_eq!(inf.total_in(), 8);
        inf.reset();
        assert_eq!(inf.total_in(), 0);
        let decoded = inf.decompress(&EMPTY_ZLIB, &mut out).unwrap();
        assert_eq!(decoded.status, Status::StreamEnd);
    }
}
