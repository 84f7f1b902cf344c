#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::*;

use crate::checksum::CRC32;
use crate::deflate::{Deflater, Strategy};
use crate::error::Status;
use crate::inflate::{InflateConfig, Inflater, Wrapper};

////////////////////////////////////////////////////////////////////////////////

const LFH_SIG: u32 = 0x04034b50;
const CDFH_SIG: u32 = 0x02014b50;
const EOCD_SIG: u32 = 0x06054b50;
const ZIP64_EOCD_SIG: u32 = 0x06064b50;
const ZIP64_LOCATOR_SIG: u32 = 0x07064b50;

const ZIP64_EXTRA_ID: u16 = 0x0001;

// EOCD is 22 bytes plus a comment of at most 65535.
const EOCD_SCAN_LIMIT: u64 = 22 + 65535;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

const FLAG_ENCRYPTED: u16 = 0x0001;

////////////////////////////////////////////////////////////////////////////////

/// One central-directory record.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub method: u16,
    pub flags: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
}

impl ZipEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// Random-access reader over a seekable ZIP archive. The central directory
/// is parsed up front; entry payloads are decoded on demand.
pub struct ZipArchive<R: Read + Seek> {
    reader: R,
    entries: Vec<ZipEntry>,
}

impl<R: Read + Seek> ZipArchive<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let eocd = Eocd::find(&mut reader).context("failed to locate central directory")?;
        let entries = read_central_directory(&mut reader, &eocd)
            .context("failed to parse central directory")?;
        debug!("archive opened: {} entries", entries.len());
        Ok(Self { reader, entries })
    }

    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    pub fn entry_by_name(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.name == name)
    }

    /// Decode one entry, verifying its CRC-32 and size against the central
    /// directory.
    pub fn read(&mut self, index: usize) -> Result<Vec<u8>> {
        let entry = self
            .entries
            .get(index)
            .context("entry index out of range")?
            .clone();
        self.read_entry(&entry)
            .with_context(|| format!("failed to read entry {:?}", entry.name))
    }

    pub fn read_by_name(&mut self, name: &str) -> Result<Vec<u8>> {
        let index = self
            .entry_by_name(name)
            .with_context(|| format!("no entry named {:?}", name))?;
        self.read(index)
    }

    fn read_entry(&mut self, entry: &ZipEntry) -> Result<Vec<u8>> {
        ensure!(entry.flags & FLAG_ENCRYPTED == 0, "entry is encrypted");

        self.reader.seek(SeekFrom::Start(entry.header_offset))?;
        let sig = self.reader.read_u32::<LittleEndian>()?;
        ensure!(sig == LFH_SIG, "bad local header signature {:#010x}", sig);
        // Skip the fixed local header fields; sizes and CRC come from the
        // central directory (the local copy may be deferred to a data
        // descriptor).
        self.reader.seek(SeekFrom::Current(22))?;
        let name_len = self.reader.read_u16::<LittleEndian>()? as i64;
        let extra_len = self.reader.read_u16::<LittleEndian>()? as i64;
        self.reader.seek(SeekFrom::Current(name_len + extra_len))?;

        let data = match entry.method {
            METHOD_STORED => {
                let mut data = vec![0u8; entry.compressed_size as usize];
                self.reader.read_exact(&mut data)?;
                data
            }
            METHOD_DEFLATED => self.inflate_payload(entry)?,
            other => bail!("unsupported compression method {}", other),
        };

        ensure!(
            data.len() as u64 == entry.uncompressed_size,
            "size mismatch: expected {} bytes, got {}",
            entry.uncompressed_size,
            data.len()
        );
        let crc = CRC32.checksum(&data);
        ensure!(
            crc == entry.crc32,
            "crc mismatch: expected {:#010x}, got {:#010x}",
            entry.crc32,
            crc
        );
        Ok(data)
    }

    fn inflate_payload(&mut self, entry: &ZipEntry) -> Result<Vec<u8>> {
        let mut inflater = Inflater::new(InflateConfig::raw())?;
        let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
        let mut inbuf = [0u8; 16 * 1024];
        let mut outbuf = [0u8; 32 * 1024];
        let mut remaining = entry.compressed_size;
        let mut have = 0usize;
        let mut pos = 0usize;
        loop {
            if pos == have {
                ensure!(remaining > 0, "truncated deflate data");
                let want = inbuf.len().min(remaining as usize);
                self.reader.read_exact(&mut inbuf[..want])?;
                remaining -= want as u64;
                have = want;
                pos = 0;
            }
            let decoded = inflater.decompress(&inbuf[pos..have], &mut outbuf)?;
            pos += decoded.consumed;
            out.extend_from_slice(&outbuf[..decoded.produced]);
            if decoded.status == Status::StreamEnd {
                return Ok(out);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

struct Eocd {
    total_entries: u64,
    cd_offset: u64,
}

impl Eocd {
    fn find<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        ensure!(file_len >= 22, "file too short for an end-of-directory record");
        let scan = file_len.min(EOCD_SCAN_LIMIT);
        reader.seek(SeekFrom::Start(file_len - scan))?;
        let mut tail = vec![0u8; scan as usize];
        reader.read_exact(&mut tail)?;

        let sig = EOCD_SIG.to_le_bytes();
        let mut found = None;
        for i in (0..=tail.len() - 22).rev() {
            if tail[i..i + 4] == sig {
                let comment_len =
                    u16::from_le_bytes([tail[i + 20], tail[i + 21]]) as usize;
                if i + 22 + comment_len == tail.len() {
                    found = Some(i);
                    break;
                }
            }
        }
        let pos = found.context("end-of-directory signature not found")?;

        let mut cursor = Cursor::new(&tail[pos + 4..]);
        let disk = cursor.read_u16::<LittleEndian>()?;
        let cd_disk = cursor.read_u16::<LittleEndian>()?;
        let _entries_on_disk = cursor.read_u16::<LittleEndian>()?;
        let total_entries = cursor.read_u16::<LittleEndian>()?;
        let cd_size = cursor.read_u32::<LittleEndian>()?;
        let cd_offset = cursor.read_u32::<LittleEndian>()?;
        ensure!(disk == 0 && cd_disk == 0, "multi-disk archives are not supported");

        let needs_zip64 = total_entries == 0xffff
            || cd_size == 0xffff_ffff
            || cd_offset == 0xffff_ffff;
        if needs_zip64 || Self::has_locator(&tail, pos) {
            if let Some(eocd) = Self::read_zip64(reader, &tail, pos, file_len, scan)? {
                return Ok(eocd);
            }
            ensure!(!needs_zip64, "zip64 end-of-directory record missing");
        }
        Ok(Self {
            total_entries: total_entries as u64,
            cd_offset: cd_offset as u64,
        })
    }

    fn has_locator(tail: &[u8], eocd_pos: usize) -> bool {
        eocd_pos >= 20 && tail[eocd_pos - 20..eocd_pos - 16] == ZIP64_LOCATOR_SIG.to_le_bytes()
    }

    fn read_zip64<R: Read + Seek>(
        reader: &mut R,
        tail: &[u8],
        eocd_pos: usize,
        file_len: u64,
        scan: u64,
    ) -> Result<Option<Self>> {
        if !Self::has_locator(tail, eocd_pos) {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&tail[eocd_pos - 16..eocd_pos]);
        let locator_disk = cursor.read_u32::<LittleEndian>()?;
        let eocd64_offset = cursor.read_u64::<LittleEndian>()?;
        let total_disks = cursor.read_u32::<LittleEndian>()?;
        ensure!(
            locator_disk == 0 && total_disks <= 1,
            "multi-disk archives are not supported"
        );
        ensure!(
            eocd64_offset < file_len - scan + eocd_pos as u64,
            "zip64 end-of-directory offset out of range"
        );

        reader.seek(SeekFrom::Start(eocd64_offset))?;
        let sig = reader.read_u32::<LittleEndian>()?;
        ensure!(
            sig == ZIP64_EOCD_SIG,
            "bad zip64 end-of-directory signature {:#010x}",
            sig
        );
        let _record_size = reader.read_u64::<LittleEndian>()?;
        let _version_made = reader.read_u16::<LittleEndian>()?;
        let _version_needed = reader.read_u16::<LittleEndian>()?;
        let disk = reader.read_u32::<LittleEndian>()?;
        let cd_disk = reader.read_u32::<LittleEndian>()?;
        let _entries_on_disk = reader.read_u64::<LittleEndian>()?;
        let total_entries = reader.read_u64::<LittleEndian>()?;
        let _cd_size = reader.read_u64::<LittleEndian>()?;
        let cd_offset = reader.read_u64::<LittleEndian>()?;
        ensure!(disk == 0 && cd_disk == 0, "multi-disk archives are not supported");
        Ok(Some(Self {
            total_entries,
            cd_offset,
        }))
    }
}

fn read_central_directory<R: Read + Seek>(
    reader: &mut R,
    eocd: &Eocd,
) -> Result<Vec<ZipEntry>> {
    reader.seek(SeekFrom::Start(eocd.cd_offset))?;
    let mut entries = Vec::with_capacity(eocd.total_entries.min(1 << 16) as usize);
    for index in 0..eocd.total_entries {
        let entry = read_cdfh(reader).with_context(|| format!("bad record {}", index))?;
        trace!("entry {:?}: {} bytes", entry.name, entry.uncompressed_size);
        entries.push(entry);
    }
    Ok(entries)
}

fn read_cdfh<R: Read + Seek>(reader: &mut R) -> Result<ZipEntry> {
    let sig = reader.read_u32::<LittleEndian>()?;
    ensure!(sig == CDFH_SIG, "bad directory signature {:#010x}", sig);
    let _version_made = reader.read_u16::<LittleEndian>()?;
    let _version_needed = reader.read_u16::<LittleEndian>()?;
    let flags = reader.read_u16::<LittleEndian>()?;
    let method = reader.read_u16::<LittleEndian>()?;
    let _mod_time = reader.read_u16::<LittleEndian>()?;
    let _mod_date = reader.read_u16::<LittleEndian>()?;
    let crc32 = reader.read_u32::<LittleEndian>()?;
    let mut compressed_size = reader.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = reader.read_u32::<LittleEndian>()? as u64;
    let name_len = reader.read_u16::<LittleEndian>()? as usize;
    let extra_len = reader.read_u16::<LittleEndian>()? as usize;
    let comment_len = reader.read_u16::<LittleEndian>()? as usize;
    let disk_start = reader.read_u16::<LittleEndian>()?;
    let _internal_attrs = reader.read_u16::<LittleEndian>()?;
    let _external_attrs = reader.read_u32::<LittleEndian>()?;
    let mut header_offset = reader.read_u32::<LittleEndian>()? as u64;
    ensure!(disk_start == 0 || disk_start == 0xffff, "multi-disk archives are not supported");

    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name)?;
    let mut extra = vec![0u8; extra_len];
    reader.read_exact(&mut extra)?;
    reader.seek(SeekFrom::Current(comment_len as i64))?;

    // The zip64 extra field carries only the fields that overflowed, in a
    // fixed order.
    let mut cursor = Cursor::new(&extra[..]);
    while (cursor.position() as usize) + 4 <= extra.len() {
        let id = cursor.read_u16::<LittleEndian>()?;
        let size = cursor.read_u16::<LittleEndian>()? as u64;
        let next = cursor.position() + size;
        if id == ZIP64_EXTRA_ID {
            if uncompressed_size == 0xffff_ffff {
                uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xffff_ffff {
                compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if header_offset == 0xffff_ffff {
                header_offset = cursor.read_u64::<LittleEndian>()?;
            }
        }
        cursor.set_position(next);
    }

    Ok(ZipEntry {
        name: String::from_utf8_lossy(&name).into_owned(),
        method,
        flags,
        crc32,
        compressed_size,
        uncompressed_size,
        header_offset,
    })
}

////////////////////////////////////////////////////////////////////////////////

struct CentralRecord {
    name: String,
    method: u16,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    header_offset: u32,
}

/// Sequential archive writer. Entries are compressed whole; the central
/// directory goes out at `finish`. No zip64 records: everything must fit
/// in 32-bit fields.
pub struct ZipWriter<W: Write + Seek> {
    writer: W,
    records: Vec<CentralRecord>,
    offset: u64,
}

impl<W: Write + Seek> ZipWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            records: Vec::new(),
            offset: 0,
        }
    }

    pub fn add(&mut self, name: &str, data: &[u8], method: u16) -> Result<()> {
        let payload: Cow<[u8]> = match method {
            METHOD_STORED => Cow::Borrowed(data),
            METHOD_DEFLATED => {
                let mut deflater = Deflater::new(Wrapper::Raw, Strategy::Dynamic);
                deflater.write(data);
                Cow::Owned(deflater.finish())
            }
            other => bail!("unsupported compression method {}", other),
        };
        ensure!(
            data.len() < 0xffff_ffff && payload.len() < 0xffff_ffff,
            "entry {:?} too large for a 32-bit archive",
            name
        );
        ensure!(
            self.offset + 30 + name.len() as u64 + payload.len() as u64 <= 0xffff_fffe,
            "archive too large for 32-bit offsets"
        );
        ensure!(name.len() <= 0xffff, "entry name too long");

        let crc32 = CRC32.checksum(data);
        let record = CentralRecord {
            name: name.to_owned(),
            method,
            crc32,
            compressed_size: payload.len() as u32,
            uncompressed_size: data.len() as u32,
            header_offset: self.offset as u32,
        };

        self.writer.write_u32::<LittleEndian>(LFH_SIG)?;
        self.writer.write_u16::<LittleEndian>(20)?; // version needed
        self.writer.write_u16::<LittleEndian>(0)?; // flags
        self.writer.write_u16::<LittleEndian>(method)?;
        self.writer.write_u16::<LittleEndian>(0)?; // mod time
        self.writer.write_u16::<LittleEndian>(0)?; // mod date
        self.writer.write_u32::<LittleEndian>(crc32)?;
        self.writer
            .write_u32::<LittleEndian>(record.compressed_size)?;
        self.writer
            .write_u32::<LittleEndian>(record.uncompressed_size)?;
        self.writer.write_u16::<LittleEndian>(name.len() as u16)?;
        self.writer.write_u16::<LittleEndian>(0)?; // extra len
        self.writer.write_all(name.as_bytes())?;
        self.writer.write_all(&payload)?;

        self.offset += 30 + name.len() as u64 + payload.len() as u64;
        self.records.push(record);
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        let cd_offset = self.offset;
        let mut cd_size = 0u64;
        for record in &self.records {
            self.writer.write_u32::<LittleEndian>(CDFH_SIG)?;
            self.writer.write_u16::<LittleEndian>(20)?; // version made by
            self.writer.write_u16::<LittleEndian>(20)?; // version needed
            self.writer.write_u16::<LittleEndian>(0)?; // flags
            self.writer.write_u16::<LittleEndian>(record.method)?;
            self.writer.write_u16::<LittleEndian>(0)?; // mod time
            self.writer.write_u16::<LittleEndian>(0)?; // mod date
            self.writer.write_u32::<LittleEndian>(record.crc32)?;
            self.writer
                .write_u32::<LittleEndian>(record.compressed_size)?;
            self.writer
                .write_u32::<LittleEndian>(record.uncompressed_size)?;
            self.writer
                .write_u16::<LittleEndian>(record.name.len() as u16)?;
            self.writer.write_u16::<LittleEndian>(0)?; // extra len
            self.writer.write_u16::<LittleEndian>(0)?; // comment len
            self.writer.write_u16::<LittleEndian>(0)?; // disk start
            self.writer.write_u16::<LittleEndian>(0)?; // internal attrs
            self.writer.write_u32::<LittleEndian>(0)?; // external attrs
            self.writer
                .write_u32::<LittleEndian>(record.header_offset)?;
            self.writer.write_all(record.name.as_bytes())?;
            cd_size += 46 + record.name.len() as u64;
        }
        ensure!(
            cd_offset + cd_size <= 0xffff_fffe && self.records.len() < 0xffff,
            "archive too large for 32-bit offsets"
        );

        self.writer.write_u32::<LittleEndian>(EOCD_SIG)?;
        self.writer.write_u16::<LittleEndian>(0)?; // disk number
        self.writer.write_u16::<LittleEndian>(0)?; // directory disk
        self.writer
            .write_u16::<LittleEndian>(self.records.len() as u16)?;
        self.writer
            .write_u16::<LittleEndian>(self.records.len() as u16)?;
        self.writer.write_u32::<LittleEndian>(cd_size as u32)?;
        self.writer.write_u32::<LittleEndian>(cd_offset as u32)?;
        self.writer.write_u16::<LittleEndian>(0)?; // comment len
        self.writer.flush()?;
        Ok(self.writer)
    }
}

////////////////////////////////////////////////////////////////////////////////
