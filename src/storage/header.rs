use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::primitives::io::{is_eof, FileIo, StdFileIo};
use crate::storage::layout::StoreFile;
use crate::types::{record_crc32, Result, SombraError};

/// Size of the header at the start of every store file.
pub const HEADER_LEN: usize = 64;

const MAGIC: &[u8; 8] = b"SOMBRAST";
const FORMAT_OFFSET: usize = 8;
const FORMAT_LEN: usize = 16;
const GENERATION_OFFSET: usize = 24;
const KIND_OFFSET: usize = 26;
const COUNT_OFFSET: usize = 28;
const RECORD_SIZE_OFFSET: usize = 36;
const CRC_OFFSET: usize = 60;

/// Format family written by this crate.
pub const FORMAT_NAME: &str = "sombra-record";
/// Narrow little-endian records with 32-bit ids.
pub const LEGACY_GENERATION: u16 = 1;
/// Wide big-endian records with 64-bit ids.
pub const CURRENT_GENERATION: u16 = 2;

/// Identifies the on-disk format of a store file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreVersion {
    /// Format family name.
    pub format: String,
    /// Generation within the family.
    pub generation: u16,
}

impl StoreVersion {
    /// Builds a version of the `sombra-record` family.
    pub fn new(generation: u16) -> Self {
        Self {
            format: FORMAT_NAME.to_owned(),
            generation,
        }
    }

    /// The version this build reads and writes natively.
    pub fn current() -> Self {
        Self::new(CURRENT_GENERATION)
    }

    /// The version written by the previous release line.
    pub fn legacy() -> Self {
        Self::new(LEGACY_GENERATION)
    }

    /// Whether this is the native version.
    pub fn is_current(&self) -> bool {
        *self == Self::current()
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.format, self.generation)
    }
}

/// Decoded header of a store file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreHeader {
    /// Format the body was written in.
    pub version: StoreVersion,
    /// Which store this file holds.
    pub kind: StoreFile,
    /// Number of records (or posting blocks for the label index).
    pub record_count: u64,
    /// Fixed record width; zero for variable-length bodies.
    pub record_size: u32,
}

impl StoreHeader {
    /// Serializes the header, including its trailing checksum.
    pub fn encode(&self) -> Result<[u8; HEADER_LEN]> {
        let name = self.version.format.as_bytes();
        if name.is_empty() || name.len() > FORMAT_LEN {
            return Err(SombraError::Invalid("format name must be 1..=16 bytes"));
        }
        let mut buf = [0u8; HEADER_LEN];
        buf[..MAGIC.len()].copy_from_slice(MAGIC);
        buf[FORMAT_OFFSET..FORMAT_OFFSET + name.len()].copy_from_slice(name);
        buf[GENERATION_OFFSET..GENERATION_OFFSET + 2]
            .copy_from_slice(&self.version.generation.to_be_bytes());
        buf[KIND_OFFSET..KIND_OFFSET + 2].copy_from_slice(&self.kind.tag().to_be_bytes());
        buf[COUNT_OFFSET..COUNT_OFFSET + 8].copy_from_slice(&self.record_count.to_be_bytes());
        buf[RECORD_SIZE_OFFSET..RECORD_SIZE_OFFSET + 4]
            .copy_from_slice(&self.record_size.to_be_bytes());
        let crc = record_crc32(&[&buf[..CRC_OFFSET]]);
        buf[CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Parses and validates a header.
    ///
    /// Any generation is accepted here; deciding whether it is supported is
    /// left to the caller.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(SombraError::Corruption("store header truncated"));
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(SombraError::Corruption("store header magic mismatch"));
        }
        let stored_crc = read_u32(buf, CRC_OFFSET);
        if record_crc32(&[&buf[..CRC_OFFSET]]) != stored_crc {
            return Err(SombraError::Corruption("store header checksum mismatch"));
        }
        let raw_name = &buf[FORMAT_OFFSET..FORMAT_OFFSET + FORMAT_LEN];
        let name_len = raw_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(FORMAT_LEN);
        if name_len == 0 || raw_name[name_len..].iter().any(|b| *b != 0) {
            return Err(SombraError::Corruption("store header format name malformed"));
        }
        let format = std::str::from_utf8(&raw_name[..name_len])
            .map_err(|_| SombraError::Corruption("store header format name is not utf-8"))?
            .to_owned();
        let generation = read_u16(buf, GENERATION_OFFSET);
        let kind_tag = read_u16(buf, KIND_OFFSET);
        let kind = StoreFile::from_tag(kind_tag).ok_or_else(|| {
            SombraError::CorruptionOwned(format!("unknown store kind tag {kind_tag}"))
        })?;
        Ok(Self {
            version: StoreVersion { format, generation },
            kind,
            record_count: read_u64(buf, COUNT_OFFSET),
            record_size: read_u32(buf, RECORD_SIZE_OFFSET),
        })
    }
}

/// Reads the header of the store file at `path`.
pub fn read_header(path: &Path) -> Result<StoreHeader> {
    let io = StdFileIo::open_read_only(path)?;
    read_header_from(&io)
}

/// Reads the header through an already open handle.
pub fn read_header_from(io: &dyn FileIo) -> Result<StoreHeader> {
    let mut buf = [0u8; HEADER_LEN];
    match io.read_at(0, &mut buf) {
        Ok(()) => StoreHeader::decode(&buf),
        Err(err) if is_eof(&err) => Err(SombraError::Corruption("store header truncated")),
        Err(err) => Err(err),
    }
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buf[off..off + 2]);
    u16::from_be_bytes(raw)
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(raw)
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(raw)
}
