#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::primitives::io::{is_eof, FileIo, StdFileIo};
use crate::types::{record_crc32, Lsn, Result, SombraError};

const LOG_MAGIC: [u8; 4] = *b"SOMT";
const LOG_FORMAT_VERSION: u16 = 1;
const SEGMENT_HEADER_LEN: usize = 32;
const ENTRY_HEADER_LEN: usize = 13;
const ENTRY_TRAILER_LEN: usize = 4;
const SEGMENT_PREFIX: &str = "txlog.";
const MAX_ENTRY_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Kind tag of a transaction log entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Transaction start.
    Start,
    /// Store command inside a transaction.
    Command,
    /// Transaction commit.
    Commit,
    /// Store reached a quiescent, durable state.
    Checkpoint,
}

impl EntryKind {
    fn tag(self) -> u8 {
        match self {
            EntryKind::Start => 1,
            EntryKind::Command => 2,
            EntryKind::Commit => 3,
            EntryKind::Checkpoint => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntryKind::Start),
            2 => Some(EntryKind::Command),
            3 => Some(EntryKind::Commit),
            4 => Some(EntryKind::Checkpoint),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryKind::Start => "start",
            EntryKind::Command => "command",
            EntryKind::Commit => "commit",
            EntryKind::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
struct SegmentHeader {
    segment: u64,
    start_lsn: Lsn,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.segment.to_be_bytes());
        buf[16..24].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = record_crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < SEGMENT_HEADER_LEN {
            return Err(SombraError::Corruption("txlog segment header truncated"));
        }
        if src[0..4] != LOG_MAGIC {
            return Err(SombraError::Corruption("txlog magic mismatch"));
        }
        let version = u16::from_be_bytes([src[4], src[5]]);
        if version != LOG_FORMAT_VERSION {
            return Err(SombraError::Corruption("txlog format version mismatch"));
        }
        let stored_crc = u32::from_be_bytes(read_array(&src[28..32]));
        if record_crc32(&[&src[..28]]) != stored_crc {
            return Err(SombraError::Corruption("txlog segment header crc mismatch"));
        }
        Ok(Self {
            segment: u64::from_be_bytes(read_array(&src[8..16])),
            start_lsn: Lsn(u64::from_be_bytes(read_array(&src[16..24]))),
        })
    }
}

/// A decoded log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Entry kind.
    pub kind: EntryKind,
    /// Sequence number assigned at append time.
    pub lsn: Lsn,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl LogEntry {
    fn encoded_len(&self) -> usize {
        ENTRY_HEADER_LEN + self.payload.len() + ENTRY_TRAILER_LEN
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind.tag());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.lsn.0.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        let crc = record_crc32(&[&buf]);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }
}

/// What the end of the newest log segment looks like.
#[derive(Clone, Debug, Serialize)]
pub struct LogTail {
    /// Segment number of the newest segment.
    pub segment: u64,
    /// Path of the newest segment.
    pub path: PathBuf,
    /// Kind of the last valid entry, if the segment has any.
    pub last_kind: Option<EntryKind>,
    /// LSN of the last valid entry.
    pub last_lsn: Option<Lsn>,
    /// Byte offset of the last valid entry.
    pub last_entry_offset: Option<u64>,
    /// LSN of the most recent checkpoint in the segment.
    pub last_checkpoint: Option<Lsn>,
    /// Entries appended after the most recent checkpoint.
    pub entries_after_checkpoint: u64,
    /// Offset just past the last valid entry.
    pub valid_up_to: u64,
    /// Physical file length; larger than `valid_up_to` when the tail is torn.
    pub file_len: u64,
}

impl LogTail {
    /// True when the last valid entry of the segment is a checkpoint.
    pub fn ends_with_checkpoint(&self) -> bool {
        matches!(self.last_kind, Some(EntryKind::Checkpoint))
    }

    /// True when bytes past the last valid entry exist.
    pub fn is_torn(&self) -> bool {
        self.file_len > self.valid_up_to
    }
}

/// Sequential reader over one segment; stops at the first torn or corrupt entry.
pub struct SegmentReader {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    valid_up_to: u64,
    header: SegmentHeader,
}

impl SegmentReader {
    /// Opens the segment at `path` for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open_read_only(path)?);
        let end = io.len()?;
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        io.read_at(0, &mut buf).map_err(|err| {
            if is_eof(&err) {
                SombraError::Corruption("txlog segment header truncated")
            } else {
                err
            }
        })?;
        let header = SegmentHeader::decode(&buf)?;
        Ok(Self {
            io,
            offset: SEGMENT_HEADER_LEN as u64,
            end,
            valid_up_to: SEGMENT_HEADER_LEN as u64,
            header,
        })
    }

    /// Returns the next valid entry and its offset, or `None` at the end of valid data.
    pub fn next_entry(&mut self) -> Result<Option<(u64, LogEntry)>> {
        let entry_off = self.offset;
        if entry_off + (ENTRY_HEADER_LEN + ENTRY_TRAILER_LEN) as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut head = [0u8; ENTRY_HEADER_LEN];
        match self.io.read_at(entry_off, &mut head) {
            Ok(()) => {}
            Err(err) if is_eof(&err) => return Ok(self.stop()),
            Err(err) => return Err(err),
        }
        let Some(kind) = EntryKind::from_tag(head[0]) else {
            return Ok(self.stop());
        };
        let len = u32::from_be_bytes(read_array(&head[1..5]));
        if len > MAX_ENTRY_PAYLOAD {
            return Ok(self.stop());
        }
        let lsn = Lsn(u64::from_be_bytes(read_array(&head[5..13])));
        let total = ENTRY_HEADER_LEN + len as usize + ENTRY_TRAILER_LEN;
        if entry_off + total as u64 > self.end {
            return Ok(self.stop());
        }
        let mut rest = vec![0u8; len as usize + ENTRY_TRAILER_LEN];
        match self.io.read_at(entry_off + ENTRY_HEADER_LEN as u64, &mut rest) {
            Ok(()) => {}
            Err(err) if is_eof(&err) => return Ok(self.stop()),
            Err(err) => return Err(err),
        }
        let (payload, trailer) = rest.split_at(len as usize);
        let stored_crc = u32::from_be_bytes(read_array(trailer));
        if record_crc32(&[&head, payload]) != stored_crc {
            return Ok(self.stop());
        }
        if lsn < self.header.start_lsn {
            return Err(SombraError::Corruption("txlog entry lsn below segment start"));
        }
        self.offset = entry_off + total as u64;
        self.valid_up_to = self.offset;
        Ok(Some((
            entry_off,
            LogEntry {
                kind,
                lsn,
                payload: payload.to_vec(),
            },
        )))
    }

    /// Offset up to which entries have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    fn stop(&mut self) -> Option<(u64, LogEntry)> {
        self.offset = self.end;
        None
    }
}

/// Lists `(segment number, path)` pairs in `dir`, oldest first.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(number) = name.strip_prefix(SEGMENT_PREFIX) else {
            continue;
        };
        if let Ok(number) = number.parse::<u64>() {
            segments.push((number, entry.path()));
        }
    }
    segments.sort_by_key(|(number, _)| *number);
    Ok(segments)
}

/// Scans the newest segment in `dir`. Returns `None` when no segment exists.
pub fn read_tail(dir: &Path) -> Result<Option<LogTail>> {
    let Some((segment, path)) = list_segments(dir)?.pop() else {
        return Ok(None);
    };
    let mut reader = SegmentReader::open(&path)?;
    let mut last: Option<(u64, EntryKind, Lsn)> = None;
    let mut last_checkpoint = None;
    let mut entries_after_checkpoint = 0u64;
    while let Some((offset, entry)) = reader.next_entry()? {
        if entry.kind == EntryKind::Checkpoint {
            last_checkpoint = Some(entry.lsn);
            entries_after_checkpoint = 0;
        } else {
            entries_after_checkpoint += 1;
        }
        last = Some((offset, entry.kind, entry.lsn));
    }
    let tail = LogTail {
        segment,
        path,
        last_kind: last.map(|(_, kind, _)| kind),
        last_lsn: last.map(|(_, _, lsn)| lsn),
        last_entry_offset: last.map(|(offset, _, _)| offset),
        last_checkpoint,
        entries_after_checkpoint,
        valid_up_to: reader.valid_up_to(),
        file_len: reader.end,
    };
    debug!(
        segment = tail.segment,
        last_kind = ?tail.last_kind,
        after_checkpoint = tail.entries_after_checkpoint,
        torn = tail.is_torn(),
        "txlog.tail.scanned"
    );
    Ok(Some(tail))
}

struct LogState {
    segment: u64,
    io: Arc<dyn FileIo>,
    append_offset: u64,
    next_lsn: Lsn,
}

/// Append side of the segmented transaction log.
pub struct TxLog {
    dir: PathBuf,
    state: Mutex<LogState>,
}

impl TxLog {
    /// Opens the log in `dir`, creating the first segment when none exists.
    ///
    /// A torn tail on the newest segment is cut back to the last valid entry.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let state = match read_tail(&dir)? {
            None => Self::create_segment(&dir, 1, Lsn(1))?,
            Some(tail) => {
                let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&tail.path)?);
                if tail.is_torn() {
                    debug!(
                        segment = tail.segment,
                        valid_up_to = tail.valid_up_to,
                        file_len = tail.file_len,
                        "txlog.open.truncate_torn_tail"
                    );
                    io.truncate(tail.valid_up_to)?;
                    io.sync_all()?;
                }
                let next_lsn = match tail.last_lsn {
                    Some(lsn) => Lsn(lsn.0 + 1),
                    None => segment_start_lsn(io.as_ref())?,
                };
                LogState {
                    segment: tail.segment,
                    io,
                    append_offset: tail.valid_up_to,
                    next_lsn,
                }
            }
        };
        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    fn create_segment(dir: &Path, segment: u64, start_lsn: Lsn) -> Result<LogState> {
        let path = segment_path(dir, segment);
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::create(&path)?);
        let header = SegmentHeader { segment, start_lsn };
        io.write_at(0, &header.encode())?;
        io.sync_all()?;
        Ok(LogState {
            segment,
            io,
            append_offset: SEGMENT_HEADER_LEN as u64,
            next_lsn: start_lsn,
        })
    }

    /// Directory holding the segments.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one entry and returns its LSN. Does not sync.
    pub fn append(&self, kind: EntryKind, payload: &[u8]) -> Result<Lsn> {
        if payload.len() as u64 > u64::from(MAX_ENTRY_PAYLOAD) {
            return Err(SombraError::Invalid("txlog payload too large"));
        }
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        let entry = LogEntry {
            kind,
            lsn,
            payload: payload.to_vec(),
        };
        let encoded = entry.encode();
        state.io.write_at(state.append_offset, &encoded)?;
        state.append_offset += encoded.len() as u64;
        state.next_lsn = Lsn(lsn.0 + 1);
        Ok(lsn)
    }

    /// Appends start, command and commit entries for one transaction, then syncs.
    pub fn append_transaction(&self, command: &[u8]) -> Result<Lsn> {
        self.append(EntryKind::Start, &[])?;
        self.append(EntryKind::Command, command)?;
        let lsn = self.append(EntryKind::Commit, &[])?;
        self.sync()?;
        Ok(lsn)
    }

    /// Appends a checkpoint entry and syncs it.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let lsn = self.append(EntryKind::Checkpoint, &[])?;
        self.sync()?;
        debug!(lsn = lsn.0, "txlog.checkpoint");
        Ok(lsn)
    }

    /// Starts a new segment; subsequent appends go there.
    pub fn rotate(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.io.sync_all()?;
        let next = Self::create_segment(&self.dir, state.segment + 1, state.next_lsn)?;
        *state = next;
        debug!(segment = state.segment, "txlog.rotate");
        Ok(state.segment)
    }

    /// Syncs the active segment.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        state.io.sync_all()
    }

    /// Scans the newest segment.
    pub fn tail(&self) -> Result<LogTail> {
        read_tail(&self.dir)?.ok_or(SombraError::Corruption("txlog has no segments"))
    }
}

fn segment_start_lsn(io: &dyn FileIo) -> Result<Lsn> {
    let mut buf = [0u8; SEGMENT_HEADER_LEN];
    io.read_at(0, &mut buf)?;
    Ok(SegmentHeader::decode(&buf)?.start_lsn)
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{segment}"))
}

fn read_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&src[..N]);
    out
}
