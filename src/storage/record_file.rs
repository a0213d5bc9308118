use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::header::{read_header_from, StoreHeader, StoreVersion, HEADER_LEN};
use crate::storage::record::{record_size, Record};
use crate::types::{Result, SombraError};

/// Read access to a fixed-width record file of any supported generation.
pub struct RecordFile<R: Record> {
    io: StdFileIo,
    header: StoreHeader,
    width: usize,
    _marker: PhantomData<R>,
}

impl<R: Record> RecordFile<R> {
    /// Opens `path` and validates its header against `R`.
    pub fn open(path: &Path) -> Result<Self> {
        let io = StdFileIo::open_read_only(path)?;
        let header = read_header_from(&io)?;
        if header.kind != R::FILE {
            return Err(SombraError::CorruptionOwned(format!(
                "{} holds a {} header",
                path.display(),
                header.kind
            )));
        }
        let width = record_size(header.version.generation)?;
        if header.record_size as usize != width {
            return Err(SombraError::CorruptionOwned(format!(
                "{} declares {}-byte records, generation {} uses {width}",
                path.display(),
                header.record_size,
                header.version.generation
            )));
        }
        let expected = header
            .record_count
            .checked_mul(width as u64)
            .and_then(|body| body.checked_add(HEADER_LEN as u64))
            .ok_or(SombraError::Corruption("record count overflows file size"))?;
        let actual = io.len()?;
        if actual != expected {
            return Err(SombraError::CorruptionOwned(format!(
                "{} is {actual} bytes, header implies {expected}",
                path.display()
            )));
        }
        Ok(Self {
            io,
            header,
            width,
            _marker: PhantomData,
        })
    }

    /// The validated header.
    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    /// Number of record slots.
    pub fn len(&self) -> u64 {
        self.header.record_count
    }

    /// Whether the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.header.record_count == 0
    }

    /// Reads up to `count` records starting at slot `start`.
    pub fn read_range(&self, start: u64, count: u64) -> Result<Vec<R>> {
        let end = start.saturating_add(count).min(self.len());
        if start >= end {
            return Ok(Vec::new());
        }
        let slots = (end - start) as usize;
        let mut buf = vec![0u8; slots * self.width];
        self.io
            .read_at(HEADER_LEN as u64 + start * self.width as u64, &mut buf)?;
        let generation = self.header.version.generation;
        buf.chunks_exact(self.width)
            .map(|chunk| R::decode(generation, chunk))
            .collect()
    }

    /// Reads every record.
    pub fn read_all(&self) -> Result<Vec<R>> {
        self.read_range(0, self.len())
    }
}

/// Streams records into a fresh file, writing the header on [`finish`](Self::finish).
pub struct RecordWriter<R: Record> {
    io: StdFileIo,
    path: PathBuf,
    version: StoreVersion,
    width: usize,
    count: u64,
    buf: Vec<u8>,
    _marker: PhantomData<R>,
}

const WRITE_BUFFER_RECORDS: usize = 1024;

impl<R: Record> RecordWriter<R> {
    /// Creates (or truncates) `path` for records of `version`.
    pub fn create(path: &Path, version: StoreVersion) -> Result<Self> {
        let width = record_size(version.generation)?;
        let io = StdFileIo::create(path)?;
        Ok(Self {
            io,
            path: path.to_path_buf(),
            version,
            width,
            count: 0,
            buf: Vec::with_capacity(width * WRITE_BUFFER_RECORDS),
            _marker: PhantomData,
        })
    }

    /// Appends one record.
    pub fn push(&mut self, record: &R) -> Result<()> {
        let start = self.buf.len();
        self.buf.resize(start + self.width, 0);
        record.encode(self.version.generation, &mut self.buf[start..])?;
        self.count += 1;
        if self.buf.len() >= self.width * WRITE_BUFFER_RECORDS {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Appends a batch of records.
    pub fn extend<'a>(&mut self, records: impl IntoIterator<Item = &'a R>) -> Result<()> {
        for record in records {
            self.push(record)?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let buffered = (self.buf.len() / self.width) as u64;
        let off = HEADER_LEN as u64 + (self.count - buffered) * self.width as u64;
        self.io.write_at(off, &self.buf)?;
        self.buf.clear();
        Ok(())
    }

    /// Writes the header, syncs, and returns it.
    pub fn finish(mut self) -> Result<StoreHeader> {
        self.flush_buffer()?;
        let header = StoreHeader {
            version: self.version.clone(),
            kind: R::FILE,
            record_count: self.count,
            record_size: self.width as u32,
        };
        self.io.write_at(0, &header.encode()?)?;
        self.io
            .truncate(HEADER_LEN as u64 + self.count * self.width as u64)?;
        self.io.sync_all()?;
        tracing::trace!(
            path = %self.path.display(),
            records = self.count,
            version = %header.version,
            "storage.record_file.finish"
        );
        Ok(header)
    }
}

/// Writes `records` to `path` in `version`.
pub fn write_records<R: Record>(path: &Path, version: StoreVersion, records: &[R]) -> Result<()> {
    let mut writer = RecordWriter::<R>::create(path, version)?;
    writer.extend(records)?;
    writer.finish()?;
    Ok(())
}

/// Reads every record of `path`.
pub fn read_records<R: Record>(path: &Path) -> Result<(StoreHeader, Vec<R>)> {
    let file = RecordFile::<R>::open(path)?;
    let records = file.read_all()?;
    Ok((file.header, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::header::LEGACY_GENERATION;
    use crate::storage::record::{EdgeRecord, NodeRecord};
    use crate::types::{LabelId, NodeId, TypeId};
    use tempfile::tempdir;

    #[test]
    fn writer_spills_across_buffer_boundary() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.db");
        let nodes: Vec<NodeRecord> = (0..(WRITE_BUFFER_RECORDS as u64 * 2 + 5))
            .map(|i| NodeRecord {
                in_use: i % 3 != 0,
                label: LabelId((i % 4) as u32),
                first_prop: None,
                degree: i,
            })
            .collect();
        write_records(&path, StoreVersion::current(), &nodes)?;
        let file = RecordFile::<NodeRecord>::open(&path)?;
        assert_eq!(file.len(), nodes.len() as u64);
        assert_eq!(file.read_range(1020, 10)?, nodes[1020..1030].to_vec());
        assert_eq!(file.read_all()?, nodes);
        Ok(())
    }

    #[test]
    fn open_rejects_wrong_kind_and_size_mismatch() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edges.db");
        let edges = vec![EdgeRecord {
            in_use: true,
            ty: TypeId(1),
            src: NodeId(0),
            dst: NodeId(0),
        }];
        write_records(&path, StoreVersion::legacy(), &edges)?;
        assert!(RecordFile::<NodeRecord>::open(&path).is_err());

        let io = StdFileIo::open(&path)?;
        io.truncate(io.len()? - 1)?;
        assert!(RecordFile::<EdgeRecord>::open(&path).is_err());
        Ok(())
    }

    #[test]
    fn read_range_past_end_is_empty() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.db");
        write_records(&path, StoreVersion::new(LEGACY_GENERATION), &[NodeRecord::default()])?;
        let file = RecordFile::<NodeRecord>::open(&path)?;
        assert!(file.read_range(5, 10)?.is_empty());
        Ok(())
    }
}
