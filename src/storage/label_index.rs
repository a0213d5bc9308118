//! Label → node postings stored beside the record files.
//!
//! Generation 1 stores flat `(label u8, node u32 LE)` pairs. Generation 2 stores
//! one checksummed block per label: `[label u32][count u32][node u64]*[crc32]`,
//! all big-endian.

use std::collections::BTreeMap;
use std::path::Path;

use crate::primitives::io::{FileIo, StdFileIo};
use crate::storage::header::{
    read_header_from, read_u32, read_u64, StoreHeader, StoreVersion, CURRENT_GENERATION,
    HEADER_LEN, LEGACY_GENERATION,
};
use crate::storage::layout::StoreFile;
use crate::storage::record::NodeRecord;
use crate::types::{record_crc32, LabelId, NodeId, Result, SombraError};

const LEGACY_ENTRY_LEN: usize = 5;
const BLOCK_HEADER_LEN: usize = 8;
const BLOCK_TRAILER_LEN: usize = 4;

/// In-memory label postings, sorted by label then node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelIndex {
    postings: BTreeMap<LabelId, Vec<NodeId>>,
}

impl LabelIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes the labeled, in-use nodes of a node store slice whose first
    /// slot is `first_id`.
    pub fn from_nodes(first_id: u64, nodes: &[NodeRecord]) -> Self {
        let mut index = Self::new();
        for (offset, node) in nodes.iter().enumerate() {
            if node.in_use && node.label != LabelId(0) {
                index.insert(node.label, NodeId(first_id + offset as u64));
            }
        }
        index
    }

    /// Adds one posting.
    pub fn insert(&mut self, label: LabelId, node: NodeId) {
        let nodes = self.postings.entry(label).or_default();
        if let Err(pos) = nodes.binary_search(&node) {
            nodes.insert(pos, node);
        }
    }

    /// Folds another partial index into this one.
    pub fn merge(&mut self, other: LabelIndex) {
        for (label, nodes) in other.postings {
            for node in nodes {
                self.insert(label, node);
            }
        }
    }

    /// Nodes carrying `label`.
    pub fn nodes(&self, label: LabelId) -> &[NodeId] {
        self.postings.get(&label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterates `(label, nodes)` in label order.
    pub fn iter(&self) -> impl Iterator<Item = (LabelId, &[NodeId])> {
        self.postings
            .iter()
            .map(|(label, nodes)| (*label, nodes.as_slice()))
    }

    /// Total number of postings.
    pub fn posting_count(&self) -> usize {
        self.postings.values().map(Vec::len).sum()
    }

    /// Number of distinct labels.
    pub fn label_count(&self) -> usize {
        self.postings.len()
    }
}

/// Writes `index` to `path` in `version` and syncs it.
pub fn write_label_index(path: &Path, version: StoreVersion, index: &LabelIndex) -> Result<()> {
    let (body, record_count, record_size) = match version.generation {
        LEGACY_GENERATION => encode_legacy(index)?,
        CURRENT_GENERATION => encode_current(index),
        other => {
            return Err(SombraError::InvalidOwned(format!(
                "no label index codec for generation {other}"
            )))
        }
    };
    let header = StoreHeader {
        version,
        kind: StoreFile::LabelIndex,
        record_count,
        record_size,
    };
    let io = StdFileIo::create(path)?;
    io.write_at(0, &header.encode()?)?;
    io.write_at(HEADER_LEN as u64, &body)?;
    io.sync_all()?;
    Ok(())
}

/// Reads the label index at `path`, whichever generation it is in.
pub fn read_label_index(path: &Path) -> Result<(StoreHeader, LabelIndex)> {
    let io = StdFileIo::open_read_only(path)?;
    let header = read_header_from(&io)?;
    if header.kind != StoreFile::LabelIndex {
        return Err(SombraError::Corruption("label index file has wrong kind"));
    }
    let body_len = io
        .len()?
        .checked_sub(HEADER_LEN as u64)
        .ok_or(SombraError::Corruption("label index truncated"))?;
    let mut body = vec![0u8; body_len as usize];
    io.read_at(HEADER_LEN as u64, &mut body)?;
    let index = match header.version.generation {
        LEGACY_GENERATION => decode_legacy(&header, &body)?,
        CURRENT_GENERATION => decode_current(&header, &body)?,
        other => {
            return Err(SombraError::InvalidOwned(format!(
                "no label index codec for generation {other}"
            )))
        }
    };
    Ok((header, index))
}

fn encode_legacy(index: &LabelIndex) -> Result<(Vec<u8>, u64, u32)> {
    let mut pairs = Vec::with_capacity(index.posting_count());
    for (label, nodes) in index.iter() {
        let label = u8::try_from(label.0).map_err(|_| {
            SombraError::InvalidOwned(format!("label {label} does not fit a generation 1 index"))
        })?;
        for node in nodes {
            let node = u32::try_from(node.0).map_err(|_| {
                SombraError::InvalidOwned(format!("node {node} does not fit a generation 1 index"))
            })?;
            pairs.push((node, label));
        }
    }
    pairs.sort_unstable();
    let mut body = Vec::with_capacity(pairs.len() * LEGACY_ENTRY_LEN);
    for (node, label) in &pairs {
        body.push(*label);
        body.extend_from_slice(&node.to_le_bytes());
    }
    Ok((body, pairs.len() as u64, LEGACY_ENTRY_LEN as u32))
}

fn decode_legacy(header: &StoreHeader, body: &[u8]) -> Result<LabelIndex> {
    if header.record_size as usize != LEGACY_ENTRY_LEN
        || body.len() as u64 != header.record_count * LEGACY_ENTRY_LEN as u64
    {
        return Err(SombraError::Corruption("legacy label index size mismatch"));
    }
    let mut index = LabelIndex::new();
    for entry in body.chunks_exact(LEGACY_ENTRY_LEN) {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&entry[1..5]);
        index.insert(
            LabelId(u32::from(entry[0])),
            NodeId(u64::from(u32::from_le_bytes(raw))),
        );
    }
    Ok(index)
}

fn encode_current(index: &LabelIndex) -> (Vec<u8>, u64, u32) {
    let mut body = Vec::new();
    for (label, nodes) in index.iter() {
        let start = body.len();
        body.extend_from_slice(&label.0.to_be_bytes());
        body.extend_from_slice(&(nodes.len() as u32).to_be_bytes());
        for node in nodes {
            body.extend_from_slice(&node.0.to_be_bytes());
        }
        let crc = record_crc32(&[&body[start..]]);
        body.extend_from_slice(&crc.to_be_bytes());
    }
    (body, index.label_count() as u64, 0)
}

fn decode_current(header: &StoreHeader, body: &[u8]) -> Result<LabelIndex> {
    if header.record_size != 0 {
        return Err(SombraError::Corruption("label index declares fixed records"));
    }
    let mut index = LabelIndex::new();
    let mut off = 0usize;
    for _ in 0..header.record_count {
        if body.len() - off < BLOCK_HEADER_LEN {
            return Err(SombraError::Corruption("label index block truncated"));
        }
        let label = LabelId(read_u32(body, off));
        let count = read_u32(body, off + 4) as usize;
        let nodes_len = count
            .checked_mul(8)
            .ok_or(SombraError::Corruption("label index block too large"))?;
        let block_len = BLOCK_HEADER_LEN + nodes_len;
        if body.len() - off < block_len + BLOCK_TRAILER_LEN {
            return Err(SombraError::Corruption("label index block truncated"));
        }
        let stored_crc = read_u32(body, off + block_len);
        if record_crc32(&[&body[off..off + block_len]]) != stored_crc {
            return Err(SombraError::Corruption("label index block checksum mismatch"));
        }
        for i in 0..count {
            index.insert(label, NodeId(read_u64(body, off + BLOCK_HEADER_LEN + i * 8)));
        }
        off += block_len + BLOCK_TRAILER_LEN;
    }
    if off != body.len() {
        return Err(SombraError::Corruption("label index has trailing bytes"));
    }
    Ok(index)
}
