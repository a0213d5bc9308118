//! Shared identifiers and the core error type.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

pub mod checksum;

pub use checksum::{record_crc32, Checksum, Crc32Fast};

/// Log sequence number of a transaction log entry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

/// Position of a node record in the node store.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct NodeId(pub u64);

/// Label identifier; `LabelId(0)` means "no label".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct LabelId(pub u32);

/// Relationship type identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TypeId(pub u32);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the storage primitives.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// On-disk bytes failed validation (with context).
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// Caller supplied an unusable value.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an unusable value (with context).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// Another owner holds the store lock.
    #[error("store is locked by another owner: {0}")]
    Locked(PathBuf),
    /// A background job this operation depended on did not complete.
    #[error("background job did not complete")]
    Job(#[from] crate::scheduler::SchedulerError),
    /// Entity missing.
    #[error("not found")]
    NotFound,
}

/// Result alias for storage primitives.
pub type Result<T> = std::result::Result<T, SombraError>;
