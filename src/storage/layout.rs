use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

const TXLOG_DIR: &str = "txlog";
const UPGRADE_DIR: &str = "upgrade";
const STAGING_DIR: &str = "staging";
const COMMIT_MARKER: &str = "commit.marker";
const LOCK_FILE: &str = "store.lock";

/// One file of a store directory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFile {
    /// Store-wide metadata; its header is the authoritative version.
    Meta,
    /// Node records.
    Nodes,
    /// Relationship records.
    Edges,
    /// Property records.
    Props,
    /// Label → node postings, derived from the node store.
    LabelIndex,
}

impl StoreFile {
    /// Every store file, foundational stores first.
    pub const ALL: [StoreFile; 5] = [
        StoreFile::Meta,
        StoreFile::Nodes,
        StoreFile::Edges,
        StoreFile::Props,
        StoreFile::LabelIndex,
    ];

    /// File name inside the store directory.
    pub fn file_name(self) -> &'static str {
        match self {
            StoreFile::Meta => "meta.db",
            StoreFile::Nodes => "nodes.db",
            StoreFile::Edges => "edges.db",
            StoreFile::Props => "props.db",
            StoreFile::LabelIndex => "labels.idx",
        }
    }

    /// Tag written into the store header.
    pub fn tag(self) -> u16 {
        match self {
            StoreFile::Meta => 1,
            StoreFile::Nodes => 2,
            StoreFile::Edges => 3,
            StoreFile::Props => 4,
            StoreFile::LabelIndex => 5,
        }
    }

    /// Inverse of [`StoreFile::tag`].
    pub fn from_tag(tag: u16) -> Option<Self> {
        StoreFile::ALL.into_iter().find(|file| file.tag() == tag)
    }

    /// Whether a store is complete without this file.
    pub fn is_optional(self) -> bool {
        matches!(self, StoreFile::LabelIndex)
    }
}

impl fmt::Display for StoreFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Paths of everything that makes up one database directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseLayout {
    dir: PathBuf,
}

impl DatabaseLayout {
    /// Layout rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of one store file.
    pub fn store_file(&self, file: StoreFile) -> PathBuf {
        self.dir.join(file.file_name())
    }

    /// Store files currently present on disk.
    pub fn present_store_files(&self) -> Vec<StoreFile> {
        StoreFile::ALL
            .into_iter()
            .filter(|file| self.store_file(*file).exists())
            .collect()
    }

    /// Whether the directory holds any store file at all.
    pub fn has_store(&self) -> bool {
        !self.present_store_files().is_empty()
    }

    /// Directory of transaction log segments.
    pub fn txlog_dir(&self) -> PathBuf {
        self.dir.join(TXLOG_DIR)
    }

    /// Working area of an upgrade attempt.
    pub fn upgrade_dir(&self) -> PathBuf {
        self.dir.join(UPGRADE_DIR)
    }

    /// Directory that receives participant output until commit.
    pub fn staging_dir(&self) -> PathBuf {
        self.upgrade_dir().join(STAGING_DIR)
    }

    /// The staging directory viewed as a layout of its own.
    pub fn staging_layout(&self) -> DatabaseLayout {
        DatabaseLayout::new(self.staging_dir())
    }

    /// Durable record of an in-flight commit.
    pub fn commit_marker(&self) -> PathBuf {
        self.upgrade_dir().join(COMMIT_MARKER)
    }

    /// Lock file guarding exclusive ownership.
    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }
}
