//! Durable, resumable commit of staged store files.
//!
//! The marker lists every `(staged, destination)` rename, relative to the
//! database directory, and is made durable before the first rename. A crash at
//! any point after that is finished by replaying the marker; a crash before it
//! leaves only staging behind, which is discarded.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::primitives::io::{remove_dir_if_exists, sync_dir, FileIo, StdFileIo};
use crate::storage::{read_header, DatabaseLayout, StoreFile, StoreVersion};
use crate::types::{record_crc32, Result, SombraError};

const MARKER_CRC_LEN: usize = 4;

/// One rename the commit performs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMove {
    /// Staged file, relative to the database directory.
    pub staged: PathBuf,
    /// Final location, relative to the database directory.
    pub destination: PathBuf,
}

/// Durable description of an in-flight commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMarker {
    /// Version every destination holds once the commit finishes.
    pub target: StoreVersion,
    /// Renames in execution order; the meta file is always last.
    pub moves: Vec<PendingMove>,
}

/// What startup recovery found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// Nothing was left over.
    Clean,
    /// An interrupted commit was finished.
    ResumedCommit {
        /// Renames that still had to be done.
        moved: usize,
    },
    /// Staging from an interrupted attempt was removed.
    DiscardedStaging,
}

impl CommitMarker {
    /// Marker committing `files` from `layout`'s staging area.
    pub fn new(layout: &DatabaseLayout, target: StoreVersion, files: &[StoreFile]) -> Self {
        let mut ordered: Vec<StoreFile> = files.to_vec();
        ordered.sort_by_key(|file| (*file == StoreFile::Meta, *file));
        ordered.dedup();
        let staging_rel = layout
            .staging_dir()
            .strip_prefix(layout.dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from("upgrade/staging"));
        let moves = ordered
            .into_iter()
            .map(|file| PendingMove {
                staged: staging_rel.join(file.file_name()),
                destination: PathBuf::from(file.file_name()),
            })
            .collect();
        Self { target, moves }
    }

    /// Writes the marker durably (temp file, fsync, rename, fsync dir).
    pub fn persist(&self, layout: &DatabaseLayout) -> Result<()> {
        let json = serde_json::to_vec(self)
            .map_err(|err| SombraError::InvalidOwned(format!("commit marker: {err}")))?;
        let mut bytes = Vec::with_capacity(MARKER_CRC_LEN + json.len());
        bytes.extend_from_slice(&record_crc32(&[&json]).to_be_bytes());
        bytes.extend_from_slice(&json);

        let path = layout.commit_marker();
        let tmp = path.with_extension("marker.tmp");
        fs::create_dir_all(layout.upgrade_dir())?;
        let io = StdFileIo::create(&tmp)?;
        io.write_at(0, &bytes)?;
        io.sync_all()?;
        drop(io);
        fs::rename(&tmp, &path)?;
        sync_dir(&layout.upgrade_dir())?;
        debug!(moves = self.moves.len(), target = %self.target, "upgrade.commit.marker_written");
        Ok(())
    }

    /// Reads the marker, if one exists.
    pub fn load(layout: &DatabaseLayout) -> Result<Option<Self>> {
        let path = layout.commit_marker();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < MARKER_CRC_LEN {
            return Err(SombraError::Corruption("commit marker truncated"));
        }
        let (crc, json) = bytes.split_at(MARKER_CRC_LEN);
        let mut stored = [0u8; MARKER_CRC_LEN];
        stored.copy_from_slice(crc);
        if u32::from_be_bytes(stored) != record_crc32(&[json]) {
            return Err(SombraError::Corruption("commit marker checksum mismatch"));
        }
        let marker: Self = serde_json::from_slice(json)
            .map_err(|err| SombraError::CorruptionOwned(format!("commit marker: {err}")))?;
        for pending in &marker.moves {
            ensure_relative(&pending.staged)?;
            ensure_relative(&pending.destination)?;
        }
        Ok(Some(marker))
    }

    /// Performs every rename that has not happened yet. Safe to repeat.
    pub fn apply(&self, layout: &DatabaseLayout) -> Result<usize> {
        let mut moved = 0;
        for pending in &self.moves {
            let staged = layout.dir().join(&pending.staged);
            let destination = layout.dir().join(&pending.destination);
            if staged.exists() {
                fs::rename(&staged, &destination)?;
                moved += 1;
                debug!(file = %pending.destination.display(), "upgrade.commit.renamed");
                continue;
            }
            let done = destination.exists()
                && read_header(&destination).map(|h| h.version == self.target)?;
            if !done {
                return Err(SombraError::CorruptionOwned(format!(
                    "commit marker lists {} but neither it nor a migrated {} exists",
                    pending.staged.display(),
                    pending.destination.display()
                )));
            }
        }
        sync_dir(layout.dir())?;
        Ok(moved)
    }

    /// Removes the marker and everything else under the upgrade directory.
    pub fn clear(layout: &DatabaseLayout) -> Result<()> {
        remove_dir_if_exists(&layout.upgrade_dir())?;
        sync_dir(layout.dir())
    }
}

fn ensure_relative(path: &Path) -> Result<()> {
    if path
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        Ok(())
    } else {
        Err(SombraError::CorruptionOwned(format!(
            "commit marker path {} escapes the database directory",
            path.display()
        )))
    }
}

/// Persists `marker`, performs its renames, and cleans up.
pub fn commit_staged(layout: &DatabaseLayout, marker: &CommitMarker) -> Result<()> {
    marker.persist(layout)?;
    let moved = marker.apply(layout)?;
    CommitMarker::clear(layout)?;
    info!(
        dir = %layout.dir().display(),
        moved,
        target = %marker.target,
        "upgrade.commit.complete"
    );
    Ok(())
}

/// Finishes or discards whatever an interrupted attempt left behind.
pub fn recover_interrupted(layout: &DatabaseLayout) -> Result<Recovery> {
    if let Some(marker) = CommitMarker::load(layout)? {
        let moved = marker.apply(layout)?;
        CommitMarker::clear(layout)?;
        info!(
            dir = %layout.dir().display(),
            moved,
            target = %marker.target,
            "upgrade.recovery.resumed_commit"
        );
        return Ok(Recovery::ResumedCommit { moved });
    }
    if layout.upgrade_dir().exists() {
        CommitMarker::clear(layout)?;
        info!(dir = %layout.dir().display(), "upgrade.recovery.discarded_staging");
        return Ok(Recovery::DiscardedStaging);
    }
    Ok(Recovery::Clean)
}
