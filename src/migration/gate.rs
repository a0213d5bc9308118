use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::primitives::txlog::{read_tail, EntryKind};
use crate::storage::DatabaseLayout;
use crate::types::{Lsn, Result, SombraError};

/// Why the gate refused an upgrade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// The newest log segment does not end with a checkpoint.
    UncleanShutdown {
        /// Segment that was scanned.
        segment: u64,
        /// Kind of its last valid entry; `None` for an empty segment.
        last_kind: Option<EntryKind>,
        /// Entries following the last checkpoint.
        entries_after_checkpoint: u64,
    },
    /// No transaction log segments exist.
    MissingTransactionLog {
        /// Directory that was searched.
        dir: PathBuf,
    },
    /// The newest segment's header is damaged.
    UnreadableLog {
        /// Segment directory.
        dir: PathBuf,
        /// What was wrong.
        detail: String,
    },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::UncleanShutdown {
                segment,
                last_kind: Some(kind),
                entries_after_checkpoint,
            } => write!(
                f,
                "the database was not shut down cleanly: transaction log segment {segment} \
                 ends with a {kind} entry instead of a checkpoint ({entries_after_checkpoint} \
                 entries after the last checkpoint); start the previous version to recover, \
                 shut it down cleanly, then retry the upgrade"
            ),
            BlockReason::UncleanShutdown {
                segment,
                last_kind: None,
                ..
            } => write!(
                f,
                "the database was not shut down cleanly: transaction log segment {segment} \
                 is empty, so no checkpoint marks a clean shutdown"
            ),
            BlockReason::MissingTransactionLog { dir } => write!(
                f,
                "no transaction log found in {}; a clean shutdown cannot be confirmed",
                dir.display()
            ),
            BlockReason::UnreadableLog { dir, detail } => write!(
                f,
                "transaction log in {} cannot be read ({detail}); a clean shutdown cannot be \
                 confirmed",
                dir.display()
            ),
        }
    }
}

/// Result of the precondition check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// The log ends with a checkpoint; upgrading is safe.
    Allow {
        /// LSN of that checkpoint.
        checkpoint: Lsn,
    },
    /// Upgrading must not proceed.
    Block(BlockReason),
}

/// Requires a clean shutdown before any store file is rewritten.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreconditionGate;

impl PreconditionGate {
    /// Inspects the tail of the newest log segment in `layout`.
    ///
    /// Damaged log data yields a `Block`; only I/O failures are errors.
    pub fn check(&self, layout: &DatabaseLayout) -> Result<GateDecision> {
        let dir = layout.txlog_dir();
        let tail = match read_tail(&dir) {
            Ok(Some(tail)) => tail,
            Ok(None) => {
                return Ok(GateDecision::Block(BlockReason::MissingTransactionLog { dir }))
            }
            Err(SombraError::Corruption(detail)) => {
                return Ok(GateDecision::Block(BlockReason::UnreadableLog {
                    dir,
                    detail: detail.to_owned(),
                }))
            }
            Err(SombraError::CorruptionOwned(detail)) => {
                return Ok(GateDecision::Block(BlockReason::UnreadableLog { dir, detail }))
            }
            Err(err) => return Err(err),
        };
        if tail.is_torn() {
            warn!(
                segment = tail.segment,
                valid_up_to = tail.valid_up_to,
                file_len = tail.file_len,
                "upgrade.gate.torn_tail"
            );
        }
        let decision = match (tail.ends_with_checkpoint(), tail.last_lsn) {
            (true, Some(lsn)) => GateDecision::Allow { checkpoint: lsn },
            _ => GateDecision::Block(BlockReason::UncleanShutdown {
                segment: tail.segment,
                last_kind: tail.last_kind,
                entries_after_checkpoint: tail.entries_after_checkpoint,
            }),
        };
        debug!(segment = tail.segment, decision = ?decision, "upgrade.gate.checked");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::txlog::TxLog;
    use tempfile::tempdir;

    #[test]
    fn checkpoint_at_tail_allows() -> Result<()> {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        let log = TxLog::open(layout.txlog_dir())?;
        log.append_transaction(b"create")?;
        let lsn = log.checkpoint()?;
        assert_eq!(
            PreconditionGate.check(&layout)?,
            GateDecision::Allow { checkpoint: lsn }
        );
        Ok(())
    }

    #[test]
    fn commit_after_checkpoint_blocks() -> Result<()> {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        let log = TxLog::open(layout.txlog_dir())?;
        log.checkpoint()?;
        log.append_transaction(b"late write")?;
        match PreconditionGate.check(&layout)? {
            GateDecision::Block(reason @ BlockReason::UncleanShutdown { .. }) => {
                assert!(reason.to_string().contains("not shut down cleanly"));
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn missing_log_blocks_with_its_own_reason() -> Result<()> {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        assert!(matches!(
            PreconditionGate.check(&layout)?,
            GateDecision::Block(BlockReason::MissingTransactionLog { .. })
        ));
        Ok(())
    }
}
