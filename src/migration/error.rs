use std::path::PathBuf;

use thiserror::Error;

use crate::admin::VerifyFinding;
use crate::migration::gate::BlockReason;
use crate::storage::StoreVersion;
use crate::types::SombraError;

/// Version detection failures.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// The file is missing, truncated, or its header is damaged.
    #[error("cannot read store version from {path}")]
    Unreadable {
        /// File that was inspected.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: SombraError,
    },
    /// The header is intact but names a format this build does not know.
    #[error("{path} is in unknown store format {found}")]
    Unknown {
        /// File that was inspected.
        path: PathBuf,
        /// Format the header names.
        found: StoreVersion,
    },
}

/// The store cannot be upgraded in its present state.
///
/// Always the root cause when startup is refused for a correctable reason
/// (unclean shutdown, upgrades disallowed, unsupported source format).
#[derive(Debug, Clone, Error)]
#[error("unable to upgrade store: {reason}")]
pub struct UnableToUpgrade {
    reason: String,
}

impl UnableToUpgrade {
    /// Wraps a human-readable reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason an operator needs to act on.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub(crate) fn not_permitted(from: &StoreVersion, to: &StoreVersion) -> Self {
        Self::new(format!(
            "store is in format {from} and must be upgraded to {to}, but upgrades are not \
             permitted; set allow_upgrade = true to upgrade on startup"
        ))
    }

    pub(crate) fn unsupported_source(from: &StoreVersion, to: &StoreVersion) -> Self {
        Self::new(format!("no migration path from {from} to {to}"))
    }
}

impl From<BlockReason> for UnableToUpgrade {
    fn from(reason: BlockReason) -> Self {
        Self::new(reason.to_string())
    }
}

/// Why a migration attempt did not complete.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The store version could not be determined.
    #[error("store version detection failed")]
    Detection(#[from] DetectionError),
    /// Preconditions are not met; nothing was written.
    #[error("store upgrade refused")]
    Blocked(#[from] UnableToUpgrade),
    /// A participant failed; staged output was rolled back.
    #[error("migration participant '{participant}' failed")]
    Participant {
        /// Participant name.
        participant: &'static str,
        /// Underlying failure.
        #[source]
        source: SombraError,
    },
    /// The staged store failed its consistency check; nothing was committed.
    #[error("migrated store failed consistency check with {} finding(s)", findings.len())]
    Verification {
        /// Error-level findings.
        findings: Vec<VerifyFinding>,
    },
    /// Moving staged files into place failed; the commit marker allows resuming.
    #[error("committing migrated store files failed")]
    Commit {
        /// Underlying failure.
        #[source]
        source: SombraError,
    },
    /// Failure outside any participant (locking, staging setup).
    #[error("store access failed during migration")]
    Store(#[from] SombraError),
}

impl MigrationError {
    /// The blocking condition, if the attempt was refused rather than failed.
    pub fn unable_to_upgrade(&self) -> Option<&UnableToUpgrade> {
        match self {
            MigrationError::Blocked(reason) => Some(reason),
            _ => None,
        }
    }
}
