//! Per-database lifecycle supervision.
//!
//! The [`DatabaseManager`] owns one [`DatabaseContext`] per database. Starting
//! a database runs any pending store upgrade and then opens the store; every
//! failure, panics included, is recorded on that database's context and never
//! reaches its siblings.

use std::error::Error;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::migration::MigrationError;
use crate::types::SombraError;

mod context;
mod manager;

pub use context::DatabaseContext;
pub use manager::DatabaseManager;

/// Name of a database; also its directory name under the manager's root.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DatabaseId(String);

impl DatabaseId {
    /// Validates `name`: non-empty ASCII alphanumerics, `-`, `_`, or `.`,
    /// not starting with `.`.
    pub fn new(name: impl Into<String>) -> Result<Self, SombraError> {
        let name = name.into();
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if !valid {
            return Err(SombraError::InvalidOwned(format!(
                "invalid database name {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// The name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a database is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Registered but not running.
    Stopped,
    /// Upgrade or open in progress.
    Starting,
    /// Open and serving.
    Started,
    /// The last start failed; see [`DatabaseContext::failure_cause`].
    Failed,
}

/// Why a database did not start.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The store upgrade was refused or failed.
    #[error("database '{database}' could not be upgraded")]
    Migration {
        /// Database that failed.
        database: DatabaseId,
        /// Underlying failure.
        #[source]
        source: MigrationError,
    },
    /// The store could not be created or opened.
    #[error("database '{database}' could not be opened")]
    Open {
        /// Database that failed.
        database: DatabaseId,
        /// Underlying failure.
        #[source]
        source: SombraError,
    },
    /// Startup panicked.
    #[error("database '{database}' panicked during startup: {message}")]
    Panicked {
        /// Database that failed.
        database: DatabaseId,
        /// Panic payload.
        message: String,
    },
}

impl StartupError {
    /// Database the failure belongs to.
    pub fn database(&self) -> &DatabaseId {
        match self {
            StartupError::Migration { database, .. }
            | StartupError::Open { database, .. }
            | StartupError::Panicked { database, .. } => database,
        }
    }
}

/// Innermost error in `err`'s source chain.
///
/// For a refused upgrade this is [`UnableToUpgrade`](crate::migration::UnableToUpgrade):
///
/// ```ignore
/// let cause = ctx.failure_cause().unwrap();
/// assert!(root_cause(cause.as_ref()).is::<UnableToUpgrade>());
/// ```
pub fn root_cause<'a>(err: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::UnableToUpgrade;

    #[test]
    fn database_names_are_validated() {
        assert!(DatabaseId::new("neo-4_j.v2").is_ok());
        for bad in ["", ".hidden", "a/b", "sp ace", "..", "é"] {
            assert!(DatabaseId::new(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn root_cause_reaches_unable_to_upgrade() {
        let err = StartupError::Migration {
            database: DatabaseId::new("graph").unwrap(),
            source: MigrationError::Blocked(UnableToUpgrade::new("dirty log")),
        };
        let cause = root_cause(&err);
        assert_eq!(
            cause.downcast_ref::<UnableToUpgrade>().map(|e| e.reason()),
            Some("dirty log")
        );
        assert_eq!(err.database().as_str(), "graph");
    }
}
