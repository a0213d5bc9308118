//! Store format upgrades performed at startup.
//!
//! A [`StoreUpgrader`] reads the on-disk version, refuses to proceed unless the
//! store was shut down cleanly and upgrades are allowed, runs every
//! [`MigrationParticipant`] into a staging area, verifies the staged store, and
//! commits it through a durable [`CommitMarker`]. The live files are never
//! modified until the verified result is renamed into place.

mod commit;
mod error;
mod gate;
mod participant;
pub mod participants;
mod upgrader;
mod version;

pub use commit::{commit_staged, recover_interrupted, CommitMarker, PendingMove, Recovery};
pub use error::{DetectionError, MigrationError, UnableToUpgrade};
pub use gate::{BlockReason, GateDecision, PreconditionGate};
pub use participant::{standard_participants, MigrationContext, MigrationParticipant, Phase};
pub use upgrader::{
    error_chain, MigrationState, StoreUpgrader, UpgradeOptions, UpgradeOutcome, UpgradeReport,
};
pub use version::{VersionCheck, VersionOracle};
