#![forbid(unsafe_code)]

//! Store administration utilities.
//!
//! Currently the offline consistency checker, which the upgrader also uses to
//! validate staged output before committing it.

mod verify;

/// Store integrity verification.
///
/// Verifies the structural integrity of the store files and reports any issues found.
pub use verify::{
    verify, ConsistencyCheck, StoreVerifier, VerifyCounts, VerifyFinding, VerifyLevel,
    VerifyReport, VerifySeverity,
};
