//! Low-level primitives the store and the upgrade path are built on.
//!
//! Includes positioned file I/O, the exclusive store lock, and the segmented
//! transaction log.

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Exclusive ownership of a store directory.
pub mod lock;

/// Segmented transaction log and its tail scanner.
///
/// Records transactions and checkpoints; the tail tells whether the previous
/// process shut down cleanly.
pub mod txlog;
