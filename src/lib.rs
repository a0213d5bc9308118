//! Startup upgrades for Sombra record stores.
//!
//! When a kernel built for store generation N meets a store written by an
//! older build, [`migration::StoreUpgrader`] converts it in a staging area and
//! commits the result atomically, but only after the store is known to have
//! been shut down cleanly and upgrades are enabled in [`config::KernelConfig`].
//! [`dbms::DatabaseManager`] runs that check for every database it starts and
//! keeps one database's failure from affecting the others. Heavy work fans out
//! on the grouped [`scheduler::JobScheduler`].

#![warn(missing_docs)]

pub mod admin;
pub mod config;
pub mod dbms;
pub mod migration;
pub mod primitives;
pub mod scheduler;
pub mod storage;
pub mod types;
