use std::path::PathBuf;

use crate::migration::participants::{LabelIndexParticipant, RecordStoreParticipant};
use crate::migration::upgrader::UpgradeOptions;
use crate::primitives::io::remove_file_if_exists;
use crate::scheduler::JobScheduler;
use crate::storage::{
    read_header, DatabaseLayout, EdgeRecord, MetaRecord, NodeRecord, PropRecord, StoreFile,
    StoreVersion,
};
use crate::types::Result;

/// Ordering class of a participant.
///
/// Derived stores are rebuilt from foundational ones, so every `Foundation`
/// participant runs before any `Derived` one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Primary record stores.
    Foundation,
    /// Stores computed from the primary ones.
    Derived,
}

/// Everything a participant sees during one attempt.
pub struct MigrationContext<'a> {
    /// The live store being upgraded; participants only read from it.
    pub source: &'a DatabaseLayout,
    /// Where participant output goes until commit.
    pub staging: &'a DatabaseLayout,
    /// Version found on disk.
    pub from: &'a StoreVersion,
    /// Version being produced.
    pub to: &'a StoreVersion,
    /// Scheduler for fanning work out to background groups.
    pub scheduler: &'a JobScheduler,
    /// Attempt options.
    pub options: &'a UpgradeOptions,
}

impl MigrationContext<'_> {
    /// Path of `file` in the live store.
    pub fn source_file(&self, file: StoreFile) -> PathBuf {
        self.source.store_file(file)
    }

    /// Path of `file` in the staging area.
    pub fn staged_file(&self, file: StoreFile) -> PathBuf {
        self.staging.store_file(file)
    }

    /// Whether `file` exists in the live store in a version other than the target.
    pub fn source_is_outdated(&self, file: StoreFile) -> Result<bool> {
        let path = self.source_file(file);
        if !path.exists() {
            return Ok(false);
        }
        Ok(read_header(&path)?.version != *self.to)
    }
}

/// One unit of migration work, owning a fixed set of store files.
///
/// Participants never touch the live store files; `migrate` writes only into
/// the staging area and `rollback` removes that output again.
pub trait MigrationParticipant: Send + Sync {
    /// Stable name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Ordering class.
    fn phase(&self) -> Phase;

    /// Store files this participant produces.
    fn owned_files(&self) -> &[StoreFile];

    /// Whether any owned file needs converting.
    fn needs_migration(&self, ctx: &MigrationContext<'_>) -> Result<bool>;

    /// Writes converted owned files into the staging area.
    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()>;

    /// Removes this participant's staging output.
    fn rollback(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        for file in self.owned_files() {
            remove_file_if_exists(&ctx.staged_file(*file))?;
        }
        Ok(())
    }
}

/// The participants shipped with this build, in execution order.
pub fn standard_participants() -> Vec<Box<dyn MigrationParticipant>> {
    vec![
        Box::new(RecordStoreParticipant::<MetaRecord>::new("meta-store")),
        Box::new(RecordStoreParticipant::<NodeRecord>::new("node-store")),
        Box::new(RecordStoreParticipant::<EdgeRecord>::new("relationship-store")),
        Box::new(RecordStoreParticipant::<PropRecord>::new("property-store")),
        Box::new(LabelIndexParticipant::new()),
    ]
}
