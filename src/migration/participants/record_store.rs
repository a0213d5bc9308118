use std::marker::PhantomData;

use tracing::debug;

use crate::migration::participant::{MigrationContext, MigrationParticipant, Phase};
use crate::storage::{Record, RecordFile, RecordWriter, StoreFile};
use crate::types::{Result, SombraError};

const COPY_BATCH: u64 = 4096;

/// Rewrites one fixed-width record store in the target generation.
///
/// Records are decoded with the source codec and re-encoded with the target
/// codec in batches, so memory use does not grow with the store.
pub struct RecordStoreParticipant<R: Record> {
    name: &'static str,
    files: [StoreFile; 1],
    _marker: PhantomData<fn() -> R>,
}

impl<R: Record> RecordStoreParticipant<R> {
    /// Participant for the store holding `R`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            files: [R::FILE],
            _marker: PhantomData,
        }
    }
}

impl<R: Record> MigrationParticipant for RecordStoreParticipant<R> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn phase(&self) -> Phase {
        Phase::Foundation
    }

    fn owned_files(&self) -> &[StoreFile] {
        &self.files
    }

    fn needs_migration(&self, ctx: &MigrationContext<'_>) -> Result<bool> {
        ctx.source_is_outdated(R::FILE)
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        let source = RecordFile::<R>::open(&ctx.source_file(R::FILE))?;
        if source.header().version != *ctx.from {
            return Err(SombraError::CorruptionOwned(format!(
                "{} is in format {}, the store is in {}",
                R::FILE,
                source.header().version,
                ctx.from
            )));
        }
        let mut writer = RecordWriter::<R>::create(&ctx.staged_file(R::FILE), ctx.to.clone())?;
        let mut start = 0;
        while start < source.len() {
            let batch = source.read_range(start, COPY_BATCH)?;
            writer.extend(&batch)?;
            start += batch.len() as u64;
        }
        let header = writer.finish()?;
        debug!(
            participant = self.name,
            records = header.record_count,
            from = %ctx.from,
            to = %ctx.to,
            "upgrade.record_store.converted"
        );
        Ok(())
    }
}
