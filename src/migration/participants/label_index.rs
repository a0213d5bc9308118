use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::migration::participant::{MigrationContext, MigrationParticipant, Phase};
use crate::scheduler::{Group, JobHandle};
use crate::storage::{
    read_label_index, write_label_index, LabelIndex, NodeRecord, RecordFile, StoreFile,
};
use crate::types::{Result, SombraError};

/// Rebuilds the label index from the (already staged) node store.
///
/// The legacy index is not decoded into the new one; postings are recomputed
/// so the result always agrees with the node records. Population is split into
/// node ranges run as [`Group::IndexPopulation`] jobs, all joined before
/// `migrate` returns.
pub struct LabelIndexParticipant {
    files: [StoreFile; 1],
}

impl Default for LabelIndexParticipant {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelIndexParticipant {
    /// The label index participant.
    pub fn new() -> Self {
        Self {
            files: [StoreFile::LabelIndex],
        }
    }
}

impl MigrationParticipant for LabelIndexParticipant {
    fn name(&self) -> &'static str {
        "label-index"
    }

    fn phase(&self) -> Phase {
        Phase::Derived
    }

    fn owned_files(&self) -> &[StoreFile] {
        &self.files
    }

    fn needs_migration(&self, ctx: &MigrationContext<'_>) -> Result<bool> {
        ctx.source_is_outdated(StoreFile::LabelIndex)
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        let staged_nodes = ctx.staged_file(StoreFile::Nodes);
        let nodes_path = if staged_nodes.exists() {
            staged_nodes
        } else {
            ctx.source_file(StoreFile::Nodes)
        };
        let total = RecordFile::<NodeRecord>::open(&nodes_path)?.len();
        let batch = ctx.options.index_population_batch.max(1) as u64;
        let partials = Arc::new(Mutex::new(Vec::new()));

        let mut handles: Vec<JobHandle> = Vec::new();
        let mut start = 0u64;
        let mut submit_error = None;
        while start < total {
            let path = nodes_path.clone();
            let partials = Arc::clone(&partials);
            let range_start = start;
            let scheduled = ctx
                .scheduler
                .schedule(Group::IndexPopulation, move |job| {
                    if job.is_interrupted() {
                        return Err(SombraError::Invalid("index population interrupted"));
                    }
                    let nodes = RecordFile::<NodeRecord>::open(&path)?.read_range(range_start, batch)?;
                    partials
                        .lock()
                        .push(LabelIndex::from_nodes(range_start, &nodes));
                    Ok(())
                });
            match scheduled {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    submit_error = Some(err);
                    break;
                }
            }
            start += batch;
        }
        debug!(jobs = handles.len(), nodes = total, batch, "upgrade.label_index.populate");

        let mut first_error = submit_error.map(SombraError::from);
        if first_error.is_some() {
            for handle in &handles {
                handle.cancel(true);
            }
        }
        for (i, handle) in handles.iter().enumerate() {
            if let Err(err) = handle.wait_termination() {
                if first_error.is_none() {
                    for pending in &handles[i + 1..] {
                        pending.cancel(true);
                    }
                    first_error = Some(err.into());
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let mut index = LabelIndex::new();
        for partial in partials.lock().drain(..) {
            index.merge(partial);
        }
        match read_label_index(&ctx.source_file(StoreFile::LabelIndex)) {
            Ok((_, legacy)) if legacy != index => warn!(
                legacy_postings = legacy.posting_count(),
                rebuilt_postings = index.posting_count(),
                "upgrade.label_index.legacy_mismatch"
            ),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "upgrade.label_index.legacy_unreadable"),
        }
        write_label_index(
            &ctx.staged_file(StoreFile::LabelIndex),
            ctx.to.clone(),
            &index,
        )?;
        debug!(
            labels = index.label_count(),
            postings = index.posting_count(),
            "upgrade.label_index.written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::upgrader::UpgradeOptions;
    use crate::scheduler::{JobScheduler, SchedulerOptions};
    use crate::storage::{write_store, DatabaseLayout, GraphData, StoreVersion};
    use std::fs;
    use tempfile::tempdir;

    fn rebuild(layout: &DatabaseLayout, batch: usize) -> Result<LabelIndex> {
        let staging = layout.staging_layout();
        fs::create_dir_all(staging.dir())?;
        let scheduler = JobScheduler::new(SchedulerOptions::default());
        scheduler.set_parallelism(Group::IndexPopulation, 3);
        let options = UpgradeOptions {
            index_population_batch: batch,
            ..UpgradeOptions::default()
        };
        let (from, to) = (StoreVersion::legacy(), StoreVersion::current());
        let ctx = MigrationContext {
            source: layout,
            staging: &staging,
            from: &from,
            to: &to,
            scheduler: &scheduler,
            options: &options,
        };
        let participant = LabelIndexParticipant::new();
        assert!(participant.needs_migration(&ctx)?);
        participant.migrate(&ctx)?;
        let (header, index) = read_label_index(&ctx.staged_file(StoreFile::LabelIndex))?;
        assert_eq!(header.version, to);
        scheduler.shutdown();
        Ok(index)
    }

    #[test]
    fn rebuilds_postings_across_many_jobs() -> Result<()> {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        let graph = GraphData::sample(1000);
        write_store(&layout, &StoreVersion::legacy(), &graph)?;
        assert_eq!(rebuild(&layout, 64)?, graph.label_index());
        Ok(())
    }

    #[test]
    fn undecodable_legacy_index_is_still_rebuilt() -> Result<()> {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        let graph = GraphData::sample(200);
        write_store(&layout, &StoreVersion::legacy(), &graph)?;
        let legacy = layout.store_file(StoreFile::LabelIndex);
        let mut bytes = fs::read(&legacy)?;
        bytes.pop();
        fs::write(&legacy, bytes)?;
        assert!(read_label_index(&legacy).is_err());

        assert_eq!(rebuild(&layout, 32)?, graph.label_index());
        Ok(())
    }
}
