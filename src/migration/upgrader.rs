use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::admin::{ConsistencyCheck, StoreVerifier, VerifyFinding, VerifyLevel};
use crate::migration::commit::{commit_staged, recover_interrupted, CommitMarker, Recovery};
use crate::migration::error::{MigrationError, UnableToUpgrade};
use crate::migration::gate::{GateDecision, PreconditionGate};
use crate::migration::participant::{standard_participants, MigrationContext, MigrationParticipant};
use crate::migration::version::{VersionCheck, VersionOracle};
use crate::primitives::io::{remove_dir_if_exists, FileIo, StdFileIo};
use crate::primitives::lock::StoreLock;
use crate::scheduler::JobScheduler;
use crate::storage::{DatabaseLayout, StoreFile, StoreVersion};

/// Progress of one upgrade attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum MigrationState {
    /// Nothing has happened yet.
    Idle,
    /// Reading the store version.
    Detecting,
    /// The store is already current.
    NotRequired,
    /// The upgrade was refused; nothing was written.
    Blocked(String),
    /// Participants are running.
    InProgress,
    /// The upgraded store has been committed.
    Completed,
    /// The attempt failed after starting.
    Failed(String),
}

/// Knobs for one attempt.
#[derive(Clone, Debug)]
pub struct UpgradeOptions {
    /// Whether an outdated store may be rewritten at all.
    pub allow_upgrade: bool,
    /// Depth of the check run over staged output.
    pub verify_level: VerifyLevel,
    /// Nodes per label index population job.
    pub index_population_batch: usize,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            allow_upgrade: false,
            verify_level: VerifyLevel::Full,
            index_population_batch: 1024,
        }
    }
}

/// How an attempt ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOutcome {
    /// The store was already current.
    NotRequired,
    /// The store was upgraded.
    Completed,
}

/// Summary of a successful attempt.
#[derive(Clone, Debug, Serialize)]
pub struct UpgradeReport {
    /// Database directory.
    pub database: PathBuf,
    /// How the attempt ended.
    pub outcome: UpgradeOutcome,
    /// Version found on disk.
    pub from: StoreVersion,
    /// Version on disk afterwards.
    pub to: StoreVersion,
    /// Participants that converted files.
    pub participants_run: Vec<&'static str>,
    /// Participants with nothing to do.
    pub participants_skipped: Vec<&'static str>,
    /// Unchanged files copied into staging for verification.
    pub carried_files: Vec<StoreFile>,
    /// Whether an interrupted commit was finished first.
    pub resumed_commit: bool,
    /// Whether leftover staging was discarded first.
    pub discarded_staging: bool,
    /// Wall time of the attempt.
    pub duration_ms: u64,
}

struct ParticipantRun {
    run: Vec<&'static str>,
    skipped: Vec<&'static str>,
    carried: Vec<StoreFile>,
}

/// Drives one store through detection, gating, conversion, verification,
/// and commit.
pub struct StoreUpgrader {
    layout: DatabaseLayout,
    options: UpgradeOptions,
    oracle: VersionOracle,
    gate: PreconditionGate,
    participants: Vec<Box<dyn MigrationParticipant>>,
    verifier: Arc<dyn ConsistencyCheck>,
    scheduler: Arc<JobScheduler>,
    state: MigrationState,
}

impl StoreUpgrader {
    /// Upgrader for the store at `layout` using the standard participants.
    pub fn new(layout: DatabaseLayout, options: UpgradeOptions, scheduler: Arc<JobScheduler>) -> Self {
        let verifier = Arc::new(StoreVerifier::new(options.verify_level));
        Self {
            layout,
            options,
            oracle: VersionOracle::new(),
            gate: PreconditionGate,
            participants: standard_participants(),
            verifier,
            scheduler,
            state: MigrationState::Idle,
        }
    }

    /// Replaces the participant list.
    pub fn with_participants(mut self, participants: Vec<Box<dyn MigrationParticipant>>) -> Self {
        self.participants = participants;
        self
    }

    /// Replaces the version oracle, and with it the registered upgrade paths.
    pub fn with_oracle(mut self, oracle: VersionOracle) -> Self {
        self.oracle = oracle;
        self
    }

    /// Replaces the consistency check run before commit.
    pub fn with_verifier(mut self, verifier: Arc<dyn ConsistencyCheck>) -> Self {
        self.verifier = verifier;
        self
    }

    /// State reached by the last attempt.
    pub fn state(&self) -> &MigrationState {
        &self.state
    }

    /// Store directory.
    pub fn layout(&self) -> &DatabaseLayout {
        &self.layout
    }

    /// Takes the store lock and runs [`migrate_if_needed_locked`](Self::migrate_if_needed_locked).
    pub fn migrate_if_needed(&mut self) -> Result<UpgradeReport, MigrationError> {
        let lock = match StoreLock::try_acquire(self.layout.lock_file()) {
            Ok(lock) => lock,
            Err(err) => {
                self.state = MigrationState::Failed(err.to_string());
                return Err(err.into());
            }
        };
        self.migrate_if_needed_locked(&lock)
    }

    /// Upgrades the store if it is outdated and allowed to be, under a lock
    /// the caller holds.
    pub fn migrate_if_needed_locked(
        &mut self,
        _lock: &StoreLock,
    ) -> Result<UpgradeReport, MigrationError> {
        let started = Instant::now();
        self.state = MigrationState::Idle;
        let recovery = match recover_interrupted(&self.layout) {
            Ok(recovery) => recovery,
            Err(source) => {
                let err = MigrationError::Commit { source };
                return Err(self.fail(err));
            }
        };

        self.state = MigrationState::Detecting;
        let from = match self.oracle.detect(&self.layout) {
            Ok(version) => version,
            Err(err) => return Err(self.block(err.into())),
        };
        let to = self.oracle.current().clone();
        let mut report = UpgradeReport {
            database: self.layout.dir().to_path_buf(),
            outcome: UpgradeOutcome::NotRequired,
            from: from.clone(),
            to: to.clone(),
            participants_run: Vec::new(),
            participants_skipped: Vec::new(),
            carried_files: Vec::new(),
            resumed_commit: matches!(recovery, Recovery::ResumedCommit { .. }),
            discarded_staging: recovery == Recovery::DiscardedStaging,
            duration_ms: 0,
        };

        match self.oracle.compare(&from) {
            VersionCheck::Current => {
                self.state = MigrationState::NotRequired;
                report.duration_ms = started.elapsed().as_millis() as u64;
                debug!(dir = %self.layout.dir().display(), version = %from, "upgrade.not_required");
                return Ok(report);
            }
            VersionCheck::Unsupported => {
                let err = UnableToUpgrade::unsupported_source(&from, &to).into();
                return Err(self.block(err));
            }
            VersionCheck::Upgradable => {}
        }
        if !self.options.allow_upgrade {
            let err = UnableToUpgrade::not_permitted(&from, &to).into();
            return Err(self.block(err));
        }
        match self.gate.check(&self.layout) {
            Ok(GateDecision::Allow { checkpoint }) => {
                debug!(checkpoint = checkpoint.0, "upgrade.gate.allow");
            }
            Ok(GateDecision::Block(reason)) => {
                let err = UnableToUpgrade::from(reason).into();
                return Err(self.block(err));
            }
            Err(err) => return Err(self.fail(err.into())),
        }

        self.state = MigrationState::InProgress;
        info!(
            dir = %self.layout.dir().display(),
            from = %from,
            to = %to,
            "upgrade.start"
        );
        match self.run_participants(&from, &to) {
            Ok(run) => {
                self.state = MigrationState::Completed;
                report.outcome = UpgradeOutcome::Completed;
                report.participants_run = run.run;
                report.participants_skipped = run.skipped;
                report.carried_files = run.carried;
                report.duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    dir = %self.layout.dir().display(),
                    duration_ms = report.duration_ms,
                    participants = report.participants_run.len(),
                    "upgrade.complete"
                );
                Ok(report)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn block(&mut self, err: MigrationError) -> MigrationError {
        let reason = match &err {
            MigrationError::Blocked(inner) => inner.reason().to_owned(),
            other => error_chain(other),
        };
        warn!(dir = %self.layout.dir().display(), reason = %reason, "upgrade.blocked");
        self.state = MigrationState::Blocked(reason);
        err
    }

    fn fail(&mut self, err: MigrationError) -> MigrationError {
        let cause = error_chain(&err);
        error!(dir = %self.layout.dir().display(), cause = %cause, "upgrade.failed");
        self.state = MigrationState::Failed(cause);
        err
    }

    fn run_participants(
        &self,
        from: &StoreVersion,
        to: &StoreVersion,
    ) -> Result<ParticipantRun, MigrationError> {
        let staging = self.layout.staging_layout();
        remove_dir_if_exists(staging.dir())?;
        fs::create_dir_all(staging.dir()).map_err(crate::types::SombraError::from)?;
        let ctx = MigrationContext {
            source: &self.layout,
            staging: &staging,
            from,
            to,
            scheduler: &self.scheduler,
            options: &self.options,
        };

        let mut ordered: Vec<&dyn MigrationParticipant> =
            self.participants.iter().map(|p| p.as_ref()).collect();
        ordered.sort_by_key(|p| p.phase());

        let mut ran: Vec<&dyn MigrationParticipant> = Vec::new();
        let mut skipped = Vec::new();
        for participant in ordered {
            let name = participant.name();
            let needs = match participant.needs_migration(&ctx) {
                Ok(needs) => needs,
                Err(source) => {
                    self.roll_back(&ctx, &ran);
                    return Err(MigrationError::Participant {
                        participant: name,
                        source,
                    });
                }
            };
            if !needs {
                debug!(participant = name, "upgrade.participant.skip");
                skipped.push(name);
                continue;
            }
            info!(participant = name, phase = ?participant.phase(), "upgrade.participant.start");
            let started = Instant::now();
            if let Err(source) = participant.migrate(&ctx) {
                ran.push(participant);
                self.roll_back(&ctx, &ran);
                return Err(MigrationError::Participant {
                    participant: name,
                    source,
                });
            }
            ran.push(participant);
            info!(
                participant = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "upgrade.participant.complete"
            );
        }

        let carried = match self.carry_unchanged(&staging) {
            Ok(carried) => carried,
            Err(err) => {
                self.roll_back(&ctx, &ran);
                return Err(err.into());
            }
        };

        let report = match self.verifier.verify(&staging) {
            Ok(report) => report,
            Err(err) => {
                self.roll_back(&ctx, &ran);
                return Err(err.into());
            }
        };
        let mut findings: Vec<VerifyFinding> = report.errors().cloned().collect();
        if findings.is_empty() && report.version.as_ref() != Some(to) {
            findings.push(VerifyFinding::error(format!(
                "staged store is not uniformly in format {to}"
            )));
        }
        if !findings.is_empty() {
            for finding in &findings {
                warn!(finding = %finding.message, "upgrade.verify.finding");
            }
            self.roll_back(&ctx, &ran);
            return Err(MigrationError::Verification { findings });
        }
        debug!(level = ?report.level, "upgrade.verify.passed");

        let staged: Vec<StoreFile> = ran
            .iter()
            .flat_map(|p| p.owned_files().iter().copied())
            .filter(|file| staging.store_file(*file).exists())
            .collect();
        let marker = CommitMarker::new(&self.layout, to.clone(), &staged);
        commit_staged(&self.layout, &marker).map_err(|source| MigrationError::Commit { source })?;

        Ok(ParticipantRun {
            run: ran.iter().map(|p| p.name()).collect(),
            skipped,
            carried,
        })
    }

    /// Copies live files no participant rewrote, so the staged layout is complete.
    fn carry_unchanged(&self, staging: &DatabaseLayout) -> crate::types::Result<Vec<StoreFile>> {
        let mut carried = Vec::new();
        for file in self.layout.present_store_files() {
            let staged = staging.store_file(file);
            if staged.exists() {
                continue;
            }
            fs::copy(self.layout.store_file(file), &staged)?;
            StdFileIo::open(&staged)?.sync_all()?;
            carried.push(file);
        }
        if !carried.is_empty() {
            debug!(files = ?carried, "upgrade.staging.carried");
        }
        Ok(carried)
    }

    fn roll_back(&self, ctx: &MigrationContext<'_>, ran: &[&dyn MigrationParticipant]) {
        for participant in ran.iter().rev() {
            if let Err(err) = participant.rollback(ctx) {
                warn!(
                    participant = participant.name(),
                    error = %err,
                    "upgrade.participant.rollback_failed"
                );
            }
        }
        if let Err(err) = remove_dir_if_exists(&self.layout.upgrade_dir()) {
            warn!(error = %err, "upgrade.staging.cleanup_failed");
        }
        info!(participants = ran.len(), "upgrade.rolled_back");
    }
}

/// Renders an error and its sources as `outer: inner: ...`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        rendered.push_str(": ");
        rendered.push_str(&inner.to_string());
        source = inner.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::error::DetectionError;
    use crate::primitives::txlog::TxLog;
    use crate::storage::{read_graph, write_store, GraphData};
    use tempfile::tempdir;

    fn legacy_store(layout: &DatabaseLayout, nodes: u64) -> GraphData {
        let graph = GraphData::sample(nodes);
        write_store(layout, &StoreVersion::legacy(), &graph).unwrap();
        TxLog::open(layout.txlog_dir()).unwrap().checkpoint().unwrap();
        graph
    }

    fn upgrader(layout: &DatabaseLayout, allow_upgrade: bool) -> StoreUpgrader {
        let options = UpgradeOptions {
            allow_upgrade,
            index_population_batch: 16,
            ..UpgradeOptions::default()
        };
        StoreUpgrader::new(layout.clone(), options, Arc::new(JobScheduler::default()))
    }

    #[test]
    fn upgrades_legacy_store_in_place() {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        let graph = legacy_store(&layout, 40);
        let mut upgrader = upgrader(&layout, true);
        let report = upgrader.migrate_if_needed().unwrap();
        assert_eq!(report.outcome, UpgradeOutcome::Completed);
        assert_eq!(report.from, StoreVersion::legacy());
        assert_eq!(report.participants_run.len(), 5);
        assert!(report.carried_files.is_empty());
        assert_eq!(upgrader.state(), &MigrationState::Completed);
        assert!(!layout.upgrade_dir().exists());
        for file in layout.present_store_files() {
            assert!(crate::storage::read_header(&layout.store_file(file))
                .unwrap()
                .version
                .is_current());
        }
        assert_eq!(read_graph(&layout).unwrap(), graph);

        let again = upgrader.migrate_if_needed().unwrap();
        assert_eq!(again.outcome, UpgradeOutcome::NotRequired);
        assert_eq!(upgrader.state(), &MigrationState::NotRequired);
    }

    #[test]
    fn refuses_when_upgrades_are_not_allowed() {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        legacy_store(&layout, 4);
        let before = std::fs::read(layout.store_file(StoreFile::Nodes)).unwrap();
        let mut upgrader = upgrader(&layout, false);
        let err = upgrader.migrate_if_needed().unwrap_err();
        let reason = err.unable_to_upgrade().expect("blocked").reason().to_owned();
        assert!(reason.contains("allow_upgrade"), "{reason}");
        assert!(matches!(upgrader.state(), MigrationState::Blocked(_)));
        assert_eq!(std::fs::read(layout.store_file(StoreFile::Nodes)).unwrap(), before);
    }

    fn store_bytes(layout: &DatabaseLayout) -> Vec<(StoreFile, Vec<u8>)> {
        StoreFile::ALL
            .iter()
            .filter_map(|file| {
                std::fs::read(layout.store_file(*file))
                    .ok()
                    .map(|bytes| (*file, bytes))
            })
            .collect()
    }

    fn assert_blocked_untouched(
        upgrader: &mut StoreUpgrader,
        before: &[(StoreFile, Vec<u8>)],
    ) -> MigrationError {
        let err = upgrader.migrate_if_needed().unwrap_err();
        assert!(
            matches!(upgrader.state(), MigrationState::Blocked(_)),
            "{:?}",
            upgrader.state()
        );
        assert_eq!(store_bytes(upgrader.layout()), before);
        assert!(!upgrader.layout().upgrade_dir().exists());
        err
    }

    #[test]
    fn damaged_meta_header_blocks() {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        legacy_store(&layout, 4);
        let meta = layout.store_file(StoreFile::Meta);
        let mut bytes = std::fs::read(&meta).unwrap();
        bytes[..8].copy_from_slice(b"garbage!");
        std::fs::write(&meta, bytes).unwrap();
        let before = store_bytes(&layout);

        let mut upgrader = upgrader(&layout, true);
        let err = assert_blocked_untouched(&mut upgrader, &before);
        assert!(matches!(
            err,
            MigrationError::Detection(DetectionError::Unreadable { .. })
        ));
    }

    #[test]
    fn missing_meta_blocks() {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        legacy_store(&layout, 4);
        std::fs::remove_file(layout.store_file(StoreFile::Meta)).unwrap();
        let before = store_bytes(&layout);

        let mut upgrader = upgrader(&layout, true);
        let err = assert_blocked_untouched(&mut upgrader, &before);
        assert!(matches!(
            err,
            MigrationError::Detection(DetectionError::Unreadable { .. })
        ));
    }

    #[test]
    fn newer_generation_blocks() {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        legacy_store(&layout, 4);
        let meta = layout.store_file(StoreFile::Meta);
        let mut header = crate::storage::read_header(&meta).unwrap();
        header.version = StoreVersion::new(crate::storage::CURRENT_GENERATION + 1);
        let encoded = header.encode().unwrap();
        let mut bytes = std::fs::read(&meta).unwrap();
        bytes[..encoded.len()].copy_from_slice(&encoded);
        std::fs::write(&meta, bytes).unwrap();
        let before = store_bytes(&layout);

        let mut upgrader = upgrader(&layout, true);
        match assert_blocked_untouched(&mut upgrader, &before) {
            MigrationError::Detection(DetectionError::Unknown { found, .. }) => {
                assert_eq!(found.generation, crate::storage::CURRENT_GENERATION + 1)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unregistered_source_generation_blocks() {
        let dir = tempdir().unwrap();
        let layout = DatabaseLayout::new(dir.path());
        legacy_store(&layout, 4);
        let before = store_bytes(&layout);

        let mut upgrader = upgrader(&layout, true)
            .with_oracle(VersionOracle::with_sources(StoreVersion::current(), Vec::new()));
        let err = assert_blocked_untouched(&mut upgrader, &before);
        let reason = err.unable_to_upgrade().expect("blocked").reason().to_owned();
        assert!(reason.contains("sombra-record/1"), "{reason}");
    }

    #[test]
    fn error_chain_joins_sources() {
        let err = MigrationError::Commit {
            source: crate::types::SombraError::Invalid("disk full"),
        };
        let rendered = error_chain(&err);
        assert!(rendered.starts_with("committing migrated store files failed: "));
        assert!(rendered.ends_with("disk full"), "{rendered}");
    }
}
