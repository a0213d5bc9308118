#![allow(missing_docs)]

mod common;

use std::fs;
use std::sync::Arc;

use sombra_upgrade::{
    admin::{
        verify, ConsistencyCheck, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport,
    },
    migration::{
        standard_participants, CommitMarker, MigrationContext, MigrationError,
        MigrationParticipant, MigrationState, Phase, StoreUpgrader, UpgradeOptions,
        UpgradeOutcome,
    },
    scheduler::JobScheduler,
    storage::{read_graph, write_store, DatabaseLayout, StoreFile, StoreVersion},
    types::{Result, SombraError},
};
use tempfile::TempDir;

use common::{all_at, init_tracing, legacy_db};

fn upgrader(layout: &DatabaseLayout, allow_upgrade: bool) -> StoreUpgrader {
    let options = UpgradeOptions {
        allow_upgrade,
        index_population_batch: 32,
        ..UpgradeOptions::default()
    };
    StoreUpgrader::new(layout.clone(), options, Arc::new(JobScheduler::default()))
}

/// Writes a partial staged file, then fails.
struct BrokenParticipant {
    files: [StoreFile; 1],
}

impl MigrationParticipant for BrokenParticipant {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn phase(&self) -> Phase {
        Phase::Foundation
    }

    fn owned_files(&self) -> &[StoreFile] {
        &self.files
    }

    fn needs_migration(&self, _ctx: &MigrationContext<'_>) -> Result<bool> {
        Ok(true)
    }

    fn migrate(&self, ctx: &MigrationContext<'_>) -> Result<()> {
        fs::write(ctx.staged_file(self.files[0]), b"half written")?;
        Err(SombraError::Invalid("injected participant failure"))
    }
}

struct RejectingVerifier;

impl ConsistencyCheck for RejectingVerifier {
    fn verify(&self, _layout: &DatabaseLayout) -> Result<VerifyReport> {
        Ok(VerifyReport {
            level: VerifyLevel::Full,
            version: None,
            success: false,
            findings: vec![VerifyFinding::error("injected verification failure")],
            counts: VerifyCounts::default(),
        })
    }
}

#[test]
fn participant_failure_keeps_original_store() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, graph) = legacy_db(dir.path(), "db", 64);

    // The broken participant runs after the node store has been staged.
    let mut participants = standard_participants();
    participants.insert(
        2,
        Box::new(BrokenParticipant {
            files: [StoreFile::Props],
        }),
    );
    let mut upgrader = upgrader(&layout, true).with_participants(participants);
    let err = upgrader.migrate_if_needed().expect_err("participant fails");
    match &err {
        MigrationError::Participant { participant, .. } => assert_eq!(*participant, "broken"),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(upgrader.state(), MigrationState::Failed(_)));
    assert!(!layout.upgrade_dir().exists());
    assert!(all_at(&layout, &StoreVersion::legacy()));
    assert_eq!(read_graph(&layout).expect("read graph"), graph);
    assert!(verify(&layout, VerifyLevel::Full).expect("verify").success);
}

#[test]
fn verification_failure_keeps_original_store() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, graph) = legacy_db(dir.path(), "db", 64);
    let mut upgrader = upgrader(&layout, true).with_verifier(Arc::new(RejectingVerifier));
    match upgrader.migrate_if_needed() {
        Err(MigrationError::Verification { findings }) => {
            assert_eq!(findings.len(), 1);
            assert_eq!(findings[0].message, "injected verification failure");
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(matches!(upgrader.state(), MigrationState::Failed(_)));
    assert!(!layout.upgrade_dir().exists());
    assert!(all_at(&layout, &StoreVersion::legacy()));
    assert_eq!(read_graph(&layout).expect("read graph"), graph);
}

#[test]
fn interrupted_commit_is_finished_on_next_start() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, graph) = legacy_db(dir.path(), "db", 40);
    write_store(&layout.staging_layout(), &StoreVersion::current(), &graph)
        .expect("stage store");
    let marker = CommitMarker::new(&layout, StoreVersion::current(), &StoreFile::ALL);
    marker.persist(&layout).expect("persist marker");

    // Crash after the first two renames.
    for pending in &marker.moves[..2] {
        fs::rename(
            layout.dir().join(&pending.staged),
            layout.dir().join(&pending.destination),
        )
        .expect("rename");
    }
    assert!(!all_at(&layout, &StoreVersion::current()));

    // Resuming does not depend on upgrades being allowed.
    let mut upgrader = upgrader(&layout, false);
    let report = upgrader.migrate_if_needed().expect("resume");
    assert!(report.resumed_commit);
    assert_eq!(report.outcome, UpgradeOutcome::NotRequired);
    assert!(!layout.upgrade_dir().exists());
    assert!(all_at(&layout, &StoreVersion::current()));
    assert_eq!(read_graph(&layout).expect("read graph"), graph);
}

#[test]
fn leftover_staging_is_discarded_before_upgrading() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, graph) = legacy_db(dir.path(), "db", 40);
    let staging = layout.staging_layout();
    fs::create_dir_all(staging.dir()).expect("staging dir");
    fs::write(staging.store_file(StoreFile::Nodes), b"stale").expect("stale file");

    let mut upgrader = upgrader(&layout, true);
    let report = upgrader.migrate_if_needed().expect("upgrade");
    assert!(report.discarded_staging);
    assert!(!report.resumed_commit);
    assert_eq!(report.outcome, UpgradeOutcome::Completed);
    assert!(all_at(&layout, &StoreVersion::current()));
    assert_eq!(read_graph(&layout).expect("read graph"), graph);
}

#[test]
fn corrupt_marker_fails_without_touching_files() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, _) = legacy_db(dir.path(), "db", 8);
    fs::create_dir_all(layout.upgrade_dir()).expect("upgrade dir");
    fs::write(layout.commit_marker(), b"\0\0\0\0{}").expect("garbage marker");

    let mut upgrader = upgrader(&layout, true);
    let err = upgrader.migrate_if_needed().expect_err("corrupt marker");
    assert!(matches!(err, MigrationError::Commit { .. }), "{err:?}");
    assert!(layout.commit_marker().exists());
    assert!(all_at(&layout, &StoreVersion::legacy()));
}
