#![allow(missing_docs)]

mod common;

use std::fs;
use std::sync::Arc;
use std::time::SystemTime;

use sombra_upgrade::{
    admin::{verify, VerifyLevel},
    dbms::{root_cause, DatabaseId, DatabaseManager, LifecycleState},
    migration::{
        MigrationState, StoreUpgrader, UnableToUpgrade, UpgradeOptions, UpgradeOutcome,
    },
    scheduler::JobScheduler,
    storage::{read_graph, DatabaseLayout, GraphData, Store, StoreFile, StoreVersion},
};
use tempfile::TempDir;

use common::{all_at, config, init_tracing, leave_unclean, legacy_db};

fn manager(root: &TempDir, allow_upgrade: bool) -> DatabaseManager {
    DatabaseManager::new(
        root.path(),
        config(allow_upgrade),
        Arc::new(JobScheduler::default()),
    )
}

fn snapshot(layout: &DatabaseLayout) -> Vec<(StoreFile, Vec<u8>, SystemTime)> {
    layout
        .present_store_files()
        .into_iter()
        .map(|file| {
            let path = layout.store_file(file);
            let bytes = fs::read(&path).expect("read store file");
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .expect("mtime");
            (file, bytes, modified)
        })
        .collect()
}

#[test]
fn current_store_is_left_alone() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let layout = DatabaseLayout::new(dir.path().join("current"));
    let store = Store::create(&layout, &GraphData::sample(10)).expect("create store");
    store.close().expect("close store");
    drop(store);
    let before = snapshot(&layout);

    let scheduler = Arc::new(JobScheduler::default());
    for _ in 0..3 {
        let options = UpgradeOptions {
            allow_upgrade: true,
            ..UpgradeOptions::default()
        };
        let mut upgrader = StoreUpgrader::new(layout.clone(), options, Arc::clone(&scheduler));
        let report = upgrader.migrate_if_needed().expect("detect current store");
        assert_eq!(report.outcome, UpgradeOutcome::NotRequired);
        assert_eq!(upgrader.state(), &MigrationState::NotRequired);
        assert!(report.participants_run.is_empty());
    }
    assert_eq!(snapshot(&layout), before);
    assert!(!layout.upgrade_dir().exists());
}

#[test]
fn outdated_store_is_upgraded_and_opened() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, graph) = legacy_db(dir.path(), "legacy", 300);
    let manager = manager(&dir, true);
    let id = DatabaseId::new("legacy").expect("id");
    let ctx = manager.register(id.clone());

    assert_eq!(manager.start(&id).expect("start"), LifecycleState::Started);
    assert!(!ctx.is_failed());
    assert_eq!(ctx.migration_state(), MigrationState::Completed);
    let report = ctx.last_migration().expect("upgrade report");
    assert_eq!(report.outcome, UpgradeOutcome::Completed);
    assert_eq!(report.from, StoreVersion::legacy());
    assert_eq!(report.to, StoreVersion::current());

    let store = ctx.store().expect("store open");
    assert!(store.version().is_current());
    assert!(all_at(&layout, &StoreVersion::current()));
    assert_eq!(read_graph(&layout).expect("read graph"), graph);
    assert_eq!(store.meta(), graph.meta);
    drop(store);

    let verified = verify(&layout, VerifyLevel::Full).expect("verify");
    assert!(verified.success, "{:?}", verified.findings);
    assert_eq!(verified.version, Some(StoreVersion::current()));
    assert_eq!(verified.counts.nodes_in_use, 300);

    manager.shutdown();
}

#[test]
fn restart_after_upgrade_needs_nothing() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    legacy_db(dir.path(), "twice", 20);
    let manager = manager(&dir, true);
    let id = DatabaseId::new("twice").expect("id");
    let ctx = manager.register(id.clone());
    assert_eq!(manager.start(&id).expect("start"), LifecycleState::Started);
    manager.stop(&id).expect("stop");

    assert_eq!(manager.start(&id).expect("restart"), LifecycleState::Started);
    assert_eq!(ctx.migration_state(), MigrationState::NotRequired);
    assert_eq!(
        ctx.last_migration().expect("report").outcome,
        UpgradeOutcome::NotRequired
    );
    manager.shutdown();
}

#[test]
fn unclean_shutdown_blocks_upgrade() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, _) = legacy_db(dir.path(), "dirty", 8);
    leave_unclean(&layout);
    let manager = manager(&dir, true);
    let id = DatabaseId::new("dirty").expect("id");
    let ctx = manager.register(id.clone());

    assert_eq!(manager.start(&id).expect("start"), LifecycleState::Failed);
    assert!(ctx.is_failed());
    assert!(ctx.store().is_none());
    assert!(matches!(ctx.migration_state(), MigrationState::Blocked(_)));

    let cause = ctx.failure_cause().expect("failure recorded");
    let root = root_cause(cause.as_ref());
    let blocked = root
        .downcast_ref::<UnableToUpgrade>()
        .expect("root cause is UnableToUpgrade");
    assert!(
        blocked.reason().contains("not shut down cleanly"),
        "{}",
        blocked.reason()
    );
    assert!(all_at(&layout, &StoreVersion::legacy()));
    assert!(!layout.upgrade_dir().exists());
}

#[test]
fn disallowed_upgrade_names_the_setting() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, _) = legacy_db(dir.path(), "pinned", 8);
    let manager = manager(&dir, false);
    let id = DatabaseId::new("pinned").expect("id");
    let ctx = manager.register(id.clone());

    assert_eq!(manager.start(&id).expect("start"), LifecycleState::Failed);
    let cause = ctx.failure_cause().expect("failure recorded");
    let blocked = root_cause(cause.as_ref())
        .downcast_ref::<UnableToUpgrade>()
        .expect("root cause is UnableToUpgrade");
    assert!(blocked.reason().contains("allow_upgrade"));
    assert!(all_at(&layout, &StoreVersion::legacy()));
}

#[test]
fn store_without_label_index_upgrades() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let layout = DatabaseLayout::new(dir.path().join("bare"));
    let mut graph = GraphData::sample(12);
    graph.with_label_index = false;
    sombra_upgrade::storage::write_store(&layout, &StoreVersion::legacy(), &graph)
        .expect("write store");
    sombra_upgrade::primitives::txlog::TxLog::open(layout.txlog_dir())
        .and_then(|log| log.checkpoint())
        .expect("checkpoint");

    let options = UpgradeOptions {
        allow_upgrade: true,
        ..UpgradeOptions::default()
    };
    let mut upgrader =
        StoreUpgrader::new(layout.clone(), options, Arc::new(JobScheduler::default()));
    let report = upgrader.migrate_if_needed().expect("upgrade");
    assert_eq!(report.participants_skipped, vec!["label-index"]);
    assert!(!layout.store_file(StoreFile::LabelIndex).exists());
    assert!(all_at(&layout, &StoreVersion::current()));
}
