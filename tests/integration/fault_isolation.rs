#![allow(missing_docs)]

mod common;

use std::path::Component;
use std::sync::Arc;

use sombra_upgrade::{
    admin::{ConsistencyCheck, StoreVerifier, VerifyLevel, VerifyReport},
    dbms::{root_cause, DatabaseId, DatabaseManager, LifecycleState, StartupError},
    migration::UnableToUpgrade,
    scheduler::JobScheduler,
    storage::{DatabaseLayout, StoreVersion},
    types::Result,
};
use tempfile::TempDir;

use common::{all_at, config, init_tracing, leave_unclean, legacy_db};

/// Panics when checking any store under a directory named `boom`.
struct PanickingVerifier;

impl ConsistencyCheck for PanickingVerifier {
    fn verify(&self, layout: &DatabaseLayout) -> Result<VerifyReport> {
        let boom = layout
            .dir()
            .components()
            .any(|c| c == Component::Normal("boom".as_ref()));
        if boom {
            panic!("verifier exploded");
        }
        StoreVerifier::new(VerifyLevel::Full).verify(layout)
    }
}

fn state_of(results: &[(DatabaseId, LifecycleState)], name: &str) -> LifecycleState {
    results
        .iter()
        .find(|(id, _)| id.as_str() == name)
        .map(|(_, state)| *state)
        .expect("database in results")
}

#[test]
fn unclean_database_does_not_stop_its_sibling() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (healthy_layout, _) = legacy_db(dir.path(), "healthy", 120);
    let (dirty_layout, _) = legacy_db(dir.path(), "dirty", 120);
    leave_unclean(&dirty_layout);

    let manager = DatabaseManager::new(
        dir.path(),
        config(true),
        Arc::new(JobScheduler::default()),
    );
    let healthy = DatabaseId::new("healthy").expect("id");
    let dirty = DatabaseId::new("dirty").expect("id");
    manager.register(healthy.clone());
    manager.register(dirty.clone());

    let results = manager.start_all();
    assert_eq!(results.len(), 2);
    assert_eq!(state_of(&results, "healthy"), LifecycleState::Started);
    assert_eq!(state_of(&results, "dirty"), LifecycleState::Failed);

    let healthy_ctx = manager.get_context(&healthy).expect("context");
    assert!(healthy_ctx.store().expect("open store").version().is_current());
    assert!(all_at(&healthy_layout, &StoreVersion::current()));

    let dirty_ctx = manager.get_context(&dirty).expect("context");
    assert!(dirty_ctx.is_failed());
    let cause = dirty_ctx.failure_cause().expect("cause");
    assert_eq!(cause.database(), &dirty);
    assert!(root_cause(cause.as_ref()).is::<UnableToUpgrade>());
    assert!(all_at(&dirty_layout, &StoreVersion::legacy()));

    manager.shutdown();
    assert!(manager.scheduler().is_shut_down());
}

#[test]
fn panic_during_startup_is_contained() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (boom_layout, _) = legacy_db(dir.path(), "boom", 16);
    legacy_db(dir.path(), "calm", 16);

    let manager = DatabaseManager::new(
        dir.path(),
        config(true),
        Arc::new(JobScheduler::default()),
    )
    .with_verifier(Arc::new(PanickingVerifier));
    let boom = DatabaseId::new("boom").expect("id");
    let calm = DatabaseId::new("calm").expect("id");
    manager.register(boom.clone());
    manager.register(calm.clone());

    let results = manager.start_all();
    assert_eq!(state_of(&results, "calm"), LifecycleState::Started);
    assert_eq!(state_of(&results, "boom"), LifecycleState::Failed);

    let cause = manager
        .get_context(&boom)
        .and_then(|ctx| ctx.failure_cause())
        .expect("cause");
    match cause.as_ref() {
        StartupError::Panicked { message, .. } => assert_eq!(message, "verifier exploded"),
        other => panic!("unexpected cause {other:?}"),
    }
    assert!(all_at(&boom_layout, &StoreVersion::legacy()));
    manager.shutdown();
}

#[test]
fn failure_cause_survives_shutdown() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, _) = legacy_db(dir.path(), "dirty", 16);
    leave_unclean(&layout);
    let manager = DatabaseManager::new(
        dir.path(),
        config(true),
        Arc::new(JobScheduler::default()),
    );
    let id = DatabaseId::new("dirty").expect("id");
    let ctx = manager.register(id.clone());
    assert_eq!(manager.start(&id).expect("start"), LifecycleState::Failed);
    let cause = ctx.failure_cause().expect("cause after start");

    manager.stop(&id).expect("stop");
    assert!(ctx.is_failed());
    manager.shutdown();
    assert_eq!(ctx.state(), LifecycleState::Failed);
    let kept = ctx.failure_cause().expect("cause after shutdown");
    assert!(Arc::ptr_eq(&cause, &kept));
    assert!(root_cause(kept.as_ref()).is::<UnableToUpgrade>());
}

#[test]
fn failed_database_can_be_retried() {
    init_tracing();
    let dir = TempDir::new().expect("tempdir");
    let (layout, _) = legacy_db(dir.path(), "retry", 16);
    leave_unclean(&layout);
    let manager = DatabaseManager::new(
        dir.path(),
        config(true),
        Arc::new(JobScheduler::default()),
    );
    let id = DatabaseId::new("retry").expect("id");
    let ctx = manager.register(id.clone());
    assert_eq!(manager.start(&id).expect("start"), LifecycleState::Failed);

    // Recovery tooling would replay the log and checkpoint it.
    sombra_upgrade::primitives::txlog::TxLog::open(layout.txlog_dir())
        .and_then(|log| log.checkpoint())
        .expect("checkpoint");

    assert_eq!(manager.start(&id).expect("retry"), LifecycleState::Started);
    assert!(ctx.failure_cause().is_none());
    assert!(all_at(&layout, &StoreVersion::current()));
    manager.shutdown();
}
