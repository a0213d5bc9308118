use std::sync::Arc;

use parking_lot::Mutex;

use crate::dbms::{DatabaseId, LifecycleState, StartupError};
use crate::migration::{MigrationState, UpgradeReport};
use crate::storage::{DatabaseLayout, Store};

#[derive(Debug)]
pub(super) struct ContextState {
    pub(super) lifecycle: LifecycleState,
    pub(super) failure: Option<Arc<StartupError>>,
    pub(super) store: Option<Arc<Store>>,
    pub(super) migration: MigrationState,
    pub(super) last_upgrade: Option<UpgradeReport>,
}

/// State of one supervised database.
///
/// Shared between the manager and callers; reads never block on a start in
/// progress for longer than a field copy.
#[derive(Debug)]
pub struct DatabaseContext {
    id: DatabaseId,
    layout: DatabaseLayout,
    pub(super) inner: Mutex<ContextState>,
}

impl DatabaseContext {
    pub(super) fn new(id: DatabaseId, layout: DatabaseLayout) -> Self {
        Self {
            id,
            layout,
            inner: Mutex::new(ContextState {
                lifecycle: LifecycleState::Stopped,
                failure: None,
                store: None,
                migration: MigrationState::Idle,
                last_upgrade: None,
            }),
        }
    }

    /// Database name.
    pub fn id(&self) -> &DatabaseId {
        &self.id
    }

    /// Store directory.
    pub fn layout(&self) -> &DatabaseLayout {
        &self.layout
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.lock().lifecycle
    }

    /// Whether the last start failed.
    pub fn is_failed(&self) -> bool {
        self.state() == LifecycleState::Failed
    }

    /// Error recorded by the last failed start.
    pub fn failure_cause(&self) -> Option<Arc<StartupError>> {
        self.inner.lock().failure.clone()
    }

    /// The open store, while started.
    pub fn store(&self) -> Option<Arc<Store>> {
        self.inner.lock().store.clone()
    }

    /// Where the last upgrade attempt ended.
    pub fn migration_state(&self) -> MigrationState {
        self.inner.lock().migration.clone()
    }

    /// Report of the last successful upgrade check, if any.
    pub fn last_migration(&self) -> Option<UpgradeReport> {
        self.inner.lock().last_upgrade.clone()
    }
}
