use std::collections::BTreeMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::admin::ConsistencyCheck;
use crate::config::KernelConfig;
use crate::dbms::context::DatabaseContext;
use crate::dbms::{root_cause, DatabaseId, LifecycleState, StartupError};
use crate::migration::{MigrationState, StoreUpgrader, UpgradeReport};
use crate::primitives::lock::StoreLock;
use crate::scheduler::{panic_message, JobScheduler};
use crate::storage::{DatabaseLayout, GraphData, Store};
use crate::types::{Result, SombraError};

type Opened = (Arc<Store>, Option<UpgradeReport>);

/// Starts, stops, and isolates the databases under one root directory.
pub struct DatabaseManager {
    root: PathBuf,
    config: KernelConfig,
    scheduler: Arc<JobScheduler>,
    verifier: Option<Arc<dyn ConsistencyCheck>>,
    databases: RwLock<BTreeMap<DatabaseId, Arc<DatabaseContext>>>,
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("root", &self.root)
            .field("databases", &self.databases.read().len())
            .finish_non_exhaustive()
    }
}

impl DatabaseManager {
    /// Manager for databases stored as `<root>/<name>`.
    pub fn new(root: impl Into<PathBuf>, config: KernelConfig, scheduler: Arc<JobScheduler>) -> Self {
        Self {
            root: root.into(),
            config,
            scheduler,
            verifier: None,
            databases: RwLock::new(BTreeMap::new()),
        }
    }

    /// Overrides the consistency check used by upgrades.
    pub fn with_verifier(mut self, verifier: Arc<dyn ConsistencyCheck>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scheduler shared by every database.
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Registers `id`, returning the existing context if already known.
    pub fn register(&self, id: DatabaseId) -> Arc<DatabaseContext> {
        let mut databases = self.databases.write();
        let layout = DatabaseLayout::new(self.root.join(id.as_str()));
        Arc::clone(databases.entry(id.clone()).or_insert_with(|| {
            debug!(database = %id, "dbms.database.register");
            Arc::new(DatabaseContext::new(id, layout))
        }))
    }

    /// Context for `id`.
    pub fn get_context(&self, id: &DatabaseId) -> Option<Arc<DatabaseContext>> {
        self.databases.read().get(id).cloned()
    }

    /// Every registered database, in name order.
    pub fn databases(&self) -> Vec<DatabaseId> {
        self.databases.read().keys().cloned().collect()
    }

    fn context(&self, id: &DatabaseId) -> Result<Arc<DatabaseContext>> {
        self.get_context(id).ok_or(SombraError::NotFound)
    }

    /// Upgrades (if needed) and opens `id`.
    ///
    /// Startup failures do not surface here; they leave the context
    /// [`LifecycleState::Failed`] with the error in
    /// [`DatabaseContext::failure_cause`]. Only an unknown `id` is an error.
    pub fn start(&self, id: &DatabaseId) -> Result<LifecycleState> {
        let ctx = self.context(id)?;
        {
            let mut inner = ctx.inner.lock();
            match inner.lifecycle {
                LifecycleState::Started | LifecycleState::Starting => return Ok(inner.lifecycle),
                LifecycleState::Failed => {
                    info!(database = %id, "dbms.database.retry");
                }
                LifecycleState::Stopped => {}
            }
            inner.lifecycle = LifecycleState::Starting;
            inner.failure = None;
        }
        info!(database = %id, dir = %ctx.layout().dir().display(), "dbms.database.starting");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.open_database(&ctx)))
            .unwrap_or_else(|payload| {
                Err(StartupError::Panicked {
                    database: id.clone(),
                    message: panic_message(payload.as_ref()),
                })
            });

        let mut inner = ctx.inner.lock();
        match outcome {
            Ok((store, report)) => {
                info!(database = %id, version = %store.version(), "dbms.database.started");
                inner.store = Some(store);
                if report.is_some() {
                    inner.last_upgrade = report;
                }
                inner.lifecycle = LifecycleState::Started;
            }
            Err(err) => {
                error!(
                    database = %id,
                    error = %err,
                    cause = %root_cause(&err),
                    "dbms.database.failed"
                );
                inner.failure = Some(Arc::new(err));
                inner.lifecycle = LifecycleState::Failed;
            }
        }
        Ok(inner.lifecycle)
    }

    fn open_database(&self, ctx: &DatabaseContext) -> std::result::Result<Opened, StartupError> {
        let database = ctx.id().clone();
        let layout = ctx.layout();
        let open_err = |source: SombraError| StartupError::Open {
            database: database.clone(),
            source,
        };

        fs::create_dir_all(layout.dir()).map_err(|err| open_err(err.into()))?;
        if !layout.has_store() && !layout.upgrade_dir().exists() {
            let store = Store::create(layout, &GraphData::empty()).map_err(open_err)?;
            info!(database = %database, "dbms.database.created");
            ctx.inner.lock().migration = MigrationState::NotRequired;
            return Ok((Arc::new(store), None));
        }

        let lock = StoreLock::try_acquire(layout.lock_file()).map_err(open_err)?;
        let mut upgrader = StoreUpgrader::new(
            layout.clone(),
            self.config.upgrade_options(),
            Arc::clone(&self.scheduler),
        );
        if let Some(verifier) = &self.verifier {
            upgrader = upgrader.with_verifier(Arc::clone(verifier));
        }
        let upgraded = upgrader.migrate_if_needed_locked(&lock);
        ctx.inner.lock().migration = upgrader.state().clone();
        let report = upgraded.map_err(|source| StartupError::Migration {
            database: database.clone(),
            source,
        })?;
        let store = Store::open_with_lock(layout, lock).map_err(open_err)?;
        Ok((Arc::new(store), Some(report)))
    }

    /// Starts every registered database concurrently and waits for all of them.
    pub fn start_all(&self) -> Vec<(DatabaseId, LifecycleState)> {
        let ids = self.databases();
        thread::scope(|scope| {
            let mut pending = Vec::with_capacity(ids.len());
            for id in &ids {
                let spawned = thread::Builder::new()
                    .name(format!("sombra-start-{id}"))
                    .spawn_scoped(scope, move || self.start(id));
                match spawned {
                    Ok(handle) => pending.push((id, Some(handle))),
                    Err(err) => {
                        warn!(database = %id, error = %err, "dbms.start_all.spawn_failed");
                        pending.push((id, None));
                    }
                }
            }
            pending
                .into_iter()
                .map(|(id, handle)| {
                    let state = match handle {
                        Some(handle) => handle.join().ok().and_then(|r| r.ok()),
                        None => self.start(id).ok(),
                    };
                    (id.clone(), state.unwrap_or(LifecycleState::Failed))
                })
                .collect()
        })
    }

    /// Closes `id`'s store with a checkpoint and marks it stopped.
    ///
    /// A failed database keeps its state and cause; only [`start`](Self::start)
    /// clears them.
    pub fn stop(&self, id: &DatabaseId) -> Result<()> {
        let ctx = self.context(id)?;
        let store = {
            let mut inner = ctx.inner.lock();
            if inner.lifecycle != LifecycleState::Failed {
                inner.lifecycle = LifecycleState::Stopped;
            }
            inner.store.take()
        };
        if let Some(store) = store {
            let checkpoint = store.close()?;
            info!(database = %id, checkpoint = checkpoint.0, "dbms.database.stopped");
        }
        Ok(())
    }

    /// Stops `id` and forgets it. Files on disk are left in place.
    pub fn drop_database(&self, id: &DatabaseId) -> Result<()> {
        self.stop(id)?;
        self.databases.write().remove(id);
        info!(database = %id, "dbms.database.dropped");
        Ok(())
    }

    /// Stops every database, then shuts down the scheduler.
    pub fn shutdown(&self) {
        for id in self.databases() {
            if let Err(err) = self.stop(&id) {
                warn!(database = %id, error = %err, "dbms.shutdown.stop_failed");
            }
        }
        self.scheduler.shutdown();
        info!(root = %self.root.display(), "dbms.shutdown.complete");
    }
}
