//! Grouped background job scheduling.
//!
//! Every job belongs to a [`Group`]; each group has its own worker threads and
//! parallelism limit, so index population can fan out while migration stays
//! serial. Jobs may run immediately, after a delay, or periodically.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{Result, SombraError};

mod job;
mod pool;
mod timer;

pub use job::{JobContext, JobHandle, JobOutcome};

use job::{Job, QueuedJob, Work};
pub(crate) use job::panic_message;
use pool::GroupPool;
use timer::Timer;

/// Category of background work.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    /// Store format migration.
    Migration,
    /// Building or rebuilding indexes.
    IndexPopulation,
    /// Checkpoints and other store upkeep.
    StorageMaintenance,
    /// Transaction log segment rotation.
    LogRotation,
}

impl Group {
    /// Every group.
    pub const ALL: [Group; 4] = [
        Group::Migration,
        Group::IndexPopulation,
        Group::StorageMaintenance,
        Group::LogRotation,
    ];

    /// Name used in thread names and logs.
    pub fn name(self) -> &'static str {
        match self {
            Group::Migration => "migration",
            Group::IndexPopulation => "index-population",
            Group::StorageMaintenance => "storage-maintenance",
            Group::LogRotation => "log-rotation",
        }
    }

    fn default_parallelism(self) -> usize {
        match self {
            Group::IndexPopulation => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            _ => 1,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What happens to outstanding work at shutdown.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Run queued jobs to completion and join every worker.
    #[default]
    Await,
    /// Cancel queued jobs, interrupt running ones, and return without joining.
    Abandon,
}

/// Errors surfaced by the scheduler and job handles.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler no longer accepts work.
    #[error("job scheduler has been shut down")]
    ShutDown,
    /// The job was cancelled before it could finish.
    #[error("job was cancelled")]
    Cancelled,
    /// The task returned an error.
    #[error("job failed")]
    JobFailed(#[source] Arc<SombraError>),
    /// The task panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
    /// The request itself was unusable; nothing was scheduled.
    #[error("invalid scheduling request: {0}")]
    InvalidArgument(&'static str),
    /// The OS refused to start a thread.
    #[error("failed to start a {group} thread")]
    Spawn {
        /// Group (or `timer`) that needed the thread.
        group: &'static str,
        /// OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Construction options for [`JobScheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    /// Prefix of every worker thread name: `<prefix>-<group>-<n>`.
    pub thread_name_prefix: String,
    /// Default shutdown behavior.
    pub shutdown: ShutdownPolicy,
    /// Per-group worker limits; groups not listed use their default.
    pub parallelism: BTreeMap<Group, usize>,
    /// How long an idle worker waits for work before exiting.
    pub keep_alive: Duration,
    /// Stack size for worker threads; `None` uses the platform default.
    pub worker_stack_size: Option<usize>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            thread_name_prefix: "sombra".to_owned(),
            shutdown: ShutdownPolicy::Await,
            parallelism: BTreeMap::new(),
            keep_alive: Duration::from_secs(30),
            worker_stack_size: None,
        }
    }
}

struct Shared {
    pools: BTreeMap<Group, Arc<GroupPool>>,
    timer: Arc<Timer>,
    policy: ShutdownPolicy,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Shared {
    fn pool(&self, group: Group) -> &Arc<GroupPool> {
        // Every group gets a pool at construction.
        &self.pools[&group]
    }

    fn new_job(&self, group: Group) -> std::result::Result<Arc<Job>, SchedulerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Job::new(id, group))
    }

    fn submit_now(
        &self,
        group: Group,
        work: Work,
    ) -> std::result::Result<JobHandle, SchedulerError> {
        let job = self.new_job(group)?;
        let handle = JobHandle::new(Arc::clone(&job));
        debug!(job = job.id(), group = group.name(), "scheduler.job.schedule");
        self.pool(group).submit(QueuedJob { job, work })?;
        Ok(handle)
    }

    fn submit_at(
        &self,
        group: Group,
        at: Instant,
        work: Work,
    ) -> std::result::Result<JobHandle, SchedulerError> {
        let job = self.new_job(group)?;
        let handle = JobHandle::new(Arc::clone(&job));
        debug!(job = job.id(), group = group.name(), "scheduler.job.schedule_delayed");
        self.timer
            .schedule(at, Arc::clone(self.pool(group)), QueuedJob { job, work })?;
        Ok(handle)
    }

    fn shutdown(&self, policy: ShutdownPolicy) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(policy = ?policy, "scheduler.shutdown.start");
        self.timer.shutdown();
        let mut workers = Vec::new();
        for pool in self.pools.values() {
            workers.extend(pool.shutdown(policy));
        }
        if policy == ShutdownPolicy::Await {
            let me = thread::current().id();
            for worker in workers {
                if worker.thread().id() != me {
                    let _ = worker.join();
                }
            }
        }
        info!("scheduler.shutdown.complete");
    }
}

/// Runs jobs on per-group worker threads.
///
/// Dropping the scheduler shuts it down with its configured policy.
pub struct JobScheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobScheduler")
            .field("policy", &self.shared.policy)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new(SchedulerOptions::default())
    }
}

impl JobScheduler {
    /// Creates a scheduler; threads start lazily on first use.
    pub fn new(options: SchedulerOptions) -> Self {
        let timer = Timer::new(&options.thread_name_prefix);
        let pools = Group::ALL
            .into_iter()
            .map(|group| {
                let parallelism = options
                    .parallelism
                    .get(&group)
                    .copied()
                    .unwrap_or_else(|| group.default_parallelism());
                let pool = GroupPool::new(
                    group,
                    options.thread_name_prefix.clone(),
                    parallelism,
                    options.keep_alive,
                    options.worker_stack_size,
                    Arc::clone(&timer),
                );
                (group, pool)
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                pools,
                timer,
                policy: options.shutdown,
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Runs `task` in `group` as soon as a worker is free.
    pub fn schedule<F>(&self, group: Group, task: F) -> std::result::Result<JobHandle, SchedulerError>
    where
        F: FnOnce(&JobContext) -> Result<()> + Send + 'static,
    {
        self.shared.submit_now(group, Work::Once(Box::new(task)))
    }

    /// Runs `task` in `group` once `delay` has elapsed.
    pub fn schedule_delayed<F>(
        &self,
        group: Group,
        delay: Duration,
        task: F,
    ) -> std::result::Result<JobHandle, SchedulerError>
    where
        F: FnOnce(&JobContext) -> Result<()> + Send + 'static,
    {
        self.shared
            .submit_at(group, Instant::now() + delay, Work::Once(Box::new(task)))
    }

    /// Runs `task` every `period`, first after one period.
    pub fn schedule_recurring<F>(
        &self,
        group: Group,
        period: Duration,
        task: F,
    ) -> std::result::Result<JobHandle, SchedulerError>
    where
        F: Fn(&JobContext) -> Result<()> + Send + Sync + 'static,
    {
        self.schedule_recurring_with_delay(group, period, period, task)
    }

    /// Runs `task` after `initial_delay`, then again `period` after each run
    /// finishes, until cancelled, failed, or shut down.
    pub fn schedule_recurring_with_delay<F>(
        &self,
        group: Group,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> std::result::Result<JobHandle, SchedulerError>
    where
        F: Fn(&JobContext) -> Result<()> + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(SchedulerError::InvalidArgument(
                "recurring period must be non-zero",
            ));
        }
        self.shared.submit_at(
            group,
            Instant::now() + initial_delay,
            Work::Repeat {
                task: Arc::new(task),
                period,
            },
        )
    }

    /// A plain executor that submits into `group`.
    pub fn executor(&self, group: Group) -> GroupExecutor {
        GroupExecutor {
            shared: Arc::clone(&self.shared),
            group,
        }
    }

    /// Changes the worker limit of `group`.
    pub fn set_parallelism(&self, group: Group, parallelism: usize) {
        self.shared.pool(group).set_parallelism(parallelism);
    }

    /// Current worker limit of `group`.
    pub fn parallelism(&self, group: Group) -> usize {
        self.shared.pool(group).parallelism()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Shuts down with the configured policy. Later calls do nothing.
    pub fn shutdown(&self) {
        self.shared.shutdown(self.shared.policy);
    }

    /// Alias of [`shutdown`](Self::shutdown).
    pub fn close(&self) {
        self.shutdown();
    }

    /// Shuts down with an explicit policy.
    pub fn shutdown_with(&self, policy: ShutdownPolicy) {
        self.shared.shutdown(policy);
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Submits plain closures into one group.
#[derive(Clone)]
pub struct GroupExecutor {
    shared: Arc<Shared>,
    group: Group,
}

impl fmt::Debug for GroupExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupExecutor")
            .field("group", &self.group)
            .finish()
    }
}

impl GroupExecutor {
    /// Group this executor feeds.
    pub fn group(&self) -> Group {
        self.group
    }

    /// Runs `task` on the group's workers.
    pub fn execute<F>(&self, task: F) -> std::result::Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(task).map(|_| ())
    }

    /// Runs `task` and returns a handle to it.
    pub fn submit<F>(&self, task: F) -> std::result::Result<JobHandle, SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.submit_now(
            self.group,
            Work::Once(Box::new(move |_: &JobContext| {
                task();
                Ok(())
            })),
        )
    }
}
