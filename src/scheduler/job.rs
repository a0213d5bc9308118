use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::scheduler::{Group, SchedulerError};
use crate::types::{Result, SombraError};

pub(crate) type OnceTask = Box<dyn FnOnce(&JobContext) -> Result<()> + Send + 'static>;
pub(crate) type RepeatTask = Arc<dyn Fn(&JobContext) -> Result<()> + Send + Sync + 'static>;

/// What a worker runs for a job.
pub(crate) enum Work {
    Once(OnceTask),
    Repeat { task: RepeatTask, period: Duration },
}

/// A job plus the closure it runs, as held by queues and the timer.
pub(crate) struct QueuedJob {
    pub job: Arc<Job>,
    pub work: Work,
}

/// Terminal result of a job.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    /// The task returned `Ok`.
    Completed,
    /// The task returned an error.
    Failed(Arc<SombraError>),
    /// The task panicked; the payload message is kept.
    Panicked(String),
    /// The job was cancelled, or abandoned at shutdown.
    Cancelled,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed => f.write_str("completed"),
            JobOutcome::Failed(err) => write!(f, "failed: {err}"),
            JobOutcome::Panicked(msg) => write!(f, "panicked: {msg}"),
            JobOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

enum Status {
    Pending,
    Running,
    Done(JobOutcome),
}

struct JobState {
    status: Status,
    cancel_requested: bool,
}

pub(crate) struct Job {
    id: u64,
    group: Group,
    state: Mutex<JobState>,
    done: Condvar,
    interrupted: Arc<AtomicBool>,
}

pub(crate) type RunResult = std::result::Result<Result<()>, Box<dyn Any + Send>>;

impl Job {
    pub(crate) fn new(id: u64, group: Group) -> Arc<Self> {
        Arc::new(Self {
            id,
            group,
            state: Mutex::new(JobState {
                status: Status::Pending,
                cancel_requested: false,
            }),
            done: Condvar::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Claims the job for a worker; false when it was cancelled before starting.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            Status::Pending => {
                state.status = Status::Running;
                true
            }
            Status::Running | Status::Done(_) => false,
        }
    }

    /// Records the result of one run. Returns true when a repeating job
    /// should be scheduled again.
    pub(crate) fn complete_run(&self, result: RunResult, repeat: bool) -> bool {
        let mut state = self.state.lock();
        let outcome = if state.cancel_requested {
            JobOutcome::Cancelled
        } else {
            match result {
                Ok(Ok(())) => JobOutcome::Completed,
                Ok(Err(err)) => JobOutcome::Failed(Arc::new(err)),
                Err(payload) => JobOutcome::Panicked(panic_message(payload.as_ref())),
            }
        };
        if repeat && matches!(outcome, JobOutcome::Completed) {
            state.status = Status::Pending;
            return true;
        }
        state.status = Status::Done(outcome);
        self.done.notify_all();
        false
    }

    /// Ends a job that will never run (again).
    pub(crate) fn mark_cancelled(&self) {
        let mut state = self.state.lock();
        if !matches!(state.status, Status::Done(_)) {
            state.status = Status::Done(JobOutcome::Cancelled);
            self.done.notify_all();
        }
    }

    pub(crate) fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.state.lock();
        match state.status {
            Status::Pending => {
                state.status = Status::Done(JobOutcome::Cancelled);
                self.done.notify_all();
                true
            }
            Status::Running => {
                state.cancel_requested = true;
                if may_interrupt {
                    self.interrupted.store(true, Ordering::Release);
                }
                true
            }
            Status::Done(_) => false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state.lock().status, Status::Done(_))
    }

    fn outcome(&self) -> Option<JobOutcome> {
        match &self.state.lock().status {
            Status::Done(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Option<JobOutcome> {
        let mut state = self.state.lock();
        loop {
            if let Status::Done(outcome) = &state.status {
                return Some(outcome.clone());
            }
            match timeout {
                Some(limit) => {
                    if self.done.wait_for(&mut state, limit).timed_out() {
                        return match &state.status {
                            Status::Done(outcome) => Some(outcome.clone()),
                            _ => None,
                        };
                    }
                }
                None => self.done.wait(&mut state),
            }
        }
    }
}

/// Runs `f`, turning a panic into an error payload instead of unwinding
/// through the worker.
pub(crate) fn run_guarded(f: impl FnOnce() -> Result<()>) -> RunResult {
    catch_unwind(AssertUnwindSafe(f))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Passed to every task run; lets long tasks notice interruption.
pub struct JobContext {
    id: u64,
    group: Group,
    interrupted: Arc<AtomicBool>,
}

impl JobContext {
    pub(crate) fn for_job(job: &Job) -> Self {
        Self {
            id: job.id,
            group: job.group,
            interrupted: Arc::clone(&job.interrupted),
        }
    }

    /// Whether the job was cancelled with interruption while running.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Scheduler-assigned job id.
    pub fn job_id(&self) -> u64 {
        self.id
    }

    /// Group the job runs in.
    pub fn group(&self) -> Group {
        self.group
    }
}

/// Handle to a scheduled job.
#[derive(Clone)]
pub struct JobHandle {
    job: Arc<Job>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.job.id)
            .field("group", &self.job.group)
            .field("done", &self.job.is_done())
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn new(job: Arc<Job>) -> Self {
        Self { job }
    }

    /// Scheduler-assigned job id.
    pub fn id(&self) -> u64 {
        self.job.id
    }

    /// Group the job was scheduled in.
    pub fn group(&self) -> Group {
        self.job.group
    }

    /// Cancels the job.
    ///
    /// A job that has not started yet never runs. A running job is flagged so
    /// its outcome becomes [`JobOutcome::Cancelled`]; with `may_interrupt` its
    /// [`JobContext::is_interrupted`] also turns true. Cancelling a finished
    /// job does nothing and returns false.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let cancelled = self.job.cancel(may_interrupt);
        tracing::debug!(
            job = self.job.id,
            group = self.job.group.name(),
            may_interrupt,
            cancelled,
            "scheduler.job.cancel"
        );
        cancelled
    }

    /// Whether the job reached a terminal outcome.
    pub fn is_done(&self) -> bool {
        self.job.is_done()
    }

    /// Terminal outcome, if reached.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.job.outcome()
    }

    /// Blocks until the job terminates and converts its outcome.
    pub fn wait_termination(&self) -> std::result::Result<(), SchedulerError> {
        match self.job.wait(None) {
            Some(outcome) => outcome_to_result(outcome),
            None => Err(SchedulerError::Cancelled),
        }
    }

    /// Like [`wait_termination`](Self::wait_termination) but gives up after
    /// `timeout`, returning `None` if the job is still live.
    pub fn wait_termination_timeout(
        &self,
        timeout: Duration,
    ) -> Option<std::result::Result<(), SchedulerError>> {
        self.job.wait(Some(timeout)).map(outcome_to_result)
    }
}

fn outcome_to_result(outcome: JobOutcome) -> std::result::Result<(), SchedulerError> {
    match outcome {
        JobOutcome::Completed => Ok(()),
        JobOutcome::Failed(err) => Err(SchedulerError::JobFailed(err)),
        JobOutcome::Panicked(msg) => Err(SchedulerError::Panicked(msg)),
        JobOutcome::Cancelled => Err(SchedulerError::Cancelled),
    }
}
