use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::scheduler::job::{run_guarded, Job, JobContext, QueuedJob, Work};
use crate::scheduler::timer::Timer;
use crate::scheduler::{Group, SchedulerError, ShutdownPolicy};

/// Worker threads and queue for one job group.
///
/// Threads are spawned on demand up to the group's parallelism and exit after
/// sitting idle for the keep-alive period.
pub(crate) struct GroupPool {
    group: Group,
    thread_prefix: String,
    keep_alive: Duration,
    stack_size: Option<usize>,
    timer: Arc<Timer>,
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

struct PoolState {
    queue: VecDeque<QueuedJob>,
    workers: Vec<JoinHandle<()>>,
    running: Vec<Arc<Job>>,
    live: usize,
    idle: usize,
    parallelism: usize,
    spawned: u64,
    shut_down: bool,
}

impl GroupPool {
    pub(crate) fn new(
        group: Group,
        thread_prefix: String,
        parallelism: usize,
        keep_alive: Duration,
        stack_size: Option<usize>,
        timer: Arc<Timer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            group,
            thread_prefix,
            keep_alive,
            stack_size,
            timer,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: Vec::new(),
                running: Vec::new(),
                live: 0,
                idle: 0,
                parallelism: parallelism.max(1),
                spawned: 0,
                shut_down: false,
            }),
            work_ready: Condvar::new(),
        })
    }

    pub(crate) fn group(&self) -> Group {
        self.group
    }

    pub(crate) fn parallelism(&self) -> usize {
        self.state.lock().parallelism
    }

    pub(crate) fn set_parallelism(self: &Arc<Self>, parallelism: usize) {
        let mut state = self.state.lock();
        state.parallelism = parallelism.max(1);
        debug!(
            group = self.group.name(),
            parallelism = state.parallelism,
            "scheduler.pool.set_parallelism"
        );
        while state.queue.len() > state.idle && state.live < state.parallelism {
            if let Err(err) = self.spawn_worker(&mut state) {
                warn!(group = self.group.name(), error = %err, "scheduler.pool.spawn_failed");
                break;
            }
        }
        // Surplus workers notice the lower limit when they next wake.
        self.work_ready.notify_all();
    }

    /// Queues a job, spawning a worker if every live one is busy.
    pub(crate) fn submit(self: &Arc<Self>, queued: QueuedJob) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            queued.job.mark_cancelled();
            return Err(SchedulerError::ShutDown);
        }
        state.queue.push_back(queued);
        if state.queue.len() > state.idle && state.live < state.parallelism {
            if let Err(err) = self.spawn_worker(&mut state) {
                if state.live == 0 {
                    // Nobody would ever run it.
                    if let Some(stranded) = state.queue.pop_back() {
                        stranded.job.mark_cancelled();
                    }
                    return Err(err);
                }
                warn!(group = self.group.name(), error = %err, "scheduler.pool.spawn_failed");
            }
        }
        self.work_ready.notify_one();
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> Result<(), SchedulerError> {
        state.spawned += 1;
        let name = format!(
            "{}-{}-{}",
            self.thread_prefix,
            self.group.name(),
            state.spawned
        );
        let pool = Arc::clone(self);
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let handle = builder
            .spawn(move || pool.worker_loop())
            .map_err(|source| SchedulerError::Spawn {
                group: self.group.name(),
                source,
            })?;
        state.workers.retain(|worker| !worker.is_finished());
        state.workers.push(handle);
        state.live += 1;
        debug!(
            group = self.group.name(),
            thread = %name,
            live = state.live,
            "scheduler.pool.spawn_worker"
        );
        Ok(())
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                loop {
                    if state.live > state.parallelism {
                        state.live -= 1;
                        break None;
                    }
                    if let Some(queued) = state.queue.pop_front() {
                        if queued.job.begin() {
                            state.running.push(Arc::clone(&queued.job));
                            break Some(queued);
                        }
                        continue;
                    }
                    if state.shut_down {
                        state.live -= 1;
                        break None;
                    }
                    state.idle += 1;
                    let timed_out = self
                        .work_ready
                        .wait_for(&mut state, self.keep_alive)
                        .timed_out();
                    state.idle -= 1;
                    if timed_out && state.queue.is_empty() && !state.shut_down {
                        state.live -= 1;
                        break None;
                    }
                }
            };
            let Some(queued) = next else {
                debug!(group = self.group.name(), "scheduler.worker.exit");
                return;
            };
            self.run(queued);
        }
    }

    fn run(self: &Arc<Self>, queued: QueuedJob) {
        let QueuedJob { job, work } = queued;
        let ctx = JobContext::for_job(&job);
        debug!(job = job.id(), group = self.group.name(), "scheduler.job.start");
        let (result, repeat) = match work {
            Work::Once(task) => (run_guarded(|| task(&ctx)), None),
            Work::Repeat { task, period } => {
                let result = run_guarded(|| task(&ctx));
                (result, Some((task, period)))
            }
        };
        self.state
            .lock()
            .running
            .retain(|running| !Arc::ptr_eq(running, &job));
        let rearm = job.complete_run(result, repeat.is_some());
        debug!(
            job = job.id(),
            group = self.group.name(),
            rearm,
            "scheduler.job.finish"
        );
        if let (true, Some((task, period))) = (rearm, repeat) {
            let queued = QueuedJob {
                job: Arc::clone(&job),
                work: Work::Repeat { task, period },
            };
            if self
                .timer
                .schedule(Instant::now() + period, Arc::clone(self), queued)
                .is_err()
            {
                job.mark_cancelled();
            }
        }
    }

    /// Stops accepting work and returns worker handles for joining.
    pub(crate) fn shutdown(&self, policy: ShutdownPolicy) -> Vec<JoinHandle<()>> {
        let mut state = self.state.lock();
        state.shut_down = true;
        if policy == ShutdownPolicy::Abandon {
            for queued in state.queue.drain(..) {
                queued.job.mark_cancelled();
            }
            for job in &state.running {
                job.cancel(true);
            }
        }
        debug!(
            group = self.group.name(),
            policy = ?policy,
            queued = state.queue.len(),
            running = state.running.len(),
            "scheduler.pool.shutdown"
        );
        self.work_ready.notify_all();
        std::mem::take(&mut state.workers)
    }
}
