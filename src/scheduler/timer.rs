use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::scheduler::job::QueuedJob;
use crate::scheduler::pool::GroupPool;
use crate::scheduler::SchedulerError;

/// Single thread that hands delayed and recurring jobs to their group pool
/// once they come due.
pub(crate) struct Timer {
    thread_name: String,
    state: Mutex<TimerState>,
    wake: Condvar,
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    seq: u64,
    thread: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct Entry {
    at: Instant,
    seq: u64,
    pool: Arc<GroupPool>,
    queued: QueuedJob,
}

// Reversed so the max-heap yields the earliest deadline first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Timer {
    pub(crate) fn new(thread_prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            thread_name: format!("{thread_prefix}-timer"),
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                seq: 0,
                thread: None,
                shut_down: false,
            }),
            wake: Condvar::new(),
        })
    }

    /// Hands `queued` to `pool` at `at`.
    pub(crate) fn schedule(
        self: &Arc<Self>,
        at: Instant,
        pool: Arc<GroupPool>,
        queued: QueuedJob,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if state.shut_down {
            drop(state);
            queued.job.mark_cancelled();
            return Err(SchedulerError::ShutDown);
        }
        if state.thread.is_none() {
            let timer = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(self.thread_name.clone())
                .spawn(move || timer.run());
            match spawned {
                Ok(handle) => state.thread = Some(handle),
                Err(source) => {
                    drop(state);
                    queued.job.mark_cancelled();
                    return Err(SchedulerError::Spawn {
                        group: "timer",
                        source,
                    });
                }
            }
        }
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Entry {
            at,
            seq,
            pool,
            queued,
        });
        self.wake.notify_one();
        Ok(())
    }

    fn run(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                break;
            }
            let Some(next_at) = state.heap.peek().map(|entry| entry.at) else {
                self.wake.wait(&mut state);
                continue;
            };
            if next_at > Instant::now() {
                self.wake.wait_until(&mut state, next_at);
                continue;
            }
            let Some(entry) = state.heap.pop() else {
                continue;
            };
            drop(state);
            if !entry.queued.job.is_done() {
                let job_id = entry.queued.job.id();
                let group = entry.pool.group();
                if entry.pool.submit(entry.queued).is_err() {
                    debug!(job = job_id, group = group.name(), "scheduler.timer.dropped");
                }
            }
            state = self.state.lock();
        }
        debug!("scheduler.timer.exit");
    }

    /// Cancels everything still waiting and stops the timer thread.
    pub(crate) fn shutdown(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.shut_down = true;
            for entry in state.heap.drain() {
                entry.queued.job.mark_cancelled();
            }
            self.wake.notify_all();
            state.thread.take()
        };
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
