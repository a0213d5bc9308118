#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use sombra_upgrade::{
    scheduler::{Group, JobOutcome, JobScheduler, SchedulerError, SchedulerOptions, ShutdownPolicy},
    types::SombraError,
};

use common::init_tracing;

const WAIT: Duration = Duration::from_secs(10);

#[test]
fn cancel_before_start_never_runs_the_task() {
    init_tracing();
    let scheduler = JobScheduler::default();
    scheduler.set_parallelism(Group::Migration, 1);

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let blocker = scheduler
        .schedule(Group::Migration, move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(WAIT);
            Ok(())
        })
        .expect("schedule blocker");
    started_rx.recv_timeout(WAIT).expect("blocker started");

    let ran = Arc::new(AtomicBool::new(false));
    let queued = {
        let ran = Arc::clone(&ran);
        scheduler
            .schedule(Group::Migration, move |_| {
                ran.store(true, Ordering::SeqCst);
                Err(SombraError::Invalid("should never surface"))
            })
            .expect("schedule queued job")
    };
    assert!(queued.cancel(false));
    release_tx.send(()).expect("release blocker");

    assert!(matches!(
        queued.wait_termination(),
        Err(SchedulerError::Cancelled)
    ));
    assert!(matches!(queued.outcome(), Some(JobOutcome::Cancelled)));
    blocker.wait_termination().expect("blocker completes");
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn late_cancel_keeps_the_result() {
    init_tracing();
    let scheduler = JobScheduler::default();
    let done = scheduler
        .schedule(Group::StorageMaintenance, |_| Ok(()))
        .expect("schedule");
    done.wait_termination().expect("completes");
    assert!(!done.cancel(true));
    assert!(matches!(done.outcome(), Some(JobOutcome::Completed)));
    done.wait_termination().expect("still completed");

    let failed = scheduler
        .schedule(Group::StorageMaintenance, |_| {
            Err(SombraError::Invalid("expected failure"))
        })
        .expect("schedule");
    assert!(failed.wait_termination().is_err());
    assert!(!failed.cancel(true));
    assert!(matches!(
        failed.wait_termination(),
        Err(SchedulerError::JobFailed(_))
    ));
}

#[test]
fn interrupting_a_running_job_is_observable() {
    init_tracing();
    let scheduler = JobScheduler::default();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let handle = scheduler
        .schedule(Group::IndexPopulation, move |job| {
            let _ = started_tx.send(());
            let deadline = Instant::now() + WAIT;
            while !job.is_interrupted() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
        .expect("schedule");
    started_rx.recv_timeout(WAIT).expect("started");
    assert!(handle.cancel(true));
    assert!(matches!(
        handle.wait_termination(),
        Err(SchedulerError::Cancelled)
    ));
}

#[test]
fn delayed_jobs_wait_for_their_delay() {
    init_tracing();
    let scheduler = JobScheduler::default();
    let scheduled_at = Instant::now();
    let (tx, rx) = mpsc::channel();
    scheduler
        .schedule_delayed(Group::LogRotation, Duration::from_millis(50), move |_| {
            let _ = tx.send(Instant::now());
            Ok(())
        })
        .expect("schedule")
        .wait_termination()
        .expect("completes");
    let ran_at = rx.recv().expect("ran");
    assert!(ran_at.duration_since(scheduled_at) >= Duration::from_millis(50));
}

#[test]
fn recurring_jobs_repeat_until_cancelled() {
    init_tracing();
    let scheduler = JobScheduler::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let handle = {
        let runs = Arc::clone(&runs);
        scheduler
            .schedule_recurring(Group::StorageMaintenance, Duration::from_millis(5), move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("schedule")
    };
    let deadline = Instant::now() + WAIT;
    while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(runs.load(Ordering::SeqCst) >= 3);
    assert!(!handle.is_done());
    handle.cancel(false);
    assert!(matches!(
        handle.wait_termination_timeout(WAIT),
        Some(Err(SchedulerError::Cancelled))
    ));
    let settled = runs.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(runs.load(Ordering::SeqCst), settled);

    assert!(matches!(
        scheduler.schedule_recurring(Group::StorageMaintenance, Duration::ZERO, |_| Ok(())),
        Err(SchedulerError::InvalidArgument(_))
    ));
}

#[test]
fn shutdown_rejects_new_work_and_awaits_queued_jobs() {
    init_tracing();
    let scheduler = JobScheduler::default();
    scheduler.set_parallelism(Group::Migration, 1);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            scheduler
                .schedule(Group::Migration, |_| {
                    std::thread::sleep(Duration::from_millis(5));
                    Ok(())
                })
                .expect("schedule")
        })
        .collect();
    scheduler.shutdown();
    for handle in &handles {
        handle.wait_termination().expect("queued job ran");
    }
    assert!(scheduler.is_shut_down());
    assert!(matches!(
        scheduler.schedule(Group::Migration, |_| Ok(())),
        Err(SchedulerError::ShutDown)
    ));
}

#[test]
fn abandon_policy_cancels_queued_jobs() {
    init_tracing();
    let scheduler = JobScheduler::new(SchedulerOptions {
        shutdown: ShutdownPolicy::Abandon,
        ..SchedulerOptions::default()
    });
    scheduler.set_parallelism(Group::Migration, 1);
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let running = scheduler
        .schedule(Group::Migration, move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(WAIT);
            Ok(())
        })
        .expect("schedule");
    started_rx.recv_timeout(WAIT).expect("started");
    let queued = scheduler
        .schedule(Group::Migration, |_| Ok(()))
        .expect("schedule");
    let delayed = scheduler
        .schedule_delayed(Group::Migration, Duration::from_secs(60), |_| Ok(()))
        .expect("schedule");

    scheduler.shutdown();
    assert!(matches!(queued.wait_termination(), Err(SchedulerError::Cancelled)));
    assert!(matches!(delayed.wait_termination(), Err(SchedulerError::Cancelled)));
    release_tx.send(()).expect("release");
    assert!(running.wait_termination_timeout(WAIT).is_some());
}

#[test]
fn executor_submits_into_its_group() {
    init_tracing();
    let scheduler = JobScheduler::default();
    let executor = scheduler.executor(Group::IndexPopulation);
    assert_eq!(executor.group(), Group::IndexPopulation);
    let (tx, rx) = mpsc::channel();
    executor
        .submit(move || {
            let _ = tx.send(std::thread::current().name().map(str::to_owned));
        })
        .expect("submit")
        .wait_termination()
        .expect("completes");
    let name = rx.recv().expect("ran").expect("named thread");
    assert!(name.starts_with("sombra-index-population-"), "{name}");
}
