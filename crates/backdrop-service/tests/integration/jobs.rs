use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use backdrop_service::caching::{CacheKey, CacheState};
use backdrop_service::config::Config;
use backdrop_service::jobs::{
    Controller, JobCategory, JobError, JobState, SubmitOptions, job_fn,
};
use backdrop_service::system::ExecutionSystem;
use backdrop_test::wait_until;

use crate::{Gate, setup_system};

/// Occupies the single worker of the calculation pool until `gate` opens.
fn block_worker(system: &ExecutionSystem<u64>, gate: &Gate) -> Controller {
    let started = Gate::default();
    let controller = {
        let started = started.clone();
        let gate = gate.clone();
        system.submit(
            JobCategory::Calculation,
            job_fn("blocker", move |check_in, _| {
                started.open();
                gate.wait(check_in)
            }),
            SubmitOptions::default(),
        )
    };
    wait_until("blocker to start", || started.is_open());
    controller
}

#[test]
fn test_priority_ordering() {
    let system = setup_system::<u64, u64>(Config::default());
    let gate = Gate::default();
    let blocker = block_worker(&system, &gate);

    let order = Arc::new(Mutex::new(Vec::new()));
    let controllers: Vec<_> = [("A", 5), ("B", 10), ("C", 5)]
        .into_iter()
        .map(|(name, priority)| {
            let order = Arc::clone(&order);
            system.submit(
                JobCategory::Calculation,
                job_fn(name, move |_, _| {
                    order.lock().unwrap().push(name);
                    Ok(())
                }),
                SubmitOptions::default().with_priority(priority),
            )
        })
        .collect();

    gate.open();
    wait_until("jobs to finish", || {
        controllers
            .iter()
            .all(|controller| controller.state() == Some(JobState::Succeeded))
    });

    assert_eq!(blocker.state(), Some(JobState::Succeeded));
    assert_eq!(*order.lock().unwrap(), ["B", "A", "C"]);
    assert_eq!(system.pool(JobCategory::Calculation).worker_count(), 1);
}

#[test]
fn test_cancellation_propagation() {
    let system = setup_system::<u64, u64>(Config::default());
    let gate = Gate::default();
    let started = Gate::default();

    let controller = {
        let gate = gate.clone();
        let started = started.clone();
        system.submit(
            JobCategory::NetworkRead,
            job_fn("download", move |check_in, progress| {
                progress.report(0.5);
                started.open();
                gate.wait(check_in)
            }),
            SubmitOptions::default(),
        )
    };
    wait_until("download to start", || started.is_open());
    assert_eq!(controller.state(), Some(JobState::Running));
    assert_eq!(controller.progress(), 0.5);

    controller.cancel();
    wait_until("download to cancel", || controller.is_finished());
    assert_eq!(controller.state(), Some(JobState::Canceled));
}

#[test]
fn test_completion_after_cancel_is_canceled() {
    let system = setup_system::<u64, u64>(Config::default());
    let gate = Gate::default();
    let started = Gate::default();

    let controller = {
        let gate = gate.clone();
        let started = started.clone();
        system.submit(
            JobCategory::Calculation,
            job_fn("stubborn", move |_, _| {
                started.open();
                // never checks in
                while !gate.is_open() {
                    std::thread::yield_now();
                }
                Ok(())
            }),
            SubmitOptions::default(),
        )
    };
    wait_until("job to start", || started.is_open());

    controller.cancel();
    gate.open();
    wait_until("job to finish", || controller.is_finished());
    assert_eq!(controller.state(), Some(JobState::Canceled));
}

#[test]
fn test_canceled_before_pickup_never_runs() {
    let system = setup_system::<u64, u64>(Config::default());
    let gate = Gate::default();
    let _blocker = block_worker(&system, &gate);

    let ran = Arc::new(AtomicBool::new(false));
    let controller = {
        let ran = Arc::clone(&ran);
        system.submit(
            JobCategory::Calculation,
            job_fn("canceled", move |_, _| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }),
            SubmitOptions::default(),
        )
    };

    controller.cancel();
    gate.open();
    wait_until("job to be canceled", || controller.is_finished());
    assert_eq!(controller.state(), Some(JobState::Canceled));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_dropping_controller_cancels() {
    let system = setup_system::<u64, u64>(Config::default());
    let gate = Gate::default();
    let blocker = block_worker(&system, &gate);

    drop(blocker);
    wait_until("blocker to be canceled", || system.status().running() == 0);
    assert!(!gate.is_open());
}

#[test]
fn test_status_snapshot() {
    let system = setup_system::<u64, u64>(Config::default());
    let gate = Gate::default();
    let _blocker = block_worker(&system, &gate);

    let _queued = system.submit(
        JobCategory::Calculation,
        job_fn("queued", |_, _| Ok(())).with_size_estimate(1024),
        SubmitOptions::default(),
    );
    let _hidden = system.submit(
        JobCategory::Calculation,
        job_fn("bookkeeping", |_, _| Ok(())),
        SubmitOptions::default().hidden(),
    );
    let failed = system.submit(
        JobCategory::NetworkWrite,
        job_fn("upload", |_, _| Err(JobError::transient("connection reset"))),
        SubmitOptions::default(),
    );
    wait_until("upload to fail", || failed.is_finished());

    let status = system.status();
    let calculation = &status.categories[&JobCategory::Calculation];
    let jobs: Vec<_> = calculation
        .jobs
        .values()
        .map(|info| (info.description.as_str(), info.size_estimate))
        .collect();
    insta::assert_debug_snapshot!((calculation.queued, calculation.running, jobs), @r###"
    (
        1,
        1,
        [
            (
                "blocker",
                0,
            ),
            (
                "queued",
                1024,
            ),
        ],
    )
    "###);

    let network_write = &status.categories[&JobCategory::NetworkWrite];
    let failures: Vec<_> = network_write
        .transient_failures
        .iter()
        .map(|failure| (failure.description.as_str(), failure.message.as_str()))
        .collect();
    insta::assert_debug_snapshot!(failures, @r###"
    [
        (
            "upload",
            "connection reset",
        ),
    ]
    "###);
    assert_eq!(network_write.queued, 0);
    assert_eq!(network_write.running, 0);
    assert_eq!(status.categories[&JobCategory::Disk], Default::default());
}

#[test]
fn test_retry() {
    let system = setup_system::<u64, u64>(Config::default());
    let mut attempts = 0;
    let controller = system.submit(
        JobCategory::NetworkRead,
        job_fn("flaky", move |_, _| {
            attempts += 1;
            match attempts {
                1 => Err(JobError::transient("timeout")),
                _ => Ok(()),
            }
        }),
        SubmitOptions::default(),
    );
    wait_until("first attempt to fail", || controller.is_finished());
    assert_eq!(controller.state(), Some(JobState::Failed));

    let id = controller.id().unwrap();
    assert!(!system.retry(JobCategory::Calculation, id));
    assert!(system.retry(JobCategory::NetworkRead, id));
    wait_until("retry to succeed", || {
        controller.state() == Some(JobState::Succeeded)
    });
    assert!(
        system.status().categories[&JobCategory::NetworkRead]
            .transient_failures
            .is_empty()
    );
}

#[test]
fn test_permanent_failure_is_dropped() {
    let system = setup_system::<u64, u64>(Config::default());
    let controller = system.submit(
        JobCategory::Disk,
        job_fn("corrupt", |_, _| Err(JobError::permanent("bad checksum"))),
        SubmitOptions::default(),
    );
    wait_until("job to fail", || controller.is_finished());

    assert_eq!(controller.state(), Some(JobState::Failed));
    assert!(!system.retry(JobCategory::Disk, controller.id().unwrap()));
    assert_eq!(system.status().categories[&JobCategory::Disk], Default::default());
}

#[test]
fn test_waiting_job_runs_once_data_arrives() {
    let system = setup_system::<u64, u64>(Config::default());
    let key = CacheKey::from("input");
    let input = system.memory_cache().acquire(key.clone());

    let consumer = {
        let input = system.memory_cache().acquire(key.clone());
        let cache = system.memory_cache().clone();
        let key = key.clone();
        system.submit(
            JobCategory::Calculation,
            job_fn("consumer", move |_, _| {
                let value = cache.acquire(key.clone()).value().map(|value| *value);
                assert_eq!(value, Some(7));
                Ok(())
            })
            .with_inputs(move || input.state() == CacheState::Ready),
            SubmitOptions::default(),
        )
    };

    wait_until("consumer to wait", || {
        system.status().categories[&JobCategory::Calculation].queued == 1
            && system.status().running() == 0
    });
    assert_eq!(consumer.state(), Some(JobState::Queued));

    assert!(system.memory_cache().set_data(&key, 7));
    wait_until("consumer to run", || consumer.is_finished());
    assert_eq!(consumer.state(), Some(JobState::Succeeded));
    assert_eq!(input.state(), CacheState::Ready);
}

#[test]
fn test_shutdown_cancels_everything() {
    let system = setup_system::<u64, u64>(Config::default());
    let gate = Gate::default();
    let blocker = block_worker(&system, &gate);
    let queued = system.submit(
        JobCategory::Calculation,
        job_fn("queued", |_, _| Ok(())),
        SubmitOptions::default(),
    );

    system.shutdown();
    assert_eq!(blocker.state(), Some(JobState::Canceled));
    assert_eq!(queued.state(), Some(JobState::Canceled));
    assert_eq!(system.status().queued(), 0);
}
