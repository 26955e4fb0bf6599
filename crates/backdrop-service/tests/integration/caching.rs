use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use backdrop_service::caching::{CacheKey, CacheState, DataStatus};
use backdrop_service::config::Config;
use backdrop_service::jobs::{JobCategory, JobError, JobState, SubmitOptions, job_fn};
use backdrop_test::wait_until;

use crate::{Gate, setup_system};

#[test]
fn test_pointer_observes_computation() {
    let system = setup_system::<u64, u64>(Config::default());
    let key = CacheKey::from("x");
    let gate = Gate::default();

    let mut pointer = system.data_pointer();
    assert_eq!(pointer.update(), DataStatus::Unset);
    pointer.reset(key.clone());
    assert_eq!(pointer.status(), DataStatus::Absent);

    let started = pointer.ensure_job(|| {
        let cache = system.memory_cache().clone();
        let gate = gate.clone();
        let key = key.clone();
        system.submit(
            JobCategory::Calculation,
            job_fn("compute x", move |check_in, _| {
                gate.wait(check_in)?;
                cache.set_data(&key, 42);
                Ok(())
            }),
            SubmitOptions::default(),
        )
    });
    assert!(started);
    assert!(matches!(pointer.update(), DataStatus::Computing { .. }));
    assert_eq!(pointer.value(), None);

    gate.open();
    let mut observed = Vec::new();
    wait_until("value to arrive", || {
        let status = pointer.update();
        if observed.last() != Some(&status) {
            observed.push(status);
        }
        status == DataStatus::Ready
    });

    assert_eq!(pointer.value().map(|value| **value), Some(42));
    assert!(
        observed
            .iter()
            .all(|status| matches!(status, DataStatus::Computing { .. } | DataStatus::Ready)),
        "{observed:?}"
    );

    // the value is sticky
    assert!(!system.memory_cache().set_data(&key, 7));
    assert_eq!(pointer.update(), DataStatus::Ready);
    assert_eq!(pointer.value().map(|value| **value), Some(42));
}

#[test]
fn test_pointer_reports_failed_computation() {
    let system = setup_system::<u64, u64>(Config::default());
    let mut pointer = system.data_pointer();
    pointer.reset(CacheKey::from("broken"));

    pointer.ensure_job(|| {
        system.submit(
            JobCategory::Calculation,
            job_fn("compute broken", |_, _| Err(JobError::permanent("no input"))),
            SubmitOptions::default(),
        )
    });
    wait_until("job to fail", || pointer.update() == DataStatus::Failed);

    // a finished job without data is restarted
    let restarted = pointer.ensure_job(|| {
        let cache = system.memory_cache().clone();
        system.submit(
            JobCategory::Calculation,
            job_fn("compute broken again", move |_, _| {
                cache.set_data(&CacheKey::from("broken"), 1);
                Ok(())
            }),
            SubmitOptions::default(),
        )
    });
    assert!(restarted);
    wait_until("value to arrive", || pointer.update() == DataStatus::Ready);
}

#[test]
fn test_tick_evicts_least_recently_released() {
    let mut config = Config::default();
    config.memory_cache.max_megabytes = 1;
    let system = setup_system::<Vec<u8>, u64>(config);
    let cache = system.memory_cache();

    let refs: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            let cache_ref = cache.acquire(CacheKey::from(name));
            assert!(cache.set_data(cache_ref.key(), vec![0; 1024 * 1024]));
            cache_ref
        })
        .collect();

    // nothing is evicted while referenced
    assert_eq!(system.tick().records_evicted, 0);
    assert_eq!(cache.len(), 3);

    drop(refs);
    assert_eq!(cache.evictable_bytes(), 3 * 1024 * 1024);

    let summary = system.tick();
    assert_eq!(summary.records_evicted, 2);
    assert_eq!(summary.evictable_bytes, 1024 * 1024);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.acquire(CacheKey::from("c")).state(), CacheState::Ready);
}

#[test]
fn test_concurrent_requests_share_one_job() {
    let system = Arc::new(setup_system::<u64, u64>(Config::default()));
    let computations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let system = Arc::clone(&system);
            let computations = Arc::clone(&computations);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut pointer = system.data_pointer();
                barrier.wait();
                pointer.reset(CacheKey::from("shared"));
                pointer.ensure_job(|| {
                    computations.fetch_add(1, Ordering::SeqCst);
                    let cache = system.memory_cache().clone();
                    system.submit(
                        JobCategory::Calculation,
                        job_fn("compute shared", move |_, _| {
                            cache.set_data(&CacheKey::from("shared"), 99);
                            Ok(())
                        }),
                        SubmitOptions::default(),
                    )
                });
                wait_until("value to arrive", || pointer.update() == DataStatus::Ready);
                pointer.value().map(|value| **value)
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(99));
    }
    assert_eq!(computations.load(Ordering::SeqCst), 1);
}

#[test]
fn test_durable_store_roundtrip_through_disk_jobs() {
    let tempdir = backdrop_test::tempdir();
    let mut config = Config::default();
    config.cache_dir = Some(tempdir.path().to_owned());
    config.durable_cache.max_size_megabytes = 0;
    let system = setup_system::<Vec<u8>, u64>(config);
    let store = Arc::clone(system.durable_store().unwrap());
    let key = CacheKey::builder().field("image", "cat.png").build();

    let write = {
        let store = Arc::clone(&store);
        let key = key.clone();
        system.submit(
            JobCategory::Disk,
            job_fn("write cat.png", move |_, _| {
                let mut pending = store.begin_insert(&key).map_err(JobError::transient)?;
                pending
                    .file()
                    .write_all(b"meow")
                    .map_err(JobError::transient)?;
                store.finish_insert(pending).map_err(JobError::transient)
            }),
            SubmitOptions::default(),
        )
    };
    wait_until("write to finish", || write.is_finished());
    assert_eq!(write.state(), Some(JobState::Succeeded));

    let mut pointer = system.data_pointer();
    pointer.reset(key.clone());
    pointer.ensure_job(|| {
        let store = Arc::clone(&store);
        let cache = system.memory_cache().clone();
        let key = key.clone();
        system.submit(
            JobCategory::Disk,
            job_fn("read cat.png", move |_, _| {
                let contents = store.lookup(&key).map_err(JobError::transient)?;
                let contents = contents.ok_or_else(|| JobError::permanent("not stored"))?;
                cache.set_data(&key, contents);
                Ok(())
            }),
            SubmitOptions::default(),
        )
    });
    wait_until("read to finish", || pointer.update() == DataStatus::Ready);
    assert_eq!(pointer.value().map(|value| value.as_slice()), Some(&b"meow"[..]));
    assert_eq!(store.enumerate().unwrap().len(), 1);

    let cleanup = system.cleanup_durable_store().unwrap();
    wait_until("cleanup to finish", || cleanup.is_finished());
    assert_eq!(cleanup.state(), Some(JobState::Succeeded));
    assert!(store.enumerate().unwrap().is_empty());
    assert_eq!(store.lookup(&key).unwrap(), None);

    // bookkeeping jobs are not reported
    assert_eq!(system.status().categories[&JobCategory::Disk], Default::default());
}
