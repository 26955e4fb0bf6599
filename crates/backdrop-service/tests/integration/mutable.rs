use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backdrop_service::config::Config;
use backdrop_service::jobs::{JobCategory, JobState, SubmitOptions, job_fn};
use backdrop_service::mutable::{EntityId, UpdateSource};
use backdrop_service::utils::defer::defer;
use backdrop_test::wait_until;

use crate::{Gate, setup_system};

#[test]
fn test_dispatch_through_network_job() {
    let system = setup_system::<u64, String>(Config::default());
    let cache = system.mutable_cache();
    let id = EntityId::from("user/42");
    let fetches = Arc::new(AtomicU64::new(0));

    let dispatch = || {
        let cache = cache.clone();
        let id = id.clone();
        let fetches = Arc::clone(&fetches);
        system.submit(
            JobCategory::NetworkRead,
            job_fn("fetch user/42", move |check_in, _| {
                check_in.check()?;
                fetches.fetch_add(1, Ordering::SeqCst);
                cache.apply_update(id.clone(), "Alice".to_owned(), UpdateSource::Dispatch);
                Ok(())
            }),
            SubmitOptions::default(),
        )
    };

    assert_eq!(cache.get_or_dispatch(&id, dispatch), None);
    wait_until("update to arrive", || {
        system.tick();
        cache.value(&id).is_some()
    });

    let value = cache.get_or_dispatch(&id, || unreachable!());
    assert_eq!(value.as_deref().map(String::as_str), Some("Alice"));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(cache.version(), 1);
}

#[test]
fn test_watch_delivers_updates_until_unwatched() {
    let system = setup_system::<u64, u64>(Config::default());
    let cache = system.mutable_cache();
    let id = EntityId::from("notifications");
    let stopped = Gate::default();

    let started = cache.watch(&id, || {
        let cache = cache.clone();
        let id = id.clone();
        let stopped = stopped.clone();
        system.submit(
            JobCategory::NotificationWatch,
            job_fn("watch notifications", move |check_in, _| {
                let _stopped = defer(|| stopped.open());
                for count in 1.. {
                    check_in.check()?;
                    cache.apply_update(id.clone(), count, UpdateSource::Watch);
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }),
            SubmitOptions::default().ensure_pickup(),
        )
    });
    assert!(started);
    assert!(cache.is_watch_active(&id));

    // the watch delivers the value, nothing is dispatched
    assert_eq!(cache.get_or_dispatch(&id, || unreachable!()), None);

    wait_until("several updates", || {
        system.tick();
        cache.value(&id).is_some_and(|count| *count >= 3)
    });
    assert!(cache.version() >= 3);

    cache.unwatch(&id);
    assert_eq!(cache.watch_count(&id), 0);
    wait_until("watch job to stop", || stopped.is_open());

    // updates already queued are still applied, then the value stays put
    system.tick();
    let last = cache.value(&id);
    system.tick();
    assert_eq!(cache.value(&id), last);
}

#[test]
fn test_waiting_job_runs_after_entity_update() {
    let system = setup_system::<u64, u64>(Config::default());
    let cache = system.mutable_cache();
    let id = EntityId::from("settings");

    let consumer = {
        let cache = cache.clone();
        let id = id.clone();
        let ready_cache = cache.clone();
        let ready_id = id.clone();
        system.submit(
            JobCategory::Calculation,
            job_fn("render settings", move |_, _| {
                assert_eq!(cache.value(&id).as_deref(), Some(&3));
                Ok(())
            })
            .with_inputs(move || ready_cache.value(&ready_id).is_some()),
            SubmitOptions::default(),
        )
    };
    wait_until("consumer to wait", || {
        system.status().categories[&JobCategory::Calculation].queued == 1
            && system.status().running() == 0
    });

    cache.apply_update(id, 3, UpdateSource::Watch);
    assert!(!consumer.is_finished());
    assert_eq!(system.tick().updates_applied, 1);

    wait_until("consumer to run", || consumer.is_finished());
    assert_eq!(consumer.state(), Some(JobState::Succeeded));
}
