use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;

use backdrop_service::config::Config as ServiceConfig;

use crate::workloads::{Poll, PreparedWorkload, Request, System, WorkloadsConfig};

struct Slot {
    request: Request,
    started: Instant,
}

struct Running {
    concurrency: usize,
    workload: PreparedWorkload,
    slots: Vec<Slot>,
    task_durations: DDSketch,
    restarts: usize,
}

pub fn perform_stresstest(
    service_config: ServiceConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let frame = service_config.maintenance_interval;
    let system = System::new(service_config).context("failed to start execution system")?;

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let prepared = PreparedWorkload::new(i, workload.priority, workload.payload);
            (workload.concurrency.max(1), prepared)
        })
        .collect();

    // warmup: run each workload once to make sure all pools are spun up
    {
        let start = Instant::now();

        let mut requests: Vec<_> = workloads
            .iter()
            .map(|(_, workload)| (workload, workload.start(&system)))
            .collect();
        while !requests.is_empty() {
            system.tick();
            requests.retain_mut(|(workload, request)| {
                workload.poll(&system, request) != Poll::Done
            });
            std::thread::sleep(frame);
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently, polling all of them once per frame
    let mut running: Vec<_> = workloads
        .into_iter()
        .map(|(concurrency, workload)| Running {
            slots: (0..concurrency)
                .map(|_| Slot {
                    request: workload.start(&system),
                    started: Instant::now(),
                })
                .collect(),
            concurrency,
            workload,
            task_durations: DDSketch::default(),
            restarts: 0,
        })
        .collect();

    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        system.tick();

        for run in &mut running {
            for slot in &mut run.slots {
                match run.workload.poll(&system, &mut slot.request) {
                    Poll::Pending => {}
                    Poll::Restarted => run.restarts += 1,
                    Poll::Done => {
                        run.task_durations
                            .add(slot.started.elapsed().as_secs_f64());
                        *slot = Slot {
                            request: run.workload.start(&system),
                            started: Instant::now(),
                        };
                    }
                }
            }
        }

        std::thread::sleep(frame);
    }

    let status = system.status();
    system.shutdown();

    for (i, run) in running.iter().enumerate() {
        let Running {
            concurrency,
            task_durations,
            restarts,
            ..
        } = run;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {restarts} restarts"
        );

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let value = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(value)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!(
        "Left behind: {} queued, {} running",
        status.queued(),
        status.running()
    );

    Ok(())
}
