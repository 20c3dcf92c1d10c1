use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use query_cache::{Config, QueryStore, Status};

use crate::workloads::{WorkloadsConfig, prepare_workload, process_workload};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let store = QueryStore::<u64, String>::new(config.defaults);

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| {
            let prepared = prepare_workload(&store, i, workload);
            (workload.concurrency, Arc::new(prepared))
        })
        .collect();

    // warmup: run each workload once to make sure the runtime is warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let store = store.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_workload(&store, &workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.iter() {
        let concurrency = *concurrency;
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let store = store.clone();
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let store = store.clone();
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if process_workload(&store, &workload).await == Status::Error {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations, errors.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, errors) = task.context("workload task panicked")?;
        let invocations = workloads[i].1.invocations();

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  invocations: {invocations}; settled to error: {errors}");

        if ops == 0 {
            continue;
        }
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(&task_durations, 0.5);
        let p90 = quantile(&task_durations, 0.9);
        let p99 = quantile(&task_durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!("Entries left in the cache: {}", store.len());

    Ok(())
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    sketch
        .quantile(q)
        .ok()
        .flatten()
        .map(Duration::from_secs_f64)
        .unwrap_or_default()
}
