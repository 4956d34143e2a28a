use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use rescache::config::Config;
use rescache_kinds::{PixelBufferFactory, PolygonSurfaceFactory};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_workload};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let registry = rescache::init_registry(&config);

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| {
            let parsed = prepare_workload(registry, i, workload);
            (workload.concurrency.max(1), Arc::new(parsed))
        })
        .collect();

    // warmup: run each workload once to make sure all resources are populated
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let workload = Arc::clone(workload);
            tokio::task::spawn_blocking(move || workload.run_once())
        });

        for result in futures::future::join_all(futures).await {
            result.context("warmup task panicked")??;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.iter() {
        let concurrency = *concurrency;
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let updates = Arc::new(AtomicUsize::new(0));
            let failures = Arc::new(AtomicUsize::new(0));
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
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let updates = Arc::clone(&updates);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let result = tokio::task::spawn_blocking(move || workload.run_once()).await;
                            match result {
                                Ok(Ok(updated)) => {
                                    if updated {
                                        updates.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                                Ok(Err(error)) => {
                                    failures.fetch_add(1, Ordering::Relaxed);
                                    rescache::logging::ensure_log_error(&error);
                                }
                                Err(error) => {
                                    failures.fetch_add(1, Ordering::Relaxed);
                                    tracing::error!(error = &error as &dyn std::error::Error, "Operation panicked");
                                }
                            }

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
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

            (
                concurrency,
                task_durations,
                updates.load(Ordering::Relaxed),
                failures.load(Ordering::Relaxed),
            )
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, updates, failures) = task.context("workload panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  populates: {updates}; failures: {failures}");

        if ops == 0 {
            continue;
        }
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
    println!();

    if let Some(cache) = registry.get::<PixelBufferFactory>() {
        println!("pixels:  {:?}", cache.stats());
    }
    if let Some(cache) = registry.get::<PolygonSurfaceFactory>() {
        println!("surface: {:?}", cache.stats());
    }

    // release the pinned resources, then make sure nothing leaked
    for (_, workload) in workloads {
        let workload = Arc::into_inner(workload).context("workload is still in use")?;
        workload.finish()?;
    }
    registry
        .teardown()
        .context("resource caches were not empty at shutdown")?;

    Ok(())
}
