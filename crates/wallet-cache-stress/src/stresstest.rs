use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use wallet_cache::caching::MemoryCache;
use wallet_cache::config::Config;
use wallet_cache::resolver::CacheAndLockResolver;

use crate::workloads::{ParsedWorkload, WorkloadsConfig, prepare_workload, process_workload};

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    errors: usize,
    misses: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = Arc::new(MemoryCache::new(&config.cache));

    // workloads naming the same resolver share it, and with it the locks
    let mut resolvers = BTreeMap::new();
    let mut parsed = Vec::with_capacity(workloads.workloads.len());
    for (i, workload) in workloads.workloads.into_iter().enumerate() {
        let resolver = match resolvers.get(&workload.resolver) {
            Some(resolver) => Arc::clone(resolver),
            None => {
                let resolver_config = config.resolver(&workload.resolver);
                let resolver = CacheAndLockResolver::new(resolver_config, Arc::clone(&cache))
                    .with_context(|| format!("invalid resolver {:?}", workload.resolver))?;
                let resolver = Arc::new(resolver);
                resolvers.insert(workload.resolver.clone(), Arc::clone(&resolver));
                resolver
            }
        };
        parsed.push(Arc::new(prepare_workload(i, workload, resolver)));
    }

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(parsed.len());
    for workload in parsed {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let stats = Arc::new(Mutex::new(Stats::default()));
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
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let result = process_workload(&workload).await;

                            transaction.finish();

                            let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
                            stats.durations.add(task_start.elapsed().as_secs_f64());
                            match result {
                                Ok(Some(_)) => {}
                                Ok(None) => stats.misses += 1,
                                Err(_) => stats.errors += 1,
                            }
                            drop(stats);

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

            let stats = std::mem::take(&mut *stats.lock().unwrap_or_else(PoisonError::into_inner));
            (workload, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, stats) = task.context("stresstest task panicked")?;
        print_summary(i, &workload, &stats, duration);
    }

    Ok(())
}

fn print_summary(i: usize, workload: &ParsedWorkload, stats: &Stats, duration: Duration) {
    let concurrency = workload.concurrency;
    let ops = stats.durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

    let computations = workload.fetcher.computations();
    let ratio = ops as f64 / computations.max(1) as f64;
    println!(
        "  computations: {computations} ({ratio:.1} operations each); misses: {}; errors: {}",
        stats.misses, stats.errors
    );

    if ops == 0 {
        return;
    }
    let quantile = |q| {
        let value = stats.durations.quantile(q).ok().flatten().unwrap_or_default();
        Duration::from_secs_f64(value)
    };
    let avg = Duration::from_secs_f64(stats.durations.sum().unwrap_or_default() / ops as f64);
    let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
    println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
}
