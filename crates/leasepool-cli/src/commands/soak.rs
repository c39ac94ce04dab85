use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use leasepool::config::parse_duration;
use leasepool::{
    ConnectionPool, LeasepoolConfig, PoolError, PoolResult, PoolStats, PooledConnection,
    TcpConnectionFactory,
};
use serde::Serialize;
use tokio::time::Instant;

/// Back-off after an exhausted acquire.
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(5);

/// Bytes each worker sends and expects echoed back on every lease.
const PROBE: &[u8] = b"leasepool-soak";

#[derive(Debug, Serialize)]
pub struct SoakReport {
    pub workers: usize,
    pub duration_ms: u64,
    pub successes: u64,
    pub exhausted: u64,
    pub failures: u64,
    pub stats: PoolStats,
}

#[derive(Default)]
struct Counters {
    successes: AtomicU64,
    exhausted: AtomicU64,
    failures: AtomicU64,
}

pub fn soak(config: &str, workers: usize, duration: &str, hold: &str) -> anyhow::Result<()> {
    let loaded = LeasepoolConfig::from_file(Path::new(config))?;
    let duration = parse_duration(duration)?;
    let hold = parse_duration(hold)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(run_soak(&loaded, workers, duration, hold))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn run_soak(
    config: &LeasepoolConfig,
    workers: usize,
    duration: Duration,
    hold: Duration,
) -> anyhow::Result<SoakReport> {
    anyhow::ensure!(workers > 0, "at least one worker is required");

    let factory = TcpConnectionFactory::from_transport(&config.transport()?)
        .map_err(|e| anyhow::anyhow!(e))?;
    let pool = ConnectionPool::new(config.pool_config()?, Arc::new(factory));
    let target = config.connect_target();
    let counters = Arc::new(Counters::default());
    let Some(deadline) = Instant::now().checked_add(duration) else {
        anyhow::bail!("soak duration {duration:?} is too long");
    };

    tracing::info!(workers, ?duration, ?hold, target = %target.address(), "starting soak run");

    let mut tasks = Vec::with_capacity(workers);
    for worker in 0..workers {
        let pool = pool.clone();
        let target = target.clone();
        let counters = Arc::clone(&counters);
        tasks.push(tokio::spawn(async move {
            while Instant::now() < deadline {
                match pool.acquire(&target).await {
                    Ok(conn) => {
                        let probe = echo_probe(&conn).await;
                        tokio::time::sleep(hold).await;
                        let released = conn.release().await;
                        match (probe, released) {
                            (Ok(true), Ok(())) => {
                                counters.successes.fetch_add(1, Ordering::Relaxed);
                            }
                            (probe, released) => {
                                tracing::warn!(worker, ?probe, ?released, "lease cycle failed");
                                counters.failures.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(PoolError::Exhausted) => {
                        counters.exhausted.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(EXHAUSTED_BACKOFF).await;
                    }
                    Err(e) => {
                        tracing::warn!(worker, error = %e, "acquire failed");
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        tokio::time::sleep(hold.max(EXHAUSTED_BACKOFF)).await;
                    }
                }
            }
        }));
    }

    for task in tasks {
        task.await?;
    }

    pool.log_stats().await;
    let stats = pool.stats().await;
    pool.shutdown().await;

    Ok(SoakReport {
        workers,
        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        successes: counters.successes.load(Ordering::Relaxed),
        exhausted: counters.exhausted.load(Ordering::Relaxed),
        failures: counters.failures.load(Ordering::Relaxed),
        stats,
    })
}

/// Send the probe and check that the same bytes come back.
async fn echo_probe(conn: &PooledConnection) -> PoolResult<bool> {
    conn.send(PROBE).await?;
    let mut echoed = Vec::with_capacity(PROBE.len());
    while echoed.len() < PROBE.len() {
        let chunk = conn.recv(PROBE.len() - echoed.len()).await?;
        if chunk.is_empty() {
            break;
        }
        echoed.extend_from_slice(&chunk);
    }
    Ok(echoed == PROBE)
}
