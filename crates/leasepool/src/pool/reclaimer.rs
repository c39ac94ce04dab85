//! Background reclaimer bound to one pool instance.
//!
//! Every `reclaim_interval` the reclaimer takes the pool lock and, in a
//! single pass over a snapshot of the handle list:
//!
//! - closes and replaces connections leased for longer than `max_lease`
//! - counts idle connections and remembers the newest return time
//!
//! If every connection was idle and even the most recent return is older
//! than `max_idle`, the instance is shut down. The task exits when its
//! instance is gone, when the pool itself is dropped, or when its stop
//! channel fires.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::Shared;
use crate::config::PoolConfig;

/// Timings captured when the instance is created; never change afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReclaimerSettings {
    pub interval: Duration,
    /// `None` disables lease expiry.
    pub max_lease_ms: Option<u64>,
    pub max_idle_ms: u64,
}

impl From<&PoolConfig> for ReclaimerSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            interval: config.reclaim_interval,
            max_lease_ms: config.max_lease.map(saturating_millis),
            max_idle_ms: saturating_millis(config.max_idle),
        }
    }
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// What the loop should do after a sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SweepOutcome {
    Continue,
    Done,
}

/// Handle to a running reclaimer task.
///
/// Dropping it closes the stop channel, which also ends the task.
pub(crate) struct Reclaimer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Reclaimer {
    pub(crate) fn spawn(pool: Weak<Shared>, generation: u64, settings: ReclaimerSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            run_reclaim_loop(pool, generation, settings, shutdown_rx).await;
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the task and wait for it to exit.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "reclaimer task ended abnormally");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_reclaim_loop(
    pool: Weak<Shared>,
    generation: u64,
    settings: ReclaimerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    // First tick completes immediately: sweep, then wait.
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(generation, interval = ?settings.interval, "reclaimer started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = pool.upgrade() else {
                    break;
                };
                if shared.sweep(generation, &settings).await == SweepOutcome::Done {
                    break;
                }
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }

    debug!(generation, "reclaimer stopped");
}
