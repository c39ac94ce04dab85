//! Connection pool manager.
//!
//! A [`ConnectionPool`] owns at most one active pool instance at a time. The
//! instance is created lazily by the first [`ConnectionPool::acquire`],
//! filled with `size` connections from the injected [`ConnectionFactory`],
//! and watched by a background [`reclaimer`] task.
//!
//! # Architecture
//!
//! ```text
//! Caller calls acquire(target)
//!   → lock pool state
//!     → No instance → validate config, open `size` connections, start reclaimer
//!     → First idle handle → validate (replace if closed/invalid) → lease it
//!     → No idle handle → PoolError::Exhausted (never waits)
//!
//! Reclaimer tick (every reclaim_interval)
//!   → lock pool state
//!     → Leased past max_lease → close, remove, repopulate
//!     → Everything idle past max_idle → shut the instance down
//! ```
//!
//! Every read or write of lease state, of the handle list and of the
//! instance slot happens under the one `tokio::sync::Mutex<PoolState>`.

pub mod handle;
#[cfg(test)]
pub(crate) mod mock;
pub mod reclaimer;
pub mod tcp;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{ConnectTarget, PoolConfig};
use crate::error::{PoolError, PoolResult};

pub use handle::PooledConnection;
use handle::Slot;
use reclaimer::{Reclaimer, ReclaimerSettings, SweepOutcome};

/// Trait abstracting the underlying connection for testability.
///
/// The pool never inspects the bytes flowing through a backend; it only
/// validates, resets and closes it.
pub trait ConnectionBackend: Send + std::fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send(&mut self, data: &[u8]) -> Result<usize, String>;
    /// Receive up to `max_bytes` from the connection.
    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String>;
    /// Validity check. Returns `false` if the connection is closed or broken.
    fn ping(&mut self) -> bool;
    /// Restore per-lease session options to their defaults on return.
    fn reset(&mut self) -> Result<(), String> {
        Ok(())
    }
    /// Close the underlying transport.
    fn close(&mut self) -> Result<(), String>;
}

/// Factory for creating new connections, injected for testability.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection to the given target.
    fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn ConnectionBackend>, String>;
}

/// Where a swallowed error happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackgroundStage {
    /// Closing a connection whose lease expired.
    LeaseReclaim,
    /// Closing an invalid connection found by `acquire`.
    AcquireEviction,
    /// Resetting a returned connection failed, so it was replaced.
    ReturnEviction,
    /// Opening replacement connections.
    Repopulate,
    /// Closing connections while shutting the pool down.
    Shutdown,
}

/// An error the pool logged and continued past.
#[derive(Clone, Debug)]
pub struct BackgroundError {
    pub stage: BackgroundStage,
    /// The affected handle, if the error concerns a single connection.
    pub handle_id: Option<u64>,
    pub error: PoolError,
}

/// Callback receiving errors that never reach a caller.
///
/// Invoked while the pool lock is held; it must not block.
pub type ErrorSink = Arc<dyn Fn(BackgroundError) + Send + Sync>;

/// Point-in-time view of the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Whether a pool instance currently exists.
    pub active: bool,
    /// Generation of the current (or last) pool instance; 0 before first use.
    pub generation: u64,
    /// Configured size of the active instance, or of the next one.
    pub size: usize,
    /// Connections currently held (leased + idle).
    pub total: usize,
    pub leased: usize,
    pub idle: usize,
    /// Leases taken back by the reclaimer over the pool's lifetime.
    pub lease_reclaims: u64,
    /// Invalid connections replaced by `acquire` over the pool's lifetime.
    pub invalid_evictions: u64,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// State guarded by the pool lock.
struct PoolState {
    /// Configuration the next instance will be created with.
    config: PoolConfig,
    /// Generation of the most recently created instance.
    generation: u64,
    instance: Option<Instance>,
}

/// One live pool instance.
struct Instance {
    generation: u64,
    config: PoolConfig,
    target: ConnectTarget,
    handles: Vec<Arc<Slot>>,
    reclaimer: Option<Reclaimer>,
}

impl Instance {
    fn contains(&self, slot: &Arc<Slot>) -> bool {
        self.handles.iter().any(|h| Arc::ptr_eq(h, slot))
    }
}

pub(crate) struct Shared {
    factory: Arc<dyn ConnectionFactory>,
    error_sink: Option<ErrorSink>,
    next_handle: AtomicU64,
    lease_reclaims: AtomicU64,
    invalid_evictions: AtomicU64,
    state: Mutex<PoolState>,
}

/// Fixed-size connection pool handing out leases.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until the first `acquire`.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::build(config, factory, None)
    }

    /// Create a pool whose swallowed background errors are also passed to `sink`.
    pub fn with_error_sink(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        sink: ErrorSink,
    ) -> Self {
        Self::build(config, factory, Some(sink))
    }

    fn build(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        error_sink: Option<ErrorSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                factory,
                error_sink,
                next_handle: AtomicU64::new(1),
                lease_reclaims: AtomicU64::new(0),
                invalid_evictions: AtomicU64::new(0),
                state: Mutex::new(PoolState {
                    config,
                    generation: 0,
                    instance: None,
                }),
            }),
        }
    }

    /// Replace the configuration used for the next pool instance.
    ///
    /// The active instance keeps the configuration it was created with. A
    /// new `size` is dropped entirely while an instance is active.
    pub async fn configure(&self, config: PoolConfig) {
        let mut state = self.shared.state.lock().await;
        if state.instance.is_some() {
            if config.size != state.config.size {
                tracing::debug!(
                    requested = config.size,
                    current = state.config.size,
                    "pool is active, ignoring size change"
                );
            }
            state.config = PoolConfig {
                size: state.config.size,
                ..config
            };
        } else {
            state.config = config;
        }
    }

    /// The configuration the next pool instance would be created with.
    pub async fn config(&self) -> PoolConfig {
        self.shared.state.lock().await.config.clone()
    }

    /// Lease a connection, creating the pool instance first if none exists.
    ///
    /// `target` is only used when a new instance is created. Never waits for
    /// a connection to be returned: fails with [`PoolError::Exhausted`] when
    /// every connection is leased.
    pub async fn acquire(&self, target: &ConnectTarget) -> PoolResult<PooledConnection> {
        let mut state = self.shared.state.lock().await;
        if state.instance.is_none() {
            self.shared.create_instance(&mut state, target).await?;
        }
        let slot = self.shared.lease(&mut state).await?;
        Ok(PooledConnection::new(slot, Arc::downgrade(&self.shared)))
    }

    /// Return a leased connection to the pool.
    ///
    /// Fails with [`PoolError::NotLeased`] if the handle is not leased.
    /// A handle that is leased but was already reclaimed is silently ignored.
    pub async fn release(&self, conn: &PooledConnection) -> PoolResult<()> {
        let mut state = self.shared.state.lock().await;
        self.shared.release(&mut state, conn.slot()).await
    }

    /// Close every connection and drop the pool instance.
    ///
    /// Does nothing if no instance exists. Waits for the reclaimer task to exit.
    pub async fn shutdown(&self) {
        let reclaimer = {
            let mut state = self.shared.state.lock().await;
            self.shared.shutdown(&mut state).await
        };
        if let Some(reclaimer) = reclaimer {
            reclaimer.stop().await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.shared.state.lock().await.instance.is_some()
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock().await;
        let mut stats = PoolStats {
            active: false,
            generation: state.generation,
            size: state.config.size,
            lease_reclaims: self.shared.lease_reclaims.load(Ordering::Relaxed),
            invalid_evictions: self.shared.invalid_evictions.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        if let Some(instance) = &state.instance {
            stats.active = true;
            stats.size = instance.config.size;
            stats.total = instance.handles.len();
            stats.leased = instance.handles.iter().filter(|h| h.is_leased()).count();
            stats.idle = stats.total - stats.leased;
        }
        stats
    }

    /// Log pool statistics at `tracing::info` level.
    pub async fn log_stats(&self) {
        let stats = self.stats().await;
        tracing::info!(
            active = stats.active,
            generation = stats.generation,
            size = stats.size,
            total = stats.total,
            leased = stats.leased,
            idle = stats.idle,
            lease_reclaims = stats.lease_reclaims,
            invalid_evictions = stats.invalid_evictions,
            "pool statistics"
        );
    }
}

impl Shared {
    /// Log a swallowed error and hand it to the sink.
    fn report(&self, stage: BackgroundStage, handle_id: Option<u64>, error: PoolError) {
        tracing::warn!(?stage, handle = ?handle_id, error = %error, "pool background error");
        if let Some(sink) = &self.error_sink {
            sink(BackgroundError {
                stage,
                handle_id,
                error,
            });
        }
    }

    async fn create_instance(
        self: &Arc<Self>,
        state: &mut PoolState,
        target: &ConnectTarget,
    ) -> PoolResult<()> {
        let config = state.config.clone();
        config.validate()?;

        state.generation += 1;
        let generation = state.generation;
        let mut instance = Instance {
            generation,
            config: config.clone(),
            target: target.clone(),
            handles: Vec::with_capacity(config.size),
            reclaimer: None,
        };

        if let Err(e) = self.repopulate(&mut instance) {
            for slot in instance.handles.drain(..) {
                if let Err(close_err) = slot.close().await {
                    tracing::debug!(
                        handle = slot.id(),
                        error = %close_err,
                        "close after failed pool creation"
                    );
                }
            }
            tracing::warn!(generation, error = %e, "failed to create pool");
            return Err(e);
        }

        instance.reclaimer = Some(Reclaimer::spawn(
            Arc::downgrade(self),
            generation,
            ReclaimerSettings::from(&config),
        ));

        tracing::info!(
            generation,
            size = config.size,
            host = %target.host,
            port = target.port,
            database = %target.database,
            "created connection pool"
        );
        state.instance = Some(instance);
        Ok(())
    }

    /// Open connections until the instance holds `size` of them.
    fn repopulate(&self, instance: &mut Instance) -> PoolResult<usize> {
        let missing = instance.config.size.saturating_sub(instance.handles.len());
        for _ in 0..missing {
            let backend = self
                .factory
                .connect(&instance.target)
                .map_err(PoolError::Resource)?;
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            instance
                .handles
                .push(Arc::new(Slot::new(id, instance.generation, backend, now_millis())));
        }
        if missing > 0 {
            tracing::debug!(
                generation = instance.generation,
                added = missing,
                total = instance.handles.len(),
                "repopulated pool"
            );
        }
        Ok(missing)
    }

    /// Close a connection and drop it from the instance, optionally refilling.
    ///
    /// Errors are reported, never returned: the handle is removed regardless.
    async fn evict_and_replace(
        &self,
        instance: &mut Instance,
        slot: &Arc<Slot>,
        repopulate: bool,
        stage: BackgroundStage,
    ) {
        if let Err(e) = slot.close().await {
            self.report(stage, Some(slot.id()), PoolError::Resource(e));
        }
        instance.handles.retain(|h| !Arc::ptr_eq(h, slot));
        tracing::debug!(
            handle = slot.id(),
            generation = instance.generation,
            ?stage,
            remaining = instance.handles.len(),
            "evicted connection"
        );

        if repopulate {
            if let Err(e) = self.repopulate(instance) {
                self.report(BackgroundStage::Repopulate, None, e);
            }
        }
    }

    async fn lease(&self, state: &mut PoolState) -> PoolResult<Arc<Slot>> {
        let Some(instance) = state.instance.as_mut() else {
            return Err(PoolError::Exhausted);
        };

        // Bounds replacements when the factory keeps handing out bad connections.
        let mut evictions_left = instance.config.size;
        let mut index = 0;
        while index < instance.handles.len() {
            let slot = Arc::clone(&instance.handles[index]);
            if slot.is_leased() {
                index += 1;
                continue;
            }

            if !slot.is_usable().await {
                if evictions_left == 0 {
                    index += 1;
                    continue;
                }
                evictions_left -= 1;
                self.invalid_evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(handle = slot.id(), "replacing invalid connection before lease");
                // Removal shifts the next candidate into `index`.
                self.evict_and_replace(instance, &slot, true, BackgroundStage::AcquireEviction)
                    .await;
                continue;
            }

            slot.mark_leased(now_millis());
            tracing::debug!(
                handle = slot.id(),
                generation = instance.generation,
                "leased connection"
            );
            return Ok(slot);
        }

        Err(PoolError::Exhausted)
    }

    async fn release(&self, state: &mut PoolState, slot: &Arc<Slot>) -> PoolResult<()> {
        if !slot.is_leased() {
            return Err(PoolError::NotLeased);
        }

        let Some(instance) = state.instance.as_mut().filter(|i| i.contains(slot)) else {
            tracing::debug!(handle = slot.id(), "ignoring return of reclaimed connection");
            return Ok(());
        };

        slot.mark_returned(now_millis());
        if let Err(e) = slot.reset().await {
            // Session state is unknown; swap the connection out rather than reuse it.
            let error = PoolError::Resource(e);
            self.report(BackgroundStage::ReturnEviction, Some(slot.id()), error.clone());
            self.evict_and_replace(instance, slot, true, BackgroundStage::ReturnEviction)
                .await;
            return Err(error);
        }
        slot.clear_leased();

        tracing::debug!(
            handle = slot.id(),
            generation = instance.generation,
            "returned connection to pool"
        );
        Ok(())
    }

    /// Release path used by [`PooledConnection::release`]: a no-op once the
    /// pool instance is gone.
    pub(crate) async fn close_path(&self, slot: &Arc<Slot>) -> PoolResult<()> {
        let mut state = self.state.lock().await;
        if state.instance.is_none() {
            tracing::debug!(handle = slot.id(), "pool already shut down, nothing to return to");
            return Ok(());
        }
        self.release(&mut state, slot).await
    }

    /// Evict every connection and clear the instance.
    ///
    /// Returns the instance's reclaimer so the caller decides whether to join it.
    async fn shutdown(&self, state: &mut PoolState) -> Option<Reclaimer> {
        let instance = state.instance.as_mut()?;
        if instance.handles.is_empty() {
            return None;
        }

        for slot in instance.handles.clone() {
            self.evict_and_replace(instance, &slot, false, BackgroundStage::Shutdown)
                .await;
        }

        let mut instance = state.instance.take()?;
        tracing::info!(generation = instance.generation, "connection pool shut down");
        instance.reclaimer.take()
    }

    /// One reclaimer pass over the instance with the given generation.
    pub(crate) async fn sweep(
        &self,
        generation: u64,
        settings: &ReclaimerSettings,
    ) -> SweepOutcome {
        let mut state = self.state.lock().await;
        let Some(instance) = state
            .instance
            .as_mut()
            .filter(|i| i.generation == generation)
        else {
            return SweepOutcome::Done;
        };

        let now = now_millis();
        let snapshot = instance.handles.clone();
        let mut idle = 0usize;
        let mut newest_return = 0u64;

        for slot in &snapshot {
            if slot.is_leased() {
                let Some(max_lease) = settings.max_lease_ms else {
                    continue;
                };
                let held = now.saturating_sub(slot.last_leased_at());
                if held > max_lease {
                    tracing::info!(handle = slot.id(), held_ms = held, "reclaiming overdue lease");
                    self.lease_reclaims.fetch_add(1, Ordering::Relaxed);
                    self.evict_and_replace(instance, slot, true, BackgroundStage::LeaseReclaim)
                        .await;
                }
            } else {
                idle += 1;
                newest_return = newest_return.max(slot.last_returned_at());
            }
        }

        if snapshot.is_empty() {
            tracing::info!(generation, "pool has no connections left, dropping instance");
            state.instance = None;
            return SweepOutcome::Done;
        }

        if idle == snapshot.len() && newest_return < now.saturating_sub(settings.max_idle_ms) {
            tracing::info!(
                generation,
                idle_ms = now.saturating_sub(newest_return),
                "pool idle past limit, shutting down"
            );
            // Our own reclaimer handle; dropping it closes the stop channel.
            drop(self.shutdown(&mut state).await);
            return SweepOutcome::Done;
        }

        SweepOutcome::Continue
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("next_handle", &self.shared.next_handle.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
