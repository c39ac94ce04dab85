//! Pooled connection handles.
//!
//! A [`Slot`] is the pool's record of one connection: the backend it owns
//! exclusively, the lease flag and the lease/return timestamps. Callers see a
//! slot through a [`PooledConnection`], which forwards connection operations
//! to the backend and carries no pooling logic of its own beyond `release`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use super::{ConnectionBackend, Shared};
use crate::error::{PoolError, PoolResult};

/// One pooled connection.
///
/// Lease fields are atomics so a slot can be shared between the pool and the
/// caller holding the lease, but they are only written while the pool lock
/// is held.
pub(crate) struct Slot {
    id: u64,
    generation: u64,
    leased: AtomicBool,
    last_leased_at: AtomicU64,
    last_returned_at: AtomicU64,
    /// Taken (set to `None`) when the connection is closed.
    backend: Mutex<Option<Box<dyn ConnectionBackend>>>,
}

impl Slot {
    /// A fresh, idle slot. `now` counts as its first return.
    pub(crate) fn new(
        id: u64,
        generation: u64,
        backend: Box<dyn ConnectionBackend>,
        now: u64,
    ) -> Self {
        Self {
            id,
            generation,
            leased: AtomicBool::new(false),
            last_leased_at: AtomicU64::new(0),
            last_returned_at: AtomicU64::new(now),
            backend: Mutex::new(Some(backend)),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(crate) fn last_leased_at(&self) -> u64 {
        self.last_leased_at.load(Ordering::Acquire)
    }

    pub(crate) fn last_returned_at(&self) -> u64 {
        self.last_returned_at.load(Ordering::Acquire)
    }

    pub(crate) fn mark_leased(&self, now: u64) {
        self.last_leased_at.store(now, Ordering::Release);
        self.leased.store(true, Ordering::Release);
    }

    pub(crate) fn mark_returned(&self, now: u64) {
        self.last_returned_at.store(now, Ordering::Release);
    }

    pub(crate) fn clear_leased(&self) {
        self.leased.store(false, Ordering::Release);
    }

    /// Open and passing its validity check.
    pub(crate) async fn is_usable(&self) -> bool {
        match self.backend.lock().await.as_mut() {
            Some(backend) => backend.ping(),
            None => false,
        }
    }

    pub(crate) async fn reset(&self) -> Result<(), String> {
        match self.backend.lock().await.as_mut() {
            Some(backend) => backend.reset(),
            None => Err(format!("connection {} is closed", self.id)),
        }
    }

    /// Close the backend. Closing twice is a no-op.
    pub(crate) async fn close(&self) -> Result<(), String> {
        let backend = self.backend.lock().await.take();
        match backend {
            Some(mut backend) => backend.close(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("leased", &self.is_leased())
            .field("last_leased_at", &self.last_leased_at())
            .field("last_returned_at", &self.last_returned_at())
            .finish_non_exhaustive()
    }
}

/// A leased connection.
///
/// Dropping a `PooledConnection` does **not** return it: call
/// [`release`](Self::release). A lease that is never released is taken back
/// by the reclaimer once it exceeds the pool's `max_lease`.
pub struct PooledConnection {
    slot: Arc<Slot>,
    pool: Weak<Shared>,
}

impl PooledConnection {
    pub(crate) fn new(slot: Arc<Slot>, pool: Weak<Shared>) -> Self {
        Self { slot, pool }
    }

    pub(crate) fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    /// Pool-unique identifier of the underlying connection.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Generation of the pool instance this connection belongs to.
    pub fn generation(&self) -> u64 {
        self.slot.generation
    }

    /// Give the connection back to its pool.
    ///
    /// A no-op if the pool instance that issued it has already shut down.
    pub async fn release(&self) -> PoolResult<()> {
        match self.pool.upgrade() {
            Some(shared) => shared.close_path(&self.slot).await,
            None => Ok(()),
        }
    }

    /// Run `f` against the underlying connection.
    ///
    /// Fails with [`PoolError::Resource`] if the pool has closed it, for
    /// example after reclaiming an overdue lease.
    pub async fn with_backend<R>(
        &self,
        f: impl FnOnce(&mut dyn ConnectionBackend) -> R,
    ) -> PoolResult<R> {
        let mut guard = self.slot.backend.lock().await;
        let backend = guard
            .as_mut()
            .ok_or_else(|| PoolError::Resource(format!("connection {} is closed", self.slot.id)))?;
        Ok(f(&mut **backend))
    }

    pub async fn send(&self, data: &[u8]) -> PoolResult<usize> {
        self.with_backend(|b| b.send(data))
            .await?
            .map_err(PoolError::Resource)
    }

    pub async fn recv(&self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        self.with_backend(|b| b.recv(max_bytes))
            .await?
            .map_err(PoolError::Resource)
    }

    pub async fn ping(&self) -> PoolResult<bool> {
        self.with_backend(|b| b.ping()).await
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}
