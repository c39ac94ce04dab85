//! Mock backend and factory shared by the pool's unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{ConnectionBackend, ConnectionFactory};
use crate::config::ConnectTarget;

pub(crate) fn test_target() -> ConnectTarget {
    ConnectTarget::new("db.pool.local", 5432, "orders", "app")
}

/// Backend whose state is shared with the test through clones.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockBackend {
    healthy: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    reset_fails: Arc<AtomicBool>,
    close_fails: Arc<AtomicBool>,
    resets: Arc<AtomicU64>,
    closes: Arc<AtomicU64>,
    echo: Arc<Mutex<Vec<u8>>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        let backend = Self::default();
        backend.healthy.store(true, Ordering::Relaxed);
        backend
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub(crate) fn fail_reset(&self) {
        self.reset_fails.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub(crate) fn closes(&self) -> u64 {
        self.closes.load(Ordering::Relaxed)
    }
}

impl ConnectionBackend for MockBackend {
    fn send(&mut self, data: &[u8]) -> Result<usize, String> {
        if self.is_closed() {
            return Err("send on closed connection".to_string());
        }
        self.echo.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> Result<Vec<u8>, String> {
        if self.is_closed() {
            return Err("recv on closed connection".to_string());
        }
        let mut echo = self.echo.lock().unwrap();
        let n = echo.len().min(max_bytes);
        Ok(echo.drain(..n).collect())
    }

    fn ping(&mut self) -> bool {
        !self.is_closed() && self.healthy.load(Ordering::Relaxed)
    }

    fn reset(&mut self) -> Result<(), String> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        if self.reset_fails.load(Ordering::Relaxed) {
            return Err("reset rejected".to_string());
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.closed.store(true, Ordering::Relaxed);
        if self.close_fails.load(Ordering::Relaxed) {
            return Err("close failed".to_string());
        }
        Ok(())
    }
}

/// Factory recording every backend it hands out.
pub(crate) struct MockFactory {
    connect_count: AtomicU64,
    /// Connects allowed before failing; `usize::MAX` means never fail.
    fail_after: AtomicUsize,
    create_unhealthy: AtomicBool,
    close_fails: AtomicBool,
    backends: Mutex<Vec<MockBackend>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self {
            connect_count: AtomicU64::new(0),
            fail_after: AtomicUsize::new(usize::MAX),
            create_unhealthy: AtomicBool::new(false),
            close_fails: AtomicBool::new(false),
            backends: Mutex::new(Vec::new()),
        }
    }

    /// Successful connects so far.
    pub(crate) fn connects(&self) -> u64 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Backends created so far.
    pub(crate) fn created(&self) -> usize {
        self.backends.lock().unwrap().len()
    }

    /// Probe for the `index`-th backend created.
    pub(crate) fn backend(&self, index: usize) -> MockBackend {
        self.backends.lock().unwrap()[index].clone()
    }

    /// Let `n` more connects through, then refuse all further ones.
    pub(crate) fn fail_after(&self, n: usize) {
        self.fail_after.store(self.created() + n, Ordering::Relaxed);
    }

    pub(crate) fn fail_now(&self) {
        self.fail_after(0);
    }

    pub(crate) fn create_unhealthy(&self, unhealthy: bool) {
        self.create_unhealthy.store(unhealthy, Ordering::Relaxed);
    }

    pub(crate) fn close_fails(&self, fails: bool) {
        self.close_fails.store(fails, Ordering::Relaxed);
    }
}

impl ConnectionFactory for MockFactory {
    fn connect(&self, _target: &ConnectTarget) -> Result<Box<dyn ConnectionBackend>, String> {
        let mut backends = self.backends.lock().unwrap();
        if backends.len() >= self.fail_after.load(Ordering::Relaxed) {
            return Err("connection refused".to_string());
        }

        let backend = MockBackend::new();
        backend.set_healthy(!self.create_unhealthy.load(Ordering::Relaxed));
        backend
            .close_fails
            .store(self.close_fails.load(Ordering::Relaxed), Ordering::Relaxed);
        backends.push(backend.clone());
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(backend))
    }
}
