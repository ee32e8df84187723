//! Connection lifecycle: lazy open, operation lock, idle-timeout watchdog.
//!
//! Every use of the backend goes through [`ConnectionManager::with_connection`],
//! which holds the operation lock for the duration of the call, opens the
//! connection if needed and records the access time on every exit path.
//!
//! The last-access timestamp has its own lock so the watchdog can read it
//! without waiting behind a slow backend call. The watchdog only takes the
//! operation lock when it actually wants to close the connection.

use crate::backend::CondDbBackend;
use conddb_core::{CondDbResult, StorageError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WATCHDOG_THREAD_NAME: &str = "conddb-watchdog";

struct Shared<B> {
    /// Operation lock; the backend is only touched while it is held.
    backend: Mutex<B>,
    open: AtomicBool,
    /// Incremented every time an open connection is closed.
    epoch: AtomicU64,
    last_access: Mutex<Instant>,
    timeout: Duration,
    /// Set once on shutdown; the watchdog sleeps on `wake`.
    stopped: Mutex<bool>,
    wake: Condvar,
    target: String,
}

impl<B: CondDbBackend> Shared<B> {
    fn lock_backend(&self) -> Result<MutexGuard<'_, B>, StorageError> {
        self.backend.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn last_access(&self) -> Instant {
        *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_access
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close with the operation lock held. No-op if already closed.
    fn close_locked(&self, backend: &mut B, reason: &str) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        backend.close();
        self.open.store(false, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(target_db = %self.target, reason, epoch, "connection closed");
        true
    }

    /// Sleep until `deadline` or shutdown. Returns true on shutdown.
    fn wait_for_stop(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *stopped {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
    }
}

/// Records the access time when dropped, so it runs on every exit path.
struct AccessGuard<'a, B: CondDbBackend> {
    shared: &'a Shared<B>,
}

impl<B: CondDbBackend> Drop for AccessGuard<'_, B> {
    fn drop(&mut self) {
        self.shared.touch();
    }
}

/// Owns the backend connection and its idle-timeout watchdog.
pub struct ConnectionManager<B: CondDbBackend> {
    shared: Arc<Shared<B>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CondDbBackend> ConnectionManager<B> {
    /// Wrap a backend. `timeout` of zero disables the idle watchdog.
    ///
    /// Nothing is opened here; the first `with_connection` does that.
    pub fn new(backend: B, timeout: Duration) -> Self {
        let target = backend.describe();
        let open = backend.is_open();
        Self {
            shared: Arc::new(Shared {
                backend: Mutex::new(backend),
                open: AtomicBool::new(open),
                epoch: AtomicU64::new(0),
                last_access: Mutex::new(Instant::now()),
                timeout,
                stopped: Mutex::new(false),
                wake: Condvar::new(),
                target,
            }),
            watchdog: Mutex::new(None),
        }
    }

    /// Run `f` against an open connection.
    ///
    /// Holds the operation lock for the whole call, opens the connection if
    /// it is closed, and updates the last-access time whether `f` succeeds
    /// or not. Open failures are returned as-is and leave the connection
    /// closed.
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut B) -> CondDbResult<T>) -> CondDbResult<T> {
        let mut backend = self.shared.lock_backend()?;
        let _access = AccessGuard {
            shared: &self.shared,
        };

        if !self.shared.open.load(Ordering::SeqCst) {
            backend.open().map_err(|e| {
                tracing::warn!(target_db = %self.shared.target, error = %e, "failed to open connection");
                e
            })?;
            self.shared.open.store(true, Ordering::SeqCst);
            tracing::info!(target_db = %self.shared.target, "connection opened");
            self.ensure_watchdog();
        }

        f(&mut backend)
    }

    /// Close the connection now. Safe to call when already closed.
    pub fn disconnect(&self) -> CondDbResult<()> {
        let mut backend = self.shared.lock_backend()?;
        self.shared.close_locked(&mut backend, "explicit disconnect");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Number of times an open connection has been closed.
    ///
    /// Anything derived from what the connection saw (the heartbeat, for
    /// one) is stale once this changes.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    pub fn last_access(&self) -> Instant {
        self.shared.last_access()
    }

    pub fn timeout(&self) -> Duration {
        self.shared.timeout
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn watchdog_running(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop and join the watchdog, then close the connection.
    ///
    /// After shutdown the manager still works, but no watchdog is started
    /// again.
    pub fn shutdown(&self) -> CondDbResult<()> {
        {
            let mut stopped = self
                .shared
                .stopped
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *stopped = true;
            self.shared.wake.notify_all();
        }

        // Take the handle first: the watchdog may be waiting for the
        // operation lock, and `with_connection` takes this lock under it.
        let handle = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(target_db = %self.shared.target, "connection watchdog panicked");
            }
        }

        self.disconnect()
    }

    /// Undo [`shutdown`](Self::shutdown): the next open starts a watchdog again.
    pub fn resume(&self) {
        *self
            .shared
            .stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Start the watchdog if it is enabled and not running. Called with the
    /// operation lock held.
    fn ensure_watchdog(&self) {
        if self.shared.timeout.is_zero() || self.shared.is_stopped() {
            return;
        }
        let mut slot = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name(WATCHDOG_THREAD_NAME.to_string())
            .spawn(move || watchdog_loop(shared))
        {
            Ok(handle) => *slot = Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "failed to spawn connection watchdog; idle connections stay open");
            }
        }
    }
}

impl<B: CondDbBackend> Drop for ConnectionManager<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "error while shutting down connection manager");
        }
    }
}

fn watchdog_loop<B: CondDbBackend>(shared: Arc<Shared<B>>) {
    let timeout = shared.timeout;
    tracing::info!(target_db = %shared.target, timeout_ms = timeout.as_millis() as u64, "connection watchdog started");

    let mut observed = shared.last_access();
    let mut next_check = observed + timeout;
    loop {
        if shared.wait_for_stop(next_check) {
            break;
        }

        let current = shared.last_access();
        if current != observed {
            // Someone used the connection while we slept.
            observed = current;
            next_check = current + timeout;
            continue;
        }

        match shared.lock_backend() {
            Ok(mut backend) => {
                // Re-check under the lock: an operation may have finished
                // between reading the timestamp and getting here.
                if shared.last_access() == observed {
                    shared.close_locked(&mut backend, "idle timeout");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "connection watchdog cannot take the operation lock");
                break;
            }
        }
        observed = shared.last_access();
        next_check = Instant::now() + timeout;
    }

    tracing::info!(target_db = %shared.target, "connection watchdog stopped");
}

// =============================================================================
// TESTS
// =============================================================================
