//! Latest-update tracking for replica staleness checks.

use crate::backend::CondDbBackend;
use crate::connection::ConnectionManager;
use conddb_core::{ChannelId, CondDbResult, ValidityKey};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct HeartbeatState {
    /// `MIN` means unknown.
    latest: ValidityKey,
    /// Connection epoch the value was read under.
    epoch: u64,
}

/// Caches the `since` of the newest heartbeat object.
///
/// The value is read lazily while the service is running and forgotten
/// whenever the connection it came from is closed. Without a heartbeat
/// path the latest update is `ValidityKey::MAX`: never stale.
#[derive(Debug)]
pub struct HeartbeatTracker {
    path: Option<String>,
    channel: ChannelId,
    state: Mutex<HeartbeatState>,
    fetches: AtomicU64,
}

impl HeartbeatTracker {
    pub fn new(path: Option<String>, channel: ChannelId) -> Self {
        let latest = if path.is_some() {
            ValidityKey::MIN
        } else {
            ValidityKey::MAX
        };
        Self {
            path,
            channel,
            state: Mutex::new(HeartbeatState { latest, epoch: 0 }),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, ChannelId::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Latest known update time.
    ///
    /// Fetches the heartbeat object valid at `ValidityKey::MAX` when the
    /// value is unknown and `running` is set. At most one fetch happens per
    /// connection epoch, however many threads ask. Fetch failures are
    /// returned; they never turn into "fresh".
    pub fn latest_update<B: CondDbBackend>(
        &self,
        connection: &ConnectionManager<B>,
        tag: &str,
        running: bool,
    ) -> CondDbResult<ValidityKey> {
        let Some(path) = self.path.as_deref() else {
            return Ok(ValidityKey::MAX);
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let epoch = connection.epoch();
        if state.epoch != epoch {
            state.latest = ValidityKey::MIN;
            state.epoch = epoch;
        }
        if state.latest != ValidityKey::MIN || !running {
            return Ok(state.latest);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let object = connection
            .with_connection(|backend| backend.fetch(path, ValidityKey::MAX, self.channel, tag))?;
        state.latest = object.iov.since();
        tracing::debug!(path, latest = %state.latest, epoch, "heartbeat refreshed");
        Ok(state.latest)
    }

    /// Value currently held, without fetching.
    pub fn cached(&self) -> ValidityKey {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
    }

    /// Forget the cached value.
    pub fn reset(&self) {
        if self.path.is_some() {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .latest = ValidityKey::MIN;
        }
    }

    /// Number of backend fetches made so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}
