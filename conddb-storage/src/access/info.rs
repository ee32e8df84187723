//! Tag, connection, replica and health queries on the access service.

use super::{write_cache, CondDbAccessSvc, CondDbCacheAccess, CondDbInfo, ServicePhase};
use crate::backend::CondDbBackend;
use conddb_core::{CondDbResult, HealthCheck, ValidityKey, HEAD_TAG};
use serde_json::json;

impl<B: CondDbBackend> CondDbInfo for CondDbAccessSvc<B> {
    fn tag(&self) -> String {
        self.current_tag()
    }

    fn set_default_tag(&self, tag: &str) -> CondDbResult<()> {
        if !self.config.no_db {
            self.tags.require(&self.connection, tag)?;
        }
        // Cached objects were read through the old tag. In NoDB mode the
        // cache is the database and is kept. Swapping the tag under the cache
        // write lock keeps in-flight fills from landing after the clear.
        match &self.cache {
            Some(cache) if !self.config.no_db => {
                let mut cache = write_cache(cache);
                self.replace_tag(tag);
                cache.clear();
            }
            _ => self.replace_tag(tag),
        }
        tracing::info!(service = %self.config.name, tag, "default tag changed");
        Ok(())
    }

    fn connection_string(&self) -> Option<&str> {
        self.config.connection_string.as_deref()
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn is_no_db(&self) -> bool {
        self.config.no_db
    }

    fn phase(&self) -> ServicePhase {
        self.current_phase()
    }

    fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    fn disconnect(&self) -> CondDbResult<()> {
        self.connection.disconnect()?;
        self.heartbeat.reset();
        Ok(())
    }

    fn latest_update(&self) -> CondDbResult<ValidityKey> {
        let running = self.current_phase() == ServicePhase::Running;
        self.heartbeat
            .latest_update(&self.connection, HEAD_TAG, running)
    }

    /// An unknown latest update (not yet fetched) is not reported as stale.
    fn replica_is_stale(&self) -> CondDbResult<bool> {
        if !self.heartbeat.is_enabled() {
            return Ok(false);
        }
        let latest = self.latest_update()?;
        if latest == ValidityKey::MIN {
            return Ok(false);
        }
        let now = self.clock.event_time();
        Ok(now >= latest)
    }

    fn health(&self) -> HealthCheck {
        let phase = self.current_phase();
        let name = self.config.name.as_str();
        let check = match phase {
            ServicePhase::Initialized | ServicePhase::Running => HealthCheck::healthy(name),
            ServicePhase::Configured => HealthCheck::degraded(name, "service not initialized"),
            ServicePhase::Finalized => HealthCheck::unhealthy(name, "service finalized"),
        };

        let mut check = check
            .with_metadata("phase", json!(phase.label()))
            .with_metadata("tag", json!(self.current_tag()))
            .with_metadata("connected", json!(self.connection.is_open()))
            .with_metadata("epoch", json!(self.connection.epoch()))
            .with_metadata("no_db", json!(self.config.no_db))
            .with_metadata("read_only", json!(self.config.read_only))
            .with_metadata("watchdog", json!(self.connection.watchdog_running()));
        if let Some(stats) = self.cache_stats() {
            if let Ok(value) = serde_json::to_value(stats) {
                check = check.with_metadata("cache", value);
            }
        }
        check
    }
}
