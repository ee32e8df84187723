//! Conditions database access service.
//!
//! [`CondDbAccessSvc`] combines the validity cache, the connection manager,
//! the tag resolver and the heartbeat tracker behind four capability traits:
//!
//! - [`CondDbReader`]: object and interval lookups, node introspection
//! - [`CondDbEditor`]: node creation, storage and tagging
//! - [`CondDbInfo`]: tag, connection and replica state
//! - [`CondDbCacheAccess`]: direct cache population
//!
//! Reads check the cache first and only take the connection on a miss.
//! Writes always go to the backend and never touch the cache.

mod cache_access;
mod editor;
mod info;
mod reader;
mod traits;

pub use traits::{CondDbCacheAccess, CondDbEditor, CondDbInfo, CondDbReader, NameTagPair};

use crate::backend::{backend_for, CondDbBackend, NoDatabase};
use crate::cache::ValidityCache;
use crate::connection::ConnectionManager;
use crate::heartbeat::HeartbeatTracker;
use crate::tag::TagResolver;
use conddb_core::{
    normalize_path, ChannelId, CondDbConfig, CondDbResult, EventClock, StorageError,
    SystemEventClock, ValidationError,
};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// SERVICE PHASE
// ============================================================================

/// Lifecycle phase of the access service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServicePhase {
    /// Constructed, not yet initialized.
    Configured,
    Initialized,
    /// Processing events; heartbeat checks are active.
    Running,
    Finalized,
}

impl ServicePhase {
    /// True once `initialize` has succeeded and until `finalize`.
    pub fn is_ready(self) -> bool {
        matches!(self, ServicePhase::Initialized | ServicePhase::Running)
    }

    pub fn label(self) -> &'static str {
        match self {
            ServicePhase::Configured => "configured",
            ServicePhase::Initialized => "initialized",
            ServicePhase::Running => "running",
            ServicePhase::Finalized => "finalized",
        }
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// ACCESS SERVICE
// ============================================================================

/// Access service over one conditions database.
///
/// All operations take `&self`; the service can be shared between threads
/// behind an `Arc`.
pub struct CondDbAccessSvc<B: CondDbBackend> {
    config: CondDbConfig,
    connection: ConnectionManager<B>,
    /// `None` when the cache is disabled.
    cache: Option<RwLock<ValidityCache>>,
    default_tag: RwLock<String>,
    tags: TagResolver,
    heartbeat: HeartbeatTracker,
    phase: Mutex<ServicePhase>,
    clock: Arc<dyn EventClock>,
}

impl<B: CondDbBackend> CondDbAccessSvc<B> {
    /// Create a service over `backend`. The configuration is validated here;
    /// the backend is not contacted until the first operation that needs it.
    pub fn new(config: CondDbConfig, backend: B) -> CondDbResult<Self> {
        config.validate()?;

        let cache = config.use_cache.then(|| {
            RwLock::new(ValidityCache::new(
                config.cache_low_level,
                config.cache_high_level,
            ))
        });
        let heartbeat = match config.heartbeat_path() {
            Some(path) if !config.no_db => HeartbeatTracker::new(
                Some(normalize_path(path)?),
                ChannelId::new(config.heartbeat_channel),
            ),
            _ => HeartbeatTracker::disabled(),
        };

        Ok(Self {
            connection: ConnectionManager::new(backend, config.connection_timeout()),
            cache,
            default_tag: RwLock::new(config.default_tag.clone()),
            tags: TagResolver::from_config(&config),
            heartbeat,
            phase: Mutex::new(ServicePhase::Configured),
            clock: Arc::new(SystemEventClock),
            config,
        })
    }

    /// Replace the event clock used by `replica_is_stale`.
    pub fn with_event_clock(mut self, clock: Arc<dyn EventClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CondDbConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager<B> {
        &self.connection
    }

    pub fn heartbeat(&self) -> &HeartbeatTracker {
        &self.heartbeat
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Validate the default tag and make the service ready.
    ///
    /// A default tag that cannot be found after the configured trials is
    /// fatal. In NoDB mode there is nothing to validate. Initializing an
    /// initialized service does nothing.
    pub fn initialize(&self) -> CondDbResult<()> {
        let previous = self.phase();
        if previous.is_ready() {
            return Ok(());
        }

        if previous == ServicePhase::Finalized {
            self.connection.resume();
        }

        let tag = self.current_tag();
        if !self.config.no_db {
            if let Err(e) = self.tags.require(&self.connection, &tag) {
                tracing::error!(service = %self.config.name, tag = %tag, error = %e, "default tag validation failed");
                return Err(e);
            }
        }

        self.set_phase(ServicePhase::Initialized);
        tracing::info!(
            service = %self.config.name,
            tag = %tag,
            no_db = self.config.no_db,
            use_cache = self.config.use_cache,
            read_only = self.config.read_only,
            "access service initialized"
        );
        Ok(())
    }

    /// Enter the running phase.
    pub fn start(&self) -> CondDbResult<()> {
        let mut phase = self.lock_phase();
        match *phase {
            ServicePhase::Initialized => {
                *phase = ServicePhase::Running;
                tracing::info!(service = %self.config.name, "access service running");
                Ok(())
            }
            ServicePhase::Running => Ok(()),
            ServicePhase::Configured | ServicePhase::Finalized => {
                Err(ValidationError::NotInitialized.into())
            }
        }
    }

    /// Leave the running phase.
    pub fn stop(&self) -> CondDbResult<()> {
        let mut phase = self.lock_phase();
        if *phase == ServicePhase::Running {
            *phase = ServicePhase::Initialized;
            tracing::info!(service = %self.config.name, "access service stopped");
        }
        Ok(())
    }

    /// Stop the watchdog, close the connection and drop the cache contents.
    pub fn finalize(&self) -> CondDbResult<()> {
        self.connection.shutdown()?;
        self.heartbeat.reset();
        if let Some(cache) = &self.cache {
            write_cache(cache).clear();
        }
        self.set_phase(ServicePhase::Finalized);
        tracing::info!(service = %self.config.name, "access service finalized");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers shared by the trait implementations
    // ------------------------------------------------------------------

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, ServicePhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: ServicePhase) {
        *self.lock_phase() = phase;
    }

    fn current_phase(&self) -> ServicePhase {
        *self.lock_phase()
    }

    fn current_tag(&self) -> String {
        self.default_tag
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_tag(&self, tag: &str) {
        *self
            .default_tag
            .write()
            .unwrap_or_else(PoisonError::into_inner) = tag.to_string();
    }

    fn ensure_ready(&self) -> CondDbResult<()> {
        if self.current_phase().is_ready() {
            Ok(())
        } else {
            Err(ValidationError::NotInitialized.into())
        }
    }

    fn ensure_writable(&self, operation: &str) -> CondDbResult<()> {
        self.ensure_ready()?;
        if self.config.read_only {
            tracing::warn!(operation, "write refused on read-only service");
            return Err(ValidationError::ReadOnly {
                operation: operation.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn cache_lock(&self) -> CondDbResult<&RwLock<ValidityCache>> {
        self.cache
            .as_ref()
            .ok_or_else(|| StorageError::CacheDisabled.into())
    }
}

impl CondDbAccessSvc<NoDatabase> {
    /// A service that runs from the cache alone. `no_db` is forced on.
    pub fn cache_only(config: CondDbConfig) -> CondDbResult<Self> {
        Self::new(
            CondDbConfig {
                no_db: true,
                ..config
            },
            NoDatabase,
        )
    }
}

impl CondDbAccessSvc<Box<dyn CondDbBackend>> {
    /// Build the backend from the configured connection string
    /// ([`NoDatabase`] in NoDB mode).
    pub fn from_config(config: CondDbConfig) -> CondDbResult<Self> {
        config.validate()?;
        let backend: Box<dyn CondDbBackend> = match config.parsed_connection_string()? {
            Some(connection) if !config.no_db => backend_for(&connection)?,
            _ => Box::new(NoDatabase),
        };
        Self::new(config, backend)
    }
}

impl<B: CondDbBackend> fmt::Debug for CondDbAccessSvc<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondDbAccessSvc")
            .field("name", &self.config.name)
            .field("target", &self.connection.target())
            .field("tag", &self.current_tag())
            .field("phase", &self.current_phase())
            .field("use_cache", &self.cache.is_some())
            .finish()
    }
}

fn read_cache(cache: &RwLock<ValidityCache>) -> RwLockReadGuard<'_, ValidityCache> {
    cache.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_cache(cache: &RwLock<ValidityCache>) -> RwLockWriteGuard<'_, ValidityCache> {
    cache.write().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryCondDb;
    use conddb_core::{CondDbError, ConfigError, TagError};

    fn memory_config() -> CondDbConfig {
        CondDbConfig::with_connection("memory://local;schema=test;dbname=DDDB;")
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = CondDbConfig {
            cache_low_level: 50,
            cache_high_level: 10,
            ..memory_config()
        };
        let err = CondDbAccessSvc::new(config, InMemoryCondDb::new()).unwrap_err();
        assert!(matches!(
            err,
            CondDbError::Config(ConfigError::InvalidValue { .. })
        ));

        let err = CondDbAccessSvc::new(CondDbConfig::default(), InMemoryCondDb::new()).unwrap_err();
        assert!(matches!(
            err,
            CondDbError::Config(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_phase_transitions() {
        let svc = CondDbAccessSvc::new(memory_config(), InMemoryCondDb::new()).unwrap();
        assert_eq!(svc.current_phase(), ServicePhase::Configured);
        assert!(matches!(
            svc.start(),
            Err(CondDbError::Validation(ValidationError::NotInitialized))
        ));

        svc.initialize().unwrap();
        assert_eq!(svc.current_phase(), ServicePhase::Initialized);
        svc.start().unwrap();
        assert_eq!(svc.current_phase(), ServicePhase::Running);
        svc.stop().unwrap();
        assert_eq!(svc.current_phase(), ServicePhase::Initialized);

        svc.finalize().unwrap();
        assert_eq!(svc.current_phase(), ServicePhase::Finalized);
        assert!(!svc.connection().is_open());

        svc.initialize().unwrap();
        assert!(svc.current_phase().is_ready());
    }

    #[test]
    fn test_initialize_fails_on_unknown_tag() {
        let config = CondDbConfig {
            default_tag: "no-such-tag".to_string(),
            check_tag_trials: 2,
            check_tag_timeout_secs: 0,
            ..memory_config()
        };
        let svc = CondDbAccessSvc::new(config, InMemoryCondDb::new()).unwrap();
        let err = svc.initialize().unwrap_err();
        assert!(matches!(
            err,
            CondDbError::Tag(TagError::NotFound { trials: 2, .. })
        ));
        assert_eq!(svc.current_phase(), ServicePhase::Configured);
    }

    #[test]
    fn test_cache_only_forces_no_db() {
        let svc = CondDbAccessSvc::cache_only(CondDbConfig::default()).unwrap();
        assert!(svc.config().no_db);
        svc.initialize().unwrap();
        assert!(!svc.connection().is_open());
    }

    #[test]
    fn test_from_config_builds_memory_backend() {
        let svc = CondDbAccessSvc::from_config(memory_config()).unwrap();
        assert!(svc.connection().target().starts_with("memory://"));
        svc.initialize().unwrap();
    }
}
