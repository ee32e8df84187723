//! Connection timeout, tag retries, replica staleness and service phases.
//!
//! Some of these tests sleep for a second or two: the connection timeout and
//! the tag retry delay are configured in whole seconds.

use conddb_core::{
    ChannelId, CondDbConfig, CondDbError, HealthStatus, ManualEventClock, TagError, ValidityKey,
};
use conddb_storage::{
    CondDbAccessSvc, CondDbCacheAccess, CondDbInfo, CondDbReader, InMemoryCondDb, ServicePhase,
};
use conddb_test_utils::assertions::*;
use conddb_test_utils::fixtures::*;
use conddb_test_utils::{BackendProbe, InstrumentedBackend};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CH0: ChannelId = ChannelId::new(0);

type Svc = CondDbAccessSvc<InstrumentedBackend<InMemoryCondDb>>;

fn service(config: CondDbConfig) -> (Svc, Arc<BackendProbe>) {
    let backend = InstrumentedBackend::new(sample_database());
    let probe = backend.probe();
    (CondDbAccessSvc::new(config, backend).unwrap(), probe)
}

/// Poll until `condition` holds or `limit` elapses.
fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn heartbeat_config() -> CondDbConfig {
    CondDbConfig {
        heartbeat_condition: Some(HEARTBEAT.to_string()),
        ..memory_config()
    }
}

#[test]
fn test_idle_connection_is_closed_and_reopened() {
    let config = CondDbConfig {
        connection_timeout_secs: 1,
        ..memory_config()
    };
    let (svc, probe) = service(config);
    svc.initialize().unwrap();

    svc.get_object(ALIGNMENT, key(150), CH0).unwrap();
    assert!(svc.is_connected());
    assert!(svc.connection().watchdog_running());

    // Still open well inside the timeout.
    thread::sleep(Duration::from_millis(300));
    assert!(svc.is_connected());

    assert!(wait_until(Duration::from_secs(3), || !svc.is_connected()));
    assert_eq!(probe.closes(), 1);
    assert_eq!(svc.connection().epoch(), 1);

    // Cache hits do not need the connection.
    svc.get_object(ALIGNMENT, key(150), CH0).unwrap();
    assert!(!svc.is_connected());

    svc.get_object(ALIGNMENT, key(250), CH0).unwrap();
    assert!(svc.is_connected());
    assert_eq!(probe.opens(), 2);

    svc.disconnect().unwrap();
    svc.disconnect().unwrap();
    assert_eq!(probe.closes(), 2);
}

#[test]
fn test_activity_keeps_connection_open() {
    let config = CondDbConfig {
        connection_timeout_secs: 1,
        use_cache: false,
        ..memory_config()
    };
    let (svc, probe) = service(config);
    svc.initialize().unwrap();

    for _ in 0..6 {
        svc.get_object(ALIGNMENT, key(150), CH0).unwrap();
        thread::sleep(Duration::from_millis(300));
    }
    assert!(svc.is_connected());
    assert_eq!(probe.closes(), 0);
}

#[test]
fn test_finalize_joins_watchdog_promptly() {
    let config = CondDbConfig {
        connection_timeout_secs: 60,
        ..memory_config()
    };
    let (svc, probe) = service(config);
    svc.initialize().unwrap();
    svc.get_object(ALIGNMENT, key(150), CH0).unwrap();
    assert!(svc.connection().watchdog_running());

    let started = Instant::now();
    svc.finalize().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!svc.connection().watchdog_running());
    assert!(!svc.is_connected());
    assert_eq!(probe.closes(), 1);
    assert_eq!(svc.cache_stats().unwrap().entry_count, 0);
    assert_eq!(svc.phase(), ServicePhase::Finalized);
}

#[test]
fn test_default_tag_found_after_retries() {
    let config = CondDbConfig {
        default_tag: SAMPLE_TAG.to_string(),
        check_tag_trials: 3,
        check_tag_timeout_secs: 1,
        ..memory_config()
    };
    let (svc, probe) = service(config);
    probe.hide_tags_for(2);

    let started = Instant::now();
    svc.initialize().unwrap();
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(probe.tag_checks(), 3);
    assert_eq!(svc.phase(), ServicePhase::Initialized);
}

#[test]
fn test_default_tag_missing_after_all_trials() {
    let config = CondDbConfig {
        default_tag: SAMPLE_TAG.to_string(),
        check_tag_trials: 2,
        ..memory_config()
    };
    let (svc, probe) = service(config);
    probe.hide_tags_for(5);

    let result = svc.initialize();
    assert!(matches!(
        result,
        Err(CondDbError::Tag(TagError::NotFound { trials: 2, .. }))
    ));
    assert_eq!(probe.tag_checks(), 2);
    assert_eq!(svc.phase(), ServicePhase::Configured);
}

#[test]
fn test_head_needs_no_tag_check() {
    let (svc, probe) = service(memory_config());
    svc.initialize().unwrap();
    assert_eq!(probe.tag_checks(), 0);
    assert_eq!(probe.opens(), 0);
}

#[test]
fn test_set_default_tag() {
    let (svc, _probe) = service(memory_config());
    svc.initialize().unwrap();
    svc.get_object(ALIGNMENT, key(350), CH0).unwrap();
    assert_eq!(svc.cache_stats().unwrap().entry_count, 1);

    assert_tag_not_found(&svc.set_default_tag("no-such-tag"));
    assert_eq!(svc.tag(), "HEAD");
    assert_eq!(svc.cache_stats().unwrap().entry_count, 1);

    svc.set_default_tag(SAMPLE_TAG).unwrap();
    assert_eq!(svc.tag(), SAMPLE_TAG);
    assert_eq!(svc.cache_stats().unwrap().entry_count, 0);

    let data = svc.get_object(ALIGNMENT, key(350), CH0).unwrap();
    assert_eq!(data.payload.xml_data(), Some(xml(3).as_str()));
}

#[test]
fn test_tag_switch_discards_fills_from_the_old_tag() {
    let (svc, probe) = service(memory_config());
    svc.initialize().unwrap();
    probe.delay_tag_checks(Duration::from_millis(300));
    let svc = Arc::new(svc);

    let switcher = {
        let svc = Arc::clone(&svc);
        thread::spawn(move || svc.set_default_tag(SAMPLE_TAG))
    };
    // Starts under HEAD and waits behind the slow tag check.
    thread::sleep(Duration::from_millis(50));
    let during = svc.get_object(ALIGNMENT, key(350), CH0).unwrap();
    assert!(during.payload.xml_data().is_some());
    switcher.join().unwrap().unwrap();

    assert_eq!(svc.tag(), SAMPLE_TAG);
    let after = svc.get_object(ALIGNMENT, key(350), CH0).unwrap();
    assert_eq!(after.payload.xml_data(), Some(xml(3).as_str()));
    assert_eq!(after.iov, conddb_core::Iov::open_ended(key(200)).unwrap());
}

#[test]
fn test_stale_replica_while_running() {
    let clock = Arc::new(ManualEventClock::new(key(500)));
    let (svc, probe) = service(heartbeat_config());
    let svc = svc.with_event_clock(clock.clone());
    svc.initialize().unwrap();

    // Not running: no heartbeat read, nothing is stale.
    assert!(!svc.replica_is_stale().unwrap());
    assert!(svc.get_object(ALIGNMENT, key(1_500), CH0).is_ok());
    assert_eq!(svc.heartbeat().fetch_count(), 0);

    svc.start().unwrap();
    assert!(!svc.replica_is_stale().unwrap());
    assert_eq!(svc.latest_update().unwrap(), key(HEARTBEAT_SINCE));
    assert_eq!(svc.heartbeat().fetch_count(), 1);

    assert!(svc.get_object(ALIGNMENT, key(500), CH0).is_ok());
    assert_stale_replica(&svc.get_object(ALIGNMENT, key(HEARTBEAT_SINCE), CH0));
    assert_stale_replica(&svc.get_object(ALIGNMENT, key(1_500), CH0));

    clock.set(key(1_500));
    assert!(svc.replica_is_stale().unwrap());
    assert_eq!(svc.heartbeat().fetch_count(), 1);

    // A new connection may see a newer replica: read the heartbeat again.
    svc.disconnect().unwrap();
    assert_eq!(svc.latest_update().unwrap(), key(HEARTBEAT_SINCE));
    assert_eq!(svc.heartbeat().fetch_count(), 2);

    svc.stop().unwrap();
    assert!(svc.get_object(ALIGNMENT, key(1_500), CH0).is_ok());
    assert!(probe.opens() >= 2);
}

#[test]
fn test_heartbeat_fetch_failure_is_not_fresh() {
    let config = CondDbConfig {
        heartbeat_condition: Some("/Conditions/Online/Missing".to_string()),
        ..memory_config()
    };
    let (svc, _probe) = service(config);
    svc.initialize().unwrap();
    svc.start().unwrap();

    assert!(svc.replica_is_stale().is_err());
    assert!(svc.get_object(ALIGNMENT, key(10), CH0).is_err());
}

#[test]
fn test_without_heartbeat_nothing_is_stale() {
    let clock = Arc::new(ManualEventClock::new(ValidityKey::MAX));
    let (svc, _probe) = service(memory_config());
    let svc = svc.with_event_clock(clock);
    svc.initialize().unwrap();
    svc.start().unwrap();

    assert!(!svc.replica_is_stale().unwrap());
    assert_eq!(svc.latest_update().unwrap(), ValidityKey::MAX);
}

#[test]
fn test_health_follows_phase() {
    let (svc, _probe) = service(memory_config());
    let configured = svc.health();
    assert_eq!(configured.status, HealthStatus::Degraded);
    assert_eq!(configured.metadata["phase"], "configured");

    svc.initialize().unwrap();
    svc.get_object(ALIGNMENT, key(150), CH0).unwrap();
    let ready = svc.health();
    assert!(ready.is_healthy());
    assert_eq!(ready.metadata["connected"], true);
    assert_eq!(ready.metadata["tag"], "HEAD");
    assert_eq!(ready.metadata["cache"]["entry_count"], 1);

    svc.finalize().unwrap();
    let finalized = svc.health();
    assert_eq!(finalized.status, HealthStatus::Unhealthy);
    assert_eq!(finalized.metadata["connected"], false);

    // Finalize is not the end: the service can be initialized again.
    svc.initialize().unwrap();
    assert!(svc.get_object(ALIGNMENT, key(150), CH0).is_ok());
    assert!(svc.health().is_healthy());
}
