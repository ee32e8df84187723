//! CondDB Test Utilities
//!
//! Shared test infrastructure for the conditions-database workspace:
//! - Instrumented backend wrapper (call counters, scripted failures)
//! - Proptest generators for intervals, payloads and cache entries
//! - Fixtures: a small populated database and matching configurations
//! - Assertions for the error variants tests care about

pub use conddb_core::{
    ChannelId, CondDbConfig, CondDbError, CondDbResult, CondObject, ConnectionError, Iov,
    NodeKind, Payload, StorageError, StorageType, TagError, ValidationError, ValidityKey,
    VersioningMode,
};
pub use conddb_storage::{CacheEntry, CondDbBackend, InMemoryCondDb};

use conddb_core::{ChildNodes, NodeInfo};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// INSTRUMENTED BACKEND
// ============================================================================

/// Counters and fault switches shared between a test and an
/// [`InstrumentedBackend`] owned by the service under test.
#[derive(Debug, Default)]
pub struct BackendProbe {
    opens: AtomicU64,
    closes: AtomicU64,
    fetches: AtomicU64,
    tag_checks: AtomicU64,
    writes: AtomicU64,
    failing_opens: AtomicU32,
    hidden_tag_checks: AtomicU32,
    tag_check_delay_ms: AtomicU64,
}

impl BackendProbe {
    /// Successful opens.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Closes of an open connection.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    /// `fetch` and `fetch_range` calls.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn tag_checks(&self) -> u64 {
        self.tag_checks.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` tag checks report the tag as missing, as a
    /// lagging replica would.
    pub fn hide_tags_for(&self, count: u32) {
        self.hidden_tag_checks.store(count, Ordering::SeqCst);
    }

    /// Make every tag check block for `delay` before answering.
    pub fn delay_tag_checks(&self, delay: Duration) {
        self.tag_check_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Backend wrapper that counts calls and injects failures.
pub struct InstrumentedBackend<B> {
    inner: B,
    probe: Arc<BackendProbe>,
}

impl<B: CondDbBackend> InstrumentedBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            probe: Arc::new(BackendProbe::default()),
        }
    }

    pub fn probe(&self) -> Arc<BackendProbe> {
        Arc::clone(&self.probe)
    }
}

impl<B: CondDbBackend> CondDbBackend for InstrumentedBackend<B> {
    fn describe(&self) -> String {
        format!("instrumented:{}", self.inner.describe())
    }

    fn open(&mut self) -> CondDbResult<()> {
        if BackendProbe::take_one(&self.probe.failing_opens) {
            return Err(ConnectionError::OpenFailed {
                target: self.describe(),
                reason: "scripted failure".to_string(),
            }
            .into());
        }
        self.inner.open()?;
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if self.inner.is_open() {
            self.probe.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.close();
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn node(&self, path: &str) -> CondDbResult<Option<NodeInfo>> {
        self.inner.node(path)
    }

    fn list_children(&self, path: &str) -> CondDbResult<ChildNodes> {
        self.inner.list_children(path)
    }

    fn fetch(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<CondObject> {
        self.probe.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(path, when, channel, tag)
    }

    fn fetch_range(
        &self,
        path: &str,
        window: &Iov,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<Vec<CondObject>> {
        self.probe.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_range(path, window, channel, tag)
    }

    fn resolve_channel(&self, path: &str, name: &str) -> CondDbResult<ChannelId> {
        self.inner.resolve_channel(path, name)
    }

    fn create_node(&mut self, path: &str, description: &str, kind: NodeKind) -> CondDbResult<()> {
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.create_node(path, description, kind)
    }

    fn store(&mut self, path: &str, object: CondObject) -> CondDbResult<()> {
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.store(path, object)
    }

    fn set_channel_name(
        &mut self,
        path: &str,
        channel: ChannelId,
        name: &str,
    ) -> CondDbResult<()> {
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_channel_name(path, channel, name)
    }

    fn tag(&mut self, path: &str, tag: &str, description: &str) -> CondDbResult<()> {
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.tag(path, tag, description)
    }

    fn create_tag_relation(
        &mut self,
        child_path: &str,
        parent_tag: &str,
        child_tag: &str,
    ) -> CondDbResult<()> {
        self.probe.writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .create_tag_relation(child_path, parent_tag, child_tag)
    }

    fn tag_exists(&self, tag: &str) -> CondDbResult<bool> {
        self.probe.tag_checks.fetch_add(1, Ordering::SeqCst);
        let delay = self.probe.tag_check_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        if BackendProbe::take_one(&self.probe.hidden_tag_checks) {
            return Ok(false);
        }
        self.inner.tag_exists(tag)
    }

    fn all_tags(&self) -> CondDbResult<BTreeSet<String>> {
        self.inner.all_tags()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for conditions data.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_validity_key() -> impl Strategy<Value = ValidityKey> {
        prop_oneof![
            9 => (0u64..100_000).prop_map(ValidityKey::new),
            1 => Just(ValidityKey::MAX),
        ]
    }

    /// A valid interval; one in ten is open-ended.
    pub fn arb_iov() -> impl Strategy<Value = Iov> {
        prop_oneof![
            9 => (0u64..10_000, 1u64..1_000).prop_map(|(since, len)| {
                Iov::new(since, since + len).unwrap_or_else(|_| Iov::unbounded())
            }),
            1 => (0u64..10_000).prop_map(|since| {
                Iov::open_ended(ValidityKey::new(since)).unwrap_or_else(|_| Iov::unbounded())
            }),
        ]
    }

    pub fn arb_channel() -> impl Strategy<Value = ChannelId> {
        (0u32..4).prop_map(ChannelId::new)
    }

    pub fn arb_payload() -> impl Strategy<Value = Payload> {
        prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,32}", 0..4).prop_map(Payload::from)
    }

    pub fn arb_folder_path() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "/Conditions/Velo/Alignment",
            "/Conditions/Velo/Temperature",
            "/Conditions/Rich1/Mirrors",
            "/Conditions/Online/HeartBeat",
        ])
        .prop_map(str::to_string)
    }

    pub fn arb_cache_entry() -> impl Strategy<Value = CacheEntry> {
        (arb_folder_path(), arb_channel(), arb_iov(), arb_payload()).prop_map(
            |(path, channel, iov, payload)| {
                let description = format!("{} description", path);
                CacheEntry::new(path, channel, iov, description, payload)
            },
        )
    }

    pub fn arb_cache_entries(max: usize) -> impl Strategy<Value = Vec<CacheEntry>> {
        prop::collection::vec(arb_cache_entry(), 0..=max)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! A small populated database and configurations pointing at it.
    //!
    //! Layout of [`sample_database`]:
    //!
    //! ```text
    //! /Conditions
    //! /Conditions/Velo
    //! /Conditions/Velo/Alignment      multi-version XML leaf
    //!     channel 0: [0,100) v1  [100,200) v2  [200,300) v3  [300,+inf) v4
    //!     channel 1: [0,+inf) module1            (alias "Module1")
    //! /Conditions/Velo/Temperature    single-version native leaf, channel 0: [0,+inf)
    //! /Conditions/Online/HeartBeat    single-version native leaf, channel 0: [1000,+inf)
    //! ```
    //!
    //! Tag [`SAMPLE_TAG`] is a hierarchical tag on `/Conditions/Velo` taken
    //! before `v4` was stored: through it, channel 0 ends with `[200,+inf) v3`.

    use super::*;

    pub const CONNECTION: &str = "memory://local;schema=test;dbname=DDDB;";
    pub const VELO: &str = "/Conditions/Velo";
    pub const ALIGNMENT: &str = "/Conditions/Velo/Alignment";
    pub const TEMPERATURE: &str = "/Conditions/Velo/Temperature";
    pub const HEARTBEAT: &str = "/Conditions/Online/HeartBeat";
    pub const SAMPLE_TAG: &str = "velo-2026";
    pub const HEARTBEAT_SINCE: u64 = 1_000;

    pub fn xml(version: u32) -> String {
        format!("<DDDB><condition name=\"Alignment\" version=\"{}\"/></DDDB>", version)
    }

    /// Config for a database-backed service: no watchdog, no tag retry delay.
    pub fn memory_config() -> CondDbConfig {
        CondDbConfig {
            connection_timeout_secs: 0,
            check_tag_timeout_secs: 0,
            ..CondDbConfig::with_connection(CONNECTION)
        }
    }

    /// Config for a writable service.
    pub fn writable_config() -> CondDbConfig {
        CondDbConfig {
            read_only: false,
            ..memory_config()
        }
    }

    pub fn key(value: u64) -> ValidityKey {
        ValidityKey::new(value)
    }

    pub fn iov(since: u64, until: u64) -> Iov {
        Iov::new(since, until).unwrap_or_else(|e| panic!("bad fixture interval: {}", e))
    }

    /// Build the sample database. The returned handle is closed; clones share
    /// its contents.
    pub fn sample_database() -> InMemoryCondDb {
        let mut db = InMemoryCondDb::named(CONNECTION);
        populate(&mut db).unwrap_or_else(|e| panic!("failed to build sample database: {}", e));
        db.close();
        db
    }

    fn populate(db: &mut InMemoryCondDb) -> CondDbResult<()> {
        db.open()?;
        let xml_leaf = NodeKind::Leaf {
            storage: StorageType::Xml,
            versioning: VersioningMode::MultiVersion,
        };
        let native_single = NodeKind::Leaf {
            storage: StorageType::Native,
            versioning: VersioningMode::SingleVersion,
        };

        db.create_node(ALIGNMENT, "Velo alignment", xml_leaf)?;
        db.create_node(TEMPERATURE, "Velo temperature", native_single)?;
        db.create_node(HEARTBEAT, "Online heartbeat", native_single)?;

        let channel0 = ChannelId::new(0);
        for (version, (since, until)) in [(0, 100), (100, 200), (200, u64::MAX)]
            .into_iter()
            .enumerate()
        {
            db.store(
                ALIGNMENT,
                CondObject::new(
                    Iov::new(since, until)?,
                    channel0,
                    Payload::xml(xml(version as u32 + 1)),
                ),
            )?;
        }
        db.store(
            ALIGNMENT,
            CondObject::new(
                Iov::unbounded(),
                ChannelId::new(1),
                Payload::xml("<DDDB><condition name=\"Module1\"/></DDDB>"),
            ),
        )?;
        db.set_channel_name(ALIGNMENT, ChannelId::new(1), "Module1")?;

        db.store(
            TEMPERATURE,
            CondObject::new(
                Iov::unbounded(),
                channel0,
                Payload::new().with_field("celsius", "-7.5"),
            ),
        )?;
        db.store(
            HEARTBEAT,
            CondObject::new(
                Iov::open_ended(ValidityKey::new(HEARTBEAT_SINCE))?,
                channel0,
                Payload::new(),
            ),
        )?;

        // Hierarchical tag rooted at /Conditions/Velo.
        db.tag(ALIGNMENT, "alignment-2026", "")?;
        db.tag(TEMPERATURE, "temperature-2026", "")?;
        db.create_tag_relation(ALIGNMENT, SAMPLE_TAG, "alignment-2026")?;
        db.create_tag_relation(TEMPERATURE, SAMPLE_TAG, "temperature-2026")?;

        db.store(
            ALIGNMENT,
            CondObject::new(
                Iov::open_ended(ValidityKey::new(300))?,
                channel0,
                Payload::xml(xml(4)),
            ),
        )?;
        Ok(())
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on conditions-database results.

    use super::*;

    /// Assert "no data": a missing object or a missing node.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CondDbResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_connection_error<T: std::fmt::Debug>(result: &CondDbResult<T>) {
        match result {
            Err(CondDbError::Connection(_)) => {}
            other => panic!("Expected Connection error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_wrong_node_type<T: std::fmt::Debug>(result: &CondDbResult<T>) {
        match result {
            Err(CondDbError::Storage(StorageError::WrongNodeType { .. })) => {}
            other => panic!("Expected WrongNodeType, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_read_only<T: std::fmt::Debug>(result: &CondDbResult<T>) {
        match result {
            Err(CondDbError::Validation(ValidationError::ReadOnly { .. })) => {}
            other => panic!("Expected ReadOnly, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_stale_replica<T: std::fmt::Debug>(result: &CondDbResult<T>) {
        match result {
            Err(CondDbError::Validation(ValidationError::StaleReplica { .. })) => {}
            other => panic!("Expected StaleReplica, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_tag_not_found<T: std::fmt::Debug>(result: &CondDbResult<T>) {
        match result {
            Err(CondDbError::Tag(TagError::NotFound { .. })) => {}
            other => panic!("Expected TagNotFound, got: {:?}", other),
        }
    }

    /// Assert that intervals are ascending and pairwise disjoint.
    #[track_caller]
    pub fn assert_disjoint_ascending(iovs: &[Iov]) {
        for pair in iovs.windows(2) {
            assert!(
                pair[0].until() <= pair[1].since(),
                "intervals {} and {} overlap or are out of order",
                pair[0],
                pair[1]
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_sample_database_head_and_tag() {
        let mut db = sample_database();
        db.open().unwrap();

        let head = db.fetch(ALIGNMENT, key(350), ChannelId::new(0), "HEAD").unwrap();
        assert_eq!(head.payload.xml_data(), Some(xml(4).as_str()));
        assert_eq!(head.iov, Iov::open_ended(key(300)).unwrap());

        let tagged = db
            .fetch(ALIGNMENT, key(350), ChannelId::new(0), SAMPLE_TAG)
            .unwrap();
        assert_eq!(tagged.payload.xml_data(), Some(xml(3).as_str()));

        assert!(db.tag_exists(SAMPLE_TAG).unwrap());
        assert_eq!(
            db.resolve_channel(ALIGNMENT, "Module1").unwrap(),
            ChannelId::new(1)
        );
    }

    #[test]
    fn test_instrumented_backend_counts_and_fails() {
        let mut backend = InstrumentedBackend::new(sample_database());
        let probe = backend.probe();

        probe.fail_next_opens(1);
        assert!(backend.open().is_err());
        backend.open().unwrap();
        assert_eq!(probe.opens(), 1);

        probe.hide_tags_for(2);
        assert!(!backend.tag_exists(SAMPLE_TAG).unwrap());
        assert!(!backend.tag_exists(SAMPLE_TAG).unwrap());
        assert!(backend.tag_exists(SAMPLE_TAG).unwrap());
        assert_eq!(probe.tag_checks(), 3);

        backend.fetch(ALIGNMENT, key(50), ChannelId::new(0), "HEAD").unwrap();
        assert_eq!(probe.fetches(), 1);

        backend.close();
        backend.close();
        assert_eq!(probe.closes(), 1);
    }

    mod prop_tests {
        use super::super::generators::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_generated_iovs_are_valid(iov in arb_iov()) {
                prop_assert!(iov.since() < iov.until());
            }
        }
    }
}
