//! CondDB Core - Conditions Data Model
//!
//! Validity keys, intervals of validity, channels, payloads and node
//! descriptors shared by the cache, the backends and the access service.
//! This crate contains ONLY data types - no connection or cache logic.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod path;

pub use config::CondDbConfig;
pub use connection::ConnectionString;
pub use error::{
    CondDbError, CondDbResult, ConfigError, ConnectionError, StorageError, TagError,
    ValidationError,
};
pub use health::{HealthCheck, HealthStatus};
pub use path::{ancestors, join_path, node_name, normalize_path, parent_path, ROOT_PATH};

// ============================================================================
// VALIDITY KEY
// ============================================================================

/// Point on the conditions time axis, in nanoseconds since the Unix epoch.
///
/// `ValidityKey::MAX` stands for "the end of time": an interval ending there
/// is valid forever from its `since`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ValidityKey(u64);

impl ValidityKey {
    pub const MIN: ValidityKey = ValidityKey(0);
    pub const MAX: ValidityKey = ValidityKey(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_max(self) -> bool {
        self == Self::MAX
    }

    /// Convert an absolute UTC time. Times before the epoch clamp to `MIN`.
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        match at.timestamp_nanos_opt() {
            Some(nanos) if nanos > 0 => Self(nanos as u64),
            Some(_) => Self::MIN,
            // Out of i64 nanosecond range: only possible far in the future.
            None if at.timestamp() > 0 => Self::MAX,
            None => Self::MIN,
        }
    }

    /// Convert back to UTC. `MAX` has no calendar representation.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if self.is_max() || self.0 > i64::MAX as u64 {
            return None;
        }
        Some(Utc.timestamp_nanos(self.0 as i64))
    }

    /// Round down to a multiple of `granularity` (no-op for 0).
    pub fn floor_to(self, granularity: u64) -> Self {
        if granularity == 0 {
            self
        } else {
            Self(self.0 - self.0 % granularity)
        }
    }

    pub fn saturating_add(self, delta: u64) -> Self {
        Self(self.0.saturating_add(delta))
    }
}

impl From<u64> for ValidityKey {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ValidityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            write!(f, "+inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ============================================================================
// INTERVAL OF VALIDITY
// ============================================================================

/// Closed-open interval `[since, until)` on the validity axis.
///
/// Construction rejects empty intervals, so every `Iov` in circulation
/// satisfies `since < until`. An interval ending at `ValidityKey::MAX` also
/// contains `MAX` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawIov")]
pub struct Iov {
    since: ValidityKey,
    until: ValidityKey,
}

#[derive(Deserialize)]
struct RawIov {
    since: ValidityKey,
    until: ValidityKey,
}

impl TryFrom<RawIov> for Iov {
    type Error = ValidationError;

    fn try_from(raw: RawIov) -> Result<Self, Self::Error> {
        Iov::new(raw.since, raw.until)
    }
}

impl Iov {
    pub fn new(
        since: impl Into<ValidityKey>,
        until: impl Into<ValidityKey>,
    ) -> Result<Self, ValidationError> {
        let (since, until) = (since.into(), until.into());
        if since >= until {
            return Err(ValidationError::InvalidIov { since, until });
        }
        Ok(Self { since, until })
    }

    /// The whole time axis.
    pub fn unbounded() -> Self {
        Self {
            since: ValidityKey::MIN,
            until: ValidityKey::MAX,
        }
    }

    /// Valid from `since` until the end of time.
    pub fn open_ended(since: ValidityKey) -> Result<Self, ValidationError> {
        Self::new(since, ValidityKey::MAX)
    }

    /// The granule of width `granularity` containing `when`.
    ///
    /// Returns `None` when granularity is disabled or the granule would be empty.
    pub fn granule(when: ValidityKey, granularity: u64) -> Option<Self> {
        if granularity == 0 {
            return None;
        }
        let since = when.floor_to(granularity);
        Self::new(since, since.saturating_add(granularity)).ok()
    }

    pub fn since(&self) -> ValidityKey {
        self.since
    }

    pub fn until(&self) -> ValidityKey {
        self.until
    }

    pub fn contains(&self, when: ValidityKey) -> bool {
        when >= self.since && (when < self.until || self.until.is_max())
    }

    pub fn intersects(&self, other: &Iov) -> bool {
        self.since < other.until && other.since < self.until
    }

    /// Adjacent or overlapping: the two can be merged into one interval.
    pub fn is_compatible(&self, other: &Iov) -> bool {
        self.intersects(other) || self.until == other.since || other.until == self.since
    }

    pub fn merge(&self, other: &Iov) -> Option<Iov> {
        if !self.is_compatible(other) {
            return None;
        }
        Some(Iov {
            since: self.since.min(other.since),
            until: self.until.max(other.until),
        })
    }

    pub fn intersection(&self, other: &Iov) -> Option<Iov> {
        Iov::new(self.since.max(other.since), self.until.min(other.until)).ok()
    }

    /// Same interval with a new end. Fails if that would empty it.
    pub fn with_until(&self, until: ValidityKey) -> Result<Iov, ValidationError> {
        Iov::new(self.since, until)
    }

    /// Same interval with a new start. Fails if that would empty it.
    pub fn with_since(&self, since: ValidityKey) -> Result<Iov, ValidationError> {
        Iov::new(since, self.until)
    }
}

impl fmt::Display for Iov {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.since, self.until)
    }
}

// ============================================================================
// CHANNELS AND PAYLOADS
// ============================================================================

/// Sub-address within a leaf node.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for ChannelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload record: named string fields. XML documents live in [`Payload::XML_FIELD`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, String>);

impl Payload {
    pub const XML_FIELD: &'static str = "data";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn xml(data: impl Into<String>) -> Self {
        Self::new().with_field(Self::XML_FIELD, data)
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn xml_data(&self) -> Option<&str> {
        self.field(Self::XML_FIELD)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, String>> for Payload {
    fn from(fields: BTreeMap<String, String>) -> Self {
        Self(fields)
    }
}

/// One stored condition: a payload valid over an interval for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondObject {
    pub iov: Iov,
    pub channel: ChannelId,
    pub payload: Payload,
}

impl CondObject {
    pub fn new(iov: Iov, channel: ChannelId, payload: Payload) -> Self {
        Self {
            iov,
            channel,
            payload,
        }
    }
}

/// What a reader gets back from `get_object`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionData {
    pub payload: Payload,
    pub description: String,
    pub iov: Iov,
    pub channel: ChannelId,
}

impl ConditionData {
    pub fn since(&self) -> ValidityKey {
        self.iov.since()
    }

    pub fn until(&self) -> ValidityKey {
        self.iov.until()
    }
}

// ============================================================================
// NODES
// ============================================================================

/// How a leaf stores its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Xml,
    Native,
}

/// Whether a leaf keeps one version per interval or a full version history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersioningMode {
    SingleVersion,
    MultiVersion,
}

/// Leaf nodes hold conditions; containers hold other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf {
        storage: StorageType,
        versioning: VersioningMode,
    },
    Container,
}

impl NodeKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Leaf { .. })
    }

    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Container)
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Leaf { .. } => "leaf node",
            NodeKind::Container => "container node",
        }
    }
}

/// Node metadata as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub path: String,
    pub kind: NodeKind,
    pub description: String,
}

/// Children of a container, split by kind. Names are relative to the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildNodes {
    pub leaves: Vec<String>,
    pub containers: Vec<String>,
}

impl ChildNodes {
    /// All names, sorted.
    pub fn all(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .leaves
            .iter()
            .chain(self.containers.iter())
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty() && self.containers.is_empty()
    }
}

// ============================================================================
// TAGS
// ============================================================================

/// Name selecting the latest (untagged) data.
pub const HEAD_TAG: &str = "HEAD";

/// True for the HEAD selector (also the empty tag).
pub fn is_head_tag(tag: &str) -> bool {
    tag.is_empty() || tag == HEAD_TAG
}

// ============================================================================
// EVENT CLOCK
// ============================================================================

/// Source of the "current event time" used for replica staleness checks.
pub trait EventClock: Send + Sync {
    fn event_time(&self) -> ValidityKey;
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct ManualEventClock {
    now: AtomicU64,
}

impl ManualEventClock {
    pub fn new(start: ValidityKey) -> Self {
        Self {
            now: AtomicU64::new(start.as_u64()),
        }
    }

    pub fn set(&self, when: ValidityKey) {
        self.now.store(when.as_u64(), Ordering::SeqCst);
    }
}

impl EventClock for ManualEventClock {
    fn event_time(&self) -> ValidityKey {
        ValidityKey::new(self.now.load(Ordering::SeqCst))
    }
}

/// Wall clock, for standalone tools without an event loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEventClock;

impl EventClock for SystemEventClock {
    fn event_time(&self) -> ValidityKey {
        ValidityKey::from_datetime(Utc::now())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn iov(since: u64, until: u64) -> Iov {
        Iov::new(since, until).expect("valid iov")
    }

    #[test]
    fn test_iov_rejects_empty_interval() {
        assert!(Iov::new(10u64, 10u64).is_err());
        assert!(Iov::new(20u64, 10u64).is_err());
        assert!(Iov::new(10u64, 11u64).is_ok());
    }

    #[test]
    fn test_iov_contains_is_closed_open() {
        let i = iov(100, 200);
        assert!(i.contains(ValidityKey::new(100)));
        assert!(i.contains(ValidityKey::new(199)));
        assert!(!i.contains(ValidityKey::new(200)));
        assert!(!i.contains(ValidityKey::new(99)));
    }

    #[test]
    fn test_open_ended_iov_contains_max() {
        let i = Iov::open_ended(ValidityKey::new(5)).unwrap();
        assert!(i.contains(ValidityKey::MAX));
        assert!(Iov::unbounded().contains(ValidityKey::MIN));
    }

    #[test]
    fn test_iov_compatibility() {
        assert!(iov(0, 10).is_compatible(&iov(10, 20)));
        assert!(iov(0, 10).is_compatible(&iov(5, 20)));
        assert!(!iov(0, 10).is_compatible(&iov(11, 20)));
        assert_eq!(iov(0, 10).merge(&iov(10, 20)), Some(iov(0, 20)));
        assert_eq!(iov(0, 10).merge(&iov(11, 20)), None);
    }

    #[test]
    fn test_iov_intersection() {
        assert_eq!(iov(0, 10).intersection(&iov(5, 20)), Some(iov(5, 10)));
        assert_eq!(iov(0, 10).intersection(&iov(10, 20)), None);
    }

    #[test]
    fn test_granule() {
        let g = Iov::granule(ValidityKey::new(1234), 100).unwrap();
        assert_eq!(g, iov(1200, 1300));
        assert!(Iov::granule(ValidityKey::new(1234), 0).is_none());
    }

    #[test]
    fn test_iov_deserialize_rejects_empty() {
        let bad = serde_json::from_str::<Iov>(r#"{"since":5,"until":5}"#);
        assert!(bad.is_err());
        let good: Iov = serde_json::from_str(r#"{"since":5,"until":6}"#).unwrap();
        assert_eq!(good, iov(5, 6));
    }

    #[test]
    fn test_validity_key_datetime_conversion() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let key = ValidityKey::from_datetime(at);
        assert_eq!(key.to_datetime(), Some(at));
        assert_eq!(ValidityKey::MAX.to_datetime(), None);
        assert_eq!(format!("{}", ValidityKey::MAX), "+inf");
    }

    #[test]
    fn test_payload_xml_field() {
        let p = Payload::xml("<DDDB/>").with_field("extra", "1");
        assert_eq!(p.xml_data(), Some("<DDDB/>"));
        assert_eq!(p.field("extra"), Some("1"));
        assert_eq!(p.fields().count(), 2);
    }

    #[test]
    fn test_head_tag() {
        assert!(is_head_tag(""));
        assert!(is_head_tag("HEAD"));
        assert!(!is_head_tag("head-2024"));
    }

    #[test]
    fn test_child_nodes_all_sorted() {
        let children = ChildNodes {
            leaves: vec!["b".to_string(), "a".to_string()],
            containers: vec!["c".to_string()],
        };
        assert_eq!(children.all(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualEventClock::new(ValidityKey::new(7));
        assert_eq!(clock.event_time(), ValidityKey::new(7));
        clock.set(ValidityKey::new(9));
        assert_eq!(clock.event_time(), ValidityKey::new(9));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Intersection is contained in both operands.
        #[test]
        fn prop_intersection_within_both(
            a in 0u64..1000, la in 1u64..500,
            b in 0u64..1000, lb in 1u64..500,
            t in 0u64..2000,
        ) {
            let x = Iov::new(a, a + la).unwrap();
            let y = Iov::new(b, b + lb).unwrap();
            let when = ValidityKey::new(t);
            match x.intersection(&y) {
                Some(i) => {
                    prop_assert!(x.intersects(&y));
                    prop_assert_eq!(i.contains(when), x.contains(when) && y.contains(when));
                }
                None => prop_assert!(!x.intersects(&y)),
            }
        }

        /// floor_to never moves forward and lands on a multiple.
        #[test]
        fn prop_floor_to(v in any::<u64>(), g in 1u64..1_000_000) {
            let floored = ValidityKey::new(v).floor_to(g);
            prop_assert!(floored.as_u64() <= v);
            prop_assert_eq!(floored.as_u64() % g, 0);
            prop_assert!(v - floored.as_u64() < g);
        }
    }
}
