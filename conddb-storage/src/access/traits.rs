//! Capability traits implemented by the access service.
//!
//! Callers that only read conditions depend on [`CondDbReader`]; tools that
//! write depend on [`CondDbEditor`]. Keeping the surfaces apart lets a reader
//! be handed around without exposing administrative operations.

use super::ServicePhase;
use crate::cache::CacheStats;
use conddb_core::{
    ChannelId, ChildNodes, CondDbResult, ConditionData, HealthCheck, Iov, Payload, StorageType,
    ValidityKey, VersioningMode,
};

/// Service name paired with the tag it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTagPair {
    pub name: String,
    pub tag: String,
}

/// Read access to conditions data and the node hierarchy.
pub trait CondDbReader {
    /// Object valid at `when` for `channel`.
    fn get_object(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
    ) -> CondDbResult<ConditionData>;

    /// Like [`get_object`](Self::get_object), addressing the channel by its alias.
    fn get_object_by_name(
        &self,
        path: &str,
        when: ValidityKey,
        channel_name: &str,
    ) -> CondDbResult<ConditionData>;

    /// Intervals of validity intersecting `window`, ascending and disjoint.
    fn get_iovs(&self, path: &str, window: &Iov, channel: ChannelId) -> CondDbResult<Vec<Iov>>;

    fn child_nodes(&self, path: &str) -> CondDbResult<ChildNodes>;

    fn exists(&self, path: &str) -> CondDbResult<bool>;

    fn is_leaf(&self, path: &str) -> CondDbResult<bool>;

    fn is_container(&self, path: &str) -> CondDbResult<bool>;

    fn default_tags(&self) -> Vec<NameTagPair>;
}

/// Administrative writes. These go straight to the backend and never touch
/// the cache, so cached reads may lag behind them.
pub trait CondDbEditor {
    fn create_folder_set(&self, path: &str, description: &str) -> CondDbResult<()>;

    fn create_node(
        &self,
        path: &str,
        description: &str,
        storage: StorageType,
        versioning: VersioningMode,
    ) -> CondDbResult<()>;

    fn store_xml_data(
        &self,
        path: &str,
        data: &str,
        since: ValidityKey,
        until: ValidityKey,
        channel: ChannelId,
    ) -> CondDbResult<()>;

    fn store_payload(
        &self,
        path: &str,
        payload: Payload,
        since: ValidityKey,
        until: ValidityKey,
        channel: ChannelId,
    ) -> CondDbResult<()>;

    fn set_channel_name(&self, path: &str, channel: ChannelId, name: &str) -> CondDbResult<()>;

    fn tag_leaf_node(&self, path: &str, tag: &str, description: &str) -> CondDbResult<()>;

    /// Tag `path` and everything below it. Intermediate containers get
    /// generated tag names linked from their parent's tag.
    fn recursive_tag(&self, path: &str, tag: &str, description: &str) -> CondDbResult<()>;
}

/// Service state and connection control.
pub trait CondDbInfo {
    fn tag(&self) -> String;

    /// Switch the default tag. The tag is validated first and the cache is
    /// cleared on success.
    fn set_default_tag(&self, tag: &str) -> CondDbResult<()>;

    fn connection_string(&self) -> Option<&str>;

    fn is_read_only(&self) -> bool;

    fn is_no_db(&self) -> bool;

    fn phase(&self) -> ServicePhase;

    fn is_connected(&self) -> bool;

    /// Close the backend connection now. It reopens on the next access.
    fn disconnect(&self) -> CondDbResult<()>;

    fn latest_update(&self) -> CondDbResult<ValidityKey>;

    /// True if the event clock has reached the latest known update.
    fn replica_is_stale(&self) -> CondDbResult<bool>;

    fn health(&self) -> HealthCheck;
}

/// Direct cache population, bypassing the backend.
///
/// Every operation fails with `StorageError::CacheDisabled` when the service
/// runs without a cache.
pub trait CondDbCacheAccess {
    fn cache_add_folder(&self, path: &str, description: &str) -> CondDbResult<bool>;

    fn cache_add_folder_set(&self, path: &str) -> CondDbResult<bool>;

    fn cache_add_xml_data(
        &self,
        path: &str,
        since: ValidityKey,
        until: ValidityKey,
        data: &str,
        channel: ChannelId,
    ) -> CondDbResult<bool>;

    fn cache_add_object(
        &self,
        path: &str,
        since: ValidityKey,
        until: ValidityKey,
        payload: Payload,
        channel: ChannelId,
    ) -> CondDbResult<bool>;

    fn cache_add_channel_name(&self, path: &str, name: &str, channel: ChannelId)
        -> CondDbResult<bool>;

    fn clear_cache(&self) -> CondDbResult<()>;

    fn dump_cache(&self) -> CondDbResult<String>;

    fn cache_stats(&self) -> Option<CacheStats>;
}
