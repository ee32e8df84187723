//! Backend for services running from the cache only.

use super::CondDbBackend;
use conddb_core::{
    ChannelId, ChildNodes, CondDbResult, CondObject, ConnectionError, Iov, NodeInfo, NodeKind,
    ValidityKey,
};
use std::collections::BTreeSet;

/// Stands in for the database when `no_db` is set. Never opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDatabase;

fn unavailable<T>() -> CondDbResult<T> {
    Err(ConnectionError::NoDatabase.into())
}

impl CondDbBackend for NoDatabase {
    fn describe(&self) -> String {
        "no database".to_string()
    }

    fn open(&mut self) -> CondDbResult<()> {
        unavailable()
    }

    fn close(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }

    fn node(&self, _path: &str) -> CondDbResult<Option<NodeInfo>> {
        unavailable()
    }

    fn list_children(&self, _path: &str) -> CondDbResult<ChildNodes> {
        unavailable()
    }

    fn fetch(
        &self,
        _path: &str,
        _when: ValidityKey,
        _channel: ChannelId,
        _tag: &str,
    ) -> CondDbResult<CondObject> {
        unavailable()
    }

    fn fetch_range(
        &self,
        _path: &str,
        _window: &Iov,
        _channel: ChannelId,
        _tag: &str,
    ) -> CondDbResult<Vec<CondObject>> {
        unavailable()
    }

    fn resolve_channel(&self, _path: &str, _name: &str) -> CondDbResult<ChannelId> {
        unavailable()
    }

    fn create_node(&mut self, _path: &str, _description: &str, _kind: NodeKind) -> CondDbResult<()> {
        unavailable()
    }

    fn store(&mut self, _path: &str, _object: CondObject) -> CondDbResult<()> {
        unavailable()
    }

    fn set_channel_name(
        &mut self,
        _path: &str,
        _channel: ChannelId,
        _name: &str,
    ) -> CondDbResult<()> {
        unavailable()
    }

    fn tag(&mut self, _path: &str, _tag: &str, _description: &str) -> CondDbResult<()> {
        unavailable()
    }

    fn create_tag_relation(
        &mut self,
        _child_path: &str,
        _parent_tag: &str,
        _child_tag: &str,
    ) -> CondDbResult<()> {
        unavailable()
    }

    fn tag_exists(&self, _tag: &str) -> CondDbResult<bool> {
        unavailable()
    }

    fn all_tags(&self) -> CondDbResult<BTreeSet<String>> {
        unavailable()
    }
}
