//! Node, series and tag records plus the semantics shared by every backend.
//!
//! A backend only has to expose its records through [`NodeStore`] (reads)
//! and [`NodeStoreMut`] (writes); path checks, HEAD write rules and tag
//! resolution are implemented once here as provided methods.

use chrono::{DateTime, Utc};
use conddb_core::{
    ancestors, is_head_tag, node_name, parent_path, ChannelId, ChildNodes, CondDbResult,
    CondObject, Iov, NodeInfo, NodeKind, StorageError, TagError, ValidationError, ValidityKey,
    VersioningMode,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stored metadata of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub kind: NodeKind,
    pub description: String,
    #[serde(default)]
    pub channel_names: BTreeMap<String, ChannelId>,
    pub created_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(kind: NodeKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            channel_names: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// What a tag points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagTarget {
    /// Leaf tag: frozen copy of the HEAD series of every channel.
    Snapshot(BTreeMap<ChannelId, Vec<CondObject>>),
    /// Container tag: child name -> tag of that child.
    Children(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub target: TagTarget,
}

impl TagRecord {
    pub fn new(description: impl Into<String>, target: TagTarget) -> Self {
        Self {
            description: description.into(),
            created_at: Utc::now(),
            target,
        }
    }
}

/// Read access to backend records.
pub(crate) trait NodeStore {
    fn node_record(&self, path: &str) -> CondDbResult<Option<NodeRecord>>;

    /// Direct children of `path` as `(full path, record)`.
    fn child_records(&self, path: &str) -> CondDbResult<Vec<(String, NodeRecord)>>;

    /// HEAD series of one channel, sorted by `since`.
    fn head_series(&self, path: &str, channel: ChannelId) -> CondDbResult<Vec<CondObject>>;

    /// HEAD series of every channel of a leaf.
    fn head_channels(&self, path: &str) -> CondDbResult<BTreeMap<ChannelId, Vec<CondObject>>>;

    fn tag_record(&self, path: &str, tag: &str) -> CondDbResult<Option<TagRecord>>;

    /// Every tag name in the database mapped to the node it is defined on.
    fn tag_owners(&self) -> CondDbResult<BTreeMap<String, String>>;

    fn node_info(&self, path: &str) -> CondDbResult<Option<NodeInfo>> {
        Ok(self.node_record(path)?.map(|record| NodeInfo {
            path: path.to_string(),
            kind: record.kind,
            description: record.description,
        }))
    }

    fn require_node(&self, path: &str) -> CondDbResult<NodeRecord> {
        self.node_record(path)?.ok_or_else(|| {
            StorageError::NodeNotFound {
                path: path.to_string(),
            }
            .into()
        })
    }

    fn require_leaf(&self, path: &str) -> CondDbResult<NodeRecord> {
        let record = self.require_node(path)?;
        if !record.kind.is_leaf() {
            return Err(wrong_type(path, "leaf node").into());
        }
        Ok(record)
    }

    fn list_children(&self, path: &str) -> CondDbResult<ChildNodes> {
        let record = self.require_node(path)?;
        if record.kind.is_leaf() {
            return Err(wrong_type(path, "container node").into());
        }
        let mut children = ChildNodes::default();
        for (child, record) in self.child_records(path)? {
            let name = node_name(&child).to_string();
            if record.kind.is_leaf() {
                children.leaves.push(name);
            } else {
                children.containers.push(name);
            }
        }
        children.leaves.sort();
        children.containers.sort();
        Ok(children)
    }

    /// Name of the tag defined on `path` that `tag` selects.
    ///
    /// A tag defined on the node itself is used directly. Otherwise the
    /// ancestor holding `tag` is located and its relations are followed down
    /// to `path`.
    fn resolve_tag(&self, path: &str, tag: &str) -> CondDbResult<String> {
        if self.tag_record(path, tag)?.is_some() {
            return Ok(tag.to_string());
        }
        let unresolved = || TagError::Unresolved {
            tag: tag.to_string(),
            path: path.to_string(),
        };

        let mut chain = ancestors(path);
        chain.push(path);
        for (i, ancestor) in chain.iter().enumerate() {
            if self.tag_record(ancestor, tag)?.is_none() {
                continue;
            }
            let mut current = tag.to_string();
            for pair in chain[i..].windows(2) {
                let record = self.tag_record(pair[0], &current)?.ok_or_else(unresolved)?;
                current = match record.target {
                    TagTarget::Children(children) => children
                        .get(node_name(pair[1]))
                        .cloned()
                        .ok_or_else(unresolved)?,
                    TagTarget::Snapshot(_) => return Err(unresolved().into()),
                };
            }
            return Ok(current);
        }
        Err(unresolved().into())
    }

    /// Objects of one channel as seen through `tag`, sorted by `since`.
    fn series(&self, path: &str, channel: ChannelId, tag: &str) -> CondDbResult<Vec<CondObject>> {
        self.require_leaf(path)?;
        if is_head_tag(tag) {
            return self.head_series(path, channel);
        }
        let local = self.resolve_tag(path, tag)?;
        match self.tag_record(path, &local)? {
            Some(TagRecord {
                target: TagTarget::Snapshot(channels),
                ..
            }) => Ok(channels.get(&channel).cloned().unwrap_or_default()),
            _ => Err(TagError::Unresolved {
                tag: tag.to_string(),
                path: path.to_string(),
            }
            .into()),
        }
    }

    fn fetch(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<CondObject> {
        let series = self.series(path, channel, tag)?;
        object_at(&series, when).cloned().ok_or_else(|| {
            StorageError::NotFound {
                path: path.to_string(),
                channel,
                when,
            }
            .into()
        })
    }

    fn fetch_range(
        &self,
        path: &str,
        window: &Iov,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<Vec<CondObject>> {
        let series = self.series(path, channel, tag)?;
        Ok(series
            .into_iter()
            .filter(|object| object.iov.intersects(window))
            .collect())
    }

    fn resolve_channel(&self, path: &str, name: &str) -> CondDbResult<ChannelId> {
        let record = self.require_leaf(path)?;
        record.channel_names.get(name).copied().ok_or_else(|| {
            StorageError::UnknownChannel {
                path: path.to_string(),
                name: name.to_string(),
            }
            .into()
        })
    }
}

/// Write access to backend records.
pub(crate) trait NodeStoreMut: NodeStore {
    fn put_node(&mut self, path: &str, record: &NodeRecord) -> CondDbResult<()>;

    fn put_head_series(
        &mut self,
        path: &str,
        channel: ChannelId,
        series: &[CondObject],
    ) -> CondDbResult<()>;

    fn put_tag(&mut self, path: &str, tag: &str, record: &TagRecord) -> CondDbResult<()>;

    /// Create a node, registering missing ancestors as containers.
    fn create_node(&mut self, path: &str, description: &str, kind: NodeKind) -> CondDbResult<()> {
        if self.node_record(path)?.is_some() {
            return Err(StorageError::AlreadyExists {
                path: path.to_string(),
            }
            .into());
        }
        let mut missing = Vec::new();
        for ancestor in ancestors(path) {
            match self.node_record(ancestor)? {
                Some(record) if record.kind.is_leaf() => {
                    return Err(wrong_type(ancestor, "container node").into());
                }
                Some(_) => {}
                None => missing.push(ancestor),
            }
        }
        for ancestor in missing {
            self.put_node(ancestor, &NodeRecord::new(NodeKind::Container, ""))?;
        }
        self.put_node(path, &NodeRecord::new(kind, description))
    }

    /// Store an object in the HEAD of a leaf.
    ///
    /// Multi-version leaves clip older overlapping objects. Single-version
    /// leaves only accept appends and close the previous object at the new
    /// `since`.
    fn store(&mut self, path: &str, object: CondObject) -> CondDbResult<()> {
        let record = self.require_leaf(path)?;
        let versioning = match record.kind {
            NodeKind::Leaf { versioning, .. } => versioning,
            NodeKind::Container => return Err(wrong_type(path, "leaf node").into()),
        };
        let channel = object.channel;
        let mut series = self.head_series(path, channel)?;
        match versioning {
            VersioningMode::MultiVersion => overlay(&mut series, object),
            VersioningMode::SingleVersion => append(path, &mut series, object)?,
        }
        self.put_head_series(path, channel, &series)
    }

    fn set_channel_name(&mut self, path: &str, channel: ChannelId, name: &str) -> CondDbResult<()> {
        let mut record = self.require_leaf(path)?;
        record.channel_names.insert(name.to_string(), channel);
        self.put_node(path, &record)
    }

    /// Define `tag` on `path`: a snapshot for leaves, an empty relation set
    /// for containers.
    fn tag(&mut self, path: &str, tag: &str, description: &str) -> CondDbResult<()> {
        if is_head_tag(tag) {
            return Err(TagError::Reserved {
                tag: tag.to_string(),
            }
            .into());
        }
        let record = self.require_node(path)?;
        if let Some(owner) = self.tag_owners()?.get(tag) {
            return Err(TagError::AlreadyExists {
                tag: tag.to_string(),
                path: owner.clone(),
            }
            .into());
        }
        let target = if record.kind.is_leaf() {
            TagTarget::Snapshot(self.head_channels(path)?)
        } else {
            TagTarget::Children(BTreeMap::new())
        };
        self.put_tag(path, tag, &TagRecord::new(description, target))
    }

    /// Make `parent_tag` on the parent of `child_path` select `child_tag`.
    /// The parent tag is created if it does not exist yet.
    fn create_tag_relation(
        &mut self,
        child_path: &str,
        parent_tag: &str,
        child_tag: &str,
    ) -> CondDbResult<()> {
        if is_head_tag(parent_tag) {
            return Err(TagError::Reserved {
                tag: parent_tag.to_string(),
            }
            .into());
        }
        let parent = parent_path(child_path).ok_or_else(|| ValidationError::InvalidPath {
            path: child_path.to_string(),
            reason: "the root node has no parent".to_string(),
        })?;
        self.require_node(child_path)?;
        if self.tag_record(child_path, child_tag)?.is_none() {
            return Err(TagError::Unresolved {
                tag: child_tag.to_string(),
                path: child_path.to_string(),
            }
            .into());
        }

        let mut record = match self.tag_owners()?.get(parent_tag) {
            Some(owner) if owner == parent => {
                self.tag_record(parent, parent_tag)?
                    .ok_or_else(|| TagError::Unresolved {
                        tag: parent_tag.to_string(),
                        path: parent.to_string(),
                    })?
            }
            Some(owner) => {
                return Err(TagError::AlreadyExists {
                    tag: parent_tag.to_string(),
                    path: owner.clone(),
                }
                .into());
            }
            None => TagRecord::new("", TagTarget::Children(BTreeMap::new())),
        };
        match &mut record.target {
            TagTarget::Children(children) => {
                children.insert(node_name(child_path).to_string(), child_tag.to_string());
            }
            TagTarget::Snapshot(_) => {
                return Err(wrong_type(parent, "container node").into());
            }
        }
        self.put_tag(parent, parent_tag, &record)
    }
}

fn wrong_type(path: &str, expected: &str) -> StorageError {
    StorageError::WrongNodeType {
        path: path.to_string(),
        expected: expected.to_string(),
    }
}

/// Object of a sorted, disjoint series valid at `when`.
pub(crate) fn object_at(series: &[CondObject], when: ValidityKey) -> Option<&CondObject> {
    let idx = series.partition_point(|object| object.iov.since() <= when);
    idx.checked_sub(1)
        .map(|i| &series[i])
        .filter(|object| object.iov.contains(when))
}

/// Insert `object`, clipping the parts of older objects it covers.
fn overlay(series: &mut Vec<CondObject>, object: CondObject) {
    let new_iov = object.iov;
    let mut kept = Vec::with_capacity(series.len() + 2);
    for old in series.drain(..) {
        if !old.iov.intersects(&new_iov) {
            kept.push(old);
            continue;
        }
        if let Ok(left) = old.iov.with_until(new_iov.since()) {
            kept.push(CondObject {
                iov: left,
                ..old.clone()
            });
        }
        if let Ok(right) = old.iov.with_since(new_iov.until()) {
            kept.push(CondObject { iov: right, ..old });
        }
    }
    kept.push(object);
    kept.sort_by_key(|o| o.iov.since());
    *series = kept;
}

/// Single-version store: `since` must be strictly after the latest one.
fn append(path: &str, series: &mut Vec<CondObject>, object: CondObject) -> CondDbResult<()> {
    if let Some(last) = series.last_mut() {
        if object.iov.since() <= last.iov.since() {
            return Err(StorageError::OutOfOrder {
                path: path.to_string(),
                since: object.iov.since(),
                latest: last.iov.since(),
            }
            .into());
        }
        if last.iov.until() > object.iov.since() {
            last.iov = last.iov.with_until(object.iov.since())?;
        }
    }
    series.push(object);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use conddb_core::Payload;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Overlay keeps the series sorted and disjoint, and the new object
        /// answers every time it covers.
        #[test]
        fn prop_overlay_disjoint(
            writes in prop::collection::vec((0u64..500, 1u64..100), 1..30),
        ) {
            let mut series = Vec::new();
            for (i, (since, len)) in writes.iter().enumerate() {
                let object = CondObject::new(
                    Iov::new(*since, since + len).unwrap(),
                    ChannelId::new(0),
                    Payload::xml(i.to_string()),
                );
                overlay(&mut series, object);
                for pair in series.windows(2) {
                    prop_assert!(pair[0].iov.until() <= pair[1].iov.since());
                }
                let hit = object_at(&series, ValidityKey::new(*since));
                let expected = i.to_string();
                prop_assert_eq!(hit.and_then(|o| o.payload.xml_data()), Some(expected.as_str()));
            }
        }
    }
}
