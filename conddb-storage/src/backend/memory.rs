//! In-process conditions database.

use super::store::{NodeRecord, NodeStore, NodeStoreMut, TagRecord};
use super::CondDbBackend;
use conddb_core::{
    join_path, parent_path, ChannelId, ChildNodes, CondDbResult, CondObject, ConnectionError, Iov,
    NodeInfo, NodeKind, StorageError, ValidityKey, ROOT_PATH,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct MemoryImage {
    nodes: BTreeMap<String, NodeRecord>,
    series: BTreeMap<(String, ChannelId), Vec<CondObject>>,
    tags: BTreeMap<(String, String), TagRecord>,
}

impl Default for MemoryImage {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_PATH.to_string(),
            NodeRecord::new(NodeKind::Container, "root"),
        );
        Self {
            nodes,
            series: BTreeMap::new(),
            tags: BTreeMap::new(),
        }
    }
}

impl NodeStore for MemoryImage {
    fn node_record(&self, path: &str) -> CondDbResult<Option<NodeRecord>> {
        Ok(self.nodes.get(path).cloned())
    }

    fn child_records(&self, path: &str) -> CondDbResult<Vec<(String, NodeRecord)>> {
        let prefix = join_path(path, "");
        Ok(self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(child, _)| child.starts_with(&prefix))
            .filter(|(child, _)| parent_path(child) == Some(path))
            .map(|(child, record)| (child.clone(), record.clone()))
            .collect())
    }

    fn head_series(&self, path: &str, channel: ChannelId) -> CondDbResult<Vec<CondObject>> {
        Ok(self
            .series
            .get(&(path.to_string(), channel))
            .cloned()
            .unwrap_or_default())
    }

    fn head_channels(&self, path: &str) -> CondDbResult<BTreeMap<ChannelId, Vec<CondObject>>> {
        let lo = (path.to_string(), ChannelId::new(0));
        let hi = (path.to_string(), ChannelId::new(u32::MAX));
        Ok(self
            .series
            .range(lo..=hi)
            .map(|((_, channel), series)| (*channel, series.clone()))
            .collect())
    }

    fn tag_record(&self, path: &str, tag: &str) -> CondDbResult<Option<TagRecord>> {
        Ok(self
            .tags
            .get(&(path.to_string(), tag.to_string()))
            .cloned())
    }

    fn tag_owners(&self) -> CondDbResult<BTreeMap<String, String>> {
        Ok(self
            .tags
            .keys()
            .map(|(path, tag)| (tag.clone(), path.clone()))
            .collect())
    }
}

impl NodeStoreMut for MemoryImage {
    fn put_node(&mut self, path: &str, record: &NodeRecord) -> CondDbResult<()> {
        self.nodes.insert(path.to_string(), record.clone());
        Ok(())
    }

    fn put_head_series(
        &mut self,
        path: &str,
        channel: ChannelId,
        series: &[CondObject],
    ) -> CondDbResult<()> {
        self.series
            .insert((path.to_string(), channel), series.to_vec());
        Ok(())
    }

    fn put_tag(&mut self, path: &str, tag: &str, record: &TagRecord) -> CondDbResult<()> {
        self.tags
            .insert((path.to_string(), tag.to_string()), record.clone());
        Ok(())
    }
}

/// In-memory conditions database.
///
/// Clones share the same data and the same reachability switch, but each
/// handle has its own open/closed state, so a test can keep one handle to
/// populate or inspect the store while a service owns another.
#[derive(Debug, Clone)]
pub struct InMemoryCondDb {
    label: String,
    image: Arc<RwLock<MemoryImage>>,
    reachable: Arc<AtomicBool>,
    open: bool,
}

impl Default for InMemoryCondDb {
    fn default() -> Self {
        Self::named("memory://local")
    }
}

impl InMemoryCondDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            image: Arc::new(RwLock::new(MemoryImage::default())),
            reachable: Arc::new(AtomicBool::new(true)),
            open: false,
        }
    }

    /// Simulate the server going away (or coming back). Affects every clone.
    ///
    /// While unreachable, `open` fails. Already-open handles keep working
    /// until they are closed.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn read(&self) -> CondDbResult<RwLockReadGuard<'_, MemoryImage>> {
        if !self.open {
            return Err(ConnectionError::NotOpen.into());
        }
        self.image
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write(&self) -> CondDbResult<RwLockWriteGuard<'_, MemoryImage>> {
        if !self.open {
            return Err(ConnectionError::NotOpen.into());
        }
        self.image
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }
}

impl CondDbBackend for InMemoryCondDb {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn open(&mut self) -> CondDbResult<()> {
        if !self.is_reachable() {
            return Err(ConnectionError::OpenFailed {
                target: self.label.clone(),
                reason: "server unreachable".to_string(),
            }
            .into());
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn node(&self, path: &str) -> CondDbResult<Option<NodeInfo>> {
        self.read()?.node_info(path)
    }

    fn list_children(&self, path: &str) -> CondDbResult<ChildNodes> {
        self.read()?.list_children(path)
    }

    fn fetch(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<CondObject> {
        self.read()?.fetch(path, when, channel, tag)
    }

    fn fetch_range(
        &self,
        path: &str,
        window: &Iov,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<Vec<CondObject>> {
        self.read()?.fetch_range(path, window, channel, tag)
    }

    fn resolve_channel(&self, path: &str, name: &str) -> CondDbResult<ChannelId> {
        self.read()?.resolve_channel(path, name)
    }

    fn create_node(&mut self, path: &str, description: &str, kind: NodeKind) -> CondDbResult<()> {
        self.write()?.create_node(path, description, kind)
    }

    fn store(&mut self, path: &str, object: CondObject) -> CondDbResult<()> {
        self.write()?.store(path, object)
    }

    fn set_channel_name(
        &mut self,
        path: &str,
        channel: ChannelId,
        name: &str,
    ) -> CondDbResult<()> {
        self.write()?.set_channel_name(path, channel, name)
    }

    fn tag(&mut self, path: &str, tag: &str, description: &str) -> CondDbResult<()> {
        self.write()?.tag(path, tag, description)
    }

    fn create_tag_relation(
        &mut self,
        child_path: &str,
        parent_tag: &str,
        child_tag: &str,
    ) -> CondDbResult<()> {
        self.write()?
            .create_tag_relation(child_path, parent_tag, child_tag)
    }

    fn tag_exists(&self, tag: &str) -> CondDbResult<bool> {
        if conddb_core::is_head_tag(tag) {
            return Ok(true);
        }
        Ok(self.read()?.tag_owners()?.contains_key(tag))
    }

    fn all_tags(&self) -> CondDbResult<BTreeSet<String>> {
        Ok(self.read()?.tag_owners()?.into_keys().collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use conddb_core::{CondDbError, Payload, StorageType, TagError, VersioningMode};

    const MV: NodeKind = NodeKind::Leaf {
        storage: StorageType::Xml,
        versioning: VersioningMode::MultiVersion,
    };

    fn open_db() -> InMemoryCondDb {
        let mut db = InMemoryCondDb::new();
        db.open().unwrap();
        db
    }

    fn obj(since: u64, until: u64, data: &str) -> CondObject {
        CondObject::new(
            Iov::new(since, until).unwrap(),
            ChannelId::new(0),
            Payload::xml(data),
        )
    }

    fn xml(object: &CondObject) -> &str {
        object.payload.xml_data().unwrap_or_default()
    }

    #[test]
    fn test_closed_handle_refuses_calls() {
        let db = InMemoryCondDb::new();
        assert!(matches!(
            db.node("/"),
            Err(CondDbError::Connection(ConnectionError::NotOpen))
        ));
    }

    #[test]
    fn test_unreachable_open_fails() {
        let mut db = InMemoryCondDb::new();
        db.set_reachable(false);
        assert!(matches!(
            db.open(),
            Err(CondDbError::Connection(ConnectionError::OpenFailed { .. }))
        ));
        db.set_reachable(true);
        assert!(db.open().is_ok());
    }

    #[test]
    fn test_clones_share_data_not_open_state() {
        let mut writer = open_db();
        let mut reader = writer.clone();
        reader.close();
        writer.create_node("/a", "leaf", MV).unwrap();

        assert!(reader.node("/a").is_err());
        reader.open().unwrap();
        assert!(reader.exists("/a").unwrap());
    }

    #[test]
    fn test_create_node_builds_parents() {
        let mut db = open_db();
        db.create_node("/Conditions/Velo/Alignment", "align", MV)
            .unwrap();

        let root = db.list_children("/").unwrap();
        assert_eq!(root.containers, vec!["Conditions"]);
        let velo = db.list_children("/Conditions/Velo").unwrap();
        assert_eq!(velo.leaves, vec!["Alignment"]);

        let info = db.node("/Conditions/Velo/Alignment").unwrap().unwrap();
        assert!(info.kind.is_leaf());
        assert_eq!(info.description, "align");

        assert!(matches!(
            db.create_node("/Conditions/Velo/Alignment", "", MV),
            Err(CondDbError::Storage(StorageError::AlreadyExists { .. }))
        ));
        assert!(matches!(
            db.create_node("/Conditions/Velo/Alignment/Sub", "", MV),
            Err(CondDbError::Storage(StorageError::WrongNodeType { .. }))
        ));
        assert!(matches!(
            db.list_children("/Conditions/Velo/Alignment"),
            Err(CondDbError::Storage(StorageError::WrongNodeType { .. }))
        ));
    }

    #[test]
    fn test_fetch_errors() {
        let mut db = open_db();
        db.create_node("/a/leaf", "", MV).unwrap();
        db.store("/a/leaf", obj(100, 200, "X")).unwrap();

        assert_eq!(
            xml(&db.fetch("/a/leaf", ValidityKey::new(150), ChannelId::new(0), "HEAD").unwrap()),
            "X"
        );
        assert!(matches!(
            db.fetch("/a/leaf", ValidityKey::new(250), ChannelId::new(0), "HEAD"),
            Err(CondDbError::Storage(StorageError::NotFound { .. }))
        ));
        assert!(matches!(
            db.fetch("/missing", ValidityKey::new(150), ChannelId::new(0), "HEAD"),
            Err(CondDbError::Storage(StorageError::NodeNotFound { .. }))
        ));
        assert!(matches!(
            db.fetch("/a", ValidityKey::new(150), ChannelId::new(0), "HEAD"),
            Err(CondDbError::Storage(StorageError::WrongNodeType { .. }))
        ));
    }

    #[test]
    fn test_leaf_tag_snapshots_head() {
        let mut db = open_db();
        db.create_node("/p", "", MV).unwrap();
        db.store("/p", obj(0, 100, "v1")).unwrap();
        db.tag("/p", "t1", "first").unwrap();
        db.store("/p", obj(0, 100, "v2")).unwrap();

        let at = ValidityKey::new(50);
        assert_eq!(xml(&db.fetch("/p", at, ChannelId::new(0), "t1").unwrap()), "v1");
        assert_eq!(xml(&db.fetch("/p", at, ChannelId::new(0), "HEAD").unwrap()), "v2");
        assert!(db.tag_exists("t1").unwrap());
        assert!(db.tag_exists("HEAD").unwrap());
        assert!(!db.tag_exists("t2").unwrap());
    }

    #[test]
    fn test_tag_names_are_unique_and_head_reserved() {
        let mut db = open_db();
        db.create_node("/p", "", MV).unwrap();
        db.create_node("/q", "", MV).unwrap();
        db.tag("/p", "t", "").unwrap();
        assert!(matches!(
            db.tag("/q", "t", ""),
            Err(CondDbError::Tag(TagError::AlreadyExists { .. }))
        ));
        assert!(matches!(
            db.tag("/q", "HEAD", ""),
            Err(CondDbError::Tag(TagError::Reserved { .. }))
        ));
    }

    #[test]
    fn test_hierarchical_tag_resolution() {
        let mut db = open_db();
        db.create_node("/top/mid/leaf", "", MV).unwrap();
        db.store("/top/mid/leaf", obj(0, 10, "tagged")).unwrap();
        db.tag("/top/mid/leaf", "leaf-1", "").unwrap();
        db.create_tag_relation("/top/mid/leaf", "mid-1", "leaf-1")
            .unwrap();
        db.create_tag_relation("/top/mid", "global", "mid-1").unwrap();
        db.store("/top/mid/leaf", obj(0, 10, "head")).unwrap();

        let at = ValidityKey::new(5);
        let got = db
            .fetch("/top/mid/leaf", at, ChannelId::new(0), "global")
            .unwrap();
        assert_eq!(xml(&got), "tagged");
        assert_eq!(
            db.all_tags().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["global", "leaf-1", "mid-1"]
        );
        assert!(matches!(
            db.fetch("/top/mid/leaf", at, ChannelId::new(0), "nope"),
            Err(CondDbError::Tag(TagError::Unresolved { .. }))
        ));
    }

    #[test]
    fn test_single_version_appends() {
        let mut db = open_db();
        let sv = NodeKind::Leaf {
            storage: StorageType::Native,
            versioning: VersioningMode::SingleVersion,
        };
        db.create_node("/sv", "", sv).unwrap();
        db.store("/sv", obj(0, u64::MAX, "a")).unwrap();
        db.store("/sv", obj(100, u64::MAX, "b")).unwrap();

        let window = Iov::unbounded();
        let all = db
            .fetch_range("/sv", &window, ChannelId::new(0), "HEAD")
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].iov, Iov::new(0u64, 100u64).unwrap());
        assert!(db.store("/sv", obj(50, 60, "c")).is_err());
    }

    #[test]
    fn test_channel_names() {
        let mut db = open_db();
        db.create_node("/r", "", MV).unwrap();
        db.set_channel_name("/r", ChannelId::new(3), "Tell1")
            .unwrap();
        assert_eq!(db.resolve_channel("/r", "Tell1").unwrap(), ChannelId::new(3));
        assert!(matches!(
            db.resolve_channel("/r", "Tell2"),
            Err(CondDbError::Storage(StorageError::UnknownChannel { .. }))
        ));
    }
}
