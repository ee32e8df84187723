//! LMDB-backed conditions database.
//!
//! Uses the heed crate (Rust bindings for LMDB). One environment is opened
//! per connection and dropped again on `close()`, so an idle service holds
//! no file handles.
//!
//! # Layout
//!
//! Three named databases inside the environment, all `Bytes -> Bytes`:
//! - `nodes`: path -> JSON [`NodeRecord`]
//! - `series`: [`SeriesKey`] -> JSON `Vec<CondObject>` (HEAD objects)
//! - `tags`: [`TagKey`] -> JSON [`TagRecord`]
//!
//! Reads run in a read transaction, each write call in one write
//! transaction that is committed only if the whole operation succeeded.

use super::key::{node_prefix, SeriesKey, TagKey};
use super::store::{NodeRecord, NodeStore, NodeStoreMut, TagRecord};
use super::CondDbBackend;
use conddb_core::{
    join_path, parent_path, ChannelId, ChildNodes, CondDbError, CondDbResult, CondObject,
    ConnectionError, Iov, NodeInfo, NodeKind, StorageError, ValidityKey, ROOT_PATH,
};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbError to CondDbError.
impl From<LmdbError> for CondDbError {
    fn from(e: LmdbError) -> Self {
        CondDbError::Storage(StorageError::Backend {
            reason: e.to_string(),
        })
    }
}

fn txn_error(e: heed::Error) -> LmdbError {
    LmdbError::Transaction(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LmdbError> {
    serde_json::to_vec(value).map_err(|e| LmdbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbError::Deserialization(e.to_string()))
}

#[derive(Debug, Clone, Copy)]
struct Databases {
    nodes: Database<Bytes, Bytes>,
    series: Database<Bytes, Bytes>,
    tags: Database<Bytes, Bytes>,
}

impl Databases {
    fn node(&self, txn: &RoTxn, path: &str) -> CondDbResult<Option<NodeRecord>> {
        match self.nodes.get(txn, path.as_bytes()).map_err(txn_error)? {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn children(&self, txn: &RoTxn, path: &str) -> CondDbResult<Vec<(String, NodeRecord)>> {
        let prefix = join_path(path, "");
        let mut children = Vec::new();
        for item in self
            .nodes
            .prefix_iter(txn, prefix.as_bytes())
            .map_err(txn_error)?
        {
            let (key, value) = item.map_err(txn_error)?;
            let child = String::from_utf8_lossy(key).into_owned();
            if parent_path(&child) == Some(path) {
                children.push((child, decode(value)?));
            }
        }
        Ok(children)
    }

    fn head_series(
        &self,
        txn: &RoTxn,
        path: &str,
        channel: ChannelId,
    ) -> CondDbResult<Vec<CondObject>> {
        let key = SeriesKey::new(path, channel).encode();
        match self.series.get(txn, &key).map_err(txn_error)? {
            Some(bytes) => Ok(decode(bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn head_channels(
        &self,
        txn: &RoTxn,
        path: &str,
    ) -> CondDbResult<BTreeMap<ChannelId, Vec<CondObject>>> {
        let mut channels = BTreeMap::new();
        for item in self
            .series
            .prefix_iter(txn, &node_prefix(path))
            .map_err(txn_error)?
        {
            let (key, value) = item.map_err(txn_error)?;
            if let Some(key) = SeriesKey::decode(key) {
                channels.insert(key.channel(), decode(value)?);
            }
        }
        Ok(channels)
    }

    fn tag(&self, txn: &RoTxn, path: &str, tag: &str) -> CondDbResult<Option<TagRecord>> {
        let key = TagKey::new(path, tag).encode();
        match self.tags.get(txn, &key).map_err(txn_error)? {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn tag_owners(&self, txn: &RoTxn) -> CondDbResult<BTreeMap<String, String>> {
        let mut owners = BTreeMap::new();
        for item in self.tags.iter(txn).map_err(txn_error)? {
            let (key, _) = item.map_err(txn_error)?;
            if let Some(key) = TagKey::decode(key) {
                owners.insert(key.tag().to_string(), key.path().to_string());
            }
        }
        Ok(owners)
    }
}

struct ReadView<'t, 'e> {
    txn: &'t RoTxn<'e>,
    dbs: Databases,
}

impl NodeStore for ReadView<'_, '_> {
    fn node_record(&self, path: &str) -> CondDbResult<Option<NodeRecord>> {
        self.dbs.node(self.txn, path)
    }

    fn child_records(&self, path: &str) -> CondDbResult<Vec<(String, NodeRecord)>> {
        self.dbs.children(self.txn, path)
    }

    fn head_series(&self, path: &str, channel: ChannelId) -> CondDbResult<Vec<CondObject>> {
        self.dbs.head_series(self.txn, path, channel)
    }

    fn head_channels(&self, path: &str) -> CondDbResult<BTreeMap<ChannelId, Vec<CondObject>>> {
        self.dbs.head_channels(self.txn, path)
    }

    fn tag_record(&self, path: &str, tag: &str) -> CondDbResult<Option<TagRecord>> {
        self.dbs.tag(self.txn, path, tag)
    }

    fn tag_owners(&self) -> CondDbResult<BTreeMap<String, String>> {
        self.dbs.tag_owners(self.txn)
    }
}

struct WriteView<'t, 'e> {
    txn: &'t mut RwTxn<'e>,
    dbs: Databases,
}

impl NodeStore for WriteView<'_, '_> {
    fn node_record(&self, path: &str) -> CondDbResult<Option<NodeRecord>> {
        self.dbs.node(&*self.txn, path)
    }

    fn child_records(&self, path: &str) -> CondDbResult<Vec<(String, NodeRecord)>> {
        self.dbs.children(&*self.txn, path)
    }

    fn head_series(&self, path: &str, channel: ChannelId) -> CondDbResult<Vec<CondObject>> {
        self.dbs.head_series(&*self.txn, path, channel)
    }

    fn head_channels(&self, path: &str) -> CondDbResult<BTreeMap<ChannelId, Vec<CondObject>>> {
        self.dbs.head_channels(&*self.txn, path)
    }

    fn tag_record(&self, path: &str, tag: &str) -> CondDbResult<Option<TagRecord>> {
        self.dbs.tag(&*self.txn, path, tag)
    }

    fn tag_owners(&self) -> CondDbResult<BTreeMap<String, String>> {
        self.dbs.tag_owners(&*self.txn)
    }
}

impl NodeStoreMut for WriteView<'_, '_> {
    fn put_node(&mut self, path: &str, record: &NodeRecord) -> CondDbResult<()> {
        let bytes = encode(record)?;
        self.dbs
            .nodes
            .put(&mut *self.txn, path.as_bytes(), &bytes)
            .map_err(txn_error)?;
        Ok(())
    }

    fn put_head_series(
        &mut self,
        path: &str,
        channel: ChannelId,
        series: &[CondObject],
    ) -> CondDbResult<()> {
        let key = SeriesKey::new(path, channel).encode();
        let bytes = encode(&series)?;
        self.dbs
            .series
            .put(&mut *self.txn, &key, &bytes)
            .map_err(txn_error)?;
        Ok(())
    }

    fn put_tag(&mut self, path: &str, tag: &str, record: &TagRecord) -> CondDbResult<()> {
        let key = TagKey::new(path, tag).encode();
        let bytes = encode(record)?;
        self.dbs.tags.put(&mut *self.txn, &key, &bytes).map_err(txn_error)?;
        Ok(())
    }
}

fn create_database(
    env: &Env,
    wtxn: &mut RwTxn,
    name: &str,
) -> Result<Database<Bytes, Bytes>, LmdbError> {
    env.create_database(wtxn, Some(name))
        .map_err(|e| LmdbError::DbOpen(e.to_string()))
}

struct OpenEnv {
    env: Env,
    dbs: Databases,
}

/// Conditions database stored in an LMDB environment directory.
///
/// # Example
///
/// ```ignore
/// let mut db = LmdbCondDb::new("/var/conddb/DDDB", 256);
/// db.open()?;
/// db.create_node("/Conditions/Velo/Alignment", "alignment", kind)?;
/// ```
pub struct LmdbCondDb {
    dir: PathBuf,
    map_size_mb: usize,
    handle: Option<OpenEnv>,
}

impl LmdbCondDb {
    /// Create a closed handle. Nothing touches the disk until `open()`.
    pub fn new<P: AsRef<Path>>(dir: P, map_size_mb: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            map_size_mb,
            handle: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn open_env(&self) -> Result<OpenEnv, LmdbError> {
        // Ensure directory exists
        std::fs::create_dir_all(&self.dir)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(self.map_size_mb * 1024 * 1024)
                .max_dbs(3)
                .open(&self.dir)
        }
        .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let dbs = Databases {
            nodes: create_database(&env, &mut wtxn, "nodes")?,
            series: create_database(&env, &mut wtxn, "series")?,
            tags: create_database(&env, &mut wtxn, "tags")?,
        };
        if dbs
            .nodes
            .get(&wtxn, ROOT_PATH.as_bytes())
            .map_err(txn_error)?
            .is_none()
        {
            let root = encode(&NodeRecord::new(NodeKind::Container, "root"))?;
            dbs.nodes
                .put(&mut wtxn, ROOT_PATH.as_bytes(), &root)
                .map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;

        Ok(OpenEnv { env, dbs })
    }

    fn handle(&self) -> CondDbResult<&OpenEnv> {
        self.handle
            .as_ref()
            .ok_or_else(|| ConnectionError::NotOpen.into())
    }

    fn read<T>(&self, f: impl FnOnce(&ReadView<'_, '_>) -> CondDbResult<T>) -> CondDbResult<T> {
        let handle = self.handle()?;
        let txn = handle.env.read_txn().map_err(txn_error)?;
        let view = ReadView {
            txn: &txn,
            dbs: handle.dbs,
        };
        f(&view)
    }

    fn write<T>(
        &mut self,
        f: impl FnOnce(&mut WriteView<'_, '_>) -> CondDbResult<T>,
    ) -> CondDbResult<T> {
        let handle = self.handle()?;
        let mut txn = handle.env.write_txn().map_err(txn_error)?;
        let result = {
            let mut view = WriteView {
                txn: &mut txn,
                dbs: handle.dbs,
            };
            f(&mut view)?
        };
        txn.commit().map_err(txn_error)?;
        Ok(result)
    }
}

impl CondDbBackend for LmdbCondDb {
    fn describe(&self) -> String {
        format!("lmdb:{}", self.dir.display())
    }

    fn open(&mut self) -> CondDbResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.open_env().map_err(|e| ConnectionError::OpenFailed {
            target: self.describe(),
            reason: e.to_string(),
        })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        self.handle = None;
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn node(&self, path: &str) -> CondDbResult<Option<NodeInfo>> {
        self.read(|view| view.node_info(path))
    }

    fn list_children(&self, path: &str) -> CondDbResult<ChildNodes> {
        self.read(|view| view.list_children(path))
    }

    fn fetch(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<CondObject> {
        self.read(|view| view.fetch(path, when, channel, tag))
    }

    fn fetch_range(
        &self,
        path: &str,
        window: &Iov,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<Vec<CondObject>> {
        self.read(|view| view.fetch_range(path, window, channel, tag))
    }

    fn resolve_channel(&self, path: &str, name: &str) -> CondDbResult<ChannelId> {
        self.read(|view| view.resolve_channel(path, name))
    }

    fn create_node(&mut self, path: &str, description: &str, kind: NodeKind) -> CondDbResult<()> {
        self.write(|view| view.create_node(path, description, kind))
    }

    fn store(&mut self, path: &str, object: CondObject) -> CondDbResult<()> {
        self.write(|view| view.store(path, object))
    }

    fn set_channel_name(
        &mut self,
        path: &str,
        channel: ChannelId,
        name: &str,
    ) -> CondDbResult<()> {
        self.write(|view| view.set_channel_name(path, channel, name))
    }

    fn tag(&mut self, path: &str, tag: &str, description: &str) -> CondDbResult<()> {
        self.write(|view| view.tag(path, tag, description))
    }

    fn create_tag_relation(
        &mut self,
        child_path: &str,
        parent_tag: &str,
        child_tag: &str,
    ) -> CondDbResult<()> {
        self.write(|view| view.create_tag_relation(child_path, parent_tag, child_tag))
    }

    fn tag_exists(&self, tag: &str) -> CondDbResult<bool> {
        if conddb_core::is_head_tag(tag) {
            return Ok(true);
        }
        self.read(|view| Ok(view.tag_owners()?.contains_key(tag)))
    }

    fn all_tags(&self) -> CondDbResult<BTreeSet<String>> {
        self.read(|view| Ok(view.tag_owners()?.into_keys().collect()))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use conddb_core::{Payload, StorageType, VersioningMode};
    use tempfile::TempDir;

    const MV: NodeKind = NodeKind::Leaf {
        storage: StorageType::Xml,
        versioning: VersioningMode::MultiVersion,
    };

    fn create_test_db() -> (LmdbCondDb, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut db = LmdbCondDb::new(temp_dir.path().join("DDDB"), 10);
        db.open().expect("Failed to open LMDB");
        (db, temp_dir)
    }

    fn obj(since: u64, until: u64, channel: u32, data: &str) -> CondObject {
        CondObject::new(
            Iov::new(since, until).unwrap(),
            ChannelId::new(channel),
            Payload::xml(data),
        )
    }

    #[test]
    fn test_closed_db_refuses_reads() {
        let temp_dir = TempDir::new().unwrap();
        let db = LmdbCondDb::new(temp_dir.path(), 10);
        assert!(!db.is_open());
        assert!(matches!(
            db.node("/"),
            Err(CondDbError::Connection(ConnectionError::NotOpen))
        ));
    }

    #[test]
    fn test_store_and_fetch() {
        let (mut db, _dir) = create_test_db();
        db.create_node("/Conditions/Velo/Alignment", "align", MV)
            .unwrap();
        db.store("/Conditions/Velo/Alignment", obj(100, 200, 0, "<a/>"))
            .unwrap();
        db.store("/Conditions/Velo/Alignment", obj(100, 200, 1, "<b/>"))
            .unwrap();

        let got = db
            .fetch(
                "/Conditions/Velo/Alignment",
                ValidityKey::new(150),
                ChannelId::new(1),
                "HEAD",
            )
            .unwrap();
        assert_eq!(got.payload.xml_data(), Some("<b/>"));
        assert!(db
            .fetch(
                "/Conditions/Velo/Alignment",
                ValidityKey::new(250),
                ChannelId::new(0),
                "HEAD"
            )
            .is_err());
    }

    #[test]
    fn test_data_survives_reopen() {
        let (mut db, _dir) = create_test_db();
        db.create_node("/a/b", "leaf", MV).unwrap();
        db.store("/a/b", obj(0, 10, 0, "kept")).unwrap();
        db.tag("/a/b", "v1", "").unwrap();
        db.close();
        assert!(!db.is_open());

        db.open().unwrap();
        let got = db
            .fetch("/a/b", ValidityKey::new(5), ChannelId::new(0), "v1")
            .unwrap();
        assert_eq!(got.payload.xml_data(), Some("kept"));
        assert_eq!(db.list_children("/a").unwrap().leaves, vec!["b"]);
        assert_eq!(db.list_children("/").unwrap().containers, vec!["a"]);
    }

    #[test]
    fn test_children_do_not_leak_across_siblings() {
        let (mut db, _dir) = create_test_db();
        db.create_node("/a/x", "", MV).unwrap();
        db.create_node("/ab/y", "", MV).unwrap();
        let a = db.list_children("/a").unwrap();
        assert_eq!(a.all(), vec!["x"]);
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let (mut db, _dir) = create_test_db();
        db.create_node("/leaf", "", MV).unwrap();
        // Parent is a leaf: nothing below it may be created.
        assert!(db.create_node("/leaf/deeper/node", "", MV).is_err());
        assert!(!db.exists("/leaf/deeper").unwrap());
    }

    #[test]
    fn test_tags_and_relations() {
        let (mut db, _dir) = create_test_db();
        db.create_node("/top/leaf", "", MV).unwrap();
        db.store("/top/leaf", obj(0, 100, 0, "v1")).unwrap();
        db.tag("/top/leaf", "leaf-v1", "").unwrap();
        db.create_tag_relation("/top/leaf", "top-v1", "leaf-v1")
            .unwrap();
        db.store("/top/leaf", obj(0, 100, 0, "v2")).unwrap();

        let got = db
            .fetch("/top/leaf", ValidityKey::new(1), ChannelId::new(0), "top-v1")
            .unwrap();
        assert_eq!(got.payload.xml_data(), Some("v1"));
        assert!(db.tag_exists("top-v1").unwrap());
        assert_eq!(db.all_tags().unwrap().len(), 2);
    }
}
