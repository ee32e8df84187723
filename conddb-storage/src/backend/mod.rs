//! Conditions database backends.
//!
//! The access service talks to its store only through [`CondDbBackend`].
//! Three implementations are provided:
//!
//! - [`InMemoryCondDb`]: shared in-process store, used by tests and fixtures
//! - [`LmdbCondDb`]: persistent store on top of LMDB (`heed`)
//! - [`NoDatabase`]: placeholder for cache-only services; every call fails

mod key;
mod lmdb;
mod memory;
mod none;
mod store;

pub use lmdb::{LmdbCondDb, LmdbError};
pub use memory::InMemoryCondDb;
pub use none::NoDatabase;
pub use store::{NodeRecord, TagRecord, TagTarget};

use conddb_core::{
    ChannelId, ChildNodes, CondDbResult, CondObject, ConnectionError, ConnectionString, Iov,
    NodeInfo, NodeKind, ValidityKey,
};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Narrow interface to a conditions database.
///
/// Read and write calls fail with `ConnectionError::NotOpen` until
/// [`open`](CondDbBackend::open) has succeeded. Tag arguments accept
/// `"HEAD"` (or `""`) to select the untagged objects.
pub trait CondDbBackend: Send + 'static {
    /// Human-readable target, used in logs and errors.
    fn describe(&self) -> String;

    fn open(&mut self) -> CondDbResult<()>;

    /// Close the connection. Closing a closed backend is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Metadata of the node at `path`, or `None` if there is none.
    fn node(&self, path: &str) -> CondDbResult<Option<NodeInfo>>;

    fn exists(&self, path: &str) -> CondDbResult<bool> {
        Ok(self.node(path)?.is_some())
    }

    fn list_children(&self, path: &str) -> CondDbResult<ChildNodes>;

    /// Object valid at `when`.
    fn fetch(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<CondObject>;

    /// Objects intersecting `window`, ascending by `since`.
    fn fetch_range(
        &self,
        path: &str,
        window: &Iov,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<Vec<CondObject>>;

    fn resolve_channel(&self, path: &str, name: &str) -> CondDbResult<ChannelId>;

    fn create_node(&mut self, path: &str, description: &str, kind: NodeKind) -> CondDbResult<()>;

    fn store(&mut self, path: &str, object: CondObject) -> CondDbResult<()>;

    fn set_channel_name(&mut self, path: &str, channel: ChannelId, name: &str)
        -> CondDbResult<()>;

    fn tag(&mut self, path: &str, tag: &str, description: &str) -> CondDbResult<()>;

    fn create_tag_relation(
        &mut self,
        child_path: &str,
        parent_tag: &str,
        child_tag: &str,
    ) -> CondDbResult<()>;

    /// True if `tag` is defined anywhere in the database. HEAD always exists.
    fn tag_exists(&self, tag: &str) -> CondDbResult<bool>;

    fn all_tags(&self) -> CondDbResult<BTreeSet<String>>;
}

impl<B: CondDbBackend + ?Sized> CondDbBackend for Box<B> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self) -> CondDbResult<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn node(&self, path: &str) -> CondDbResult<Option<NodeInfo>> {
        (**self).node(path)
    }

    fn exists(&self, path: &str) -> CondDbResult<bool> {
        (**self).exists(path)
    }

    fn list_children(&self, path: &str) -> CondDbResult<ChildNodes> {
        (**self).list_children(path)
    }

    fn fetch(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<CondObject> {
        (**self).fetch(path, when, channel, tag)
    }

    fn fetch_range(
        &self,
        path: &str,
        window: &Iov,
        channel: ChannelId,
        tag: &str,
    ) -> CondDbResult<Vec<CondObject>> {
        (**self).fetch_range(path, window, channel, tag)
    }

    fn resolve_channel(&self, path: &str, name: &str) -> CondDbResult<ChannelId> {
        (**self).resolve_channel(path, name)
    }

    fn create_node(&mut self, path: &str, description: &str, kind: NodeKind) -> CondDbResult<()> {
        (**self).create_node(path, description, kind)
    }

    fn store(&mut self, path: &str, object: CondObject) -> CondDbResult<()> {
        (**self).store(path, object)
    }

    fn set_channel_name(
        &mut self,
        path: &str,
        channel: ChannelId,
        name: &str,
    ) -> CondDbResult<()> {
        (**self).set_channel_name(path, channel, name)
    }

    fn tag(&mut self, path: &str, tag: &str, description: &str) -> CondDbResult<()> {
        (**self).tag(path, tag, description)
    }

    fn create_tag_relation(
        &mut self,
        child_path: &str,
        parent_tag: &str,
        child_tag: &str,
    ) -> CondDbResult<()> {
        (**self).create_tag_relation(child_path, parent_tag, child_tag)
    }

    fn tag_exists(&self, tag: &str) -> CondDbResult<bool> {
        (**self).tag_exists(tag)
    }

    fn all_tags(&self) -> CondDbResult<BTreeSet<String>> {
        (**self).all_tags()
    }
}

/// Default LMDB map size for backends built from a connection string.
const DEFAULT_MAP_SIZE_MB: usize = 256;

/// Build a backend for a parsed connection string.
///
/// `memory://` gives a fresh, empty in-memory store; `lmdb://` stores the
/// database under `<schema>/<dbname>`. Host aliases need an external lookup
/// service and are not supported.
pub fn backend_for(connection: &ConnectionString) -> CondDbResult<Box<dyn CondDbBackend>> {
    match connection {
        ConnectionString::Full {
            backend,
            schema,
            dbname,
            ..
        } => match backend.as_str() {
            "memory" => Ok(Box::new(InMemoryCondDb::named(connection.to_string()))),
            "lmdb" => Ok(Box::new(LmdbCondDb::new(
                PathBuf::from(schema).join(dbname),
                DEFAULT_MAP_SIZE_MB,
            ))),
            other => Err(ConnectionError::UnsupportedBackend {
                backend: other.to_string(),
            }
            .into()),
        },
        ConnectionString::Alias { host_alias, .. } => Err(ConnectionError::UnsupportedBackend {
            backend: format!("alias {}", host_alias),
        }
        .into()),
    }
}
