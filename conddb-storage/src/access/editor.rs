//! Administrative writes.

use super::{CondDbAccessSvc, CondDbEditor};
use crate::backend::CondDbBackend;
use crate::tag::AutoTagNamer;
use conddb_core::{
    join_path, normalize_path, ChannelId, CondDbResult, CondObject, Iov, NodeKind, Payload,
    StorageError, StorageType, TagError, ValidityKey, VersioningMode,
};

impl<B: CondDbBackend> CondDbEditor for CondDbAccessSvc<B> {
    fn create_folder_set(&self, path: &str, description: &str) -> CondDbResult<()> {
        self.ensure_writable("create_folder_set")?;
        let path = normalize_path(path)?;
        self.connection
            .with_connection(|backend| backend.create_node(&path, description, NodeKind::Container))?;
        tracing::info!(path = %path, "folder set created");
        Ok(())
    }

    fn create_node(
        &self,
        path: &str,
        description: &str,
        storage: StorageType,
        versioning: VersioningMode,
    ) -> CondDbResult<()> {
        self.ensure_writable("create_node")?;
        let path = normalize_path(path)?;
        let kind = NodeKind::Leaf {
            storage,
            versioning,
        };
        self.connection
            .with_connection(|backend| backend.create_node(&path, description, kind))?;
        tracing::info!(path = %path, ?storage, ?versioning, "folder created");
        Ok(())
    }

    fn store_xml_data(
        &self,
        path: &str,
        data: &str,
        since: ValidityKey,
        until: ValidityKey,
        channel: ChannelId,
    ) -> CondDbResult<()> {
        self.store_payload(path, Payload::xml(data), since, until, channel)
    }

    fn store_payload(
        &self,
        path: &str,
        payload: Payload,
        since: ValidityKey,
        until: ValidityKey,
        channel: ChannelId,
    ) -> CondDbResult<()> {
        self.ensure_writable("store")?;
        let path = normalize_path(path)?;
        let iov = Iov::new(since, until)?;
        self.connection.with_connection(|backend| {
            backend.store(&path, CondObject::new(iov, channel, payload))
        })?;
        tracing::debug!(path = %path, channel = %channel, iov = %iov, "object stored");
        Ok(())
    }

    fn set_channel_name(&self, path: &str, channel: ChannelId, name: &str) -> CondDbResult<()> {
        self.ensure_writable("set_channel_name")?;
        let path = normalize_path(path)?;
        self.connection
            .with_connection(|backend| backend.set_channel_name(&path, channel, name))
    }

    fn tag_leaf_node(&self, path: &str, tag: &str, description: &str) -> CondDbResult<()> {
        self.ensure_writable("tag_leaf_node")?;
        let path = normalize_path(path)?;
        self.connection.with_connection(|backend| {
            match backend.node(&path)? {
                Some(info) if info.kind.is_leaf() => {}
                Some(_) => {
                    return Err(StorageError::WrongNodeType {
                        path: path.clone(),
                        expected: "leaf node".to_string(),
                    }
                    .into())
                }
                None => return Err(StorageError::NodeNotFound { path: path.clone() }.into()),
            }
            backend.tag(&path, tag, description)
        })?;
        tracing::info!(path = %path, tag, "leaf node tagged");
        Ok(())
    }

    /// The whole walk runs under one operation lock, so it blocks every
    /// other backend user until it is done.
    fn recursive_tag(&self, path: &str, tag: &str, description: &str) -> CondDbResult<()> {
        self.ensure_writable("recursive_tag")?;
        let path = normalize_path(path)?;
        let tagged = self.connection.with_connection(|backend| {
            let mut namer = AutoTagNamer::new(tag, backend.all_tags()?);
            if !namer.reserve(tag) {
                return Err(TagError::AlreadyExists {
                    tag: tag.to_string(),
                    path: path.clone(),
                }
                .into());
            }
            tag_subtree(backend, &path, tag, description, &mut namer)
        })?;
        tracing::info!(path = %path, tag, nodes = tagged, "recursive tag applied");
        Ok(())
    }
}

/// Tag `path` with `tag`; for a container, give each child a generated tag
/// and link it from `tag`. Returns the number of nodes tagged.
fn tag_subtree<B: CondDbBackend + ?Sized>(
    backend: &mut B,
    path: &str,
    tag: &str,
    description: &str,
    namer: &mut AutoTagNamer,
) -> CondDbResult<usize> {
    let info = backend
        .node(path)?
        .ok_or_else(|| StorageError::NodeNotFound {
            path: path.to_string(),
        })?;

    backend.tag(path, tag, description)?;
    if info.kind.is_leaf() {
        return Ok(1);
    }

    let mut tagged = 1;
    for name in backend.list_children(path)?.all() {
        let child = join_path(path, &name);
        let child_tag = namer.next_name();
        tagged += tag_subtree(backend, &child, &child_tag, description, namer)?;
        backend.create_tag_relation(&child, tag, &child_tag)?;
    }
    Ok(tagged)
}
