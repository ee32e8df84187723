//! Read side of the access service.

use super::{read_cache, write_cache, CondDbAccessSvc, CondDbReader, NameTagPair, ServicePhase};
use crate::backend::CondDbBackend;
use crate::cache::{CachedNode, ValidityCache};
use conddb_core::{
    normalize_path, ChannelId, ChildNodes, CondDbResult, CondObject, ConditionData, Iov,
    NodeInfo, StorageError, ValidationError, ValidityKey, HEAD_TAG, ROOT_PATH,
};

const LEAF: &str = "leaf node";
const CONTAINER: &str = "container node";

impl<B: CondDbBackend> CondDbAccessSvc<B> {
    /// Fail with `StaleReplica` if `when` is at or past the latest update
    /// the replica has seen. Only checked while running.
    fn check_replica(&self, when: ValidityKey) -> CondDbResult<()> {
        if !self.heartbeat.is_enabled() || self.current_phase() != ServicePhase::Running {
            return Ok(());
        }
        let latest = self
            .heartbeat
            .latest_update(&self.connection, HEAD_TAG, true)?;
        if when >= latest {
            tracing::warn!(requested = %when, latest = %latest, "conditions database replica is not up to date");
            return Err(ValidationError::StaleReplica {
                requested: when,
                latest,
            }
            .into());
        }
        Ok(())
    }

    /// Fetch from the backend and cache what was fetched.
    ///
    /// With a query granularity, every object overlapping the granule around
    /// `when` is fetched and cached, so neighbouring lookups hit.
    fn fetch_and_cache(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
    ) -> CondDbResult<ConditionData> {
        // Tag and generation are read together: a tag switch changes both
        // under the cache write lock.
        let (tag, generation) = match &self.cache {
            Some(cache) => {
                let cache = read_cache(cache);
                (self.current_tag(), Some(cache.generation()))
            }
            None => (self.current_tag(), None),
        };
        let granule = self
            .cache
            .as_ref()
            .and_then(|_| Iov::granule(when, self.config.query_granularity));

        let (info, objects) = self.connection.with_connection(|backend| {
            let info = require_leaf(backend.node(path)?, path)?;
            let objects = match &granule {
                Some(window) => backend.fetch_range(path, window, channel, &tag)?,
                None => vec![backend.fetch(path, when, channel, &tag)?],
            };
            Ok((info, objects))
        })?;

        let object = objects
            .iter()
            .find(|object| object.iov.contains(when))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                path: path.to_string(),
                channel,
                when,
            })?;

        if let Some(cache) = &self.cache {
            let mut cache = write_cache(cache);
            if Some(cache.generation()) != generation {
                tracing::debug!(path, channel = %channel, when = %when, "cache cleared during fetch, not filling");
                return Ok(condition(object, info.description));
            }
            cache.add_folder(path, &info.description);
            let fetched = objects.len();
            for extra in objects {
                cache.insert_object(path, extra);
            }
            tracing::debug!(path, channel = %channel, when = %when, fetched, "cache miss filled");
        }

        Ok(condition(object, info.description))
    }

    /// Kind of a node: `Some(true)` for a leaf, `Some(false)` for a
    /// container, `None` if absent.
    fn node_is_leaf(&self, path: &str) -> CondDbResult<Option<bool>> {
        self.ensure_ready()?;
        let path = normalize_path(path)?;
        if self.config.no_db {
            let cache = read_cache(self.cache_lock()?);
            return Ok(match cache.node(&path) {
                Some(node) => Some(node.is_folder()),
                None if path == ROOT_PATH => Some(false),
                None => None,
            });
        }
        let info = self.connection.with_connection(|backend| backend.node(&path))?;
        Ok(info.map(|info| info.kind.is_leaf()))
    }
}

impl<B: CondDbBackend> CondDbReader for CondDbAccessSvc<B> {
    fn get_object(
        &self,
        path: &str,
        when: ValidityKey,
        channel: ChannelId,
    ) -> CondDbResult<ConditionData> {
        self.ensure_ready()?;
        let path = normalize_path(path)?;
        self.check_replica(when)?;

        if let Some(cache) = &self.cache {
            let cache = read_cache(cache);
            if let Some(entry) = cache.lookup(&path, channel, when) {
                tracing::debug!(path = %path, channel = %channel, when = %when, "cache hit");
                return Ok(entry.into());
            }
            if self.config.no_db {
                return Err(cache_miss(&cache, &path, channel, when));
            }
        }

        self.fetch_and_cache(&path, when, channel)
    }

    fn get_object_by_name(
        &self,
        path: &str,
        when: ValidityKey,
        channel_name: &str,
    ) -> CondDbResult<ConditionData> {
        self.ensure_ready()?;
        let path = normalize_path(path)?;

        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| read_cache(cache).channel_by_name(&path, channel_name));
        if let Some(channel) = cached {
            return self.get_object(&path, when, channel);
        }
        if self.config.no_db {
            return Err(StorageError::UnknownChannel {
                path,
                name: channel_name.to_string(),
            }
            .into());
        }

        let channel = self
            .connection
            .with_connection(|backend| backend.resolve_channel(&path, channel_name))?;
        let data = self.get_object(&path, when, channel)?;
        if let Some(cache) = &self.cache {
            write_cache(cache).add_channel_name(&path, channel_name, channel);
        }
        Ok(data)
    }

    /// Backend intervals are authoritative. Cached intervals are reported
    /// only where no backend interval covers them, which happens in NoDB
    /// mode or for objects added straight to the cache.
    fn get_iovs(&self, path: &str, window: &Iov, channel: ChannelId) -> CondDbResult<Vec<Iov>> {
        self.ensure_ready()?;
        let path = normalize_path(path)?;

        let cached: Vec<Iov> = match &self.cache {
            Some(cache) => {
                let cache = read_cache(cache);
                if self.config.no_db && !cache.has_path(&path) {
                    return Err(StorageError::NodeNotFound { path }.into());
                }
                cache
                    .lookup_range(&path, channel, window)
                    .into_iter()
                    .map(|entry| entry.iov)
                    .collect()
            }
            None => Vec::new(),
        };
        if self.config.no_db {
            return Ok(canonicalize_iovs(cached));
        }

        let tag = self.current_tag();
        let stored: Vec<Iov> = self
            .connection
            .with_connection(|backend| {
                require_leaf(backend.node(&path)?, &path)?;
                backend.fetch_range(&path, window, channel, &tag)
            })?
            .into_iter()
            .map(|object| object.iov)
            .collect();

        Ok(merge_iovs(stored, cached))
    }

    fn child_nodes(&self, path: &str) -> CondDbResult<ChildNodes> {
        self.ensure_ready()?;
        let path = normalize_path(path)?;
        if self.config.no_db {
            let cache = read_cache(self.cache_lock()?);
            return match cache.node(&path) {
                Some(CachedNode::FolderSet) => Ok(cache.child_nodes(&path).unwrap_or_default()),
                Some(CachedNode::Folder { .. }) => Err(StorageError::WrongNodeType {
                    path,
                    expected: CONTAINER.to_string(),
                }
                .into()),
                None if path == ROOT_PATH => Ok(ChildNodes::default()),
                None => Err(StorageError::NodeNotFound { path }.into()),
            };
        }
        self.connection
            .with_connection(|backend| backend.list_children(&path))
    }

    fn exists(&self, path: &str) -> CondDbResult<bool> {
        Ok(self.node_is_leaf(path)?.is_some())
    }

    fn is_leaf(&self, path: &str) -> CondDbResult<bool> {
        Ok(self.node_is_leaf(path)? == Some(true))
    }

    fn is_container(&self, path: &str) -> CondDbResult<bool> {
        Ok(self.node_is_leaf(path)? == Some(false))
    }

    fn default_tags(&self) -> Vec<NameTagPair> {
        vec![NameTagPair {
            name: self.config.name.clone(),
            tag: self.current_tag(),
        }]
    }
}

fn require_leaf(info: Option<NodeInfo>, path: &str) -> CondDbResult<NodeInfo> {
    match info {
        Some(info) if info.kind.is_leaf() => Ok(info),
        Some(_) => Err(StorageError::WrongNodeType {
            path: path.to_string(),
            expected: LEAF.to_string(),
        }
        .into()),
        None => Err(StorageError::NodeNotFound {
            path: path.to_string(),
        }
        .into()),
    }
}

fn condition(object: CondObject, description: String) -> ConditionData {
    ConditionData {
        payload: object.payload,
        description,
        iov: object.iov,
        channel: object.channel,
    }
}

/// Error for a NoDB lookup that missed the cache.
fn cache_miss(
    cache: &ValidityCache,
    path: &str,
    channel: ChannelId,
    when: ValidityKey,
) -> conddb_core::CondDbError {
    match cache.node(path) {
        Some(CachedNode::Folder { .. }) => StorageError::NotFound {
            path: path.to_string(),
            channel,
            when,
        },
        Some(CachedNode::FolderSet) => StorageError::WrongNodeType {
            path: path.to_string(),
            expected: LEAF.to_string(),
        },
        None => StorageError::NodeNotFound {
            path: path.to_string(),
        },
    }
    .into()
}

/// Union of backend and cached intervals. A cached interval that intersects
/// any backend interval is dropped in favour of the backend's boundaries.
pub(crate) fn merge_iovs(authoritative: Vec<Iov>, cached: Vec<Iov>) -> Vec<Iov> {
    let extra: Vec<Iov> = cached
        .into_iter()
        .filter(|iov| !authoritative.iter().any(|stored| stored.intersects(iov)))
        .collect();
    let mut merged = authoritative;
    merged.extend(extra);
    canonicalize_iovs(merged)
}

/// Sort by `since`, drop duplicates and clip each interval to start where
/// the previous one ends. The result is ascending and pairwise disjoint.
pub(crate) fn canonicalize_iovs(mut iovs: Vec<Iov>) -> Vec<Iov> {
    iovs.sort_by_key(|iov| (iov.since(), iov.until()));
    let mut out: Vec<Iov> = Vec::with_capacity(iovs.len());
    for iov in iovs {
        match out.last() {
            Some(previous) if previous.until() > iov.since() => {
                // Nothing left when the previous interval covers this one.
                if let Ok(rest) = iov.with_since(previous.until()) {
                    out.push(rest);
                }
            }
            _ => out.push(iov),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iov(since: u64, until: u64) -> Iov {
        Iov::new(since, until).unwrap()
    }

    #[test]
    fn test_canonicalize_clips_and_dedups() {
        let out = canonicalize_iovs(vec![
            iov(100, 200),
            iov(0, 100),
            iov(150, 300),
            iov(100, 200),
            iov(120, 180),
        ]);
        assert_eq!(out, vec![iov(0, 100), iov(100, 200), iov(200, 300)]);
    }

    #[test]
    fn test_canonicalize_open_ended_swallows_rest() {
        let out = canonicalize_iovs(vec![
            Iov::open_ended(ValidityKey::new(10)).unwrap(),
            iov(20, 30),
        ]);
        assert_eq!(out, vec![Iov::open_ended(ValidityKey::new(10)).unwrap()]);
    }

    #[test]
    fn test_merge_prefers_backend_boundaries() {
        // The cache holds a granule-sized copy of a stored object plus an
        // object only the cache knows about.
        let stored = vec![iov(100, 200), iov(200, 400)];
        let cached = vec![iov(150, 250), iov(500, 600)];
        assert_eq!(
            merge_iovs(stored, cached),
            vec![iov(100, 200), iov(200, 400), iov(500, 600)]
        );
    }
}
