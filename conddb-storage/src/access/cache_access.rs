use super::{read_cache, write_cache, CondDbAccessSvc, CondDbCacheAccess};
use crate::backend::CondDbBackend;
use crate::cache::CacheStats;
use conddb_core::{normalize_path, ChannelId, CondDbResult, CondObject, Iov, Payload, ValidityKey};

impl<B: CondDbBackend> CondDbCacheAccess for CondDbAccessSvc<B> {
    fn cache_add_folder(&self, path: &str, description: &str) -> CondDbResult<bool> {
        let cache = self.cache_lock()?;
        let path = normalize_path(path)?;
        Ok(write_cache(cache).add_folder(&path, description))
    }

    fn cache_add_folder_set(&self, path: &str) -> CondDbResult<bool> {
        let cache = self.cache_lock()?;
        let path = normalize_path(path)?;
        Ok(write_cache(cache).add_folder_set(&path))
    }

    fn cache_add_xml_data(
        &self,
        path: &str,
        since: ValidityKey,
        until: ValidityKey,
        data: &str,
        channel: ChannelId,
    ) -> CondDbResult<bool> {
        self.cache_add_object(path, since, until, Payload::xml(data), channel)
    }

    /// Returns `false` if `path` is not a registered folder.
    fn cache_add_object(
        &self,
        path: &str,
        since: ValidityKey,
        until: ValidityKey,
        payload: Payload,
        channel: ChannelId,
    ) -> CondDbResult<bool> {
        let cache = self.cache_lock()?;
        let path = normalize_path(path)?;
        let iov = Iov::new(since, until)?;
        let added = write_cache(cache).insert_object(&path, CondObject::new(iov, channel, payload));
        if !added {
            tracing::warn!(path = %path, "cannot add object: folder not registered in the cache");
        }
        Ok(added)
    }

    fn cache_add_channel_name(
        &self,
        path: &str,
        name: &str,
        channel: ChannelId,
    ) -> CondDbResult<bool> {
        let cache = self.cache_lock()?;
        let path = normalize_path(path)?;
        Ok(write_cache(cache).add_channel_name(&path, name, channel))
    }

    fn clear_cache(&self) -> CondDbResult<()> {
        write_cache(self.cache_lock()?).clear();
        tracing::info!(service = %self.config.name, "cache cleared");
        Ok(())
    }

    fn dump_cache(&self) -> CondDbResult<String> {
        Ok(read_cache(self.cache_lock()?).dump())
    }

    fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| read_cache(cache).stats())
    }
}
