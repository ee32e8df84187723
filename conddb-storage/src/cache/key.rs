//! Cache key for one channel of one leaf node.

use conddb_core::ChannelId;
use std::fmt;

/// `(path, channel)` pair addressing one series of cached payloads.
///
/// Ordering is by path, then channel, which is also the order of
/// [`super::ValidityCache::dump`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    path: String,
    channel: ChannelId,
}

impl CacheKey {
    pub fn new(path: impl Into<String>, channel: ChannelId) -> Self {
        Self {
            path: path.into(),
            channel,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_path_then_channel() {
        let mut keys = vec![
            CacheKey::new("/b", ChannelId::new(0)),
            CacheKey::new("/a", ChannelId::new(2)),
            CacheKey::new("/a", ChannelId::new(1)),
        ];
        keys.sort();
        assert_eq!(keys[0], CacheKey::new("/a", ChannelId::new(1)));
        assert_eq!(keys[1], CacheKey::new("/a", ChannelId::new(2)));
        assert_eq!(keys[2], CacheKey::new("/b", ChannelId::new(0)));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(CacheKey::new("/a/b", ChannelId::new(7)).to_string(), "/a/b:7");
    }
}
