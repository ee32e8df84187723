//! Binary keys for the LMDB series and tag databases.
//!
//! Both key kinds start with the node path, followed by a separator byte and
//! a node-local discriminator, so a prefix scan over `path + SEPARATOR`
//! visits everything stored for one node.

use conddb_core::ChannelId;

/// Separator between the path and the rest of the key. Never valid UTF-8,
/// so it cannot appear inside a path or a tag name.
const SEPARATOR: u8 = 0xFF;

/// Key of the HEAD series of one channel.
///
/// Format: `[path bytes][0xFF][channel: u32 big-endian]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    path: String,
    channel: ChannelId,
}

impl SeriesKey {
    pub fn new(path: &str, channel: ChannelId) -> Self {
        Self {
            path: path.to_string(),
            channel,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = node_prefix(&self.path);
        bytes.extend_from_slice(&self.channel.as_u32().to_be_bytes());
        bytes
    }

    /// Decode a key. Returns `None` for anything not produced by `encode`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (path, rest) = split_at_separator(bytes)?;
        let channel: [u8; 4] = rest.try_into().ok()?;
        Some(Self {
            path,
            channel: ChannelId::new(u32::from_be_bytes(channel)),
        })
    }
}

/// Key of one tag defined on one node.
///
/// Format: `[path bytes][0xFF][tag bytes]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagKey {
    path: String,
    tag: String,
}

impl TagKey {
    pub fn new(path: &str, tag: &str) -> Self {
        Self {
            path: path.to_string(),
            tag: tag.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = node_prefix(&self.path);
        bytes.extend_from_slice(self.tag.as_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (path, rest) = split_at_separator(bytes)?;
        let tag = std::str::from_utf8(rest).ok()?.to_string();
        Some(Self { path, tag })
    }
}

/// Prefix shared by every series and tag key of `path`.
pub fn node_prefix(path: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(path.len() + 5);
    bytes.extend_from_slice(path.as_bytes());
    bytes.push(SEPARATOR);
    bytes
}

fn split_at_separator(bytes: &[u8]) -> Option<(String, &[u8])> {
    let idx = bytes.iter().position(|b| *b == SEPARATOR)?;
    let path = std::str::from_utf8(&bytes[..idx]).ok()?.to_string();
    Some((path, &bytes[idx + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key_encode_decode() {
        let key = SeriesKey::new("/Conditions/Velo", ChannelId::new(258));
        let bytes = key.encode();
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 1, 2]);
        assert_eq!(SeriesKey::decode(&bytes), Some(key));
    }

    #[test]
    fn test_tag_key_encode_decode() {
        let key = TagKey::new("/a/b", "cond-2024");
        let decoded = TagKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded.path(), "/a/b");
        assert_eq!(decoded.tag(), "cond-2024");
    }

    #[test]
    fn test_prefix_separates_sibling_paths() {
        // "/a" must not be a prefix match for keys of "/ab".
        let prefix = node_prefix("/a");
        let other = SeriesKey::new("/ab", ChannelId::new(0)).encode();
        assert!(!other.starts_with(&prefix));
        let own = SeriesKey::new("/a", ChannelId::new(0)).encode();
        assert!(own.starts_with(&prefix));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SeriesKey::decode(b"no separator").is_none());
        assert!(SeriesKey::decode(&[b'/', SEPARATOR, 1, 2]).is_none());
    }
}
