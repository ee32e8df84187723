//! Time-indexed conditions cache.
//!
//! The cache maps `(path, channel)` to a sequence of payloads ordered by the
//! start of their interval of validity. Intervals stored for one key never
//! overlap: an insert first drops every stored entry it intersects, so the
//! latest insert always wins.
//!
//! # Eviction
//!
//! Eviction is by insertion order, not by access: once the total entry count
//! exceeds the high watermark the oldest-inserted entries (across all keys)
//! are removed until the count is back at the low watermark.
//!
//! # Example
//!
//! ```ignore
//! let mut cache = ValidityCache::new(10, 100);
//! cache.add_folder("/Conditions/Velo/Alignment", "XML alignment");
//! cache.insert(CacheEntry::new("/Conditions/Velo/Alignment", ChannelId::new(0),
//!     Iov::new(100u64, 200u64)?, "XML alignment", Payload::xml("<DDDB/>")));
//! let hit = cache.lookup("/Conditions/Velo/Alignment", ChannelId::new(0), ValidityKey::new(150));
//! ```

pub mod key;
pub mod stats;
pub mod validity;

pub use key::CacheKey;
pub use stats::CacheStats;
pub use validity::{CacheEntry, CachedNode, ValidityCache};
