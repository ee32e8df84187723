//! Cache properties over generated entries.

use conddb_core::Iov;
use conddb_storage::ValidityCache;
use conddb_test_utils::generators::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_generated_entries_stay_disjoint_and_bounded(
        entries in arb_cache_entries(60),
        low in 0usize..8,
        extra in 1usize..16,
    ) {
        let high = low + extra;
        let mut cache = ValidityCache::new(low, high);
        let mut keys = BTreeSet::new();
        for entry in entries {
            keys.insert((entry.path.clone(), entry.channel));
            prop_assert!(cache.insert(entry));
            prop_assert!(cache.len() <= high);
        }

        for (path, channel) in keys {
            let stored = cache.lookup_range(&path, channel, &Iov::unbounded());
            for pair in stored.windows(2) {
                prop_assert!(pair[0].until() <= pair[1].since());
            }
        }
    }

    #[test]
    fn prop_lookup_only_returns_covering_entries(
        entries in arb_cache_entries(30),
        when in arb_validity_key(),
        channel in arb_channel(),
        path in arb_folder_path(),
    ) {
        let mut cache = ValidityCache::new(100, 100);
        for entry in entries {
            cache.insert(entry);
        }
        if let Some(hit) = cache.lookup(&path, channel, when) {
            prop_assert!(hit.iov.contains(when));
            prop_assert_eq!(hit.path, path);
            prop_assert_eq!(hit.channel, channel);
        }
    }

    #[test]
    fn prop_last_insert_is_served_at_its_since(entries in arb_cache_entries(30)) {
        prop_assume!(!entries.is_empty());
        let mut cache = ValidityCache::new(100, 100);
        let last = entries[entries.len() - 1].clone();
        for entry in entries {
            cache.insert(entry);
        }
        let hit = cache.lookup(&last.path, last.channel, last.since());
        prop_assert_eq!(hit, Some(last));
    }
}
