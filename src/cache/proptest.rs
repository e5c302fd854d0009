//! Property-Based Tests for the Sharded Cache
//!
//! # Test Properties
//!
//! 1. **Budgets Hold**: no tier of any shard exceeds its byte or item budget
//! 2. **Read Your Write**: a key read right after its write returns that value
//! 3. **Delete Is Final**: put, delete, get yields a clean miss

#![cfg(test)]

use bytes::Bytes;
use proptest::prelude::*;

use super::{CacheConfig, Lookup, ShardedCache, Tier, TierBudget, TierBudgets};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put { key: u8, size: usize },
    Get { key: u8 },
    Delete { key: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (any::<u8>(), 1usize..200).prop_map(|(key, size)| Op::Put { key, size }),
        3 => any::<u8>().prop_map(|key| Op::Get { key }),
        1 => any::<u8>().prop_map(|key| Op::Delete { key }),
    ]
}

fn tight_cache(shards: usize) -> ShardedCache {
    let budgets = TierBudgets {
        hot: TierBudget::new(512, 4),
        warm: TierBudget::new(1024, 8),
        cold: TierBudget::new(2048, 16),
    };
    ShardedCache::new(
        CacheConfig::default()
            .with_shard_count(shards)
            .with_budgets(budgets)
            .with_max_entry_size(256),
    )
    .unwrap()
}

fn value_for(key: u8, size: usize) -> Bytes {
    Bytes::from(vec![key; size])
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_tier_budgets_never_exceeded(
        shards in 1usize..4,
        ops in prop::collection::vec(op_strategy(), 1..300),
    ) {
        let cache = tight_cache(shards);
        let budgets = cache.config().budgets;

        for op in ops {
            match op {
                Op::Put { key, size } => {
                    cache.put("t", &key.to_string(), value_for(key, size)).unwrap();
                }
                Op::Get { key } => {
                    cache.get("t", &key.to_string());
                }
                Op::Delete { key } => {
                    cache.delete("t", &key.to_string());
                }
            }

            for index in 0..shards {
                for tier in Tier::ALL {
                    let (bytes, items) = cache.shard_residency(index, tier).unwrap();
                    let budget = budgets.get(tier);
                    prop_assert!(bytes <= budget.max_bytes, "{} bytes over budget in shard {}", tier, index);
                    prop_assert!(items <= budget.max_items, "{} items over budget in shard {}", tier, index);
                }
            }
        }
    }

    #[test]
    fn prop_read_your_write(
        writes in prop::collection::vec((any::<u8>(), 1usize..200), 1..50),
    ) {
        let cache = tight_cache(4);
        for (key, size) in writes {
            let k = key.to_string();
            let value = value_for(key, size);
            let outcome = cache.put("t", &k, value.clone()).unwrap();
            match cache.get("t", &k) {
                Lookup::Hit { value: got, version, .. } => {
                    prop_assert_eq!(got, value);
                    prop_assert_eq!(version, outcome.version);
                }
                Lookup::Miss => prop_assert!(false, "fresh write missing"),
            }
        }
    }

    #[test]
    fn prop_delete_is_final(
        keys in prop::collection::vec(any::<u8>(), 1..50),
        size in 1usize..200,
    ) {
        let cache = tight_cache(2);
        for key in keys {
            let k = key.to_string();
            cache.put("t", &k, value_for(key, size)).unwrap();
            cache.delete("t", &k);
            prop_assert_eq!(cache.get("t", &k), Lookup::Miss);
            prop_assert!(!cache.contains("t", &k));
        }
    }
}
