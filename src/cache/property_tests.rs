//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the cache against a simple map model, with a manual
//! clock so expiry is deterministic.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheOptions, TtlCache};
use crate::clock::ManualClock;
use crate::error::CacheError;
use crate::mem::{AllocFlags, Allocator};

// == Test Configuration ==
const TEST_MAX_ENTRIES: usize = 100;

fn test_cache(max_entries: usize) -> (TtlCache<String>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let options = CacheOptions {
        max_entries,
        default_ttl: None,
        btree_order: 4,
        value_flags: AllocFlags::DEFAULT,
    };
    (TtlCache::with_options(options, Allocator::new(), clock.clone()), clock)
}

// == Strategies ==
/// Generates cache keys from a small alphabet so operations collide
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-e]{1,2}"
}

fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Generates a sequence of cache operations for testing
#[derive(Debug, Clone)]
enum CacheOp {
    Put { key: String, value: Vec<u8>, ttl_ms: Option<u64> },
    Get { key: String },
    Delete { key: String },
    Advance { ms: u64 },
    Sweep,
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        4 => (key_strategy(), value_strategy(), prop::option::of(0u64..200))
            .prop_map(|(key, value, ttl_ms)| CacheOp::Put { key, value, ttl_ms }),
        3 => key_strategy().prop_map(|key| CacheOp::Get { key }),
        1 => key_strategy().prop_map(|key| CacheOp::Delete { key }),
        1 => (0u64..100).prop_map(|ms| CacheOp::Advance { ms }),
        1 => Just(CacheOp::Sweep),
    ]
}

/// Model entry: value and absolute expiry
type Model = BTreeMap<String, (Vec<u8>, Option<u64>)>;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // **Property 1: Model Agreement**
    // *For any* sequence of puts, gets, deletes, clock advances and sweeps,
    // every get reports the same value, `Expired` or `NotFound` as a plain
    // map model, and both indexes stay consistent.
    #[test]
    fn prop_model_agreement(ops in prop::collection::vec(cache_op_strategy(), 1..120)) {
        let (cache, clock) = test_cache(TEST_MAX_ENTRIES);
        let mut model: Model = BTreeMap::new();
        let mut now = 0u64;

        for op in ops {
            match op {
                CacheOp::Put { key, value, ttl_ms } => {
                    cache.put(key.clone(), &value, ttl_ms.map(Duration::from_millis)).unwrap();
                    model.insert(key, (value, ttl_ms.map(|ttl| now + ttl)));
                }
                CacheOp::Get { key } => {
                    let expected = match model.get(&key) {
                        None => Err(CacheError::NotFound(key.clone())),
                        Some((_, Some(expires))) if now >= *expires => Err(CacheError::Expired(key.clone())),
                        Some((value, _)) => Ok(value.clone()),
                    };
                    prop_assert_eq!(cache.get(key.as_str()), expected);
                }
                CacheOp::Delete { key } => {
                    let expected = match model.remove(&key) {
                        Some(_) => Ok(()),
                        None => Err(CacheError::NotFound(key.clone())),
                    };
                    prop_assert_eq!(cache.delete(key.as_str()), expected);
                }
                CacheOp::Advance { ms } => {
                    now += ms;
                    clock.advance(Duration::from_millis(ms));
                }
                CacheOp::Sweep => {
                    let before = model.len();
                    model.retain(|_, (_, expires)| expires.map_or(true, |e| now < e));
                    prop_assert_eq!(cache.sweep_expired(), before - model.len());
                }
            }
            prop_assert_eq!(cache.len(), model.len());
            prop_assert!(cache.check_invariants().is_ok());
        }

        // Live storage matches the entries still indexed.
        prop_assert_eq!(cache.allocator().stats().live_allocations, model.len());
    }

    // **Property 2: Statistics Accuracy**
    // *For any* sequence of cache operations, hits and misses reflect the
    // outcome of every get.
    #[test]
    fn prop_statistics_accuracy(ops in prop::collection::vec(cache_op_strategy(), 1..50)) {
        let (cache, clock) = test_cache(TEST_MAX_ENTRIES);
        let mut expected_hits: u64 = 0;
        let mut expected_misses: u64 = 0;

        for op in ops {
            match op {
                CacheOp::Put { key, value, ttl_ms } => {
                    let _ = cache.put(key, &value, ttl_ms.map(Duration::from_millis));
                }
                CacheOp::Get { key } => match cache.get(key.as_str()) {
                    Ok(_) => expected_hits += 1,
                    Err(_) => expected_misses += 1,
                },
                CacheOp::Delete { key } => {
                    let _ = cache.delete(key.as_str());
                }
                CacheOp::Advance { ms } => clock.advance(Duration::from_millis(ms)),
                CacheOp::Sweep => {
                    cache.sweep_expired();
                }
            }
        }

        let stats = cache.stats();
        prop_assert_eq!(stats.hits, expected_hits, "Hits mismatch");
        prop_assert_eq!(stats.misses, expected_misses, "Misses mismatch");
        prop_assert_eq!(stats.total_entries, cache.len(), "Total entries mismatch");
    }

    // **Property 3: Overwrite Semantics**
    // *For any* key, storing V1 then V2 returns V2, keeps one entry and
    // frees the storage of V1 exactly once.
    #[test]
    fn prop_overwrite_semantics(
        key in key_strategy(),
        value1 in value_strategy(),
        value2 in value_strategy()
    ) {
        let (cache, _) = test_cache(TEST_MAX_ENTRIES);

        cache.put(key.clone(), &value1, None).unwrap();
        let first = cache.entry_handle(key.as_str()).unwrap();
        cache.put(key.clone(), &value2, None).unwrap();

        prop_assert_eq!(cache.get(key.as_str()).unwrap(), value2);
        prop_assert_eq!(cache.len(), 1);

        let freed: Vec<_> = cache
            .allocator()
            .inspect_dirty_pointers()
            .filter(|snapshot| snapshot.handle == first)
            .collect();
        prop_assert_eq!(freed.len(), 1);
        prop_assert_eq!(cache.allocator().stats().total_frees, 1);
    }

    // **Property 4: Capacity Enforcement**
    // *For any* sequence of puts, the number of entries never exceeds
    // `max_entries`.
    #[test]
    fn prop_capacity_enforcement(
        entries in prop::collection::vec(("[a-z]{1,6}", value_strategy()), 1..200)
    ) {
        let max_entries = 20;
        let (cache, _) = test_cache(max_entries);

        for (key, value) in entries {
            cache.put(key, &value, None).unwrap();
            prop_assert!(
                cache.len() <= max_entries,
                "Cache size {} exceeds max {}",
                cache.len(),
                max_entries
            );
        }
        prop_assert_eq!(cache.allocator().stats().live_allocations, cache.len());
    }

    // **Property 5: Eviction Order**
    // *For any* set of distinct keys with distinct TTLs filling the cache, the
    // next new key evicts the entry with the nearest expiry.
    #[test]
    fn prop_eviction_order(
        keys in prop::collection::hash_set("[a-z]{3,8}", 2..10),
        new_key in "[A-Z]{3,8}"
    ) {
        let keys: Vec<String> = keys.into_iter().collect();
        let (cache, _) = test_cache(keys.len());

        // Reverse TTL order: the last key inserted expires first.
        for (i, key) in keys.iter().enumerate() {
            let ttl = Duration::from_secs(1000 - i as u64);
            cache.put(key.clone(), b"v", Some(ttl)).unwrap();
        }
        let nearest = keys.last().cloned().unwrap();

        cache.put(new_key.clone(), b"n", None).unwrap();

        prop_assert_eq!(cache.len(), keys.len());
        prop_assert!(matches!(cache.get(nearest.as_str()), Err(CacheError::NotFound(_))));
        prop_assert!(cache.get(new_key.as_str()).is_ok());
        for key in &keys[..keys.len() - 1] {
            prop_assert!(cache.get(key.as_str()).is_ok(), "Key '{}' should remain", key);
        }
    }

    // **Property 6: Ordered Range**
    // *For any* set of keys, a full range returns every unexpired key in
    // strictly increasing order.
    #[test]
    fn prop_range_ordered(keys in prop::collection::vec("[a-z]{1,5}", 1..60)) {
        let (cache, _) = test_cache(TEST_MAX_ENTRIES);
        for key in &keys {
            cache.put(key.clone(), key.as_bytes(), None).unwrap();
        }

        let entries = cache.range::<str, _>(..).unwrap();
        let distinct: HashSet<&String> = keys.iter().collect();
        prop_assert_eq!(entries.len(), distinct.len());
        prop_assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
        for (key, value) in &entries {
            prop_assert_eq!(key.as_bytes(), value.as_slice());
        }
    }
}

// == Property Test for Concurrent Operation Correctness ==
proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    // **Property 7: Concurrent Operation Correctness**
    // *For any* set of concurrent puts and gets, every read returns a complete
    // value written by some put, never a torn or freed one.
    #[test]
    fn prop_concurrent_reads_see_whole_values(
        writes in prop::collection::vec((key_strategy(), 1u8..=255), 10..60)
    ) {
        let (cache, _) = test_cache(TEST_MAX_ENTRIES);
        let cache = Arc::new(cache);

        std::thread::scope(|scope| {
            for chunk in writes.chunks(10) {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for (key, byte) in chunk {
                        cache.put(key.clone(), &[*byte; 32], None).unwrap();
                        if let Ok(value) = cache.get(key.as_str()) {
                            assert_eq!(value.len(), 32);
                            assert!(value.iter().all(|b| *b == value[0]));
                        }
                    }
                });
            }
        });

        prop_assert!(cache.check_invariants().is_ok());
        prop_assert_eq!(cache.allocator().stats().live_allocations, cache.len());
    }
}
