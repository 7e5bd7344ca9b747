//! Adaptive applied-key tracker: records which source keys have been written
//! during a rewrite pass. The tier is picked once from the estimated source
//! cardinality; lookups and inserts are O(1) expected in every tier.
//!
//! Exactness: the exact tier always answers precisely; the LRU tier is exact
//! until its first eviction; the Bloom tier answers "possibly applied" with a
//! configurable false-positive rate. Callers that need precision after an
//! inexact tracker must re-confirm against the rewritten outputs.

use log::debug;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;

/// Largest cardinality handled by the exact tier (T1).
pub const EXACT_TIER_MAX_KEYS: usize = 100_000;
/// Largest cardinality handled by the bounded LRU tier (T2).
pub const LRU_TIER_MAX_KEYS: usize = 2_000_000;
/// False-positive rate of the Bloom tier unless overridden.
pub const DEFAULT_BLOOM_FPR: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerTier {
    Exact,
    BoundedLru,
    Bloom,
}

impl TrackerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerTier::Exact => "exact",
            TrackerTier::BoundedLru => "lru",
            TrackerTier::Bloom => "bloom",
        }
    }
}

struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    hashes: u32,
}

impl BloomFilter {
    fn with_capacity(expected_keys: usize, fpr: f64) -> Self {
        let n = expected_keys.max(1) as f64;
        let p = fpr.clamp(1e-6, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = m.next_multiple_of(64).max(64);
        let hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, 16.0) as u32;
        BloomFilter {
            bits: vec![0u64; (num_bits / 64) as usize],
            num_bits,
            hashes,
        }
    }

    fn bit_positions(&self, key: u128) -> impl Iterator<Item = u64> + '_ {
        let h1 = key as u64;
        let h2 = ((key >> 64) as u64) | 1;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    fn insert(&mut self, key: u128) {
        let positions: Vec<u64> = self.bit_positions(key).collect();
        for bit in positions {
            self.bits[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    fn contains(&self, key: u128) -> bool {
        self.bit_positions(key)
            .all(|bit| self.bits[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }
}

/// Tiered set of applied key hashes, sized once at construction.
pub struct KeyTracker {
    tier: TrackerTier,
    exact: HashSet<u128>,
    lru: Option<LruCache<u128, ()>>,
    bloom: Option<BloomFilter>,
    evictions: u64,
}

impl KeyTracker {
    /// Pick a tier from the estimated key cardinality.
    pub fn for_estimate(estimated_keys: usize, bloom_fpr: f64) -> Self {
        if estimated_keys <= EXACT_TIER_MAX_KEYS {
            KeyTracker {
                tier: TrackerTier::Exact,
                exact: HashSet::with_capacity(estimated_keys),
                lru: None,
                bloom: None,
                evictions: 0,
            }
        } else if estimated_keys <= LRU_TIER_MAX_KEYS {
            let cap = NonZeroUsize::new(LRU_TIER_MAX_KEYS).unwrap();
            KeyTracker {
                tier: TrackerTier::BoundedLru,
                exact: HashSet::new(),
                lru: Some(LruCache::new(cap)),
                bloom: None,
                evictions: 0,
            }
        } else {
            KeyTracker {
                tier: TrackerTier::Bloom,
                exact: HashSet::new(),
                lru: None,
                bloom: Some(BloomFilter::with_capacity(estimated_keys, bloom_fpr)),
                evictions: 0,
            }
        }
    }

    /// Record a key as applied.
    pub fn mark(&mut self, key: u128) {
        match self.tier {
            TrackerTier::Exact => {
                self.exact.insert(key);
            }
            TrackerTier::BoundedLru => {
                let lru = self.lru.as_mut().unwrap();
                if lru.len() == lru.cap().get() && !lru.contains(&key) {
                    self.evictions += 1;
                    if self.evictions == 1 {
                        debug!("key tracker LRU tier started evicting; answers are no longer exact");
                    }
                }
                lru.put(key, ());
            }
            TrackerTier::Bloom => {
                self.bloom.as_mut().unwrap().insert(key);
            }
        }
    }

    /// Whether a key was applied. On the Bloom tier (and on the LRU tier
    /// after evictions) a `true` means "possibly".
    pub fn contains(&self, key: u128) -> bool {
        match self.tier {
            TrackerTier::Exact => self.exact.contains(&key),
            TrackerTier::BoundedLru => self.lru.as_ref().unwrap().contains(&key),
            TrackerTier::Bloom => self.bloom.as_ref().unwrap().contains(key),
        }
    }

    /// True while every answer from `contains` is precise.
    pub fn is_exact(&self) -> bool {
        match self.tier {
            TrackerTier::Exact => true,
            TrackerTier::BoundedLru => self.evictions == 0,
            TrackerTier::Bloom => false,
        }
    }

    pub fn tier(&self) -> TrackerTier {
        self.tier
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_tier_from_estimate() {
        assert_eq!(KeyTracker::for_estimate(10, 0.01).tier(), TrackerTier::Exact);
        assert_eq!(
            KeyTracker::for_estimate(EXACT_TIER_MAX_KEYS + 1, 0.01).tier(),
            TrackerTier::BoundedLru
        );
        assert_eq!(
            KeyTracker::for_estimate(LRU_TIER_MAX_KEYS + 1, 0.01).tier(),
            TrackerTier::Bloom
        );
    }

    #[test]
    fn exact_tier_round_trip() {
        let mut tracker = KeyTracker::for_estimate(100, 0.01);
        tracker.mark(42);
        assert!(tracker.contains(42));
        assert!(!tracker.contains(43));
        assert!(tracker.is_exact());
    }

    #[test]
    fn bloom_tier_has_no_false_negatives() {
        let mut tracker = KeyTracker::for_estimate(LRU_TIER_MAX_KEYS + 1, 0.01);
        for key in 0..1000u128 {
            tracker.mark(key * 7919);
        }
        for key in 0..1000u128 {
            assert!(tracker.contains(key * 7919));
        }
        assert!(!tracker.is_exact());
    }

    #[test]
    fn bloom_false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::with_capacity(10_000, 0.01);
        for key in 0..10_000u128 {
            filter.insert(key);
        }
        let false_positives = (10_000..30_000u128).filter(|k| filter.contains(*k)).count();
        // 2x headroom over the configured 1%.
        assert!(
            false_positives < 400,
            "false positive count too high: {}",
            false_positives
        );
    }

    #[test]
    fn lru_eviction_flips_exactness() {
        let mut tracker = KeyTracker::for_estimate(EXACT_TIER_MAX_KEYS + 1, 0.01);
        assert!(tracker.is_exact());
        for key in 0..(LRU_TIER_MAX_KEYS as u128 + 1) {
            tracker.mark(key);
        }
        assert_eq!(tracker.evictions(), 1);
        assert!(!tracker.is_exact());
    }
}
