//! Region algebra: hash-band × key-range rectangles.
//!
//! A region pairs a half-open band of the 64-bit hash space with a key range.
//! Point operations live in a single hash cell (`monokey_region`); range
//! operations span the full hash universe and shard along the key dimension;
//! CPU sharding partitions the hash dimension into contiguous bands.

use std::hash::Hasher;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::keys::{KeyRange, StoreKey};

/// Size of the hash space. A power of two, so hashes mask in exactly.
pub const HASH_SIZE: u64 = 1 << 63;

/// Deterministic hash of a key's bytes into `[0, HASH_SIZE)`.
///
/// Replicas on different machines must agree on placement, so this must stay
/// stable across builds and platforms.
pub fn hash_store_key(key: &StoreKey) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key.as_slice());
    hasher.finish() & (HASH_SIZE - 1)
}

/// A hash-band × key-range rectangle over which operations are defined.
///
/// The hash band is `[beg, end)`; `inner` is the key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub beg: u64,
    pub end: u64,
    pub inner: KeyRange,
}

impl Region {
    pub fn new(beg: u64, end: u64, inner: KeyRange) -> Region {
        Region { beg, end, inner }
    }

    /// A region spanning the full hash universe over `inner`. This is the
    /// region of key-sharded operations such as range reads.
    pub fn from_key_range(inner: KeyRange) -> Region {
        Region {
            beg: 0,
            end: HASH_SIZE,
            inner,
        }
    }

    pub fn universe() -> Region {
        Region::from_key_range(KeyRange::universe())
    }

    pub fn contains_key(&self, key: &StoreKey) -> bool {
        let h = hash_store_key(key);
        self.beg <= h && h < self.end && self.inner.contains_key(key)
    }
}

/// The region containing exactly `key`: its single hash cell crossed with
/// the closed singleton key range.
pub fn monokey_region(key: &StoreKey) -> Region {
    let h = hash_store_key(key);
    Region {
        beg: h,
        end: h + 1,
        inner: KeyRange::new(
            std::ops::Bound::Included(key.clone()),
            std::ops::Bound::Included(key.clone()),
        ),
    }
}

/// Hash band `subregion` of `num_cpu_shards` equal partitions of the hash
/// dimension, crossed with the key universe.
///
/// The last band absorbs the division remainder so the union of all bands is
/// exactly `[0, HASH_SIZE)`; computing `width * num_cpu_shards` instead would
/// truncate the space.
pub fn cpu_sharding_subspace(subregion: usize, num_cpu_shards: usize) -> Region {
    debug_assert!(num_cpu_shards > 0);
    debug_assert!(subregion < num_cpu_shards);

    let width = HASH_SIZE / num_cpu_shards as u64;
    let beg = width * subregion as u64;
    let end = if subregion + 1 == num_cpu_shards {
        HASH_SIZE
    } else {
        beg + width
    };
    Region {
        beg,
        end,
        inner: KeyRange::universe(),
    }
}

pub fn region_is_empty(region: &Region) -> bool {
    region.beg >= region.end || region.inner.is_empty()
}

/// True when every point of `inner` is also in `outer`.
pub fn region_is_superset(outer: &Region, inner: &Region) -> bool {
    if region_is_empty(inner) {
        return true;
    }
    outer.beg <= inner.beg && inner.end <= outer.end && outer.inner.is_superset(&inner.inner)
}

pub fn region_intersection(a: &Region, b: &Region) -> Region {
    Region {
        beg: a.beg.max(b.beg),
        end: a.end.min(b.end),
        inner: a.inner.intersection(&b.inner),
    }
}
