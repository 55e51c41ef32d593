//! Store keys and lexicographic key ranges.
//!
//! Keys are opaque byte strings with a bounded length and a total
//! lexicographic order. Ranges are normalized to left-closed/right-open form
//! (`right = None` means unbounded); the endpoint-bound constructor accepts
//! independently open/closed endpoints and performs the normalization.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum key length in bytes. Longer keys are rejected at the boundary.
pub const MAX_KEY_SIZE: usize = 250;

/// An opaque store key: a bounded byte string ordered lexicographically.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    /// Build a key from raw bytes.
    ///
    /// Panics if `bytes` exceeds `MAX_KEY_SIZE`; callers validate client
    /// input before keys enter the dispatch layer.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        assert!(
            bytes.len() <= MAX_KEY_SIZE,
            "store key exceeds {MAX_KEY_SIZE} bytes"
        );
        StoreKey(bytes)
    }

    /// The smallest key (the empty byte string).
    pub fn min() -> Self {
        StoreKey(Vec::new())
    }

    /// The largest representable key: `MAX_KEY_SIZE` bytes of `0xff`.
    pub fn max() -> Self {
        StoreKey(vec![0xff; MAX_KEY_SIZE])
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The smallest key strictly greater than `self`, or `None` when `self`
    /// is already the largest representable key.
    pub fn successor(&self) -> Option<StoreKey> {
        if self.0.len() < MAX_KEY_SIZE {
            let mut bytes = self.0.clone();
            bytes.push(0x00);
            return Some(StoreKey(bytes));
        }
        // At maximum length the successor drops the trailing 0xff run and
        // bumps the last non-0xff byte.
        let mut bytes = self.0.clone();
        while let Some(&last) = bytes.last() {
            if last == 0xff {
                bytes.pop();
            } else {
                *bytes.last_mut().unwrap() = last + 1;
                return Some(StoreKey(bytes));
            }
        }
        None
    }

    /// The largest key strictly smaller than `self`, or `None` for the empty
    /// key (which has no predecessor).
    pub fn decrement(&self) -> Option<StoreKey> {
        let mut bytes = self.0.clone();
        let last = *bytes.last()?;
        if last == 0x00 {
            bytes.pop();
            return Some(StoreKey(bytes));
        }
        *bytes.last_mut().unwrap() = last - 1;
        bytes.resize(MAX_KEY_SIZE, 0xff);
        Some(StoreKey(bytes))
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&[u8]> for StoreKey {
    fn from(bytes: &[u8]) -> Self {
        StoreKey::new(bytes.to_vec())
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        StoreKey::new(s.as_bytes().to_vec())
    }
}

// Keys serialize as lowercase hex so they are legal JSON map keys in the
// cluster wire layer (`DistributionReadResponse::key_counts`).
impl Serialize for StoreKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for StoreKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(D::Error::custom)?;
        if bytes.len() > MAX_KEY_SIZE {
            return Err(D::Error::custom("store key exceeds maximum length"));
        }
        Ok(StoreKey(bytes))
    }
}

/// A half-open key interval `[left, right)`; `right = None` is unbounded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: StoreKey,
    pub right: Option<StoreKey>,
}

impl KeyRange {
    /// Build a range from arbitrary endpoint bounds, normalizing to the
    /// left-closed/right-open representation.
    pub fn new(left: Bound<StoreKey>, right: Bound<StoreKey>) -> KeyRange {
        let left = match left {
            Bound::Included(k) => k,
            // An open left bound starts just past the key; when no successor
            // exists the range is empty and collapses below.
            Bound::Excluded(k) => match k.successor() {
                Some(next) => next,
                None => return KeyRange::empty(),
            },
            Bound::Unbounded => StoreKey::min(),
        };
        let right = match right {
            Bound::Excluded(k) => Some(k),
            // A closed right bound ends just past the key; no successor means
            // the range runs to the top of the keyspace.
            Bound::Included(k) => k.successor(),
            Bound::Unbounded => None,
        };
        KeyRange { left, right }
    }

    /// The whole keyspace.
    pub fn universe() -> KeyRange {
        KeyRange {
            left: StoreKey::min(),
            right: None,
        }
    }

    /// A canonical empty range.
    pub fn empty() -> KeyRange {
        KeyRange {
            left: StoreKey::min(),
            right: Some(StoreKey::min()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.right {
            Some(right) => self.left >= *right,
            None => false,
        }
    }

    pub fn contains_key(&self, key: &StoreKey) -> bool {
        *key >= self.left
            && match &self.right {
                Some(right) => *key < *right,
                None => true,
            }
    }

    /// True when every key in `other` is also in `self`.
    pub fn is_superset(&self, other: &KeyRange) -> bool {
        if other.is_empty() {
            return true;
        }
        if self.left > other.left {
            return false;
        }
        match (&self.right, &other.right) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(ours), Some(theirs)) => *theirs <= *ours,
        }
    }

    pub fn intersection(&self, other: &KeyRange) -> KeyRange {
        let left = self.left.clone().max(other.left.clone());
        let right = match (&self.right, &other.right) {
            (None, None) => None,
            (Some(r), None) | (None, Some(r)) => Some(r.clone()),
            (Some(a), Some(b)) => Some(a.clone().min(b.clone())),
        };
        let range = KeyRange { left, right };
        if range.is_empty() {
            KeyRange::empty()
        } else {
            range
        }
    }

    /// The largest key logically inside the range. This is the initial
    /// `last_considered_key` watermark for hash-sharded stream merges.
    ///
    /// Falls back to the smallest key for an empty range; the watermark of an
    /// empty scan is never consulted.
    pub fn last_key(&self) -> StoreKey {
        match &self.right {
            None => StoreKey::max(),
            Some(right) => right.decrement().unwrap_or_else(StoreKey::min),
        }
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.right {
            Some(right) => write!(f, "[{:?}, {:?})", self.left, right),
            None => write!(f, "[{:?}, +inf)", self.left),
        }
    }
}

// Total order used to canonicalize shard responses: by left endpoint, then
// by right endpoint with unbounded sorting last.
impl Ord for KeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.left.cmp(&other.left).then_with(|| {
            match (&self.right, &other.right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            }
        })
    }
}

impl PartialOrd for KeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
