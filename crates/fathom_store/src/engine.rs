//! Contract with the ordered key/value engine.
//!
//! The engine itself (b-tree, transactions, disk) lives outside this crate;
//! the dispatch core drives it through `StoreEngine`. Every call takes the
//! caller's transaction and superblock handles and may suspend on I/O; a
//! pulsed interruptor surfaces as `Interrupted` at the next suspension, and
//! engine faults arrive wrapped as `ProtocolError::Engine`. Timestamps are
//! monotonic per key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backfill::{BackfillAtom, TraversalProgress};
use crate::context::{Interruptor, RuntimeEnv};
use crate::error::ProtocolError;
use crate::keys::{KeyRange, StoreKey};
use crate::read::{DistributionReadResponse, RangeReadResponse};
use crate::region::{hash_store_key, Region};
use crate::term::{Mapping, ModifyOp, Terminal, Transform};
use crate::write::{DeleteResult, ModifyResult, StoreResult};

/// Engine-visible modification timestamp (recency) of a key.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Recency(pub u64);

impl Recency {
    /// Sentinel for chunks that carry no recency (range deletions).
    pub const INVALID: Recency = Recency(u64::MAX);
}

/// A point in the replication state timeline; the backfill floor is derived
/// from it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StateTimestamp(pub u64);

impl StateTimestamp {
    pub fn to_recency(self) -> Recency {
        Recency(self.0)
    }
}

/// Decides which keys an `erase_range` call removes.
pub trait KeyTester: Send + Sync {
    fn key_should_be_erased(&self, key: &StoreKey) -> bool;
}

/// Erases only keys inside the region: hash band and key range both must
/// match. The hash test stays even where the key range alone would do; it
/// guards against residual entries written under an older hashing scheme.
pub struct RangeKeyTester<'a> {
    delete_range: &'a Region,
}

impl<'a> RangeKeyTester<'a> {
    pub fn new(delete_range: &'a Region) -> Self {
        RangeKeyTester { delete_range }
    }
}

impl KeyTester for RangeKeyTester<'_> {
    fn key_should_be_erased(&self, key: &StoreKey) -> bool {
        let h = hash_store_key(key);
        self.delete_range.beg <= h
            && h < self.delete_range.end
            && self.delete_range.inner.contains_key(key)
    }
}

/// Erases everything the traversal offers; used by `protocol_reset_data`.
pub struct AlwaysTrueKeyTester;

impl KeyTester for AlwaysTrueKeyTester {
    fn key_should_be_erased(&self, _key: &StoreKey) -> bool {
        true
    }
}

/// Events delivered by the engine's snapshot traversal during backfill.
///
/// Each delivery may block on downstream backpressure; implementations must
/// lose that race to the interruptor.
#[async_trait]
pub trait BackfillCallback: Send + Sync {
    async fn on_delete_range(
        &self,
        range: &KeyRange,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError>;

    async fn on_deletion(
        &self,
        key: &StoreKey,
        recency: Recency,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError>;

    async fn on_keyvalue(
        &self,
        atom: &BackfillAtom,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError>;
}

/// The ordered key/value engine serving one local slice.
#[async_trait]
pub trait StoreEngine: Send + Sync {
    /// Opaque transaction handle; the caller acquires and owns it.
    type Txn: Send + Sync;
    /// Opaque handle to the transaction's root block.
    type Superblock: Send + Sync;

    async fn get(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        key: &StoreKey,
    ) -> Result<Option<serde_json::Value>, ProtocolError>;

    async fn set(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        key: &StoreKey,
        value: &serde_json::Value,
        recency: Recency,
    ) -> Result<StoreResult, ProtocolError>;

    async fn delete(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        key: &StoreKey,
        recency: Recency,
    ) -> Result<DeleteResult, ProtocolError>;

    /// Apply `mapping` to the document at `key` under `op` semantics.
    /// Evaluator failures are reported inside `ModifyResult`, not as engine
    /// faults.
    #[allow(clippy::too_many_arguments)]
    async fn modify(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        primary_key: &str,
        key: &StoreKey,
        op: ModifyOp,
        env: &mut RuntimeEnv,
        mapping: &Mapping,
        recency: Recency,
    ) -> Result<ModifyResult, ProtocolError>;

    /// Scan `range` in key order, at most `max_rows` rows, feeding each row
    /// through `transforms` and folding into `terminal` when present. The
    /// response's `result` carries a `RuntimeError` value when evaluation
    /// fails; engine faults are still `EngineError`.
    #[allow(clippy::too_many_arguments)]
    async fn rget_slice(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        range: &KeyRange,
        max_rows: usize,
        env: &mut RuntimeEnv,
        transforms: &[Transform],
        terminal: Option<&Terminal>,
    ) -> Result<RangeReadResponse, ProtocolError>;

    /// Sampled key-count histogram starting at `left`, descending at most
    /// `max_depth` levels. May overshoot the caller's range; the executor
    /// filters.
    async fn distribution_get(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        max_depth: u32,
        left: &StoreKey,
    ) -> Result<DistributionReadResponse, ProtocolError>;

    async fn erase_range(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        tester: &(dyn KeyTester + '_),
        range: &KeyRange,
    ) -> Result<(), ProtocolError>;

    /// Traverse a snapshot of `range`, reporting every key at or above
    /// `recency_floor` (and deletions since it) to `callback` in traversal
    /// order. Observes `interruptor` at each suspension.
    #[allow(clippy::too_many_arguments)]
    async fn backfill(
        &self,
        txn: &Self::Txn,
        superblock: &Self::Superblock,
        range: &KeyRange,
        recency_floor: Recency,
        callback: &(dyn BackfillCallback + '_),
        progress: &TraversalProgress,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError>;
}
