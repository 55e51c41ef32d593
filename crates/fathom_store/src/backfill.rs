//! Backfill: streaming a point-in-time snapshot of a region between replicas.
//!
//! The producer side walks each sub-region of the start point in parallel,
//! packaging every traversal event into a `BackfillChunk` and pushing it
//! through a pluggable `ChunkSink`. The sink blocks on downstream
//! backpressure and loses that race to the interruptor, which keeps the whole
//! pipeline promptly cancellable.
//!
//! Ordering contract: within one sub-region chunks arrive in traversal order;
//! across sub-regions they interleave arbitrarily. Consumers must not assume
//! a global order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::Interruptor;
use crate::engine::{BackfillCallback, Recency, StateTimestamp, StoreEngine};
use crate::error::ProtocolError;
use crate::eval::Value;
use crate::keys::{KeyRange, StoreKey};
use crate::region::{monokey_region, region_intersection, region_is_empty, region_is_superset,
                    Region};

/// Upper bound on concurrently traversing sub-regions within one backfill.
const BACKFILL_CONCURRENCY: usize = 16;

/// Tuning for the channel-backed chunk sink.
#[derive(Clone, Copy, Debug)]
pub struct BackfillConfig {
    /// Chunks buffered between producer and transport before the producer
    /// blocks.
    pub chunk_queue_depth: usize,
}

impl Default for BackfillConfig {
    fn default() -> BackfillConfig {
        BackfillConfig {
            chunk_queue_depth: 64,
        }
    }
}

/// One live key/value carried by a backfill.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackfillAtom {
    pub key: StoreKey,
    pub value: Value,
    pub recency: Recency,
}

/// One unit of backfill traffic, produced in traversal order and consumed
/// once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BackfillChunk {
    DeleteKey { key: StoreKey, recency: Recency },
    DeleteRange { range: Region },
    KeyValuePair { atom: BackfillAtom },
}

impl BackfillChunk {
    pub fn delete_key(key: StoreKey, recency: Recency) -> BackfillChunk {
        BackfillChunk::DeleteKey { key, recency }
    }

    pub fn delete_range(range: Region) -> BackfillChunk {
        BackfillChunk::DeleteRange { range }
    }

    pub fn set_key(atom: BackfillAtom) -> BackfillChunk {
        BackfillChunk::KeyValuePair { atom }
    }

    /// The region this chunk affects: monokey for single-key chunks, the
    /// carried range for range deletions.
    pub fn get_region(&self) -> Region {
        match self {
            BackfillChunk::DeleteKey { key, .. } => monokey_region(key),
            BackfillChunk::DeleteRange { range } => range.clone(),
            BackfillChunk::KeyValuePair { atom } => monokey_region(&atom.key),
        }
    }

    /// The engine timestamp this chunk applies at; range deletions carry
    /// none.
    pub fn recency(&self) -> Recency {
        match self {
            BackfillChunk::DeleteKey { recency, .. } => *recency,
            BackfillChunk::DeleteRange { .. } => Recency::INVALID,
            BackfillChunk::KeyValuePair { atom } => atom.recency,
        }
    }

    /// Restrict this chunk to `region`. Single-key chunks must already be
    /// inside it; a range deletion narrows to the intersection, which must
    /// be non-empty.
    pub fn shard(&self, region: &Region) -> BackfillChunk {
        match self {
            BackfillChunk::DeleteKey { .. } | BackfillChunk::KeyValuePair { .. } => {
                debug_assert!(region_is_superset(region, &self.get_region()));
                self.clone()
            }
            BackfillChunk::DeleteRange { range } => {
                let narrowed = region_intersection(range, region);
                debug_assert!(!region_is_empty(&narrowed));
                BackfillChunk::DeleteRange { range: narrowed }
            }
        }
    }
}

/// Downstream receiver of backfill chunks. `send_chunk` blocks until the
/// downstream is ready or the interruptor fires.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(
        &self,
        chunk: BackfillChunk,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError>;
}

/// `ChunkSink` backed by a bounded channel; the transport drains the
/// receiving half.
pub struct ChannelChunkSink {
    tx: mpsc::Sender<BackfillChunk>,
}

impl ChannelChunkSink {
    pub fn new(config: &BackfillConfig) -> (ChannelChunkSink, mpsc::Receiver<BackfillChunk>) {
        let (tx, rx) = mpsc::channel(config.chunk_queue_depth.max(1));
        (ChannelChunkSink { tx }, rx)
    }
}

#[async_trait]
impl ChunkSink for ChannelChunkSink {
    async fn send_chunk(
        &self,
        chunk: BackfillChunk,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError> {
        tokio::select! {
            _ = interruptor.cancelled() => Err(ProtocolError::Interrupted),
            sent = self.tx.send(chunk) => sent.map_err(|_| {
                warn!("backfill chunk receiver dropped mid-stream");
                ProtocolError::Interrupted
            }),
        }
    }
}

/// Progress of one sub-region traversal, updated lock-free by the engine.
#[derive(Debug, Default)]
pub struct TraversalProgress {
    objects_done: AtomicU64,
    objects_total: AtomicU64,
}

impl TraversalProgress {
    pub fn add_total(&self, objects: u64) {
        self.objects_total.fetch_add(objects, Ordering::Relaxed);
    }

    pub fn record_done(&self, objects: u64) {
        self.objects_done.fetch_add(objects, Ordering::Relaxed);
    }

    pub fn done(&self) -> u64 {
        self.objects_done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.objects_total.load(Ordering::Relaxed)
    }
}

/// Aggregate progress over all sub-region traversals of one backfill. Each
/// parallel worker attaches its own constituent tracker.
#[derive(Debug, Default)]
pub struct BackfillProgress {
    constituents: Mutex<Vec<Arc<TraversalProgress>>>,
}

impl BackfillProgress {
    pub fn add_constituent(&self, constituent: Arc<TraversalProgress>) {
        self.constituents
            .lock()
            .expect("backfill progress lock poisoned")
            .push(constituent);
    }

    /// Best-effort completion estimate in `[0, 1]`; zero until any
    /// constituent reports a total.
    pub fn guess_completion(&self) -> f64 {
        let constituents = self
            .constituents
            .lock()
            .expect("backfill progress lock poisoned");
        let mut done = 0u64;
        let mut total = 0u64;
        for c in constituents.iter() {
            done += c.done();
            total += c.total();
        }
        if total == 0 {
            0.0
        } else {
            done as f64 / total as f64
        }
    }
}

/// Shares one superblock across the parallel sub-region workers. Built with
/// the worker cardinality up front; each worker holds a `SuperblockRef`
/// guard whose drop releases one reference on every exit path.
pub struct RefcountedSuperblock<'a, S> {
    superblock: &'a S,
    outstanding: AtomicUsize,
}

impl<'a, S> RefcountedSuperblock<'a, S> {
    pub fn new(superblock: &'a S, cardinality: usize) -> RefcountedSuperblock<'a, S> {
        RefcountedSuperblock {
            superblock,
            outstanding: AtomicUsize::new(cardinality),
        }
    }

    /// Take one of the preallocated references. Call at most `cardinality`
    /// times.
    pub fn acquire(&self) -> SuperblockRef<'_, 'a, S> {
        SuperblockRef { holder: self }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn release(&self) {
        let prev = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "released more superblock refs than acquired");
    }
}

/// One worker's logical reference to the shared superblock.
pub struct SuperblockRef<'h, 'a, S> {
    holder: &'h RefcountedSuperblock<'a, S>,
}

impl<'h, 'a, S> SuperblockRef<'h, 'a, S> {
    pub fn superblock(&self) -> &'a S {
        self.holder.superblock
    }
}

impl<S> Drop for SuperblockRef<'_, '_, S> {
    fn drop(&mut self) {
        self.holder.release();
    }
}

/// Packages engine traversal events into chunks and forwards them to the
/// sink.
struct ChunkPackager<'a> {
    sink: &'a dyn ChunkSink,
}

#[async_trait]
impl BackfillCallback for ChunkPackager<'_> {
    async fn on_delete_range(
        &self,
        range: &KeyRange,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError> {
        self.sink
            .send_chunk(
                BackfillChunk::delete_range(Region::from_key_range(range.clone())),
                interruptor,
            )
            .await
    }

    async fn on_deletion(
        &self,
        key: &StoreKey,
        recency: Recency,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError> {
        self.sink
            .send_chunk(BackfillChunk::delete_key(key.clone(), recency), interruptor)
            .await
    }

    async fn on_keyvalue(
        &self,
        atom: &BackfillAtom,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError> {
        self.sink
            .send_chunk(BackfillChunk::set_key(atom.clone()), interruptor)
            .await
    }
}

/// Stream a snapshot of every sub-region in `start_point` through `sink`.
///
/// One worker runs per sub-region, all sharing the caller's superblock via a
/// refcount holder. A worker that observes the interruptor returns quietly;
/// after all workers join, a pulsed interruptor is re-raised here so the
/// caller always sees `Interrupted` even when every worker swallowed it. Any
/// other worker fault propagates (first in sub-region order).
pub async fn send_backfill<E: StoreEngine>(
    engine: &E,
    start_point: &[(Region, StateTimestamp)],
    sink: &dyn ChunkSink,
    txn: &E::Txn,
    superblock: &E::Superblock,
    progress: &BackfillProgress,
    interruptor: &Interruptor,
) -> Result<(), ProtocolError> {
    info!(sub_regions = start_point.len(), "backfill send starting");
    let callback = ChunkPackager { sink };
    let refcount = RefcountedSuperblock::new(superblock, start_point.len());

    let workers = start_point.iter().map(|(region, timestamp)| {
        let sub = refcount.acquire();
        let callback = &callback;
        async move {
            let worker_progress = Arc::new(TraversalProgress::default());
            progress.add_constituent(Arc::clone(&worker_progress));
            let result = engine
                .backfill(
                    txn,
                    sub.superblock(),
                    &region.inner,
                    timestamp.to_recency(),
                    callback,
                    &worker_progress,
                    interruptor,
                )
                .await;
            drop(sub);
            match result {
                // Swallow the interruption here; the producer re-checks the
                // signal once every worker has joined.
                Err(ProtocolError::Interrupted) => {
                    debug!("backfill worker interrupted");
                    Ok(())
                }
                other => other,
            }
        }
    });
    let results: Vec<Result<(), ProtocolError>> = futures_util::stream::iter(workers)
        .buffered(BACKFILL_CONCURRENCY)
        .collect()
        .await;

    debug_assert_eq!(refcount.outstanding(), 0);
    for result in results {
        result?;
    }
    if interruptor.is_pulsed() {
        info!("backfill send interrupted");
        return Err(ProtocolError::Interrupted);
    }
    info!("backfill send finished");
    Ok(())
}
