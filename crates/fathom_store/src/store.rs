//! Local execution of operations against this node's slice of the keyspace.
//!
//! A `Store` runs on one worker thread inside transactions the caller
//! acquires; it never opens transactions itself. Reads and writes translate
//! one operation into the matching engine call; the backfill entry points
//! delegate to the producer in `crate::backfill` and apply received chunks.

use std::sync::Arc;

use tracing::debug;

use crate::backfill::{self, BackfillChunk, BackfillProgress, ChunkSink};
use crate::context::{Context, Interruptor};
use crate::engine::{AlwaysTrueKeyTester, RangeKeyTester, Recency, StateTimestamp, StoreEngine};
use crate::error::ProtocolError;
use crate::read::{PointReadResponse, Read, ReadResponse};
use crate::region::Region;
use crate::write::{
    PointDeleteResponse, PointModifyResponse, PointWriteResponse, Write, WriteResponse,
};

/// Row cap for a single range-read slice; shards never return more rows than
/// this in one response.
pub const MAX_ROWS: usize = 1000;

/// One store instance serving one slice, pinned to one worker thread.
pub struct Store<E: StoreEngine> {
    engine: E,
    ctx: Arc<Context>,
    thread: usize,
}

impl<E: StoreEngine> Store<E> {
    pub fn new(engine: E, ctx: Arc<Context>, thread: usize) -> Store<E> {
        debug_assert!(thread < ctx.num_threads());
        Store {
            engine,
            ctx,
            thread,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Execute one read inside the caller's transaction.
    pub async fn protocol_read(
        &self,
        read: &Read,
        txn: &E::Txn,
        superblock: &E::Superblock,
    ) -> Result<ReadResponse, ProtocolError> {
        match read {
            Read::Point(pr) => {
                let data = self.engine.get(txn, superblock, &pr.key).await?;
                Ok(ReadResponse::Point(PointReadResponse { data }))
            }
            Read::Range(rg) => {
                let mut env = self.ctx.env_for_thread(self.thread);
                env.scopes = rg.scopes.clone();
                let response = self
                    .engine
                    .rget_slice(
                        txn,
                        superblock,
                        &rg.key_range,
                        MAX_ROWS,
                        &mut env,
                        &rg.transform,
                        rg.terminal.as_ref(),
                    )
                    .await?;
                Ok(ReadResponse::Range(response))
            }
            Read::Distribution(dg) => {
                let mut response = self
                    .engine
                    .distribution_get(txn, superblock, dg.max_depth, &dg.range.left)
                    .await?;
                // The engine samples from whole subtrees and may overshoot
                // the requested range at either boundary.
                response.key_counts.retain(|key, _| dg.range.contains_key(key));
                Ok(ReadResponse::Distribution(response))
            }
        }
    }

    /// Execute one write inside the caller's transaction at `timestamp`.
    pub async fn protocol_write(
        &self,
        write: &Write,
        timestamp: Recency,
        txn: &E::Txn,
        superblock: &E::Superblock,
    ) -> Result<WriteResponse, ProtocolError> {
        match write {
            Write::Point(w) => {
                let result = self
                    .engine
                    .set(txn, superblock, &w.key, &w.data, timestamp)
                    .await?;
                Ok(WriteResponse::Point(PointWriteResponse { result }))
            }
            Write::Modify(m) => {
                debug!(key = ?m.key, primary_key = %m.primary_key, "point modify begin");
                let mut env = self.ctx.env_for_thread(self.thread);
                env.scopes = m.scopes.clone();
                let result = self
                    .engine
                    .modify(
                        txn,
                        superblock,
                        &m.primary_key,
                        &m.key,
                        m.op,
                        &mut env,
                        &m.mapping,
                        timestamp,
                    )
                    .await?;
                debug!(key = ?m.key, "point modify end");
                Ok(WriteResponse::Modify(PointModifyResponse { result }))
            }
            Write::Delete(d) => {
                let result = self.engine.delete(txn, superblock, &d.key, timestamp).await?;
                Ok(WriteResponse::Delete(PointDeleteResponse { result }))
            }
        }
    }

    /// Stream a snapshot of every sub-region in `start_point` through `sink`.
    /// See `backfill::send_backfill` for the parallelism and interruption
    /// contract.
    #[allow(clippy::too_many_arguments)]
    pub async fn protocol_send_backfill(
        &self,
        start_point: &[(Region, StateTimestamp)],
        sink: &dyn ChunkSink,
        txn: &E::Txn,
        superblock: &E::Superblock,
        progress: &BackfillProgress,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError> {
        backfill::send_backfill(
            &self.engine,
            start_point,
            sink,
            txn,
            superblock,
            progress,
            interruptor,
        )
        .await
    }

    /// Apply one received backfill chunk to the local slice.
    pub async fn protocol_receive_backfill(
        &self,
        chunk: &BackfillChunk,
        txn: &E::Txn,
        superblock: &E::Superblock,
    ) -> Result<(), ProtocolError> {
        match chunk {
            BackfillChunk::DeleteKey { key, recency } => {
                self.engine.delete(txn, superblock, key, *recency).await?;
            }
            BackfillChunk::DeleteRange { range } => {
                let tester = RangeKeyTester::new(range);
                self.engine
                    .erase_range(txn, superblock, &tester, &range.inner)
                    .await?;
            }
            BackfillChunk::KeyValuePair { atom } => {
                self.engine
                    .set(txn, superblock, &atom.key, &atom.value, atom.recency)
                    .await?;
            }
        }
        Ok(())
    }

    /// Erase everything inside `subregion`, hash band included or not: the
    /// always-true tester removes every key the traversal offers.
    pub async fn protocol_reset_data(
        &self,
        subregion: &Region,
        txn: &E::Txn,
        superblock: &E::Superblock,
    ) -> Result<(), ProtocolError> {
        self.engine
            .erase_range(txn, superblock, &AlwaysTrueKeyTester, &subregion.inner)
            .await?;
        Ok(())
    }
}
