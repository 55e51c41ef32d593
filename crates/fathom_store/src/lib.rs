//! Query dispatch and sharding core for a FathomDB node.
//!
//! This crate classifies client operations over regions of the keyspace,
//! splits them so each shard receives the slice intersecting its own region,
//! executes point and range operations against the local ordered key/value
//! engine, merges per-shard responses into a single client-visible result,
//! and streams consistent snapshots between replicas during backfill.
//!
//! The sharding scheme is two-dimensional: a hash band crossed with an
//! ordered key range (`region`). Point operations live in a single hash
//! cell; range operations shard along the key dimension; CPU sharding
//! partitions the hash dimension. The engine itself, the expression runtime,
//! RPC transport, and cluster metadata distribution are external
//! collaborators reached through the traits in `engine`, `eval`, and
//! `context`.

pub mod backfill;
pub mod context;
pub mod engine;
pub mod error;
pub mod eval;
pub mod keys;
pub mod read;
pub mod region;
pub mod store;
pub mod term;
pub mod wire;
pub mod write;

/// Cluster-visible name of this protocol.
pub const PROTOCOL_NAME: &str = "rdb";

pub use backfill::{
    BackfillAtom, BackfillChunk, BackfillConfig, BackfillProgress, ChannelChunkSink, ChunkSink,
    TraversalProgress,
};
pub use context::{Context, Interruptor, MachineId, RuntimeEnv};
pub use engine::{Recency, StateTimestamp, StoreEngine};
pub use error::{EngineError, ProtocolError};
pub use eval::{RuntimeError, Scopes, Value};
pub use keys::{KeyRange, StoreKey};
pub use read::{Read, ReadResponse};
pub use region::{
    cpu_sharding_subspace, monokey_region, region_intersection, region_is_empty,
    region_is_superset, Region, HASH_SIZE,
};
pub use store::{Store, MAX_ROWS};
pub use write::{Write, WriteResponse};
