//! Read operations: classification, sharding, and response merging.
//!
//! A `Read` is an immutable value built once per client request. The
//! dispatcher restricts it to each owning shard with `shard`, executes the
//! pieces (possibly on other threads), and recombines the shard responses
//! with `unshard` (shards partition the key dimension) or
//! `multistore_unshard` (the same key interval served by several hash bands).
//!
//! Evaluator failures never escape as errors from a merge: they dominate the
//! merged `result` as a `RuntimeError` value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::{Context, RuntimeEnv};
use crate::eval::{Backtrace, RuntimeError, Scopes, Value};
use crate::keys::{KeyRange, StoreKey};
use crate::region::{monokey_region, region_is_superset, Region};
use crate::term::{BuiltinGroupedMapReduce, Reduction, Terminal, Transform};

/// Read of a single key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointRead {
    pub key: StoreKey,
}

/// Streaming read over a key range, with an optional transform pipeline and
/// terminal reduction. `maximum` caps the rows any one shard returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeRead {
    pub key_range: KeyRange,
    pub scopes: Scopes,
    pub transform: Vec<Transform>,
    pub terminal: Option<Terminal>,
    pub maximum: usize,
}

/// Sampled key-distribution probe over a range.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributionRead {
    pub max_depth: u32,
    pub range: KeyRange,
}

/// A client-visible read operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Read {
    Point(PointRead),
    Range(RangeRead),
    Distribution(DistributionRead),
}

/// Rows streamed out of a range read, in key order within one shard.
pub type Stream = Vec<(StoreKey, Value)>;

/// Grouped accumulators keyed by the canonical JSON encoding of the group
/// key, which keeps the map deterministic and JSON-serializable.
pub type Groups = BTreeMap<String, Value>;

/// The payload of a range-read response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RangeResult {
    Stream(Stream),
    Groups(Groups),
    Atom(Value),
    Length { length: u64 },
    Inserted { inserted: u64 },
    Error(RuntimeError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointReadResponse {
    pub data: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeReadResponse {
    pub result: RangeResult,
    pub key_range: KeyRange,
    pub truncated: bool,
    /// Watermark up to which the scan definitively enumerated keys; the
    /// client continues its next request from here.
    pub last_considered_key: StoreKey,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributionReadResponse {
    pub key_counts: BTreeMap<StoreKey, u64>,
}

/// A response mirroring the read variant it answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReadResponse {
    Point(PointReadResponse),
    Range(RangeReadResponse),
    Distribution(DistributionReadResponse),
}

impl Read {
    /// The region this read covers: point reads live in their single hash
    /// cell, range-shaped reads span the full hash universe over their key
    /// range.
    pub fn get_region(&self) -> Region {
        match self {
            Read::Point(pr) => monokey_region(&pr.key),
            Read::Range(rg) => Region::from_key_range(rg.key_range.clone()),
            Read::Distribution(dg) => Region::from_key_range(dg.range.clone()),
        }
    }

    /// Restrict this read to `region`, which must be a subset of
    /// `self.get_region()` (a programmer error otherwise). The returned
    /// read's own region is exactly the intersection.
    pub fn shard(&self, region: &Region) -> Read {
        debug_assert!(
            region_is_superset(&self.get_region(), region),
            "sharding a read outside its own region"
        );
        match self {
            Read::Point(pr) => {
                debug_assert_eq!(monokey_region(&pr.key), *region);
                Read::Point(pr.clone())
            }
            Read::Range(rg) => {
                let mut sharded = rg.clone();
                sharded.key_range = region.inner.clone();
                Read::Range(sharded)
            }
            Read::Distribution(dg) => {
                let mut sharded = dg.clone();
                sharded.range = region.inner.clone();
                Read::Distribution(sharded)
            }
        }
    }

    /// Merge responses from shards that partition the key dimension.
    /// `thread` is the executing worker's index.
    pub async fn unshard(
        &self,
        responses: &[ReadResponse],
        ctx: &Context,
        thread: usize,
    ) -> ReadResponse {
        match self {
            Read::Point(_) => unshard_point(responses),
            Read::Range(rg) => ReadResponse::Range(
                unshard_range(rg, responses, ctx, thread, UnshardMode::KeySharded).await,
            ),
            Read::Distribution(_) => {
                ReadResponse::Distribution(unshard_distribution_key_sharded(responses))
            }
        }
    }

    /// Merge responses from hash shards serving the same key interval.
    pub async fn multistore_unshard(
        &self,
        responses: &[ReadResponse],
        ctx: &Context,
        thread: usize,
    ) -> ReadResponse {
        match self {
            Read::Point(_) => unshard_point(responses),
            Read::Range(rg) => ReadResponse::Range(
                unshard_range(rg, responses, ctx, thread, UnshardMode::HashSharded).await,
            ),
            Read::Distribution(_) => {
                ReadResponse::Distribution(unshard_distribution_hash_sharded(responses))
            }
        }
    }
}

/// Sort rget shard responses by their key range so key-sharded unshard sees
/// shards in ascending key order.
pub fn sort_rget_responses(responses: &mut [ReadResponse]) {
    responses.sort_by(|a, b| match (a, b) {
        (ReadResponse::Range(left), ReadResponse::Range(right)) => {
            left.key_range.cmp(&right.key_range)
        }
        _ => {
            debug_assert!(false, "sorting non-range read responses");
            std::cmp::Ordering::Equal
        }
    });
}

#[derive(Clone, Copy, PartialEq)]
enum UnshardMode {
    KeySharded,
    HashSharded,
}

fn unshard_point(responses: &[ReadResponse]) -> ReadResponse {
    debug_assert_eq!(responses.len(), 1, "point reads never split");
    debug_assert!(matches!(responses[0], ReadResponse::Point(_)));
    responses[0].clone()
}

fn range_inputs<'a>(responses: &'a [ReadResponse]) -> Vec<&'a RangeReadResponse> {
    responses
        .iter()
        .filter_map(|r| match r {
            ReadResponse::Range(rr) => Some(rr),
            other => {
                debug_assert!(false, "range unshard fed a non-range response");
                warn!(?other, "dropping mismatched response during range unshard");
                None
            }
        })
        .collect()
}

async fn unshard_range(
    rg: &RangeRead,
    responses: &[ReadResponse],
    ctx: &Context,
    thread: usize,
    mode: UnshardMode,
) -> RangeReadResponse {
    let mut env = ctx.env_for_thread(thread);
    env.scopes = rg.scopes.clone();

    let mut out = RangeReadResponse {
        result: RangeResult::Stream(Stream::new()),
        key_range: rg.key_range.clone(),
        truncated: false,
        last_considered_key: rg.key_range.left.clone(),
    };
    let inputs = range_inputs(responses);

    // A runtime error in any shard dominates the merge, first in input order.
    if let Some(err) = inputs.iter().find_map(|r| match &r.result {
        RangeResult::Error(e) => Some(e.clone()),
        _ => None,
    }) {
        out.result = RangeResult::Error(err);
        return out;
    }

    match &rg.terminal {
        None => {
            let (stream, truncated, last) = match mode {
                UnshardMode::KeySharded => merge_streams_key_sharded(rg, &inputs),
                UnshardMode::HashSharded => merge_streams_hash_sharded(rg, &inputs),
            };
            out.result = RangeResult::Stream(stream);
            out.truncated = truncated;
            out.last_considered_key = last;
        }
        Some(Terminal::GroupedMapReduce(gmr)) => {
            out.result = match merge_grouped(gmr, &inputs, &mut env).await {
                Ok(groups) => RangeResult::Groups(groups),
                Err(e) => RangeResult::Error(e),
            };
        }
        Some(Terminal::Reduce(reduction)) => {
            out.result = match merge_reduction(reduction, &inputs, &mut env).await {
                Ok(atom) => RangeResult::Atom(atom),
                Err(e) => RangeResult::Error(e),
            };
        }
        Some(Terminal::Length) => {
            let mut length = 0u64;
            for r in &inputs {
                match &r.result {
                    RangeResult::Length { length: piece } => length += piece,
                    _ => debug_assert!(false, "length unshard fed a non-length result"),
                }
            }
            out.result = RangeResult::Length { length };
        }
        Some(Terminal::ForEach(_)) => {
            let mut inserted = 0u64;
            for r in &inputs {
                match &r.result {
                    RangeResult::Inserted { inserted: piece } => inserted += piece,
                    _ => debug_assert!(false, "for-each unshard fed a non-inserted result"),
                }
            }
            out.result = RangeResult::Inserted { inserted };
        }
    }
    out
}

/// Concatenate shard streams in input order; the merged watermark is the
/// furthest any shard scanned.
fn merge_streams_key_sharded(
    rg: &RangeRead,
    inputs: &[&RangeReadResponse],
) -> (Stream, bool, StoreKey) {
    let mut stream = Stream::new();
    let mut truncated = false;
    let mut last = rg.key_range.left.clone();
    for r in inputs {
        // TODO: re-apply the per-shard row cap when recombining shard streams.
        let RangeResult::Stream(piece) = &r.result else {
            debug_assert!(false, "stream unshard fed a non-stream result");
            continue;
        };
        stream.extend_from_slice(piece);
        truncated |= r.truncated;
        if last < r.last_considered_key {
            last = r.last_considered_key.clone();
        }
    }
    (stream, truncated, last)
}

/// Merge streams from hash shards over the same key interval.
///
/// When a shard hit its row cap, the interval past its own watermark is
/// unscanned *in that shard only*, so the merged watermark must drop to the
/// minimum over all capped shards: picking a higher key would make the
/// client's next continuation start past keys the lagging shard never
/// reported. Rows beyond the merged watermark are discarded. Shards that
/// returned fewer than `maximum` rows finished their whole interval and do
/// not lower the bound.
fn merge_streams_hash_sharded(
    rg: &RangeRead,
    inputs: &[&RangeReadResponse],
) -> (Stream, bool, StoreKey) {
    let mut last = rg.key_range.last_key();
    for r in inputs {
        if let RangeResult::Stream(piece) = &r.result {
            if piece.len() == rg.maximum && r.last_considered_key < last {
                last = r.last_considered_key.clone();
            }
        }
    }

    let mut stream = Stream::new();
    let mut truncated = false;
    for r in inputs {
        let RangeResult::Stream(piece) = &r.result else {
            debug_assert!(false, "stream unshard fed a non-stream result");
            continue;
        };
        for (key, value) in piece {
            if *key <= last {
                stream.push((key.clone(), value.clone()));
            }
        }
        truncated |= r.truncated;
    }
    (stream, truncated, last)
}

/// Fold each incoming group into the accumulator map. The accumulator for a
/// group starts from the reduction's base and absorbs one shard value per
/// step inside a fresh lexical frame.
async fn merge_grouped(
    gmr: &BuiltinGroupedMapReduce,
    inputs: &[&RangeReadResponse],
    env: &mut RuntimeEnv,
) -> Result<Groups, RuntimeError> {
    let reduction = gmr.reduction()?;
    let base = reduction.base_term()?;
    let body = reduction.body_term()?;
    let backtrace = Backtrace::new();

    let mut groups = Groups::new();
    for r in inputs {
        let RangeResult::Groups(in_groups) = &r.result else {
            debug_assert!(false, "grouped unshard fed a non-groups result");
            continue;
        };
        for (group_key, shard_value) in in_groups {
            let acc = match groups.get(group_key) {
                Some(existing) => existing.clone(),
                None => env.runner.eval(base, &mut env.scopes, &backtrace).await?,
            };
            env.scopes.push_frame();
            env.scopes.put_in_scope(reduction.var1.clone(), acc);
            env.scopes
                .put_in_scope(reduction.var2.clone(), shard_value.clone());
            let folded = env.runner.eval(body, &mut env.scopes, &backtrace).await;
            env.scopes.pop_frame();
            groups.insert(group_key.clone(), folded?);
        }
    }
    Ok(groups)
}

/// Fold shard atoms into one accumulator, starting from the reduction base.
/// Folding order is the input order; bodies must be associative for the
/// merged value to be well-defined across shard layouts.
async fn merge_reduction(
    reduction: &Reduction,
    inputs: &[&RangeReadResponse],
    env: &mut RuntimeEnv,
) -> Result<Value, RuntimeError> {
    let base = reduction.base_term()?;
    let body = reduction.body_term()?;
    let backtrace = Backtrace::new();

    let mut acc = env.runner.eval(base, &mut env.scopes, &backtrace).await?;
    for r in inputs {
        let RangeResult::Atom(shard_atom) = &r.result else {
            debug_assert!(false, "reduction unshard fed a non-atom result");
            continue;
        };
        env.scopes.push_frame();
        env.scopes.put_in_scope(reduction.var1.clone(), acc.clone());
        env.scopes
            .put_in_scope(reduction.var2.clone(), shard_atom.clone());
        let folded = env.runner.eval(body, &mut env.scopes, &backtrace).await;
        env.scopes.pop_frame();
        acc = folded?;
    }
    Ok(acc)
}

fn distribution_inputs<'a>(responses: &'a [ReadResponse]) -> Vec<&'a DistributionReadResponse> {
    responses
        .iter()
        .filter_map(|r| match r {
            ReadResponse::Distribution(dr) => Some(dr),
            _ => {
                debug_assert!(false, "distribution unshard fed a mismatched response");
                None
            }
        })
        .collect()
}

/// Key-sharded distribution merge: shards sampled disjoint key intervals, so
/// their counts concatenate.
fn unshard_distribution_key_sharded(responses: &[ReadResponse]) -> DistributionReadResponse {
    let inputs = distribution_inputs(responses);
    debug_assert!(!inputs.is_empty());
    // Hash-sharded inputs sample the same interval and therefore coincide on
    // their smallest key; that would be the wrong merge to be in.
    debug_assert!(
        !(inputs.len() > 1
            && inputs[0].key_counts.keys().next() == inputs[1].key_counts.keys().next()),
        "key-sharded distribution unshard given hash-sharded responses"
    );

    let mut merged = DistributionReadResponse::default();
    for r in &inputs {
        for (key, count) in &r.key_counts {
            debug_assert!(
                !merged.key_counts.contains_key(key),
                "key sampled by two distribution shards"
            );
            merged.key_counts.insert(key.clone(), *count);
        }
    }
    merged
}

/// Hash-sharded distribution merge: every shard sampled the same key
/// interval with an independent subset of keys. The densest response becomes
/// the template and is scaled so its total matches the combined total.
fn unshard_distribution_hash_sharded(responses: &[ReadResponse]) -> DistributionReadResponse {
    let inputs = distribution_inputs(responses);
    debug_assert!(inputs.len() > 1, "hash-sharded unshard of a single response");
    debug_assert!(
        inputs.len() < 2
            || inputs[0].key_counts.keys().next() == inputs[1].key_counts.keys().next(),
        "hash shards must sample from the same smallest key"
    );

    let mut merged = DistributionReadResponse::default();
    let mut total_num_keys = 0u64;
    let mut total_keys_in_template = 0u64;
    for r in &inputs {
        let piece_total: u64 = r.key_counts.values().sum();
        total_num_keys += piece_total;
        if merged.key_counts.len() < r.key_counts.len() {
            merged = (*r).clone();
            total_keys_in_template = piece_total;
        }
    }

    if total_keys_in_template == 0 {
        return merged;
    }

    let scale_factor = total_num_keys as f64 / total_keys_in_template as f64;
    debug_assert!(scale_factor >= 1.0);
    for count in merged.key_counts.values_mut() {
        // Truncate toward zero so every replica derives identical counts.
        *count = (*count as f64 * scale_factor) as u64;
    }
    merged
}
