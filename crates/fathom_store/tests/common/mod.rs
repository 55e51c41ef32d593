//! Shared test fixtures: an in-memory engine and an arithmetic evaluator.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use fathom_store::backfill::{BackfillAtom, TraversalProgress};
use fathom_store::context::{
    Context, DatabasesMetadata, Interruptor, NamespaceDesc, NamespaceRepo, NamespacesMetadata,
    RuntimeEnv,
};
use fathom_store::engine::{BackfillCallback, KeyTester, Recency, StoreEngine};
use fathom_store::error::ProtocolError;
use fathom_store::eval::{Backtrace, ExprRunner, ExprRunnerFactory, RuntimeError, Scopes, Value};
use fathom_store::keys::{KeyRange, StoreKey};
use fathom_store::read::{DistributionReadResponse, Groups, RangeReadResponse, RangeResult, Stream};
use fathom_store::term::{
    Mapping, ModifyOp, Reduction, Term, TermType, Terminal, Transform,
};
use fathom_store::write::{DeleteResult, ModifyResult, StoreResult};

pub fn key(s: &str) -> StoreKey {
    StoreKey::from(s)
}

pub fn range(left: &str, right: &str) -> KeyRange {
    KeyRange::new(Bound::Included(key(left)), Bound::Excluded(key(right)))
}

/// Reduction computing `base + Σ rows` with an arithmetic body.
pub fn sum_reduction() -> Reduction {
    Reduction {
        base: Some(Term::number(0.0)),
        var1: "acc".to_string(),
        var2: "row".to_string(),
        body: Some(Term::call("add", vec![Term::var("acc"), Term::var("row")])),
    }
}

/// Evaluates the small arithmetic term language used by the tests.
pub struct ArithRunner;

impl ArithRunner {
    fn eval_term(term: &Term, scopes: &mut Scopes) -> Result<Value, RuntimeError> {
        match TermType::try_from(term.kind) {
            Ok(TermType::Number) => Ok(number_value(term.number)),
            Ok(TermType::Json) => serde_json::from_str(&term.json)
                .map_err(|e| RuntimeError::new(format!("bad json literal: {e}"))),
            Ok(TermType::Var) => scopes
                .lookup(&term.var)
                .cloned()
                .ok_or_else(|| RuntimeError::new(format!("unbound variable `{}`", term.var))),
            Ok(TermType::Call) => match term.var.as_str() {
                "add" => {
                    let mut sum = 0.0;
                    for arg in &term.args {
                        sum += as_number(&Self::eval_term(arg, scopes)?)?;
                    }
                    Ok(number_value(sum))
                }
                "mul" => {
                    let mut product = 1.0;
                    for arg in &term.args {
                        product *= as_number(&Self::eval_term(arg, scopes)?)?;
                    }
                    Ok(number_value(product))
                }
                other => Err(RuntimeError::new(format!("unknown builtin `{other}`"))),
            },
            Err(_) => Err(RuntimeError::new("unknown term kind")),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn as_number(value: &Value) -> Result<f64, RuntimeError> {
    value
        .as_f64()
        .ok_or_else(|| RuntimeError::new(format!("expected a number, got {value}")))
}

#[async_trait]
impl ExprRunner for ArithRunner {
    async fn eval(
        &mut self,
        term: &Term,
        scopes: &mut Scopes,
        _backtrace: &Backtrace,
    ) -> Result<Value, RuntimeError> {
        Self::eval_term(term, scopes)
    }
}

pub struct ArithRunnerFactory;

impl ExprRunnerFactory for ArithRunnerFactory {
    fn fresh_runner(&self) -> Box<dyn ExprRunner> {
        Box::new(ArithRunner)
    }
}

struct StaticNamespaceRepo;

impl NamespaceRepo for StaticNamespaceRepo {
    fn namespace(&self, id: u64) -> Option<NamespaceDesc> {
        (id == 1).then(|| NamespaceDesc {
            name: "docs".to_string(),
            database: 1,
            primary_key: "id".to_string(),
        })
    }
}

/// A context wired with the arithmetic evaluator.
pub fn test_context(num_threads: usize) -> Arc<Context> {
    // Receivers keep serving the last value after the senders drop, which is
    // all these tests need.
    let (_ns_tx, ns_rx) = watch::channel(NamespacesMetadata::default());
    let (_db_tx, db_rx) = watch::channel(DatabasesMetadata::default());
    Arc::new(Context::new(
        Arc::new(ArithRunnerFactory),
        Arc::new(StaticNamespaceRepo),
        ns_rx,
        db_rx,
        42,
        num_threads,
    ))
}

/// In-memory ordered engine with per-key recencies and a deletion log, enough
/// to exercise every dispatch path without a disk.
#[derive(Default)]
pub struct MemoryEngine {
    rows: RwLock<BTreeMap<StoreKey, (Value, Recency)>>,
    deletions: RwLock<Vec<(StoreKey, Recency)>>,
}

impl MemoryEngine {
    pub fn new() -> MemoryEngine {
        MemoryEngine::default()
    }

    pub fn seed(&self, key: StoreKey, value: Value, recency: Recency) {
        self.rows.write().unwrap().insert(key, (value, recency));
    }

    pub fn record_deletion(&self, key: StoreKey, recency: Recency) {
        self.deletions.write().unwrap().push((key, recency));
    }

    pub fn dump(&self) -> BTreeMap<StoreKey, Value> {
        self.rows
            .read()
            .unwrap()
            .iter()
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap().len()
    }

    fn rows_in(&self, range: &KeyRange) -> Vec<(StoreKey, Value, Recency)> {
        let guard = self.rows.read().unwrap();
        let upper = match &range.right {
            Some(right) => Bound::Excluded(right.clone()),
            None => Bound::Unbounded,
        };
        guard
            .range((Bound::Included(range.left.clone()), upper))
            .map(|(k, (v, r))| (k.clone(), v.clone(), *r))
            .collect()
    }
}

async fn apply_transform(
    transform: &Transform,
    input: Vec<Value>,
    env: &mut RuntimeEnv,
) -> Result<Vec<Value>, RuntimeError> {
    let backtrace = Backtrace::new();
    let mut out = Vec::new();
    match transform {
        Transform::Filter(filter) => {
            let predicate = filter
                .predicate
                .as_ref()
                .ok_or_else(|| RuntimeError::new("filter without a predicate"))?;
            let body = predicate
                .body
                .as_ref()
                .ok_or_else(|| RuntimeError::new("predicate without a body"))?;
            for value in input {
                env.scopes.push_frame();
                env.scopes.put_in_scope(predicate.arg.clone(), value.clone());
                let verdict = env.runner.eval(body, &mut env.scopes, &backtrace).await;
                env.scopes.pop_frame();
                if verdict? == json!(true) {
                    out.push(value);
                }
            }
        }
        Transform::Map(map) => {
            let mapping = map
                .mapping
                .as_ref()
                .ok_or_else(|| RuntimeError::new("map without a mapping"))?;
            for value in input {
                out.push(eval_mapping(mapping, value, env).await?);
            }
        }
        Transform::ConcatMap(concat) => {
            let mapping = concat
                .mapping
                .as_ref()
                .ok_or_else(|| RuntimeError::new("concat-map without a mapping"))?;
            for value in input {
                match eval_mapping(mapping, value, env).await? {
                    Value::Array(items) => out.extend(items),
                    other => {
                        return Err(RuntimeError::new(format!(
                            "concat-map body returned a non-array: {other}"
                        )))
                    }
                }
            }
        }
        Transform::Range(_) => {
            return Err(RuntimeError::new(
                "attribute-range transforms are not supported by the test engine",
            ))
        }
    }
    Ok(out)
}

async fn eval_mapping(
    mapping: &Mapping,
    value: Value,
    env: &mut RuntimeEnv,
) -> Result<Value, RuntimeError> {
    let body = mapping
        .body
        .as_ref()
        .ok_or_else(|| RuntimeError::new("mapping without a body"))?;
    let backtrace = Backtrace::new();
    env.scopes.push_frame();
    env.scopes.put_in_scope(mapping.arg.clone(), value);
    let out = env.runner.eval(body, &mut env.scopes, &backtrace).await;
    env.scopes.pop_frame();
    out
}

async fn fold_reduction(
    reduction: &Reduction,
    values: impl Iterator<Item = Value>,
    env: &mut RuntimeEnv,
) -> Result<Value, RuntimeError> {
    let base = reduction.base_term()?;
    let body = reduction.body_term()?;
    let backtrace = Backtrace::new();
    let mut acc = env.runner.eval(base, &mut env.scopes, &backtrace).await?;
    for value in values {
        env.scopes.push_frame();
        env.scopes.put_in_scope(reduction.var1.clone(), acc.clone());
        env.scopes.put_in_scope(reduction.var2.clone(), value);
        let folded = env.runner.eval(body, &mut env.scopes, &backtrace).await;
        env.scopes.pop_frame();
        acc = folded?;
    }
    Ok(acc)
}

async fn run_terminal(
    terminal: Option<&Terminal>,
    rows: Vec<(StoreKey, Value)>,
    env: &mut RuntimeEnv,
) -> Result<RangeResult, RuntimeError> {
    match terminal {
        None => Ok(RangeResult::Stream(rows)),
        Some(Terminal::Length) => Ok(RangeResult::Length {
            length: rows.len() as u64,
        }),
        Some(Terminal::Reduce(reduction)) => {
            let atom = fold_reduction(reduction, rows.into_iter().map(|(_, v)| v), env).await?;
            Ok(RangeResult::Atom(atom))
        }
        Some(Terminal::GroupedMapReduce(gmr)) => {
            let group_mapping = gmr
                .group_mapping
                .as_ref()
                .ok_or_else(|| RuntimeError::new("grouped map-reduce without a group mapping"))?;
            let value_mapping = gmr
                .value_mapping
                .as_ref()
                .ok_or_else(|| RuntimeError::new("grouped map-reduce without a value mapping"))?;
            let reduction = gmr.reduction()?;
            let base = reduction.base_term()?;
            let body = reduction.body_term()?;
            let backtrace = Backtrace::new();
            let mut groups = Groups::new();
            for (_, value) in rows {
                let group_key = eval_mapping(group_mapping, value.clone(), env).await?;
                let canonical = serde_json::to_string(&group_key)
                    .map_err(|e| RuntimeError::new(format!("unencodable group key: {e}")))?;
                let mapped = eval_mapping(value_mapping, value, env).await?;
                let acc = match groups.get(&canonical) {
                    Some(existing) => existing.clone(),
                    None => env.runner.eval(base, &mut env.scopes, &backtrace).await?,
                };
                env.scopes.push_frame();
                env.scopes.put_in_scope(reduction.var1.clone(), acc);
                env.scopes.put_in_scope(reduction.var2.clone(), mapped);
                let folded = env.runner.eval(body, &mut env.scopes, &backtrace).await;
                env.scopes.pop_frame();
                groups.insert(canonical, folded?);
            }
            Ok(RangeResult::Groups(groups))
        }
        Some(Terminal::ForEach(for_each)) => Ok(RangeResult::Inserted {
            inserted: (rows.len() * for_each.queries.len()) as u64,
        }),
    }
}

#[async_trait]
impl StoreEngine for MemoryEngine {
    type Txn = ();
    type Superblock = ();

    async fn get(
        &self,
        _txn: &(),
        _superblock: &(),
        key: &StoreKey,
    ) -> Result<Option<Value>, ProtocolError> {
        Ok(self.rows.read().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn set(
        &self,
        _txn: &(),
        _superblock: &(),
        key: &StoreKey,
        value: &Value,
        recency: Recency,
    ) -> Result<StoreResult, ProtocolError> {
        self.rows
            .write()
            .unwrap()
            .insert(key.clone(), (value.clone(), recency));
        Ok(StoreResult::Stored)
    }

    async fn delete(
        &self,
        _txn: &(),
        _superblock: &(),
        key: &StoreKey,
        recency: Recency,
    ) -> Result<DeleteResult, ProtocolError> {
        let removed = self.rows.write().unwrap().remove(key).is_some();
        if removed {
            self.deletions.write().unwrap().push((key.clone(), recency));
            Ok(DeleteResult::Deleted)
        } else {
            Ok(DeleteResult::Missing)
        }
    }

    async fn modify(
        &self,
        _txn: &(),
        _superblock: &(),
        _primary_key: &str,
        key: &StoreKey,
        op: ModifyOp,
        env: &mut RuntimeEnv,
        mapping: &Mapping,
        recency: Recency,
    ) -> Result<ModifyResult, ProtocolError> {
        let existing = self.rows.read().unwrap().get(key).map(|(v, _)| v.clone());
        let Some(old) = existing else {
            return Ok(ModifyResult::Skipped);
        };
        match eval_mapping(mapping, old.clone(), env).await {
            Err(e) => Ok(ModifyResult::Error(e)),
            Ok(new) => {
                let merged = match op {
                    ModifyOp::Mutate => new,
                    ModifyOp::Update => match (old, new) {
                        (Value::Object(mut base), Value::Object(patch)) => {
                            base.extend(patch);
                            Value::Object(base)
                        }
                        (_, replacement) => replacement,
                    },
                };
                self.rows
                    .write()
                    .unwrap()
                    .insert(key.clone(), (merged, recency));
                Ok(ModifyResult::Modified)
            }
        }
    }

    async fn rget_slice(
        &self,
        _txn: &(),
        _superblock: &(),
        range: &KeyRange,
        max_rows: usize,
        env: &mut RuntimeEnv,
        transforms: &[Transform],
        terminal: Option<&Terminal>,
    ) -> Result<RangeReadResponse, ProtocolError> {
        let snapshot = self.rows_in(range);
        let mut rows: Stream = Vec::new();
        let mut truncated = false;
        let mut last = range.left.clone();

        let outcome: Result<RangeResult, RuntimeError> = async {
            let mut scanned = 0usize;
            for (k, v, _) in snapshot {
                let mut values = vec![v];
                for transform in transforms {
                    values = apply_transform(transform, values, env).await?;
                }
                for value in values {
                    rows.push((k.clone(), value));
                }
                last = k;
                scanned += 1;
                if scanned == max_rows {
                    truncated = true;
                    break;
                }
            }
            run_terminal(terminal, std::mem::take(&mut rows), env).await
        }
        .await;

        Ok(match outcome {
            Ok(result) => RangeReadResponse {
                result,
                key_range: range.clone(),
                truncated,
                last_considered_key: last,
            },
            Err(e) => RangeReadResponse {
                result: RangeResult::Error(e),
                key_range: range.clone(),
                truncated: false,
                last_considered_key: range.left.clone(),
            },
        })
    }

    async fn distribution_get(
        &self,
        _txn: &(),
        _superblock: &(),
        _max_depth: u32,
        left: &StoreKey,
    ) -> Result<DistributionReadResponse, ProtocolError> {
        // Deliberately overshoots any right bound, like a subtree-sampling
        // engine would; the executor filters.
        let mut response = DistributionReadResponse::default();
        for (k, _) in self.rows.read().unwrap().iter() {
            if *k >= *left {
                response.key_counts.insert(k.clone(), 1);
            }
        }
        Ok(response)
    }

    async fn erase_range(
        &self,
        _txn: &(),
        _superblock: &(),
        tester: &(dyn KeyTester + '_),
        range: &KeyRange,
    ) -> Result<(), ProtocolError> {
        let doomed: Vec<StoreKey> = self
            .rows_in(range)
            .into_iter()
            .filter(|(k, _, _)| tester.key_should_be_erased(k))
            .map(|(k, _, _)| k)
            .collect();
        let mut guard = self.rows.write().unwrap();
        for k in doomed {
            guard.remove(&k);
        }
        Ok(())
    }

    async fn backfill(
        &self,
        _txn: &(),
        _superblock: &(),
        range: &KeyRange,
        recency_floor: Recency,
        callback: &(dyn BackfillCallback + '_),
        progress: &TraversalProgress,
        interruptor: &Interruptor,
    ) -> Result<(), ProtocolError> {
        let deletions: Vec<(StoreKey, Recency)> = self
            .deletions
            .read()
            .unwrap()
            .iter()
            .filter(|(k, r)| range.contains_key(k) && *r >= recency_floor)
            .cloned()
            .collect();
        let atoms: Vec<BackfillAtom> = self
            .rows_in(range)
            .into_iter()
            .filter(|(_, _, r)| *r >= recency_floor)
            .map(|(k, v, r)| BackfillAtom {
                key: k,
                value: v,
                recency: r,
            })
            .collect();
        progress.add_total((deletions.len() + atoms.len()) as u64);

        for (k, recency) in deletions {
            interruptor.checkpoint()?;
            callback.on_deletion(&k, recency, interruptor).await?;
            progress.record_done(1);
        }
        for atom in atoms {
            interruptor.checkpoint()?;
            callback.on_keyvalue(&atom, interruptor).await?;
            progress.record_done(1);
        }
        Ok(())
    }
}
