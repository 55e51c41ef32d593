//! Per-thread environment cache for expression evaluation.
//!
//! A `Context` is process-lived. At construction it pre-builds one read-only
//! metadata mirror and one child interrupt signal per worker thread, so the
//! request path can assemble a `RuntimeEnv` without cross-thread
//! synchronization. The expression runner inside each env is minted fresh per
//! request to isolate side effects.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ProtocolError;
use crate::eval::{Backtrace, ExprRunner, ExprRunnerFactory, RuntimeError, Scopes, Value};
use crate::term::Term;

/// Identifier of the machine this node runs on.
pub type MachineId = u64;

/// One-shot cancellation signal observed at every suspension point.
///
/// Child signals (`child`) trip when the parent does, which is how one
/// process-wide pulse reaches every worker thread's mirror.
#[derive(Clone, Debug, Default)]
pub struct Interruptor {
    token: CancellationToken,
}

impl Interruptor {
    pub fn new() -> Interruptor {
        Interruptor {
            token: CancellationToken::new(),
        }
    }

    /// A child signal that fires when `self` fires.
    pub fn child(&self) -> Interruptor {
        Interruptor {
            token: self.token.child_token(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn pulse(&self) {
        self.token.cancel();
    }

    pub fn is_pulsed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once the signal fires. Used in `select!` races against
    /// blocking work such as chunk handoff.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Suspension-point check: error out if the signal already fired.
    pub fn checkpoint(&self) -> Result<(), ProtocolError> {
        if self.is_pulsed() {
            Err(ProtocolError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Descriptor of one namespace (table) in cluster metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDesc {
    pub name: String,
    pub database: u64,
    pub primary_key: String,
}

/// Cluster-wide namespace metadata, mirrored read-only per worker thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacesMetadata {
    pub namespaces: BTreeMap<u64, NamespaceDesc>,
}

/// Cluster-wide database metadata, mirrored read-only per worker thread.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasesMetadata {
    pub databases: BTreeMap<u64, String>,
}

/// Lookup handle into the namespace repository, consulted by the expression
/// runtime when a query touches another table.
pub trait NamespaceRepo: Send + Sync {
    fn namespace(&self, id: u64) -> Option<NamespaceDesc>;
}

/// Everything one evaluation needs: lexical scopes, a fresh runner, this
/// thread's metadata mirrors, this thread's interrupt signal, and identity.
pub struct RuntimeEnv {
    pub scopes: Scopes,
    pub runner: Box<dyn ExprRunner>,
    pub namespaces: watch::Receiver<NamespacesMetadata>,
    pub databases: watch::Receiver<DatabasesMetadata>,
    pub ns_repo: Arc<dyn NamespaceRepo>,
    pub interruptor: Interruptor,
    pub machine_id: MachineId,
}

/// Process-lived context shared by every store on this node.
pub struct Context {
    runner_factory: Arc<dyn ExprRunnerFactory>,
    ns_repo: Arc<dyn NamespaceRepo>,
    namespace_watchables: Vec<watch::Receiver<NamespacesMetadata>>,
    database_watchables: Vec<watch::Receiver<DatabasesMetadata>>,
    signals: Vec<Interruptor>,
    interruptor: Interruptor,
    machine_id: MachineId,
}

impl Context {
    /// Wire a context for `num_threads` workers.
    ///
    /// The metadata receivers are cloned once per thread here rather than per
    /// request; the metadata layer refreshes the senders and every mirror
    /// observes the update without locking on the request path.
    pub fn new(
        runner_factory: Arc<dyn ExprRunnerFactory>,
        ns_repo: Arc<dyn NamespaceRepo>,
        namespaces: watch::Receiver<NamespacesMetadata>,
        databases: watch::Receiver<DatabasesMetadata>,
        machine_id: MachineId,
        num_threads: usize,
    ) -> Context {
        let num_threads = num_threads.max(1);
        let interruptor = Interruptor::new();
        Context {
            runner_factory,
            ns_repo,
            namespace_watchables: (0..num_threads).map(|_| namespaces.clone()).collect(),
            database_watchables: (0..num_threads).map(|_| databases.clone()).collect(),
            signals: (0..num_threads).map(|_| interruptor.child()).collect(),
            interruptor,
            machine_id,
        }
    }

    /// A context with no metadata feed and no expression runtime. Useful for
    /// embedding and for exercising paths that never evaluate a term; any
    /// evaluation through it reports a `RuntimeError`.
    pub fn disconnected(num_threads: usize) -> Context {
        let (_, namespaces) = watch::channel(NamespacesMetadata::default());
        let (_, databases) = watch::channel(DatabasesMetadata::default());
        Context::new(
            Arc::new(UnwiredRunnerFactory),
            Arc::new(EmptyNamespaceRepo),
            namespaces,
            databases,
            0,
            num_threads,
        )
    }

    pub fn num_threads(&self) -> usize {
        self.signals.len()
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    /// The process-wide interrupt signal; pulsing it reaches every thread's
    /// mirror signal.
    pub fn interruptor(&self) -> &Interruptor {
        &self.interruptor
    }

    /// The interrupt mirror for one worker thread.
    pub fn signal_for_thread(&self, thread: usize) -> &Interruptor {
        &self.signals[thread]
    }

    /// Assemble a fresh evaluation environment for `thread`.
    pub fn env_for_thread(&self, thread: usize) -> RuntimeEnv {
        debug_assert!(thread < self.num_threads());
        RuntimeEnv {
            scopes: Scopes::new(),
            runner: self.runner_factory.fresh_runner(),
            namespaces: self.namespace_watchables[thread].clone(),
            databases: self.database_watchables[thread].clone(),
            ns_repo: Arc::clone(&self.ns_repo),
            interruptor: self.signals[thread].clone(),
            machine_id: self.machine_id,
        }
    }
}

/// Default thread count: one worker per CPU.
pub fn detect_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct UnwiredRunnerFactory;

struct UnwiredRunner;

#[async_trait::async_trait]
impl ExprRunner for UnwiredRunner {
    async fn eval(
        &mut self,
        _term: &Term,
        _scopes: &mut Scopes,
        _backtrace: &Backtrace,
    ) -> Result<Value, RuntimeError> {
        Err(RuntimeError::new("no expression runtime is wired"))
    }
}

impl ExprRunnerFactory for UnwiredRunnerFactory {
    fn fresh_runner(&self) -> Box<dyn ExprRunner> {
        Box::new(UnwiredRunner)
    }
}

struct EmptyNamespaceRepo;

impl NamespaceRepo for EmptyNamespaceRepo {
    fn namespace(&self, _id: u64) -> Option<NamespaceDesc> {
        None
    }
}
