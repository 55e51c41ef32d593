//! Expression-evaluator contract.
//!
//! The expression runtime itself lives outside this crate; the dispatch core
//! only depends on the shapes here: a runner that evaluates a `Term` inside a
//! lexical scope, and a factory that mints a fresh runner per request so one
//! request's side effects cannot leak into another.
//!
//! Evaluation failures are values (`RuntimeError`), not Rust errors: they ride
//! inside a range response's `result` field and must survive unsharding.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::term::Term;

/// Document values are JSON.
pub type Value = serde_json::Value;

/// Evaluation call path, innermost frame last.
pub type Backtrace = Vec<String>;

/// An evaluator failure, carried by value inside range-read results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub message: String,
    pub backtrace: Backtrace,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query evaluation failed: {}", self.message)
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
            backtrace: Backtrace::new(),
        }
    }
}

/// Lexical variable scopes: a stack of frames, innermost last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scopes {
    frames: Vec<BTreeMap<String, Value>>,
}

impl Scopes {
    pub fn new() -> Scopes {
        Scopes {
            frames: vec![BTreeMap::new()],
        }
    }

    /// Bind `name` in the innermost frame, shadowing outer bindings.
    pub fn put_in_scope(&mut self, name: impl Into<String>, value: Value) {
        if self.frames.is_empty() {
            self.frames.push(BTreeMap::new());
        }
        self.frames
            .last_mut()
            .expect("scopes always hold at least one frame")
            .insert(name.into(), value);
    }

    /// Resolve `name`, innermost frame first.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    /// Open a fresh innermost frame. Every `push_frame` must be paired with a
    /// `pop_frame`; reduction merges open one frame per folded element.
    pub fn push_frame(&mut self) {
        self.frames.push(BTreeMap::new());
    }

    pub fn pop_frame(&mut self) {
        debug_assert!(self.frames.len() > 1, "popped the outermost scope frame");
        self.frames.pop();
    }

    /// Run `f` inside a fresh frame that is discarded afterwards.
    pub fn with_frame<R>(&mut self, f: impl FnOnce(&mut Scopes) -> R) -> R {
        self.push_frame();
        let out = f(self);
        self.pop_frame();
        out
    }
}

impl Default for Scopes {
    fn default() -> Scopes {
        Scopes::new()
    }
}

/// Evaluates terms. May suspend (the runtime can call into an external
/// worker process); a runner serves exactly one request.
#[async_trait]
pub trait ExprRunner: Send {
    async fn eval(
        &mut self,
        term: &Term,
        scopes: &mut Scopes,
        backtrace: &Backtrace,
    ) -> Result<Value, RuntimeError>;
}

/// Mints one fresh runner per request. Implementations front the external
/// worker-process pool.
pub trait ExprRunnerFactory: Send + Sync {
    fn fresh_runner(&self) -> Box<dyn ExprRunner>;
}
