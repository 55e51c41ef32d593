//! Wire-frozen builtin terms for the expression pipeline.
//!
//! These messages cross the wire between peers, so their prost field tags are
//! part of the on-wire schema: never renumber or retype an existing field,
//! only append. They also derive serde so they can travel inside operations
//! through the cluster serialization layer.
//!
//! The dispatch core does not interpret term bodies; it hands them to the
//! expression runner (`crate::eval`) together with a lexical scope.

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::eval::RuntimeError;

/// Discriminator for the small term tree the expression runner interprets.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum TermType {
    /// Literal JSON document carried in `json`.
    Json = 0,
    /// Numeric literal carried in `number`.
    Number = 1,
    /// Variable reference into the lexical scope, name in `var`.
    Var = 2,
    /// N-ary builtin call; the callee name is in `var`, operands in `args`.
    Call = 3,
}

/// One node of an expression tree.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct Term {
    #[prost(enumeration = "TermType", tag = "1")]
    pub kind: i32,
    #[prost(double, tag = "2")]
    pub number: f64,
    #[prost(string, tag = "3")]
    pub var: String,
    #[prost(string, tag = "4")]
    pub json: String,
    #[prost(message, repeated, tag = "5")]
    pub args: Vec<Term>,
}

impl Term {
    pub fn number(value: f64) -> Term {
        Term {
            kind: TermType::Number as i32,
            number: value,
            ..Term::default()
        }
    }

    pub fn var(name: impl Into<String>) -> Term {
        Term {
            kind: TermType::Var as i32,
            var: name.into(),
            ..Term::default()
        }
    }

    pub fn call(callee: impl Into<String>, args: Vec<Term>) -> Term {
        Term {
            kind: TermType::Call as i32,
            var: callee.into(),
            args,
            ..Term::default()
        }
    }
}

/// A one-argument boolean predicate.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct Predicate {
    #[prost(string, tag = "1")]
    pub arg: String,
    #[prost(message, optional, tag = "2")]
    pub body: Option<Term>,
}

/// A one-argument mapping from document to value.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct Mapping {
    #[prost(string, tag = "1")]
    pub arg: String,
    #[prost(message, optional, tag = "2")]
    pub body: Option<Term>,
}

/// A two-argument reduction with a base value.
///
/// `body` must be associative over shard order; merged values of
/// non-associative reductions are implementation-defined. This is a client
/// contract and is not enforced here.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct Reduction {
    #[prost(message, optional, tag = "1")]
    pub base: Option<Term>,
    #[prost(string, tag = "2")]
    pub var1: String,
    #[prost(string, tag = "3")]
    pub var2: String,
    #[prost(message, optional, tag = "4")]
    pub body: Option<Term>,
}

impl Reduction {
    pub fn base_term(&self) -> Result<&Term, RuntimeError> {
        self.base
            .as_ref()
            .ok_or_else(|| RuntimeError::new("reduction is missing its base term"))
    }

    pub fn body_term(&self) -> Result<&Term, RuntimeError> {
        self.body
            .as_ref()
            .ok_or_else(|| RuntimeError::new("reduction is missing its body term"))
    }
}

/// Attribute-range restriction applied per element.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct BuiltinRange {
    #[prost(string, tag = "1")]
    pub attrname: String,
    #[prost(message, optional, tag = "2")]
    pub lowerbound: Option<Term>,
    #[prost(message, optional, tag = "3")]
    pub upperbound: Option<Term>,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct BuiltinFilter {
    #[prost(message, optional, tag = "1")]
    pub predicate: Option<Predicate>,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct BuiltinMap {
    #[prost(message, optional, tag = "1")]
    pub mapping: Option<Mapping>,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct BuiltinConcatMap {
    #[prost(message, optional, tag = "1")]
    pub mapping: Option<Mapping>,
}

/// Group-then-reduce terminal: groups elements by `group_mapping`, maps them
/// through `value_mapping`, and folds each group with `reduction`.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct BuiltinGroupedMapReduce {
    #[prost(message, optional, tag = "1")]
    pub group_mapping: Option<Mapping>,
    #[prost(message, optional, tag = "2")]
    pub value_mapping: Option<Mapping>,
    #[prost(message, optional, tag = "3")]
    pub reduction: Option<Reduction>,
}

impl BuiltinGroupedMapReduce {
    pub fn reduction(&self) -> Result<&Reduction, RuntimeError> {
        self.reduction
            .as_ref()
            .ok_or_else(|| RuntimeError::new("grouped map-reduce is missing its reduction"))
    }
}

/// Per-row write actions applied to a streamed range; the dispatch core only
/// ever counts how many rows were inserted.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct WriteQueryForEach {
    #[prost(message, optional, tag = "1")]
    pub stream: Option<Term>,
    #[prost(string, tag = "2")]
    pub var: String,
    #[prost(message, repeated, tag = "3")]
    pub queries: Vec<Term>,
}

/// How a point modify applies its mapping to the existing document.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash,
    ::prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum ModifyOp {
    /// Merge the mapping result into the existing document.
    Update = 0,
    /// Replace the existing document with the mapping result.
    Mutate = 1,
}

/// One per-element transformation in a range read's pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    Filter(BuiltinFilter),
    Map(BuiltinMap),
    ConcatMap(BuiltinConcatMap),
    Range(BuiltinRange),
}

/// The reduction attached to a range read, if any. `None` streams raw rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Terminal {
    GroupedMapReduce(BuiltinGroupedMapReduce),
    Reduce(Reduction),
    Length,
    ForEach(WriteQueryForEach),
}
