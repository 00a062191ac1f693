//! Coordination layer between a policy-authoring API and a pluggable
//! rule-evaluation engine: a three-level registry of targets, templates,
//! and constraints; schema derivation and validation; per-constraint
//! matcher dispatch; and the request fan-out that drives the engine and
//! collects results.
//!
//! The rule-evaluation engine itself, target handlers, and the rule
//! language's parser are external collaborators: this crate only
//! specifies and consumes their interfaces ([`driver::Driver`],
//! [`target::Target`]).

pub mod cancel;
pub mod client;
pub mod constraint;
pub mod driver;
pub mod error;
pub mod matcher_registry;
pub mod schema;
pub mod target;
pub mod template;
pub mod value;

pub use cancel::CancellationToken;
pub use client::{Client, ClientBuilder, ClientConfig, ReviewOptions, ViolationResult, Responses};
pub use constraint::{Constraint, MatchOutcome, ScopedAction};
pub use driver::{Driver, QueryOptions, QueryResult, RawViolation};
pub use error::{Error, ErrorKind};
pub use target::{Matcher, Review, Target, TargetSet};
pub use template::{Template, TargetBinding};
pub use value::{Doc, DocExt};

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
