//! Target registration and the target capability interface. The target
//! capability set is the framework's only variation point; it is modeled
//! as a trait object with one table lookup per call, the way agent roles
//! are dispatched in `knhk-swarm::agents` through a single lookup rather
//! than a match over a closed enum.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Error;
use crate::value::Doc;

/// A target-supplied view of an inbound object. Opaque to the core,
/// carried as a tagged document rather than a
/// target-specific type so the core never needs to downcast it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review(Doc);

impl Review {
    pub fn new(value: Doc) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Doc {
        &self.0
    }

    pub fn into_value(self) -> Doc {
        self.0
    }
}

/// An opaque, target-supplied predicate over a review object. Produced from a constraint by [`Target::to_matcher`] at
/// constraint-add time and stored verbatim by both the matcher registry
/// and the owning constraint record.
pub trait Matcher: Send + Sync {
    fn matches(&self, review: &Review) -> Result<bool, Error>;
}

/// The capability set a policy domain plug-in must implement.
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    /// JSON-Schema fragment describing the target's match criteria,
    /// embedded verbatim into the derived instance schema.
    fn match_schema(&self) -> Doc;

    /// Rule-language source merged with the template program at compile
    /// time.
    fn library(&self) -> &str;

    /// Normalizes raw data into the target's internal representation.
    /// Returns `None` when the target declines to handle this value.
    fn process_data(&self, value: &Doc) -> Result<Option<(String, Doc)>, Error>;

    /// Produces a review object from a raw inbound object. Returns `None`
    /// when this target does not claim the object.
    fn handle_review(&self, value: &Doc) -> Result<Option<Review>, Error>;

    /// Attaches target-specific fields to a violation's metadata prior to
    /// being returned to the caller.
    fn handle_violation(&self, metadata: &mut BTreeMap<String, Doc>) -> Result<(), Error>;

    /// Produces a compiled matcher for the given constraint's match spec.
    fn to_matcher(&self, match_spec: &Doc) -> Result<Arc<dyn Matcher>, Error>;

    /// Validates that the constraint's match spec is well-formed for this
    /// target (independent of schema validation).
    fn validate_constraint(&self, match_spec: &Doc) -> Result<(), Error>;
}

/// A valid target name: non-empty, begins with a letter, contains no
/// whitespace or dots.
pub fn validate_target_name(name: &str) -> Result<(), Error> {
    let mut chars = name.chars();
    let first = chars.next().ok_or_else(|| Error::CreatingClient("target name must not be empty".into()))?;
    if !first.is_ascii_alphabetic() {
        return Err(Error::CreatingClient(format!(
            "target name {name:?} must begin with a letter"
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '.') {
        return Err(Error::CreatingClient(format!(
            "target name {name:?} must not contain whitespace or dots"
        )));
    }
    Ok(())
}

/// The immutable set of targets registered at client construction. Built once
/// by [`crate::client::ClientBuilder`] and never mutated thereafter.
pub struct TargetSet {
    targets: BTreeMap<String, Arc<dyn Target>>,
}

impl TargetSet {
    #[instrument(skip(targets))]
    pub fn new(targets: Vec<Arc<dyn Target>>) -> Result<Self, Error> {
        let mut map = BTreeMap::new();
        for target in targets {
            validate_target_name(target.name())?;
            let name = target.name().to_string();
            if map.insert(name.clone(), target).is_some() {
                return Err(Error::CreatingClient(format!(
                    "duplicate target name {name:?}"
                )));
            }
        }
        if map.is_empty() {
            return Err(Error::CreatingClient(
                "at least one target must be registered".into(),
            ));
        }
        Ok(Self { targets: map })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Target>> {
        self.targets.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Target>)> {
        self.targets.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }
}
