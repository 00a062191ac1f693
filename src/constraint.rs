//! Constraint instances and the per-constraint record that tracks their
//! compiled matchers and enforcement policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::target::{Matcher, Review};
use crate::value::{Doc, DocExt};

/// One enforcement action scoped to a set of enforcement points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedAction {
    pub action: String,
    #[serde(default)]
    pub enforcement_points: Vec<String>,
}

/// The wildcard enforcement point that collects every declared action.
pub const WILDCARD_ENFORCEMENT_POINT: &str = "*";

/// An instance of a template, identified by `(kind, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub kind: String,
    pub name: String,
    #[serde(default = "Doc::default")]
    pub parameters: Doc,
    #[serde(default = "Doc::default")]
    pub match_spec: Doc,
    pub enforcement_action: Option<String>,
    pub scoped_enforcement_actions: Option<Vec<ScopedAction>>,
}

impl Constraint {
    /// Strips the status subtree from a raw instance document before it is
    /// validated or persisted. Called by `Client::add_constraint` against
    /// the incoming raw document, ahead of anything that gets cached.
    pub fn strip_status_from_raw(raw: &Doc) -> Doc {
        raw.without_status()
    }

    pub fn validate_shape(&self) -> Result<(), Error> {
        let invalid = |reason: &str| Error::InvalidConstraint {
            kind: self.kind.clone(),
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.kind.trim().is_empty() {
            return Err(invalid("kind must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        Ok(())
    }
}

/// The result of matching a constraint against a review: either a real match, with the applicable
/// enforcement actions, or an autoreject carrying the matcher's error.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched { actions: Vec<String> },
    Autoreject { actions: Vec<String>, message: String },
}

impl MatchOutcome {
    pub fn actions(&self) -> &[String] {
        match self {
            MatchOutcome::Matched { actions } => actions,
            MatchOutcome::Autoreject { actions, .. } => actions,
        }
    }
}

/// Marker prefixed onto every autoreject message.
pub const AUTOREJECT_MARKER: &str = "autoreject:";

/// Holds one instance: its matcher map, its enforcement policy, and the
/// matching/result-producing logic.
pub struct ConstraintRecord {
    constraint: Constraint,
    matchers: HashMap<String, Arc<dyn Matcher>>,
}

impl ConstraintRecord {
    pub fn new(constraint: Constraint, matchers: HashMap<String, Arc<dyn Matcher>>) -> Self {
        Self {
            constraint,
            matchers,
        }
    }

    /// Deep copy accessor.
    pub fn constraint(&self) -> Constraint {
        self.constraint.clone()
    }

    pub fn matcher_for(&self, target: &str) -> Option<&Arc<dyn Matcher>> {
        self.matchers.get(target)
    }

    pub fn matcher_map(&self) -> &HashMap<String, Arc<dyn Matcher>> {
        &self.matchers
    }

    /// The set of applicable actions for a given
    /// source enforcement point set, independent of whether the matcher
    /// actually matches. Exposed so callers that already know the match
    /// decision (e.g. via [`crate::matcher_registry::MatcherRegistry`])
    /// can resolve actions without re-running the matcher.
    pub fn applicable_actions(&self, source_enforcement_points: &[String]) -> Vec<String> {
        match &self.constraint.scoped_enforcement_actions {
            Some(scoped) => {
                let mut seen = BTreeMap::new();
                for ep in source_enforcement_points {
                    for entry in scoped {
                        let applies = entry.enforcement_points.iter().any(|declared| {
                            declared == ep || declared == WILDCARD_ENFORCEMENT_POINT
                        });
                        if applies {
                            seen.insert(entry.action.clone(), ());
                        }
                    }
                }
                seen.into_keys().collect()
            }
            None => vec![self
                .constraint
                .enforcement_action
                .clone()
                .unwrap_or_else(|| "deny".to_string())],
        }
    }

    /// Full match semantics:
    /// 1. Absent matcher for `target` => no record.
    /// 2. Compute applicable actions; empty => no record.
    /// 3. Run the matcher: error => autoreject; `false` => no record;
    ///    `true` => matched.
    pub fn match_against(
        &self,
        target: &str,
        review: &Review,
        source_enforcement_points: &[String],
    ) -> Option<MatchOutcome> {
        let matcher = self.matchers.get(target)?;
        let actions = self.applicable_actions(source_enforcement_points);
        if actions.is_empty() {
            return None;
        }
        match matcher.matches(review) {
            Ok(true) => Some(MatchOutcome::Matched { actions }),
            Ok(false) => None,
            Err(err) => Some(MatchOutcome::Autoreject {
                actions,
                message: format!("{AUTOREJECT_MARKER} {err}"),
            }),
        }
    }
}
