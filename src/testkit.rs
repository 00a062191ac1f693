//! Fixtures for exercising the framework without a real rule-evaluation
//! engine: an in-memory [`Driver`] and a small `test` [`Target`] used by
//! this crate's own integration tests and available to downstream
//! consumers (behind the `testkit` feature) for testing their own target
//! implementations against a known-good driver.
//!
//! The in-memory driver's "rule language" is a deliberately trivial
//! convention (`msg:<text>` lines mean "always emit this violation") —
//! real parsing/compilation belongs to the driver, which this crate never
//! implements.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::driver::{Driver, QueryOptions, QueryResult, RawViolation};
use crate::error::Error;
use crate::target::{Matcher, Review, Target};
use crate::value::{Doc, DocExt};

/// An in-process stand-in for the rule-evaluation engine.
#[derive(Default)]
pub struct InMemoryDriver {
    rules: Mutex<BTreeMap<String, String>>,
    data: Mutex<BTreeMap<String, Doc>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Driver for InMemoryDriver {
    fn put_rule(&self, cancel: &CancellationToken, path: &str, source: &str) -> Result<(), Error> {
        cancel.check()?;
        self.rules.lock().insert(path.to_string(), source.to_string());
        Ok(())
    }

    fn delete_rule(&self, cancel: &CancellationToken, path: &str) -> Result<bool, Error> {
        cancel.check()?;
        Ok(self.rules.lock().remove(path).is_some())
    }

    fn put_data(&self, cancel: &CancellationToken, path: &str, value: Doc) -> Result<(), Error> {
        cancel.check()?;
        self.data.lock().insert(path.to_string(), value);
        Ok(())
    }

    fn delete_data(&self, cancel: &CancellationToken, path: &str) -> Result<bool, Error> {
        cancel.check()?;
        Ok(self.data.lock().remove(path).is_some())
    }

    fn list_data(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<String>, Error> {
        cancel.check()?;
        Ok(self
            .data
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get_data(&self, cancel: &CancellationToken, path: &str) -> Result<Option<Doc>, Error> {
        cancel.check()?;
        Ok(self.data.lock().get(path).cloned())
    }

    fn query(
        &self,
        cancel: &CancellationToken,
        path: &str,
        _input: &Doc,
        opts: &QueryOptions,
    ) -> Result<QueryResult, Error> {
        cancel.check()?;
        let rules = self.rules.lock();
        let Some(source) = rules.get(path) else {
            return Ok(QueryResult::default());
        };
        let constraint_name = opts
            .externs
            .get("constraint")
            .and_then(|c| c.as_str_field("name"))
            .unwrap_or_default()
            .to_string();
        let violations = source
            .lines()
            .filter_map(|line| line.strip_prefix("msg:"))
            .map(|msg| RawViolation {
                constraint_name: constraint_name.clone(),
                msg: msg.trim().to_string(),
                metadata: BTreeMap::new(),
                resource: None,
            })
            .collect();
        Ok(QueryResult {
            violations,
            trace: None,
            stats: None,
        })
    }

    fn dump(&self, cancel: &CancellationToken) -> Result<String, Error> {
        cancel.check()?;
        let rules = self.rules.lock();
        let data = self.data.lock();
        let mut out = String::new();
        out.push_str("rules:\n");
        for (path, source) in rules.iter() {
            out.push_str(&format!("  {path}: {source}\n"));
        }
        out.push_str("data:\n");
        for path in data.keys() {
            out.push_str(&format!("  {path}\n"));
        }
        Ok(out)
    }
}

struct AlwaysMatch;
impl Matcher for AlwaysMatch {
    fn matches(&self, _review: &Review) -> Result<bool, Error> {
        Ok(true)
    }
}

struct NamespaceMatcher {
    required: String,
    known_namespaces: Arc<RwLock<BTreeSet<String>>>,
}

impl Matcher for NamespaceMatcher {
    fn matches(&self, review: &Review) -> Result<bool, Error> {
        let ns = review
            .value()
            .as_str_field("namespace")
            .ok_or_else(|| Error::ReviewTypeMismatch {
                target: "test".to_string(),
            })?;
        if !self.known_namespaces.read().contains(ns) {
            return Err(Error::EngineInternal(format!(
                "namespace {ns} not in cache"
            )));
        }
        Ok(ns == self.required)
    }
}

/// A minimal target used by this crate's test suite: reviews are passed
/// through verbatim, matches are scoped by an optional `namespace` field
/// in the match spec, and `AddData` ingests `Namespace`-shaped objects
/// into a namespace cache consulted by [`NamespaceMatcher`].
pub struct TestTarget {
    name: String,
    known_namespaces: Arc<RwLock<BTreeSet<String>>>,
}

impl Default for TestTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTarget {
    pub fn new() -> Self {
        Self::named("test")
    }

    /// A second, independently named instance, for exercising behavior that
    /// requires more than one genuinely registered target (e.g. rebinding a
    /// template from one registered target to another).
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            known_namespaces: Arc::new(RwLock::new(BTreeSet::new())),
        }
    }

    pub fn seed_namespace(&self, namespace: &str) {
        self.known_namespaces.write().insert(namespace.to_string());
    }
}

impl Target for TestTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_schema(&self) -> Doc {
        serde_json::json!({
            "type": "object",
            "properties": {"namespace": {"type": "string"}}
        })
    }

    fn library(&self) -> &str {
        ""
    }

    fn process_data(&self, value: &Doc) -> Result<Option<(String, Doc)>, Error> {
        if value.as_str_field("kind") != Some("Namespace") {
            return Ok(None);
        }
        let name = value
            .get_path(&["metadata", "name"])
            .and_then(Value::as_str)
            .ok_or_else(|| Error::ReviewTypeMismatch {
                target: self.name.clone(),
            })?;
        Ok(Some((format!("namespace/{name}"), value.clone())))
    }

    fn handle_review(&self, value: &Doc) -> Result<Option<Review>, Error> {
        Ok(Some(Review::new(value.clone())))
    }

    fn handle_violation(&self, metadata: &mut BTreeMap<String, Doc>) -> Result<(), Error> {
        metadata.insert("target".to_string(), Value::String(self.name.clone()));
        Ok(())
    }

    fn to_matcher(&self, match_spec: &Doc) -> Result<Arc<dyn Matcher>, Error> {
        match match_spec.as_str_field("namespace") {
            Some(ns) => Ok(Arc::new(NamespaceMatcher {
                required: ns.to_string(),
                known_namespaces: self.known_namespaces.clone(),
            })),
            None => Ok(Arc::new(AlwaysMatch)),
        }
    }

    fn validate_constraint(&self, match_spec: &Doc) -> Result<(), Error> {
        if !match_spec.is_object() && !match_spec.is_null() {
            return Err(Error::InvalidConstraint {
                kind: String::new(),
                name: String::new(),
                reason: "match spec must be an object".into(),
            });
        }
        Ok(())
    }
}
