//! The driver interface: the rule-evaluation
//! engine this crate coordinates but never implements. Kept as a trait
//! object so the framework stays interchangeable across drivers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::value::Doc;

/// Options accepted by [`Driver::query`].
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub tracing: bool,
    pub stats: bool,
    pub print_enabled: bool,
    /// Called with each line a `print()`-style builtin emits during
    /// evaluation, when `print_enabled` is set. `None` means no hook is
    /// installed, even if printing is enabled.
    pub print_hook: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Additional named inputs passed alongside `input`, e.g. the set of
    /// candidate constraint instances a single query should evaluate
    /// against.
    pub externs: BTreeMap<String, Doc>,
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("tracing", &self.tracing)
            .field("stats", &self.stats)
            .field("print_enabled", &self.print_enabled)
            .field("print_hook", &self.print_hook.is_some())
            .field("externs", &self.externs)
            .finish()
    }
}

/// One raw violation produced by evaluating a compiled program. The enforcement action and
/// constraint handle are attached by the client façade, not the driver.
#[derive(Debug, Clone)]
pub struct RawViolation {
    pub constraint_name: String,
    pub msg: String,
    pub metadata: BTreeMap<String, Doc>,
    pub resource: Option<Doc>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub violations: Vec<RawViolation>,
    pub trace: Option<String>,
    pub stats: Option<Doc>,
}

/// The rule-evaluation engine consumed by the client façade.
/// Assumed internally threadsafe; invoked while the client holds its
/// outer lock to prevent torn state.
pub trait Driver: Send + Sync {
    fn put_rule(&self, cancel: &CancellationToken, path: &str, source: &str) -> Result<(), Error>;

    /// Returns whether a rule existed at `path` prior to deletion.
    fn delete_rule(&self, cancel: &CancellationToken, path: &str) -> Result<bool, Error>;

    fn put_data(&self, cancel: &CancellationToken, path: &str, value: Doc) -> Result<(), Error>;

    /// Returns whether data existed at `path` prior to deletion.
    fn delete_data(&self, cancel: &CancellationToken, path: &str) -> Result<bool, Error>;

    /// Lists cached data paths under `prefix`, ascending, for `Audit`.
    fn list_data(&self, cancel: &CancellationToken, prefix: &str) -> Result<Vec<String>, Error>;

    fn get_data(&self, cancel: &CancellationToken, path: &str) -> Result<Option<Doc>, Error>;

    fn query(
        &self,
        cancel: &CancellationToken,
        path: &str,
        input: &Doc,
        opts: &QueryOptions,
    ) -> Result<QueryResult, Error>;

    fn dump(&self, cancel: &CancellationToken) -> Result<String, Error>;
}

/// The compiled-program path for a template's kind, e.g. `templates.Deny`.
pub fn program_path(kind: &str) -> String {
    format!("templates.{kind}")
}

/// The data path a target's normalized object is pushed under.
pub fn external_data_path(target: &str, path: &str) -> String {
    format!("external/{target}/{path}")
}
