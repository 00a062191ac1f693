//! The public API: target registry, dispatcher to the driver, and
//! concurrency coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::constraint::Constraint;
use crate::driver::{self, Driver, QueryOptions};
use crate::error::Error;
use crate::matcher_registry::MatcherRegistry;
use crate::schema;
use crate::target::{Review, Target, TargetSet};
use crate::template::{Template, TemplateRecord};
use crate::value::Doc;

/// Configurable knobs that are part of the core (not loaded from disk —
/// loading config files from an external source is out of scope; having
/// configurable values is not). Mirrors `SwarmConfig::validate` in structure: built
/// once, validated eagerly, then treated as immutable for the client's
/// lifetime.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub forbidden_allowlist: BTreeSet<String>,
    pub group: String,
    pub max_name_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            forbidden_allowlist: BTreeSet::from(["inventory".to_string()]),
            group: "constraints.gatekeeper.sh".to_string(),
            max_name_len: 63,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.group.trim().is_empty() {
            return Err(Error::CreatingClient("group must not be empty".into()));
        }
        if self.max_name_len == 0 {
            return Err(Error::CreatingClient("max_name_len must be positive".into()));
        }
        Ok(())
    }
}

/// Per-target success/error accounting for a fanned-out call.
#[derive(Debug, Default)]
pub struct Responses {
    pub handled: BTreeSet<String>,
    pub errors: BTreeMap<String, Error>,
}

impl Responses {
    fn single_handled(target: &str) -> Self {
        let mut handled = BTreeSet::new();
        handled.insert(target.to_string());
        Self {
            handled,
            errors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    pub source_enforcement_point: Option<String>,
    pub tracing_enabled: bool,
    pub stats_enabled: bool,
}

/// One violation produced by `Review`.
#[derive(Debug, Clone)]
pub struct ViolationResult {
    pub target: String,
    pub msg: String,
    pub metadata: BTreeMap<String, Doc>,
    pub constraint: Constraint,
    pub review: Review,
    pub enforcement_action: Vec<String>,
    pub resource: Option<Doc>,
}

struct ClientState {
    // kind -> record
    templates: BTreeMap<String, TemplateRecord>,
    // template name -> kind, so a "sparse" RemoveTemplate(name-only) can
    // locate its record.
    name_to_kind: BTreeMap<String, String>,
    matchers: MatcherRegistry,
}

/// Public API façade. Guards the template/matcher registries behind a
/// single shared/exclusive lock: readers (`review`, `audit`,
/// `get_template`, `get_constraint`) take it shared; writers take it
/// exclusive. The driver is invoked while holding the lock to prevent
/// torn state.
pub struct Client {
    targets: TargetSet,
    config: ClientConfig,
    driver: Box<dyn Driver>,
    state: RwLock<ClientState>,
}

pub struct ClientBuilder {
    targets: Vec<Arc<dyn Target>>,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            config: ClientConfig::default(),
        }
    }

    pub fn with_target(mut self, target: Arc<dyn Target>) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self, driver: Box<dyn Driver>) -> Result<Client, Error> {
        self.config.validate()?;
        let targets = TargetSet::new(self.targets)?;
        Ok(Client {
            targets,
            config: self.config,
            driver,
            state: RwLock::new(ClientState {
                templates: BTreeMap::new(),
                name_to_kind: BTreeMap::new(),
                matchers: MatcherRegistry::new(),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn merged_source(target: &dyn Target, binding: &crate::template::TargetBinding) -> String {
    format!("{}\n{}", target.library(), binding.source)
}

impl Client {
    /// Fans out a raw object to every target's data processor and pushes
    /// accepted data into the driver under `external/<target>/<path>`.
    #[instrument(skip(self, value, cancel))]
    pub fn add_data(&self, value: &Doc, cancel: &CancellationToken) -> Result<Responses, Error> {
        cancel.check()?;
        let state = self.state.read();
        let mut responses = Responses::default();
        let outcomes: Vec<(String, Result<Option<()>, Error>)> = self
            .targets
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(name, target)| {
                let outcome = (|| -> Result<Option<()>, Error> {
                    cancel.check()?;
                    match target.process_data(value)? {
                        None => Ok(None),
                        Some((path, normalized)) => {
                            self.driver.put_data(
                                cancel,
                                &driver::external_data_path(name, &path),
                                normalized,
                            )?;
                            Ok(Some(()))
                        }
                    }
                })();
                ((*name).clone(), outcome)
            })
            .collect();
        drop(state);
        for (name, outcome) in outcomes {
            match outcome {
                Ok(Some(())) => {
                    responses.handled.insert(name);
                }
                Ok(None) => {}
                Err(e) => {
                    responses.errors.insert(name, e);
                }
            }
        }
        Ok(responses)
    }

    /// Dual of `add_data`: removes previously-pushed data.
    #[instrument(skip(self, value, cancel))]
    pub fn remove_data(&self, value: &Doc, cancel: &CancellationToken) -> Result<Responses, Error> {
        cancel.check()?;
        let mut responses = Responses::default();
        for (name, target) in self.targets.iter() {
            cancel.check()?;
            match target.process_data(value) {
                Ok(Some((path, _normalized))) => {
                    match self
                        .driver
                        .delete_data(cancel, &driver::external_data_path(name, &path))
                    {
                        Ok(_) => {
                            responses.handled.insert(name.clone());
                        }
                        Err(e) => {
                            responses.errors.insert(name.clone(), e);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    responses.errors.insert(name.clone(), e);
                }
            }
        }
        Ok(responses)
    }

    /// Installs or updates a template. Validates
    /// the target set, derives the schema/CRD, compiles via the driver,
    /// then atomically installs a new record (fresh install) or updates
    /// an existing one.
    #[instrument(skip(self, template, cancel), fields(name = %template.name, kind = %template.kind))]
    pub fn add_template(
        &self,
        template: Template,
        cancel: &CancellationToken,
    ) -> Result<Responses, Error> {
        cancel.check()?;
        if template.name.trim().is_empty() || template.kind.trim().is_empty() {
            return Err(Error::InvalidTemplate {
                name: template.name.clone(),
                reason: "name and kind are required".into(),
            });
        }
        if template.targets.len() != 1 {
            return Err(Error::InvalidTemplate {
                name: template.name.clone(),
                reason: format!(
                    "exactly one target binding is required, got {}",
                    template.targets.len()
                ),
            });
        }
        if template.name.to_lowercase() != template.kind.to_lowercase() {
            return Err(Error::InvalidTemplate {
                name: template.name.clone(),
                reason: format!(
                    "kind {:?} must match template name {:?}",
                    template.kind, template.name
                ),
            });
        }
        let binding = template.targets[0].clone();
        let target = self
            .targets
            .get(&binding.target)
            .ok_or_else(|| Error::InvalidTemplate {
                name: template.name.clone(),
                reason: format!("unknown target {:?}", binding.target),
            })?;

        schema::check_forbidden_fields(&binding.source, &self.config.forbidden_allowlist)
            .map_err(|e| match e {
                Error::InvalidTemplate { reason, .. } => Error::InvalidTemplate {
                    name: template.name.clone(),
                    reason,
                },
                other => other,
            })?;

        let schema = schema::create_schema(&template, target.as_ref())?;
        let crd = schema::create_crd(&template, &schema, &self.config.group)?;
        schema::validate_crd(&template, &crd, &self.targets)?;

        let mut state = self.state.write();
        let program_path = driver::program_path(&template.kind);
        let source = merged_source(target.as_ref(), &binding);

        if let Some(existing_kind) = state.name_to_kind.get(&template.name).cloned() {
            if existing_kind != template.kind {
                return Err(Error::InvalidTemplate {
                    name: template.name.clone(),
                    reason: "kind may not change across AddTemplate calls".into(),
                });
            }
            let existing_target = state
                .templates
                .get(&existing_kind)
                .expect("name_to_kind index must be consistent")
                .target_name()
                .to_string();
            if existing_target != binding.target {
                return Err(Error::CannotChangeTargets {
                    name: template.name.clone(),
                    current: existing_target,
                    requested: binding.target.clone(),
                });
            }
            let unchanged = state.templates.get(&existing_kind).unwrap().template() == &template;
            if unchanged {
                info!("template unchanged, reporting handled without reinstalling");
                return Ok(Responses::single_handled(&binding.target));
            }

            self.driver.put_rule(cancel, &program_path, &source)?;
            let record = state.templates.get_mut(&existing_kind).unwrap();
            record.update(
                template,
                crd,
                schema,
                program_path,
                &self.targets,
                &self.config.group,
                self.config.max_name_len,
            )?;
        } else {
            self.driver.put_rule(cancel, &program_path, &source)?;
            let record = TemplateRecord::new(template.clone(), crd, schema, program_path);
            state
                .name_to_kind
                .insert(template.name.clone(), template.kind.clone());
            state.templates.insert(template.kind.clone(), record);
        }

        Ok(Responses::single_handled(&binding.target))
    }

    /// Cascading remove. Accepts a "sparse"
    /// template carrying only the name. Idempotent: removing an unknown
    /// template is a no-op, not an error.
    #[instrument(skip(self, cancel))]
    pub fn remove_template(&self, name: &str, cancel: &CancellationToken) -> Result<(), Error> {
        cancel.check()?;
        let mut state = self.state.write();
        let Some(kind) = state.name_to_kind.remove(name) else {
            return Ok(());
        };
        if let Some(record) = state.templates.remove(&kind) {
            for constraint_name in record.constraint_names() {
                state.matchers.remove(record.target_name(), &kind, &constraint_name);
            }
            state.matchers.remove_kind(&kind);
            let _ = self.driver.delete_rule(cancel, record.program_path());
            info!(kind = %kind, "removed template, cascading to constraints");
        }
        Ok(())
    }

    /// Resolves the owning template by `kind` and forwards to it.
    #[instrument(skip(self, instance, raw, cancel), fields(kind = %instance.kind, name = %instance.name))]
    pub fn add_constraint(
        &self,
        instance: Constraint,
        raw: &Doc,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        cancel.check()?;
        let raw = Constraint::strip_status_from_raw(raw);
        let mut state = self.state.write();
        let kind = instance.kind.clone();
        let name = instance.name.clone();
        let target_name = {
            let record = state
                .templates
                .get(&kind)
                .ok_or_else(|| Error::MissingTemplate(kind.clone()))?;
            record.target_name().to_string()
        };
        let record = state.templates.get_mut(&kind).unwrap();
        let changed = record.add_constraint(
            instance,
            &raw,
            &self.targets,
            &self.config.group,
            self.config.max_name_len,
        )?;
        if changed {
            let matcher = record
                .get_record(&name)
                .and_then(|r| r.matcher_for(&target_name))
                .expect("matcher just built")
                .clone();
            state.matchers.add(&target_name, &kind, &name, matcher);
        }
        Ok(())
    }

    #[instrument(skip(self, cancel))]
    pub fn remove_constraint(
        &self,
        kind: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        cancel.check()?;
        let mut state = self.state.write();
        let Some(record) = state.templates.get_mut(kind) else {
            return Ok(());
        };
        let target_name = record.target_name().to_string();
        if record.remove_constraint(name) {
            state.matchers.remove(&target_name, kind, name);
        }
        Ok(())
    }

    pub fn get_template(&self, name: &str) -> Result<Template, Error> {
        let state = self.state.read();
        let kind = state
            .name_to_kind
            .get(name)
            .ok_or_else(|| Error::MissingTemplate(name.to_string()))?;
        Ok(state.templates[kind].template().clone())
    }

    pub fn get_constraint(&self, kind: &str, name: &str) -> Result<Constraint, Error> {
        let state = self.state.read();
        let record = state
            .templates
            .get(kind)
            .ok_or_else(|| Error::MissingTemplate(kind.to_string()))?;
        record
            .get_constraint(name)
            .ok_or_else(|| Error::MissingConstraint {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    /// Reviews an inbound object against every applicable constraint.
    /// Uses the matcher registry as the single source of truth for the
    /// boolean match decision, and resolves enforcement actions from the
    /// owning constraint record without re-running the matcher a second
    /// time.
    #[instrument(skip(self, object, cancel))]
    pub fn review(
        &self,
        object: &Doc,
        opts: &ReviewOptions,
        cancel: &CancellationToken,
    ) -> Result<(Vec<ViolationResult>, Responses), Error> {
        cancel.check()?;
        let state = self.state.read();
        let source_eps: Vec<String> = opts.source_enforcement_point.iter().cloned().collect();
        let qopts = QueryOptions {
            tracing: opts.tracing_enabled,
            stats: opts.stats_enabled,
            print_enabled: false,
            print_hook: None,
            externs: BTreeMap::new(),
        };

        enum Outcome {
            NotHandled,
            Handled {
                review: Review,
                matched: BTreeMap<String, Vec<String>>,
                errors: BTreeMap<String, Error>,
            },
        }

        let per_target: Vec<(String, Result<Outcome, Error>)> = self
            .targets
            .iter()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|(name, target)| {
                let outcome = (|| -> Result<Outcome, Error> {
                    cancel.check()?;
                    match target.handle_review(object)? {
                        None => Ok(Outcome::NotHandled),
                        Some(review) => {
                            let (matched, errors) =
                                state.matchers.constraints_for(name, &review, cancel)?;
                            Ok(Outcome::Handled {
                                review,
                                matched,
                                errors,
                            })
                        }
                    }
                })();
                ((*name).clone(), outcome)
            })
            .collect();

        let mut responses = Responses::default();
        let mut violations = Vec::new();

        for (target_name, outcome) in per_target {
            let target = self.targets.get(&target_name).expect("iterated from targets");
            match outcome {
                Err(e) => {
                    warn!(target = %target_name, error = %e, "target review fan-out failed");
                    responses.errors.insert(target_name, e);
                }
                Ok(Outcome::NotHandled) => {}
                Ok(Outcome::Handled {
                    review,
                    matched,
                    errors,
                }) => {
                    responses.handled.insert(target_name.clone());

                    for (key, err) in errors {
                        if let Some((kind, name)) = parse_registry_key(&key, &target_name) {
                            if let Some(tpl) = state.templates.get(&kind) {
                                if let Some(record) = tpl.get_record(&name) {
                                    let actions = record.applicable_actions(&source_eps);
                                    if actions.is_empty() {
                                        continue;
                                    }
                                    violations.push(ViolationResult {
                                        target: target_name.clone(),
                                        msg: format!(
                                            "{} {err}",
                                            crate::constraint::AUTOREJECT_MARKER
                                        ),
                                        metadata: BTreeMap::new(),
                                        constraint: record.constraint(),
                                        review: review.clone(),
                                        enforcement_action: actions,
                                        resource: None,
                                    });
                                }
                            }
                        }
                    }

                    for (kind, names) in matched {
                        let Some(tpl) = state.templates.get(&kind) else {
                            continue;
                        };
                        for name in names {
                            let Some(record) = tpl.get_record(&name) else {
                                continue;
                            };
                            let actions = record.applicable_actions(&source_eps);
                            if actions.is_empty() {
                                continue;
                            }
                            let instance_doc =
                                serde_json::to_value(record.constraint()).unwrap_or(Doc::Null);
                            let mut query_opts = qopts.clone();
                            query_opts
                                .externs
                                .insert("constraint".to_string(), instance_doc);
                            let result = self.driver.query(
                                cancel,
                                tpl.program_path(),
                                review.value(),
                                &query_opts,
                            )?;
                            for raw in result.violations {
                                if raw.constraint_name != name {
                                    continue;
                                }
                                let mut metadata = raw.metadata;
                                target.handle_violation(&mut metadata)?;
                                violations.push(ViolationResult {
                                    target: target_name.clone(),
                                    msg: raw.msg,
                                    metadata,
                                    constraint: record.constraint(),
                                    review: review.clone(),
                                    enforcement_action: actions.clone(),
                                    resource: raw.resource,
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok((violations, responses))
    }

    /// Iterates the driver's cached data as reviews and returns all
    /// violations. Iteration order is ascending by
    /// data path. Takes the same options as `review`, so a caller can
    /// enable tracing/stats or scope the audit to an enforcement point.
    #[instrument(skip(self, opts, cancel))]
    pub fn audit(
        &self,
        opts: &ReviewOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ViolationResult>, Error> {
        cancel.check()?;
        let mut paths = self.driver.list_data(cancel, "external")?;
        paths.sort();
        let mut all = Vec::new();
        for path in paths {
            cancel.check()?;
            if let Some(obj) = self.driver.get_data(cancel, &path)? {
                let (mut violations, _responses) = self.review(&obj, opts, cancel)?;
                all.append(&mut violations);
            }
        }
        Ok(all)
    }

    /// Diagnostic string capturing the current driver state.
    pub fn dump(&self, cancel: &CancellationToken) -> Result<String, Error> {
        self.driver.dump(cancel)
    }
}

fn parse_registry_key(key: &str, expected_target: &str) -> Option<(String, String)> {
    let mut parts = key.splitn(3, ' ');
    let target = parts.next()?;
    if target != expected_target {
        return None;
    }
    let kind = parts.next()?.to_string();
    let name = parts.next()?.to_string();
    Some((kind, name))
}
