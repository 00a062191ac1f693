use std::sync::{Arc, Once};

use constraint_framework::testkit::{InMemoryDriver, TestTarget};
use constraint_framework::{
    CancellationToken, Client, ClientBuilder, Constraint, ReviewOptions, ScopedAction, Target,
    TargetBinding, Template,
};
use serde_json::{json, Value};

static TRACING_INIT: Once = Once::new();

/// Installs a subscriber so `tracing` output from the operations under test
/// is visible (e.g. via `RUST_LOG=debug cargo test -- --nocapture`) instead
/// of being silently dropped. Safe to call from every test: subsequent
/// calls after the first are no-ops.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub fn build_client(target: Arc<TestTarget>) -> Client {
    init_tracing();
    ClientBuilder::new()
        .with_target(target as Arc<dyn Target>)
        .build(Box::new(InMemoryDriver::new()))
        .expect("client builds with a single valid target")
}

/// A client with two independently named, genuinely registered targets, for
/// scenarios that must rebind a template from one real target to another
/// (as opposed to an unregistered name).
pub fn build_client_with_two_targets(first: Arc<TestTarget>, second: Arc<TestTarget>) -> Client {
    init_tracing();
    ClientBuilder::new()
        .with_target(first as Arc<dyn Target>)
        .with_target(second as Arc<dyn Target>)
        .build(Box::new(InMemoryDriver::new()))
        .expect("client builds with two valid targets")
}

pub fn deny_all_template(kind: &str) -> Template {
    Template {
        name: kind.to_lowercase(),
        kind: kind.to_string(),
        parameters_schema: None,
        targets: vec![TargetBinding {
            target: "test".to_string(),
            source: "msg:denied".to_string(),
            libs: vec![],
        }],
    }
}

pub fn constraint(kind: &str, name: &str, match_spec: Value) -> Constraint {
    Constraint {
        kind: kind.to_string(),
        name: name.to_string(),
        parameters: json!({}),
        match_spec,
        enforcement_action: Some("deny".to_string()),
        scoped_enforcement_actions: None,
    }
}

pub fn scoped_constraint(
    kind: &str,
    name: &str,
    match_spec: Value,
    scoped: Vec<ScopedAction>,
) -> Constraint {
    Constraint {
        kind: kind.to_string(),
        name: name.to_string(),
        parameters: json!({}),
        match_spec,
        enforcement_action: None,
        scoped_enforcement_actions: Some(scoped),
    }
}

pub fn raw_instance(kind: &str, name: &str) -> Value {
    json!({
        "apiVersion": "constraints.gatekeeper.sh/v1beta1",
        "kind": kind,
        "metadata": {"name": name},
    })
}

pub fn cancel() -> CancellationToken {
    CancellationToken::new()
}

pub fn review_opts() -> ReviewOptions {
    ReviewOptions::default()
}
