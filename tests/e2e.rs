//! End-to-end scenarios covering the client's core review and
//! registry-mutation behavior.

mod common;

use std::sync::Arc;

use constraint_framework::testkit::TestTarget;
use constraint_framework::{Error, ScopedAction};
use serde_json::json;

use common::*;

#[test]
fn scenario_1_deny_all() {
    let target = Arc::new(TestTarget::new());
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("Deny"), &c).unwrap();
    client
        .add_constraint(constraint("Deny", "c1", json!({})), &raw_instance("Deny", "c1"), &c)
        .unwrap();

    let (violations, responses) = client.review(&json!({"name": "x"}), &review_opts(), &c).unwrap();
    assert!(responses.handled.contains("test"));
    assert_eq!(violations.len(), 1);
    let v = &violations[0];
    assert_eq!(v.target, "test");
    assert_eq!(v.msg, "denied");
    assert_eq!(v.enforcement_action, vec!["deny".to_string()]);
    assert_eq!(v.constraint.kind, "Deny");
    assert_eq!(v.constraint.name, "c1");
}

#[test]
fn scenario_2_cascading_remove() {
    let target = Arc::new(TestTarget::new());
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("CascadeA"), &c).unwrap();
    client
        .add_constraint(
            constraint("CascadeA", "c1_a", json!({})),
            &raw_instance("CascadeA", "c1_a"),
            &c,
        )
        .unwrap();
    client
        .add_constraint(
            constraint("CascadeA", "c2_a", json!({})),
            &raw_instance("CascadeA", "c2_a"),
            &c,
        )
        .unwrap();

    client.add_template(deny_all_template("CascadeB"), &c).unwrap();
    client
        .add_constraint(
            constraint("CascadeB", "c3_b", json!({})),
            &raw_instance("CascadeB", "c3_b"),
            &c,
        )
        .unwrap();
    client
        .add_constraint(
            constraint("CascadeB", "c4_b", json!({})),
            &raw_instance("CascadeB", "c4_b"),
            &c,
        )
        .unwrap();

    client.remove_template("cascadea", &c).unwrap();

    let err = client.get_constraint("CascadeA", "c1_a").unwrap_err();
    assert!(matches!(err, Error::MissingTemplate(_)));
    assert!(client.get_constraint("CascadeB", "c3_b").is_ok());

    let dump = client.dump(&c).unwrap();
    assert!(!dump.to_lowercase().contains("cascadea"));
    let b_count = dump.to_lowercase().matches("cascadeb").count();
    assert!(b_count >= 1);
}

#[test]
fn scenario_3_namespace_match_filter() {
    let target = Arc::new(TestTarget::new());
    target.seed_namespace("billing");
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("NsScoped"), &c).unwrap();
    client
        .add_constraint(
            constraint("NsScoped", "c1", json!({"namespace": "billing"})),
            &raw_instance("NsScoped", "c1"),
            &c,
        )
        .unwrap();

    let (violations, _) = client
        .review(&json!({"namespace": "billing"}), &review_opts(), &c)
        .unwrap();
    assert_eq!(violations.len(), 1);

    let (violations, _) = client
        .review(&json!({"namespace": "shipping"}), &review_opts(), &c)
        .unwrap();
    assert!(violations.is_empty());
}

#[test]
fn scenario_4_autoreject_on_unknown_namespace() {
    let target = Arc::new(TestTarget::new());
    // "aaa" is deliberately never seeded.
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("NsScoped"), &c).unwrap();
    client
        .add_constraint(
            constraint("NsScoped", "c1", json!({"namespace": "billing"})),
            &raw_instance("NsScoped", "c1"),
            &c,
        )
        .unwrap();

    let (violations, _) = client
        .review(&json!({"namespace": "aaa"}), &review_opts(), &c)
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert!(violations[0].msg.contains("not in cache"));
    assert_eq!(violations[0].enforcement_action, vec!["deny".to_string()]);
}

#[test]
fn scenario_5_scoped_enforcement_action() {
    let target = Arc::new(TestTarget::new());
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("Scoped"), &c).unwrap();
    let scoped = vec![ScopedAction {
        action: "deny".to_string(),
        enforcement_points: vec!["audit".to_string(), "webhook".to_string()],
    }];
    client
        .add_constraint(
            scoped_constraint("Scoped", "c1", json!({}), scoped),
            &raw_instance("Scoped", "c1"),
            &c,
        )
        .unwrap();

    let mut opts = review_opts();
    opts.source_enforcement_point = Some("audit".to_string());
    let (violations, _) = client.review(&json!({}), &opts, &c).unwrap();
    assert_eq!(violations.len(), 1);

    opts.source_enforcement_point = Some("webhook".to_string());
    let (violations, _) = client.review(&json!({}), &opts, &c).unwrap();
    assert_eq!(violations.len(), 1);

    opts.source_enforcement_point = Some("other".to_string());
    let (violations, _) = client.review(&json!({}), &opts, &c).unwrap();
    assert!(violations.is_empty());
}

#[test]
fn scenario_5_wildcard_scoped_enforcement_action() {
    let target = Arc::new(TestTarget::new());
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("Scoped2"), &c).unwrap();
    let scoped = vec![
        ScopedAction {
            action: "deny".to_string(),
            enforcement_points: vec!["audit".to_string()],
        },
        ScopedAction {
            action: "warn".to_string(),
            enforcement_points: vec!["webhook".to_string()],
        },
    ];
    client
        .add_constraint(
            scoped_constraint("Scoped2", "c1", json!({}), scoped),
            &raw_instance("Scoped2", "c1"),
            &c,
        )
        .unwrap();

    let mut opts = review_opts();
    opts.source_enforcement_point = Some("*".to_string());
    let (violations, _) = client.review(&json!({}), &opts, &c).unwrap();
    assert_eq!(violations.len(), 1);
    let mut actions = violations[0].enforcement_action.clone();
    actions.sort();
    assert_eq!(actions, vec!["deny".to_string(), "warn".to_string()]);
}

#[test]
fn scenario_6_target_change_rejected() {
    let foo1 = Arc::new(TestTarget::named("foo1"));
    let foo2 = Arc::new(TestTarget::named("foo2"));
    let client = build_client_with_two_targets(foo1, foo2);
    let c = cancel();

    let mut tpl = deny_all_template("Immutable");
    tpl.targets[0].target = "foo1".to_string();
    client.add_template(tpl.clone(), &c).unwrap();

    let mut changed = tpl.clone();
    changed.targets[0].target = "foo2".to_string();
    let err = client.add_template(changed, &c).unwrap_err();
    assert!(matches!(err, Error::CannotChangeTargets { .. }));

    assert_eq!(client.get_template("immutable").unwrap(), tpl);
}

#[test]
fn add_constraint_is_idempotent_end_to_end() {
    let target = Arc::new(TestTarget::new());
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("Idem"), &c).unwrap();
    let inst = constraint("Idem", "c1", json!({}));
    client.add_constraint(inst.clone(), &raw_instance("Idem", "c1"), &c).unwrap();
    client.add_constraint(inst, &raw_instance("Idem", "c1"), &c).unwrap();

    let (violations, _) = client.review(&json!({}), &review_opts(), &c).unwrap();
    assert_eq!(violations.len(), 1);
}

#[test]
fn review_result_constraint_is_a_deep_copy() {
    let target = Arc::new(TestTarget::new());
    let client = build_client(target);
    let c = cancel();

    client.add_template(deny_all_template("Deny"), &c).unwrap();
    client
        .add_constraint(constraint("Deny", "c1", json!({})), &raw_instance("Deny", "c1"), &c)
        .unwrap();

    let (mut violations, _) = client.review(&json!({}), &review_opts(), &c).unwrap();
    violations[0].constraint.name = "mutated".to_string();

    let (violations_again, _) = client.review(&json!({}), &review_opts(), &c).unwrap();
    assert_eq!(violations_again[0].constraint.name, "c1");
}
