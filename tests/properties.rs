//! Property-based tests for invariants that must hold across arbitrary
//! inputs, not just the fixed scenarios in `tests/e2e.rs`.

mod common;

use std::sync::Arc;

use constraint_framework::testkit::TestTarget;
use proptest::prelude::*;
use serde_json::json;

use common::*;

proptest! {
    /// Registering the same constraint any number of extra times never
    /// changes the number of violations a review produces.
    #[test]
    fn add_constraint_idempotence(extra_adds in 0usize..5) {
        let target = Arc::new(TestTarget::new());
        let client = build_client(target);
        let c = cancel();

        client.add_template(deny_all_template("Idem"), &c).unwrap();
        let inst = constraint("Idem", "c1", json!({}));
        for _ in 0..=extra_adds {
            client.add_constraint(inst.clone(), &raw_instance("Idem", "c1"), &c).unwrap();
        }

        let (violations, _) = client.review(&json!({}), &review_opts(), &c).unwrap();
        prop_assert_eq!(violations.len(), 1);
    }

    /// A rejected target-set change (rebinding an installed template to an
    /// unregistered target) never mutates the stored template, whatever
    /// target name is attempted.
    #[test]
    fn rejected_target_change_leaves_state_untouched(new_target in "[a-z]{1,10}") {
        let target = Arc::new(TestTarget::new());
        let client = build_client(target);
        let c = cancel();

        let tpl = deny_all_template("Immutable");
        client.add_template(tpl.clone(), &c).unwrap();

        prop_assume!(new_target != "test");
        let mut changed = tpl.clone();
        changed.targets[0].target = new_target;
        let _ = client.add_template(changed, &c);

        prop_assert_eq!(client.get_template("immutable").unwrap(), tpl);
    }

    /// Removing a template cascades completely: no constraint under its
    /// kind remains retrievable, and its kind no longer appears in the
    /// diagnostic dump.
    #[test]
    fn remove_template_cascades_completely(n_constraints in 1usize..8) {
        let target = Arc::new(TestTarget::new());
        let client = build_client(target);
        let c = cancel();

        client.add_template(deny_all_template("Gone"), &c).unwrap();
        for i in 0..n_constraints {
            let name = format!("c{i}");
            client
                .add_constraint(constraint("Gone", &name, json!({})), &raw_instance("Gone", &name), &c)
                .unwrap();
        }

        client.remove_template("gone", &c).unwrap();

        for i in 0..n_constraints {
            let name = format!("c{i}");
            prop_assert!(client.get_constraint("Gone", &name).is_err());
        }
        let dump = client.dump(&c).unwrap();
        prop_assert!(!dump.to_lowercase().contains("gone"));
    }

    /// Mutating a returned violation's constraint field never affects a
    /// subsequent review: the framework always hands back a deep copy.
    #[test]
    fn review_constraint_field_is_always_a_deep_copy(mutated_name in "[a-z]{1,10}") {
        let target = Arc::new(TestTarget::new());
        let client = build_client(target);
        let c = cancel();

        client.add_template(deny_all_template("Deny"), &c).unwrap();
        client
            .add_constraint(constraint("Deny", "c1", json!({})), &raw_instance("Deny", "c1"), &c)
            .unwrap();

        let (mut violations, _) = client.review(&json!({}), &review_opts(), &c).unwrap();
        violations[0].constraint.name = mutated_name;

        let (violations_again, _) = client.review(&json!({}), &review_opts(), &c).unwrap();
        prop_assert_eq!(&violations_again[0].constraint.name, "c1");
    }
}
