//! Template records and the per-kind record that tracks their compiled
//! program, derived schema, and owned constraints.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::constraint::{Constraint, ConstraintRecord, MatchOutcome};
use crate::error::Error;
use crate::schema::{validate_cr, Crd, Schema};
use crate::target::{Review, Target, TargetSet};
use crate::value::Doc;

/// One target binding: rule-language source plus referenced libraries.
/// The current design permits exactly one binding per
/// template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetBinding {
    pub target: String,
    pub source: String,
    #[serde(default)]
    pub libs: Vec<String>,
}

/// User-authored policy source bound to one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub kind: String,
    pub parameters_schema: Option<Schema>,
    pub targets: Vec<TargetBinding>,
}

// `Schema` wraps `serde_json::Value`, which already implements
// Serialize/Deserialize; derive would require Schema to implement those
// traits directly, so provide a manual (de)serialization bridge through
// its inner value for Template's derive to work.
impl Serialize for Schema {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Schema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Schema(Doc::deserialize(deserializer)?))
    }
}

impl Template {
    pub fn binding(&self) -> Option<&TargetBinding> {
        self.targets.first()
    }
}

/// Owns one template: compiled program handle, derived schema, and the
/// set of its constraints.
pub struct TemplateRecord {
    template: Template,
    crd: Crd,
    schema: Schema,
    program_path: String,
    constraints: BTreeMap<String, ConstraintRecord>,
}

impl TemplateRecord {
    pub fn new(template: Template, crd: Crd, schema: Schema, program_path: String) -> Self {
        Self {
            template,
            crd,
            schema,
            program_path,
            constraints: BTreeMap::new(),
        }
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn crd(&self) -> &Crd {
        &self.crd
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn program_path(&self) -> &str {
        &self.program_path
    }

    pub fn target_name(&self) -> &str {
        self.template
            .binding()
            .map(|b| b.target.as_str())
            .unwrap_or_default()
    }

    pub fn constraint_names(&self) -> Vec<String> {
        self.constraints.keys().cloned().collect()
    }

    pub fn get_record(&self, name: &str) -> Option<&ConstraintRecord> {
        self.constraints.get(name)
    }

    pub fn get_constraint(&self, name: &str) -> Option<Constraint> {
        self.constraints.get(name).map(ConstraintRecord::constraint)
    }

    /// Delegates to the target's own validation and to `validateCR`.
    pub fn validate_instance(
        &self,
        instance: &Constraint,
        raw: &Doc,
        target: &dyn Target,
        group: &str,
        max_name_len: usize,
    ) -> Result<(), Error> {
        instance.validate_shape()?;
        target.validate_constraint(&instance.match_spec)?;
        validate_cr(
            &instance.kind,
            &instance.name,
            group,
            &self.crd,
            &self.schema,
            raw,
            max_name_len,
        )
    }

    /// Idempotent fast-path: if `cached[name]` exists and is semantically
    /// equal to `instance`, this is a no-op. Returns whether anything changed.
    #[instrument(skip(self, instance, raw, targets), fields(kind = %self.template.kind, name = %instance.name))]
    pub fn add_constraint(
        &mut self,
        instance: Constraint,
        raw: &Doc,
        targets: &TargetSet,
        group: &str,
        max_name_len: usize,
    ) -> Result<bool, Error> {
        let target = targets
            .get(self.target_name())
            .ok_or_else(|| Error::InvalidConstraint {
                kind: instance.kind.clone(),
                name: instance.name.clone(),
                reason: format!("unknown target {:?}", self.target_name()),
            })?;

        self.validate_instance(&instance, raw, target.as_ref(), group, max_name_len)?;

        if let Some(existing) = self.constraints.get(&instance.name) {
            if existing.constraint() == instance {
                debug!("constraint unchanged, skipping matcher rebuild");
                return Ok(false);
            }
        }

        let matcher = target.to_matcher(&instance.match_spec)?;
        let mut matchers = std::collections::HashMap::new();
        matchers.insert(self.target_name().to_string(), matcher);
        self.constraints
            .insert(instance.name.clone(), ConstraintRecord::new(instance, matchers));
        Ok(true)
    }

    pub fn remove_constraint(&mut self, name: &str) -> bool {
        self.constraints.remove(name).is_some()
    }

    /// Atomically rebinds this template to a new target. Builds the new
    /// `(template, crd, schema, matchers)` state entirely off to the side;
    /// only swaps in once every existing constraint's matcher rebuilds and
    /// validates successfully. A failing update leaves `self` untouched.
    #[instrument(skip(self, new_template, new_crd, new_schema, targets))]
    pub fn update(
        &mut self,
        new_template: Template,
        new_crd: Crd,
        new_schema: Schema,
        new_program_path: String,
        targets: &TargetSet,
        group: &str,
        max_name_len: usize,
    ) -> Result<(), Error> {
        let new_binding = new_template
            .binding()
            .ok_or_else(|| Error::InvalidTemplate {
                name: new_template.name.clone(),
                reason: "template has no target binding".into(),
            })?;
        let new_target = targets
            .get(&new_binding.target)
            .ok_or_else(|| Error::InvalidTemplate {
                name: new_template.name.clone(),
                reason: format!("unknown target {:?}", new_binding.target),
            })?;

        let mut rebuilt = BTreeMap::new();
        for (name, record) in &self.constraints {
            let instance = record.constraint();
            validate_cr(
                &instance.kind,
                &instance.name,
                group,
                &new_crd,
                &new_schema,
                &serde_json::to_value(&instance).unwrap_or(Doc::Null),
                max_name_len,
            )?;
            new_target.validate_constraint(&instance.match_spec)?;
            let matcher = new_target.to_matcher(&instance.match_spec)?;
            let mut matchers = std::collections::HashMap::new();
            matchers.insert(new_binding.target.clone(), matcher);
            rebuilt.insert(name.clone(), ConstraintRecord::new(instance, matchers));
        }

        // Only now, with every constraint proven compatible, swap state in.
        self.template = new_template;
        self.crd = new_crd;
        self.schema = new_schema;
        self.program_path = new_program_path;
        self.constraints = rebuilt;
        Ok(())
    }

    /// Runs each constraint's match logic; returns only constraints that
    /// matched or errored. Self-contained: re-runs
    /// each constraint's own matcher, so it works correctly even when the
    /// client-level matcher registry (`crate::matcher_registry`) has not
    /// been consulted.
    pub fn matches(
        &self,
        target: &str,
        review: &Review,
        source_enforcement_points: &[String],
    ) -> BTreeMap<String, MatchOutcome> {
        self.constraints
            .iter()
            .filter_map(|(name, record)| {
                record
                    .match_against(target, review, source_enforcement_points)
                    .map(|outcome| (name.clone(), outcome))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::target::Matcher;
    use serde_json::json;
    use std::sync::Arc;

    struct AcceptAllTarget;
    impl Target for AcceptAllTarget {
        fn name(&self) -> &str {
            "test"
        }
        fn match_schema(&self) -> Doc {
            json!({"type": "object"})
        }
        fn library(&self) -> &str {
            ""
        }
        fn process_data(&self, _value: &Doc) -> Result<Option<(String, Doc)>, Error> {
            Ok(None)
        }
        fn handle_review(&self, value: &Doc) -> Result<Option<Review>, Error> {
            Ok(Some(Review::new(value.clone())))
        }
        fn handle_violation(&self, _metadata: &mut std::collections::BTreeMap<String, Doc>) -> Result<(), Error> {
            Ok(())
        }
        fn to_matcher(&self, _match_spec: &Doc) -> Result<Arc<dyn Matcher>, Error> {
            struct Always;
            impl Matcher for Always {
                fn matches(&self, _review: &Review) -> Result<bool, Error> {
                    Ok(true)
                }
            }
            Ok(Arc::new(Always))
        }
        fn validate_constraint(&self, _match_spec: &Doc) -> Result<(), Error> {
            Ok(())
        }
    }

    fn make_record() -> (TemplateRecord, TargetSet) {
        let targets = TargetSet::new(vec![Arc::new(AcceptAllTarget)]).unwrap();
        let template = Template {
            name: "deny".into(),
            kind: "Deny".into(),
            parameters_schema: None,
            targets: vec![TargetBinding {
                target: "test".into(),
                source: "package deny".into(),
                libs: vec![],
            }],
        };
        let schema = crate::schema::create_schema(&template, targets.get("test").unwrap().as_ref()).unwrap();
        let crd = crate::schema::create_crd(&template, &schema, "constraints.gatekeeper.sh").unwrap();
        (
            TemplateRecord::new(template, crd, schema, "templates.Deny".into()),
            targets,
        )
    }

    #[test]
    fn add_constraint_is_idempotent() {
        let (mut record, targets) = make_record();
        let instance = Constraint {
            kind: "Deny".into(),
            name: "c1".into(),
            parameters: json!({}),
            match_spec: json!({}),
            enforcement_action: Some("deny".into()),
            scoped_enforcement_actions: None,
        };
        let raw = json!({"metadata": {"name": "c1"}});
        let changed1 = record
            .add_constraint(instance.clone(), &raw, &targets, "constraints.gatekeeper.sh", 63)
            .unwrap();
        let changed2 = record
            .add_constraint(instance, &raw, &targets, "constraints.gatekeeper.sh", 63)
            .unwrap();
        assert!(changed1);
        assert!(!changed2);
    }

    #[test]
    fn update_rejects_unknown_target_leaving_state_untouched() {
        let (mut record, targets) = make_record();
        let before = record.template().clone();
        let new_template = Template {
            name: "deny".into(),
            kind: "Deny".into(),
            parameters_schema: None,
            targets: vec![TargetBinding {
                target: "does-not-exist".into(),
                source: "package deny".into(),
                libs: vec![],
            }],
        };
        let schema = record.schema().clone();
        let crd = record.crd().clone();
        let result = record.update(
            new_template,
            crd,
            schema,
            "templates.Deny".into(),
            &targets,
            "constraints.gatekeeper.sh",
            63,
        );
        assert!(result.is_err());
        assert_eq!(record.template(), &before);
    }
}
