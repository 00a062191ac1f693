//! Schema derivation and CRD construction, in the same style `knhk-config::schema`
//! builds its configuration schema structs and `knhk-validation::policy`
//! derives validation shape from a policy document: plain serde structs
//! over a `serde_json::Value` payload rather than a full JSON-Schema
//! compiler, since the core only ever validates documents it derived the
//! schema for.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::{json, Value};

use crate::error::Error;
use crate::target::Target;
use crate::template::Template;
use crate::value::{Doc, DocExt};

/// A derived JSON-Schema fragment.
/// Kept as a plain `serde_json::Value` tree: the schema is always
/// produced by [`create_schema`] from trusted inputs, so a bespoke schema
/// AST would only add ceremony without adding safety.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema(pub Value);

impl Schema {
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Cluster-scoped CRD naming derived from a template.
#[derive(Debug, Clone, PartialEq)]
pub struct Crd {
    pub name: String,
    pub group: String,
    pub plural: String,
    pub singular: String,
    pub list_kind: String,
    pub kind: String,
    pub categories: BTreeSet<String>,
    pub served_versions: Vec<(String, bool)>, // (version, stored)
    pub labels: BTreeMap<String, String>,
}

const SYSTEM_LABEL_KEY: &str = "gatekeeper.sh/constraint";
const SYSTEM_LABEL_VALUE: &str = "yes";

/// Builds the schema embedded in an instance's `spec`.
pub fn create_schema(template: &Template, target: &dyn Target) -> Result<Schema, Error> {
    let mut spec_properties = serde_json::Map::new();
    spec_properties.insert("match".to_string(), target.match_schema());
    spec_properties.insert(
        "enforcementAction".to_string(),
        json!({"type": "string"}),
    );
    spec_properties.insert(
        "scopedEnforcementActions".to_string(),
        json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "action": {"type": "string"},
                    "enforcementPoints": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["action"]
            }
        }),
    );
    if let Some(params) = &template.parameters_schema {
        spec_properties.insert("parameters".to_string(), params.as_value().clone());
    }

    let schema = json!({
        "type": "object",
        "properties": {
            "spec": {
                "type": "object",
                "properties": Value::Object(spec_properties)
            },
            "status": {
                "type": "object",
                "x-kubernetes-preserve-unknown-fields": true
            },
            "metadata": {
                "type": "object",
                "properties": {
                    "name": {"type": "string", "maxLength": 63}
                }
            }
        }
    });
    Ok(Schema(schema))
}

/// Wraps a schema with naming and the system label.
pub fn create_crd(template: &Template, schema: &Schema, group: &str) -> Result<Crd, Error> {
    let _ = schema; // the schema is carried alongside the CRD by the caller, not embedded here
    let plural = template.kind.to_lowercase();
    let singular = plural.clone();
    let mut labels = BTreeMap::new();
    labels.insert(SYSTEM_LABEL_KEY.to_string(), SYSTEM_LABEL_VALUE.to_string());

    Ok(Crd {
        name: format!("{plural}.{group}"),
        group: group.to_string(),
        plural: plural.clone(),
        singular,
        list_kind: format!("{}List", template.kind),
        kind: template.kind.clone(),
        categories: BTreeSet::from(["constraint".to_string(), "constraints".to_string()]),
        served_versions: vec![
            ("v1beta1".to_string(), true),
            ("v1alpha1".to_string(), false),
        ],
        labels,
    })
}

/// A user-supplied label may not override the system label.
pub fn merge_user_labels(
    crd: &Crd,
    user_labels: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, Error> {
    if user_labels.contains_key(SYSTEM_LABEL_KEY) {
        return Err(Error::InvalidTemplate {
            name: crd.kind.clone(),
            reason: format!("label {SYSTEM_LABEL_KEY:?} is reserved by the system"),
        });
    }
    let mut merged = user_labels.clone();
    merged.extend(crd.labels.clone());
    Ok(merged)
}

/// `validateCRD`: fails with *invalid-template* on a missing
/// name/kind, a kind/name mismatch, an unknown target, or multiple
/// targets.
pub fn validate_crd(
    template: &Template,
    crd: &Crd,
    targets: &crate::target::TargetSet,
) -> Result<(), Error> {
    let invalid = |reason: String| Error::InvalidTemplate {
        name: template.name.clone(),
        reason,
    };

    if template.name.trim().is_empty() {
        return Err(invalid("template name is required".into()));
    }
    if template.kind.trim().is_empty() {
        return Err(invalid("template kind is required".into()));
    }
    if template.name.to_lowercase() != template.kind.to_lowercase() {
        return Err(invalid(format!(
            "kind {:?} does not match template name {:?}",
            template.kind, template.name
        )));
    }
    if template.targets.len() != 1 {
        return Err(invalid(format!(
            "exactly one target binding is required, got {}",
            template.targets.len()
        )));
    }
    let binding = &template.targets[0];
    if !targets.contains(&binding.target) {
        return Err(invalid(format!("unknown target {:?}", binding.target)));
    }
    if crd.kind != template.kind {
        return Err(invalid("CRD kind does not match template kind".into()));
    }
    Ok(())
}

/// `validateCR`: fails with *invalid-constraint* on a
/// group/version/kind mismatch, a missing/overlong `metadata.name`, or a
/// typed-validation failure of parameters/match.
pub fn validate_cr(
    kind: &str,
    name: &str,
    group: &str,
    crd: &Crd,
    schema: &Schema,
    instance: &Doc,
    max_name_len: usize,
) -> Result<(), Error> {
    let invalid = |reason: String| Error::InvalidConstraint {
        kind: kind.to_string(),
        name: name.to_string(),
        reason,
    };

    if crd.group != group || crd.kind != kind {
        return Err(invalid(format!(
            "group/kind mismatch: expected {group}/{kind}, CRD is {}/{}",
            crd.group, crd.kind
        )));
    }
    if name.trim().is_empty() {
        return Err(invalid("metadata.name is required".into()));
    }
    if name.len() > max_name_len {
        return Err(invalid(format!(
            "metadata.name exceeds {max_name_len} characters"
        )));
    }
    validate_against_schema(schema, instance).map_err(|reason| Error::InvalidConstraintSchema {
        kind: kind.to_string(),
        name: name.to_string(),
        reason,
    })?;
    Ok(())
}

/// A minimal structural validator over the schema shapes [`create_schema`]
/// itself produces. The schema is always self-authored, so this does not
/// need to be a general JSON-Schema engine: it only has to catch the
/// shapes `create_schema` can emit (object/array/string typing,
/// `maxLength`, `required`).
fn validate_against_schema(schema: &Schema, instance: &Doc) -> Result<(), String> {
    validate_node(schema.as_value(), instance, "$")
}

fn validate_node(schema: &Value, instance: &Doc, path: &str) -> Result<(), String> {
    if schema.get("x-kubernetes-preserve-unknown-fields") == Some(&Value::Bool(true)) {
        return Ok(());
    }
    let ty = schema.get("type").and_then(Value::as_str);
    match ty {
        Some("object") => {
            let obj = instance
                .as_object()
                .ok_or_else(|| format!("{path}: expected an object"))?;
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for req in required {
                    let field = req.as_str().unwrap_or_default();
                    if !obj.contains_key(field) {
                        return Err(format!("{path}: missing required field {field:?}"));
                    }
                }
            }
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (field, field_schema) in props {
                    if let Some(value) = obj.get(field) {
                        validate_node(field_schema, value, &format!("{path}.{field}"))?;
                    }
                }
            }
            Ok(())
        }
        Some("array") => {
            let arr = instance
                .as_array()
                .ok_or_else(|| format!("{path}: expected an array"))?;
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in arr.iter().enumerate() {
                    validate_node(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
            Ok(())
        }
        Some("string") => {
            let s = instance
                .as_str()
                .ok_or_else(|| format!("{path}: expected a string"))?;
            if let Some(max_len) = schema.get("maxLength").and_then(Value::as_u64) {
                if s.len() as u64 > max_len {
                    return Err(format!("{path}: exceeds maxLength {max_len}"));
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// The forbidden-field check applied to a template's rule source at add
/// time. All references to the root data object must be of
/// the form `root.<literal>` where `<literal>` is in the allowlist; bare
/// `root`, dynamic indexing (`root[...]`), or any other literal is a
/// template-invalid error.
///
/// The core only ever sees rule-language source as opaque text (the
/// parser lives in the driver), so this check is lexical rather
/// than AST-based — deliberately conservative, and kept in the core rather
/// than pushed down into the driver.
pub fn check_forbidden_fields(source: &str, allowlist: &BTreeSet<String>) -> Result<(), Error> {
    let dotted = Regex::new(r"\broot\.([A-Za-z_][A-Za-z0-9_]*)").unwrap();
    let dynamic = Regex::new(r"\broot\s*\[").unwrap();
    let bare = Regex::new(r"\broot\b(?:\s*[^.\[A-Za-z0-9_]|$)").unwrap();

    if dynamic.is_match(source) {
        return Err(Error::InvalidTemplate {
            name: String::new(),
            reason: "dynamic indexing of root data object is forbidden".into(),
        });
    }
    for cap in dotted.captures_iter(source) {
        let literal = &cap[1];
        if !allowlist.contains(literal) {
            return Err(Error::InvalidTemplate {
                name: String::new(),
                reason: format!("root.{literal} is not an allowed root data field"),
            });
        }
    }
    // A bare `root` reference not immediately followed by `.<literal>` is
    // only forbidden when it isn't part of one of the dotted references
    // already accepted above.
    for m in bare.find_iter(source) {
        let matched = m.as_str();
        if !matched.trim_end().ends_with('.') {
            return Err(Error::InvalidTemplate {
                name: String::new(),
                reason: "bare reference to the root data object is forbidden".into(),
            });
        }
    }
    Ok(())
}
