//! Dynamic, tagged document type used for instance payloads, match specs,
//! review objects, and schema fragments. Instances arrive as arbitrary structured documents;
//! this module carries them as a tagged tree with typed accessors rather
//! than inventing a bespoke representation.

use serde_json::Value as Json;

/// A tagged map/list/scalar document. A thin, named wrapper over
/// [`serde_json::Value`] so call sites read as domain types instead of
/// bare JSON, while reusing `serde_json`'s battle-tested representation
/// and (de)serialization.
pub type Doc = Json;

/// Typed accessors over a [`Doc`], validated against the derived schema
/// before first use (callers are expected to validate via
/// [`crate::schema`] prior to reading through these accessors).
pub trait DocExt {
    fn get_path(&self, path: &[&str]) -> Option<&Doc>;
    fn as_str_field(&self, field: &str) -> Option<&str>;
    fn as_object_field(&self, field: &str) -> Option<&serde_json::Map<String, Doc>>;
    fn without_status(&self) -> Doc;
}

impl DocExt for Doc {
    fn get_path(&self, path: &[&str]) -> Option<&Doc> {
        let mut cur = self;
        for seg in path {
            cur = cur.as_object()?.get(*seg)?;
        }
        Some(cur)
    }

    fn as_str_field(&self, field: &str) -> Option<&str> {
        self.as_object()?.get(field)?.as_str()
    }

    fn as_object_field(&self, field: &str) -> Option<&serde_json::Map<String, Doc>> {
        self.as_object()?.get(field)?.as_object()
    }

    /// Strip the `status` subtree on ingest.
    fn without_status(&self) -> Doc {
        match self.as_object() {
            Some(map) => {
                let mut copy = map.clone();
                copy.remove("status");
                Doc::Object(copy)
            }
            None => self.clone(),
        }
    }
}
