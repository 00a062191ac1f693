//! The matcher registry: a three-level
//! `target -> kind -> name -> matcher` index used to select candidate
//! constraint names for a review before the authoritative per-constraint
//! match/action resolution in [`crate::constraint`] runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::target::{Matcher, Review};

#[derive(Default)]
pub struct MatcherRegistry {
    // target -> kind -> name -> matcher
    inner: BTreeMap<String, BTreeMap<String, BTreeMap<String, Arc<dyn Matcher>>>>,
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite-semantics: replacing an existing `(target, kind, name)`
    /// entry with an identical or different matcher is never an error.
    pub fn add(&mut self, target: &str, kind: &str, name: &str, matcher: Arc<dyn Matcher>) {
        self.inner
            .entry(target.to_string())
            .or_default()
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string(), matcher);
    }

    /// Idempotent: removing an absent entry is not an error. Only empty
    /// inner maps are pruned, bounding memory without over-eager cleanup.
    pub fn remove(&mut self, target: &str, kind: &str, name: &str) {
        if let Some(kinds) = self.inner.get_mut(target) {
            if let Some(names) = kinds.get_mut(kind) {
                names.remove(name);
                if names.is_empty() {
                    kinds.remove(kind);
                }
            }
            if kinds.is_empty() {
                self.inner.remove(target);
            }
        }
    }

    /// Removes every `(target, kind, *)` entry across all targets.
    /// Idempotent.
    pub fn remove_kind(&mut self, kind: &str) {
        let mut empty_targets = Vec::new();
        for (target, kinds) in self.inner.iter_mut() {
            kinds.remove(kind);
            if kinds.is_empty() {
                empty_targets.push(target.clone());
            }
        }
        for target in empty_targets {
            self.inner.remove(&target);
        }
    }

    /// Whether any entry under `kind` (any target) remains. Used by tests
    /// and by `Client::dump` style diagnostics.
    pub fn contains_kind(&self, kind: &str) -> bool {
        self.inner.values().any(|kinds| kinds.contains_key(kind))
    }

    /// Runs every matcher registered under `target` against `review`.
    /// Returns `(kind -> sorted names that matched, "<target> <kind>
    /// <name>" -> matcher error)`. Kinds and names are independent: a
    /// matcher failure for one `(kind, name)` never suppresses names that
    /// matched successfully elsewhere under the same target.
    ///
    /// `cancel` is checked once per constraint-group (kind) boundary, so a
    /// large registry fanning out under a single `Review` has a
    /// cancellation checkpoint partway through rather than only after the
    /// whole target's matcher set has run.
    pub fn constraints_for(
        &self,
        target: &str,
        review: &Review,
        cancel: &CancellationToken,
    ) -> Result<(BTreeMap<String, Vec<String>>, BTreeMap<String, Error>), Error> {
        let Some(kinds) = self.inner.get(target) else {
            return Ok((BTreeMap::new(), BTreeMap::new()));
        };

        let mut matched = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (kind, names) in kinds {
            cancel.check()?;
            let evaluated: Vec<(String, Result<bool, Error>)> = names
                .par_iter()
                .map(|(name, matcher)| (name.clone(), matcher.matches(review)))
                .collect();

            let mut matched_names = Vec::new();
            for (name, result) in evaluated {
                match result {
                    Ok(true) => matched_names.push(name),
                    Ok(false) => {}
                    Err(err) => {
                        errors.insert(format!("{target} {kind} {name}"), err);
                    }
                }
            }
            if !matched_names.is_empty() {
                matched_names.sort();
                matched.insert(kind.clone(), matched_names);
            }
        }
        Ok((matched, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Review;
    use serde_json::json;

    struct Always(bool);
    impl Matcher for Always {
        fn matches(&self, _review: &Review) -> Result<bool, Error> {
            Ok(self.0)
        }
    }

    struct Failing;
    impl Matcher for Failing {
        fn matches(&self, _review: &Review) -> Result<bool, Error> {
            Err(Error::EngineInternal("boom".into()))
        }
    }

    #[test]
    fn names_within_a_kind_are_sorted() {
        let mut reg = MatcherRegistry::new();
        reg.add("t", "Deny", "zebra", Arc::new(Always(true)));
        reg.add("t", "Deny", "alpha", Arc::new(Always(true)));
        let review = Review::new(json!({}));
        let (matched, errors) = reg.constraints_for("t", &review, &CancellationToken::new()).unwrap();
        assert!(errors.is_empty());
        assert_eq!(matched["Deny"], vec!["alpha".to_string(), "zebra".to_string()]);
    }

    #[test]
    fn failing_matcher_does_not_suppress_other_names() {
        let mut reg = MatcherRegistry::new();
        reg.add("t", "Deny", "good", Arc::new(Always(true)));
        reg.add("t", "Deny", "bad", Arc::new(Failing));
        let review = Review::new(json!({}));
        let (matched, errors) = reg.constraints_for("t", &review, &CancellationToken::new()).unwrap();
        assert_eq!(matched["Deny"], vec!["good".to_string()]);
        assert!(errors.contains_key("t Deny bad"));
    }

    #[test]
    fn cancellation_is_observed_before_evaluating_further_kinds() {
        let mut reg = MatcherRegistry::new();
        reg.add("t", "Deny", "a", Arc::new(Always(true)));
        let review = Review::new(json!({}));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = reg.constraints_for("t", &review, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn remove_prunes_empty_maps() {
        let mut reg = MatcherRegistry::new();
        reg.add("t", "Deny", "a", Arc::new(Always(true)));
        reg.remove("t", "Deny", "a");
        assert!(!reg.contains_kind("Deny"));
        assert!(reg.inner.is_empty());
    }

    #[test]
    fn remove_kind_is_idempotent() {
        let mut reg = MatcherRegistry::new();
        reg.remove_kind("NoSuchKind");
        reg.add("t", "Deny", "a", Arc::new(Always(true)));
        reg.remove_kind("Deny");
        reg.remove_kind("Deny");
        assert!(!reg.contains_kind("Deny"));
    }
}
