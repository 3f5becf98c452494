//! Attribute rule evaluation.

use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::attributes::AssertedIdentity;
use crate::rules::{AuthorizationRule, GrantSet, RuleId};

/// Result of evaluating the rule set for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantEvaluation {
    /// Current grants united with every matching rule's grants.
    pub grants: GrantSet,
    /// Whether the grants differ from the ones held before evaluation.
    pub cache_stale: bool,
    /// Rules that matched, in store order.
    pub matched_rules: Vec<RuleId>,
}

/// Evaluates authorization rules against asserted attributes.
///
/// Compiled patterns are cached by pattern text. Patterns that fail to
/// compile are cached as `None` and skipped.
#[derive(Default)]
pub struct AuthorizationEngine {
    patterns: RwLock<HashMap<String, Option<Regex>>>,
}

impl AuthorizationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unite `current` with the grants of every rule whose attribute matches.
    ///
    /// Grants are never removed. Entries with role id 0 or a blank name are
    /// dropped from the result.
    pub fn compute_grants(
        &self,
        identity: &AssertedIdentity,
        rules: &[AuthorizationRule],
        current: &GrantSet,
    ) -> GrantEvaluation {
        let mut grants = current.clone();
        let mut matched_rules = Vec::new();

        for rule in rules {
            let value = match identity.attribute(&rule.attribute_name) {
                Some(v) => v,
                None => continue,
            };

            let matched = self.with_pattern(rule, |regex| AuthorizationRule::matches_value(regex, value));
            if matched {
                debug!(
                    rule_id = %rule.id,
                    attribute = %rule.attribute_name,
                    roles = %rule.grants.display_names(),
                    "Authorization rule matched"
                );
                grants.merge(&rule.grants);
                matched_rules.push(rule.id);
            }
        }

        grants.retain_valid();
        let cache_stale = grants != *current;

        GrantEvaluation {
            grants,
            cache_stale,
            matched_rules,
        }
    }

    /// Number of cached patterns, valid or not.
    pub fn cached_patterns(&self) -> usize {
        self.patterns.read().map(|p| p.len()).unwrap_or(0)
    }

    fn with_pattern(&self, rule: &AuthorizationRule, f: impl FnOnce(&Regex) -> bool) -> bool {
        if let Ok(cache) = self.patterns.read() {
            if let Some(entry) = cache.get(&rule.pattern) {
                return entry.as_ref().map(f).unwrap_or(false);
            }
        }

        let compiled = match Regex::new(&rule.pattern) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(rule_id = %rule.id, pattern = %rule.pattern, error = %e, "Invalid rule pattern, skipping");
                None
            }
        };
        let matched = compiled.as_ref().map(f).unwrap_or(false);

        if let Ok(mut cache) = self.patterns.write() {
            cache.insert(rule.pattern.clone(), compiled);
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RoleId;

    fn rule(id: u64, attribute: &str, pattern: &str, grants: &[(u32, &str)]) -> AuthorizationRule {
        AuthorizationRule {
            id: RuleId(id),
            attribute_name: attribute.to_string(),
            pattern: pattern.to_string(),
            grants: GrantSet::from_pairs(grants.iter().map(|(id, name)| (*id, *name))),
        }
    }

    fn identity(attrs: &[(&str, &str)]) -> AssertedIdentity {
        AssertedIdentity {
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            federation_active: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_multi_valued_attribute_match() {
        let engine = AuthorizationEngine::new();
        let rules = vec![rule(1, "affiliation", "^staff$", &[(2, "editor")])];
        let current = GrantSet::from_pairs([(3, "member")]);

        let eval = engine.compute_grants(&identity(&[("affiliation", "student; staff")]), &rules, &current);
        assert_eq!(eval.grants.role_ids(), vec![RoleId(2), RoleId(3)]);
        assert!(eval.cache_stale);
        assert_eq!(eval.matched_rules, vec![RuleId(1)]);
    }

    #[test]
    fn test_no_match_keeps_grants() {
        let engine = AuthorizationEngine::new();
        let rules = vec![rule(1, "affiliation", "^staff$", &[(2, "editor")])];
        let current = GrantSet::from_pairs([(3, "member")]);

        let eval = engine.compute_grants(&identity(&[("affiliation", "staffer;member")]), &rules, &current);
        assert_eq!(eval.grants, current);
        assert!(!eval.cache_stale);
        assert!(eval.matched_rules.is_empty());
    }

    #[test]
    fn test_missing_attribute_skips_rule() {
        let engine = AuthorizationEngine::new();
        let rules = vec![rule(1, "entitlement", ".*", &[(2, "editor")])];
        let eval = engine.compute_grants(&identity(&[]), &rules, &GrantSet::new());
        assert!(eval.grants.is_empty());
        assert!(!eval.cache_stale);
    }

    #[test]
    fn test_grants_are_monotonic() {
        let engine = AuthorizationEngine::new();
        let rules = vec![
            rule(1, "affiliation", "staff", &[(2, "editor")]),
            rule(2, "affiliation", "faculty", &[(4, "lecturer")]),
        ];
        let current = GrantSet::from_pairs([(3, "member"), (9, "admin")]);

        let eval = engine.compute_grants(&identity(&[("affiliation", "faculty")]), &rules, &current);
        for id in current.role_ids() {
            assert!(eval.grants.contains(id));
        }
        assert!(eval.grants.contains(RoleId(4)));
        assert!(!eval.grants.contains(RoleId(2)));
    }

    #[test]
    fn test_repeated_evaluation_is_stable() {
        let engine = AuthorizationEngine::new();
        let rules = vec![rule(1, "affiliation", "staff", &[(2, "editor")])];
        let attrs = identity(&[("affiliation", "staff")]);

        let first = engine.compute_grants(&attrs, &rules, &GrantSet::new());
        let second = engine.compute_grants(&attrs, &rules, &first.grants);
        assert_eq!(first.grants, second.grants);
        assert!(first.cache_stale);
        assert!(!second.cache_stale);
    }

    #[test]
    fn test_rule_order_does_not_matter() {
        let engine = AuthorizationEngine::new();
        let a = rule(1, "affiliation", "staff", &[(2, "editor")]);
        let b = rule(2, "entitlement", "urn:mace:lib", &[(5, "librarian")]);
        let attrs = identity(&[("affiliation", "staff"), ("entitlement", "urn:mace:lib")]);

        let forward = engine.compute_grants(&attrs, &[a.clone(), b.clone()], &GrantSet::new());
        let backward = engine.compute_grants(&attrs, &[b, a], &GrantSet::new());
        assert_eq!(forward.grants, backward.grants);
    }

    #[test]
    fn test_falsy_grants_dropped() {
        let engine = AuthorizationEngine::new();
        let rules = vec![rule(1, "affiliation", "staff", &[(0, "bogus"), (2, "editor"), (6, "")])];

        let eval = engine.compute_grants(&identity(&[("affiliation", "staff")]), &rules, &GrantSet::new());
        assert_eq!(eval.grants.role_ids(), vec![RoleId(2)]);
    }

    #[test]
    fn test_invalid_pattern_skipped_and_cached() {
        let engine = AuthorizationEngine::new();
        let rules = vec![
            rule(1, "affiliation", "(unclosed", &[(2, "editor")]),
            rule(2, "affiliation", "staff", &[(3, "member")]),
        ];

        for _ in 0..2 {
            let eval = engine.compute_grants(&identity(&[("affiliation", "staff")]), &rules, &GrantSet::new());
            assert_eq!(eval.grants.role_ids(), vec![RoleId(3)]);
        }
        assert_eq!(engine.cached_patterns(), 2);
    }
}
