//! Header rewrite engine
//!
//! Rules apply in configuration order against the message's headers before
//! the adapter builds its payload. Conditions evaluate against the current
//! first value of the target header; variable substitution (an upstream
//! collaborator) has already run by the time rules are evaluated.

use drover_common::{
    Headers,
    provider::{RewriteAction, RewriteCondition, RewriteRule},
};

use crate::error::BuildError;

/// A rule with its condition regex pre-compiled
#[derive(Debug, Clone)]
pub struct CompiledRule {
    rule: RewriteRule,
    matcher: Option<regex::Regex>,
}

impl CompiledRule {
    /// Compile a rule, validating any regex condition up front
    ///
    /// # Errors
    /// If the rule's `Matches` condition is not a valid regex
    pub fn compile(rule: RewriteRule) -> Result<Self, BuildError> {
        let matcher = match &rule.condition {
            RewriteCondition::Matches(pattern) => Some(regex::Regex::new(pattern).map_err(
                |error| BuildError::InvalidCondition {
                    header: rule.header.clone(),
                    error: error.to_string(),
                },
            )?),
            _ => None,
        };

        Ok(Self { rule, matcher })
    }

    fn applies(&self, headers: &Headers) -> bool {
        let current = headers.get(&self.rule.header);
        match &self.rule.condition {
            RewriteCondition::Always => true,
            RewriteCondition::IfPresent => current.is_some(),
            RewriteCondition::IfMissing => current.is_none(),
            RewriteCondition::Matches(_) => current.is_some_and(|value| {
                self.matcher.as_ref().is_some_and(|re| re.is_match(value))
            }),
        }
    }

    fn apply(&self, headers: &mut Headers) {
        match self.rule.action {
            RewriteAction::Add => {
                if let Some(value) = &self.rule.value {
                    headers.append(self.rule.header.clone(), value.clone());
                }
            }
            RewriteAction::Replace => {
                if let Some(value) = &self.rule.value {
                    headers.set(&self.rule.header, value.clone());
                }
            }
            RewriteAction::Remove => headers.remove(&self.rule.header),
        }
    }
}

/// Compile a provider's rule list
///
/// # Errors
/// If any rule fails to compile
pub fn compile_rules(rules: &[RewriteRule]) -> Result<Vec<CompiledRule>, BuildError> {
    rules
        .iter()
        .cloned()
        .map(CompiledRule::compile)
        .collect()
}

/// Apply compiled rules, in order, to a header map
pub fn apply_rewrites(headers: &mut Headers, rules: &[CompiledRule]) {
    for rule in rules {
        if rule.applies(headers) {
            rule.apply(headers);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rule(
        header: &str,
        action: RewriteAction,
        value: Option<&str>,
        condition: RewriteCondition,
    ) -> CompiledRule {
        CompiledRule::compile(RewriteRule {
            header: header.to_string(),
            action,
            value: value.map(String::from),
            condition,
        })
        .unwrap()
    }

    #[test]
    fn test_add_keeps_existing() {
        let mut headers = Headers::new();
        headers.append("X-Tag", "old");

        let rules = vec![rule(
            "X-Tag",
            RewriteAction::Add,
            Some("new"),
            RewriteCondition::Always,
        )];
        apply_rewrites(&mut headers, &rules);

        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_replace_collapses_values() {
        let mut headers = Headers::new();
        headers.append("List-Unsubscribe", "<mailto:a@x.com>");
        headers.append("list-unsubscribe", "<mailto:b@x.com>");

        let rules = vec![rule(
            "List-Unsubscribe",
            RewriteAction::Replace,
            Some("<https://relay.example/unsub>"),
            RewriteCondition::Always,
        )];
        apply_rewrites(&mut headers, &rules);

        assert_eq!(headers.len(), 1);
        assert_eq!(
            headers.get("List-Unsubscribe"),
            Some("<https://relay.example/unsub>")
        );
    }

    #[test]
    fn test_if_missing_does_not_override() {
        let mut headers = Headers::new();
        headers.append("Reply-To", "present@x.com");

        let rules = vec![
            rule(
                "Reply-To",
                RewriteAction::Add,
                Some("fallback@x.com"),
                RewriteCondition::IfMissing,
            ),
            rule(
                "X-Mailer",
                RewriteAction::Add,
                Some("drover"),
                RewriteCondition::IfMissing,
            ),
        ];
        apply_rewrites(&mut headers, &rules);

        assert_eq!(headers.get("Reply-To"), Some("present@x.com"));
        assert_eq!(headers.get("X-Mailer"), Some("drover"));
    }

    #[test]
    fn test_if_present_removal() {
        let mut headers = Headers::new();
        headers.append("X-Internal-Trace", "abc123");

        let rules = vec![rule(
            "X-Internal-Trace",
            RewriteAction::Remove,
            None,
            RewriteCondition::IfPresent,
        )];
        apply_rewrites(&mut headers, &rules);

        assert!(!headers.contains("X-Internal-Trace"));
    }

    #[test]
    fn test_regex_condition() {
        let mut headers = Headers::new();
        headers.append("X-Priority", "urgent");

        let rules = vec![rule(
            "X-Priority",
            RewriteAction::Replace,
            Some("1"),
            RewriteCondition::Matches("(?i)^urgent$".to_string()),
        )];
        apply_rewrites(&mut headers, &rules);
        assert_eq!(headers.get("X-Priority"), Some("1"));

        // Non-matching value is left alone
        let mut headers = Headers::new();
        headers.append("X-Priority", "bulk");
        apply_rewrites(&mut headers, &rules);
        assert_eq!(headers.get("X-Priority"), Some("bulk"));
    }

    #[test]
    fn test_rules_apply_in_order() {
        let mut headers = Headers::new();

        let rules = vec![
            rule(
                "X-Stage",
                RewriteAction::Add,
                Some("one"),
                RewriteCondition::Always,
            ),
            rule(
                "X-Stage",
                RewriteAction::Replace,
                Some("two"),
                RewriteCondition::IfPresent,
            ),
        ];
        apply_rewrites(&mut headers, &rules);

        assert_eq!(headers.get("X-Stage"), Some("two"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_invalid_regex_rejected_at_compile() {
        let result = CompiledRule::compile(RewriteRule {
            header: "X-Bad".to_string(),
            action: RewriteAction::Remove,
            value: None,
            condition: RewriteCondition::Matches("(unclosed".to_string()),
        });
        assert!(matches!(result, Err(BuildError::InvalidCondition { .. })));
    }
}
