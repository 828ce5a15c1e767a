//! Retry policy tables: `RetryRule` (per-category attempts/backoff) and
//! `TxOptions` (how a transaction is opened) (spec §3, §4.8).

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ErrorCategory;

/// `{isolation, readonly, deferrable}`, translated into a `START
/// TRANSACTION ...` command (spec §3 `TxOptions`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxOptions {
    pub isolation: Isolation,
    pub readonly: bool,
    pub deferrable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    Serializable,
    RepeatableRead,
}

impl TxOptions {
    /// Renders this as the `START TRANSACTION` command text the
    /// transaction runner sends before the caller's action (spec §4.8).
    pub fn to_command_text(self) -> String {
        let mut parts = vec!["START TRANSACTION".to_owned()];
        parts.push(
            match self.isolation {
                Isolation::Serializable => "ISOLATION SERIALIZABLE",
                Isolation::RepeatableRead => "ISOLATION REPEATABLE READ",
            }
            .to_owned(),
        );
        parts.push(if self.readonly { "READ ONLY" } else { "READ WRITE" }.to_owned());
        parts.push(
            if self.deferrable {
                "DEFERRABLE"
            } else {
                "NOT DEFERRABLE"
            }
            .to_owned(),
        );
        parts.join(", ")
    }
}

/// A backoff function from attempt number (1-based) to a sleep duration.
pub type BackoffFn = fn(u32) -> Duration;

/// Exponential backoff with a fixed base, capped at 10 seconds — the
/// default `RetryRule` backoff unless a caller supplies its own table.
pub fn default_backoff(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(millis.min(10_000))
}

/// `{attempts, backoff_fn}` keyed by error category (spec §3 `RetryRule`).
#[derive(Debug, Clone, Copy)]
pub struct RetryRule {
    pub attempts: u32,
    pub backoff: BackoffFn,
}

impl Default for RetryRule {
    fn default() -> Self {
        RetryRule {
            attempts: 3,
            backoff: default_backoff,
        }
    }
}

impl RetryRule {
    pub fn new(attempts: u32, backoff: BackoffFn) -> Self {
        RetryRule { attempts, backoff }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }
}

/// A table of `RetryRule`s keyed by category, with a fallback for
/// categories not explicitly configured.
#[derive(Debug, Clone)]
pub struct RetryRules {
    rules: HashMap<ErrorCategory, RetryRule>,
    default_rule: RetryRule,
}

impl Default for RetryRules {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(ErrorCategory::TransactionConflict, RetryRule::default());
        RetryRules {
            rules,
            default_rule: RetryRule::new(1, default_backoff),
        }
    }
}

impl RetryRules {
    pub fn with_rule(mut self, category: ErrorCategory, rule: RetryRule) -> Self {
        self.rules.insert(category, rule);
        self
    }

    pub fn rule_for(&self, category: ErrorCategory) -> &RetryRule {
        self.rules.get(&category).unwrap_or(&self.default_rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_options_render_all_four_clauses() {
        let opts = TxOptions {
            isolation: Isolation::RepeatableRead,
            readonly: true,
            deferrable: true,
        };
        let text = opts.to_command_text();
        assert!(text.contains("REPEATABLE READ"));
        assert!(text.contains("READ ONLY"));
        assert!(text.contains("DEFERRABLE") && !text.contains("NOT DEFERRABLE"));
    }

    #[test]
    fn backoff_grows_then_caps() {
        assert!(default_backoff(1) < default_backoff(4));
        assert_eq!(default_backoff(20), Duration::from_millis(10_000));
    }

    #[test]
    fn unconfigured_category_uses_default_rule() {
        let rules = RetryRules::default();
        assert_eq!(rules.rule_for(ErrorCategory::BinaryProtocol).attempts, 1);
        assert_eq!(
            rules.rule_for(ErrorCategory::TransactionConflict).attempts,
            3
        );
    }
}
