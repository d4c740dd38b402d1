//! Per-path conflict policy rules
//!
//! Glob rules from configuration decide the strategy for matching paths,
//! first match wins; unmatched paths use the default strategy. Invalid
//! rules are logged and skipped so one typo cannot disable resolution.

use glob::Pattern;
use tracing::{debug, trace, warn};

use driftfs_core::config::ConflictRule;

use crate::strategy::Strategy;

/// Evaluates conflict rules against mount-relative paths
pub struct PolicyEngine {
    rules: Vec<(Pattern, Strategy)>,
    default_strategy: Strategy,
}

impl PolicyEngine {
    /// Compiles the configured rules; invalid patterns and strategies are
    /// skipped with a warning
    pub fn new(default_strategy: Strategy, rules: &[ConflictRule]) -> Self {
        let compiled: Vec<(Pattern, Strategy)> = rules
            .iter()
            .filter_map(|rule| {
                let pattern = match Pattern::new(&rule.pattern) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(pattern = %rule.pattern, error = %e, "Skipping invalid conflict rule pattern");
                        return None;
                    }
                };
                let strategy = match rule.strategy.parse::<Strategy>() {
                    Ok(s) => s,
                    Err(_) => {
                        warn!(strategy = %rule.strategy, "Skipping conflict rule with unknown strategy");
                        return None;
                    }
                };
                Some((pattern, strategy))
            })
            .collect();

        debug!(
            rules = compiled.len(),
            default = %default_strategy,
            "Conflict policy compiled"
        );

        Self {
            rules: compiled,
            default_strategy,
        }
    }

    /// Strategy for a path relative to the mount root
    #[must_use]
    pub fn evaluate(&self, relative_path: &str) -> Strategy {
        for (pattern, strategy) in &self.rules {
            if pattern.matches(relative_path) {
                trace!(path = %relative_path, pattern = %pattern, strategy = %strategy, "Conflict rule matched");
                return *strategy;
            }
        }
        self.default_strategy
    }

    #[must_use]
    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    #[must_use]
    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }
}
