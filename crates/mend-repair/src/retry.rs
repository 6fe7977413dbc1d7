use std::collections::HashMap;

use mend_core::config::RetryConfig;
use mend_core::types::{Diagnostic, Uid};

use crate::generator::GenerationFeedback;

/// Tracks failed candidates per target and decides what to try next.
///
/// While candidates remain in the current set the next one is tried. Once a
/// set is exhausted a generation attempt is spent: below the budget the
/// target is regenerated with the failed ids excluded, at the budget it is
/// escalated to a reviewer.
#[derive(Debug)]
pub struct RetryBudget {
    state: HashMap<Uid, TargetState>,
    max_attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TargetState {
    /// Generation attempts whose candidates all failed.
    pub attempts: u32,
    pub failed: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Try the next candidate of the current set.
    AlternateCandidate,
    /// Ask the generator for a fresh set.
    Regenerate,
    /// Budget spent; hand the target to a human.
    Escalate,
}

impl RetryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryAction::AlternateCandidate => "alternate_candidate",
            RetryAction::Regenerate => "regenerate",
            RetryAction::Escalate => "escalate",
        }
    }
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryBudget {
    pub fn new(config: &RetryConfig) -> Self {
        Self::with_max_attempts(config.max_attempts)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            state: HashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Record that `candidate_id` failed for `target`.
    pub fn record_failure(
        &mut self,
        target: &str,
        candidate_id: &str,
        diagnostics: &[Diagnostic],
        alternates_left: bool,
    ) -> RetryAction {
        let entry = self.state.entry(target.to_string()).or_default();
        if !entry.failed.iter().any(|id| id == candidate_id) {
            entry.failed.push(candidate_id.to_string());
        }
        entry.diagnostics.extend(diagnostics.iter().cloned());

        if alternates_left {
            return RetryAction::AlternateCandidate;
        }
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            RetryAction::Escalate
        } else {
            RetryAction::Regenerate
        }
    }

    /// Spend an attempt without a specific candidate, e.g. when generation
    /// itself produced nothing.
    pub fn record_exhausted(&mut self, target: &str) -> RetryAction {
        let entry = self.state.entry(target.to_string()).or_default();
        entry.attempts += 1;
        if entry.attempts >= self.max_attempts {
            RetryAction::Escalate
        } else {
            RetryAction::Regenerate
        }
    }

    pub fn record_success(&mut self, target: &str) {
        self.state.remove(target);
    }

    pub fn attempts(&self, target: &str) -> u32 {
        self.state.get(target).map_or(0, |s| s.attempts)
    }

    pub fn failed(&self, target: &str) -> &[String] {
        self.state.get(target).map_or(&[], |s| s.failed.as_slice())
    }

    /// What the next generation round must avoid and learn from.
    pub fn feedback(&self, target: &str) -> GenerationFeedback {
        match self.state.get(target) {
            Some(s) => GenerationFeedback {
                exclude: s.failed.iter().cloned().collect(),
                diagnostics: s.diagnostics.clone(),
            },
            None => GenerationFeedback::default(),
        }
    }
}
