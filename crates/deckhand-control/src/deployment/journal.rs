//! Compensation journal for the deploy workflow.
//!
//! Each forward step that succeeds leaves a marker here. Markers carry only
//! the identifiers needed to undo the step, never live handles, so the undo
//! pass can run no matter how far the forward pass got.

use std::fmt;

use crate::types::ServiceName;

/// A deploy step whose effect is in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletedStep {
    /// Build installed and linked.
    Artifact {
        /// Installed version.
        version: String,
    },
    /// Schema and principal created.
    Database,
    /// Secrets file written.
    Secrets,
    /// System account created.
    Account,
    /// Unit file written; the unit may also be enabled and running.
    Unit,
    /// Proxy route live.
    Route,
}

impl CompletedStep {
    /// Short name used in logs and error reports.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Artifact { .. } => "artifact",
            Self::Database => "database",
            Self::Secrets => "secrets",
            Self::Account => "account",
            Self::Unit => "unit",
            Self::Route => "route",
        }
    }
}

impl fmt::Display for CompletedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Artifact { version } => write!(f, "artifact {version}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Ordered record of completed steps for one service.
#[derive(Debug)]
pub struct Journal {
    service: ServiceName,
    steps: Vec<CompletedStep>,
}

impl Journal {
    /// Start an empty journal.
    #[must_use]
    pub const fn new(service: ServiceName) -> Self {
        Self {
            service,
            steps: Vec::new(),
        }
    }

    /// Service the journal belongs to.
    #[must_use]
    pub const fn service(&self) -> &ServiceName {
        &self.service
    }

    /// Record a completed step.
    pub fn record(&mut self, step: CompletedStep) {
        self.steps.push(step);
    }

    /// Whether no step has completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Completed steps in completion order, rendered for reporting.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.steps.iter().map(ToString::to_string).collect()
    }

    /// Steps in the order they must be undone.
    pub fn into_undo_order(self) -> impl Iterator<Item = CompletedStep> {
        self.steps.into_iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undo_order_is_reverse_of_completion() {
        let mut journal = Journal::new(ServiceName::new("api").unwrap());
        assert!(journal.is_empty());

        journal.record(CompletedStep::Artifact {
            version: "v1.0.0".to_owned(),
        });
        journal.record(CompletedStep::Database);
        journal.record(CompletedStep::Secrets);
        journal.record(CompletedStep::Account);
        journal.record(CompletedStep::Unit);

        assert_eq!(
            journal.applied(),
            vec!["artifact v1.0.0", "database", "secrets", "account", "unit"]
        );

        let labels: Vec<_> = journal.into_undo_order().map(|s| s.label()).collect();
        assert_eq!(labels, vec!["unit", "account", "secrets", "database", "artifact"]);
    }
}
