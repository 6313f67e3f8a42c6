//! Critic gate
//!
//! Every proposed diff passes the [`SafetyGuard`] first; only a diff the
//! guard accepts is shown to the optional semantic reviewer.

use crate::diff::DiffModel;
use crate::oracle::FailingTest;
use crate::proposer::{Plan, ProposerError};
use crate::safety::{SafetyGuard, SafetyReport};
use crate::violation::{summarize, Violation};
use serde::Serialize;
use tracing::{debug, info};

/// What the reviewer gets to see alongside the diff.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReviewContext {
    pub iteration: usize,
    pub plan: Option<Plan>,
    pub failing_tests: Vec<FailingTest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewOutcome {
    pub approved: bool,
    pub reason: String,
}

pub trait CriticReviewer {
    fn review(&mut self, diff_text: &str, context: &ReviewContext)
        -> Result<ReviewOutcome, ProposerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticVerdict {
    pub approved: bool,
    pub reason: String,
    pub violations: Vec<Violation>,
    /// Rejected for touching a denied path; the run must stop.
    pub fatal: bool,
}

impl CriticVerdict {
    fn approve(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
            violations: Vec::new(),
            fatal: false,
        }
    }

    fn from_safety(report: SafetyReport) -> Self {
        Self {
            approved: false,
            reason: format!("Safety check failed: {}", summarize(&report.violations)),
            fatal: report.is_fatal(),
            violations: report.violations,
        }
    }
}

pub struct Critic<'a> {
    guard: &'a SafetyGuard,
    reviewer: Option<Box<dyn CriticReviewer + 'a>>,
}

impl<'a> Critic<'a> {
    pub fn new(guard: &'a SafetyGuard) -> Self {
        Self {
            guard,
            reviewer: None,
        }
    }

    pub fn with_reviewer(mut self, reviewer: Box<dyn CriticReviewer + 'a>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn evaluate(
        &mut self,
        diff: &DiffModel,
        diff_text: &str,
        context: &ReviewContext,
    ) -> Result<CriticVerdict, ProposerError> {
        let report = self.guard.validate(diff);
        if !report.ok {
            info!(
                "Safety guard rejected diff ({} violations)",
                report.violations.len()
            );
            return Ok(CriticVerdict::from_safety(report));
        }

        let Some(reviewer) = self.reviewer.as_mut() else {
            return Ok(CriticVerdict::approve("Safety checks passed"));
        };
        let outcome = reviewer.review(diff_text, context)?;
        debug!(
            "Reviewer {}: {}",
            if outcome.approved { "approved" } else { "rejected" },
            outcome.reason
        );
        if outcome.approved {
            Ok(CriticVerdict::approve(outcome.reason))
        } else {
            Ok(CriticVerdict {
                approved: false,
                reason: format!("Reviewer rejected diff: {}", outcome.reason),
                violations: Vec::new(),
                fatal: false,
            })
        }
    }
}
