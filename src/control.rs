//! The fix-and-verify control loop
//!
//! Drives one run through Discover → Plan → Act → Critic → Apply → Verify →
//! Reflect until the failing tests are fixed or a stop condition hits. Only
//! denied paths, an empty proposal, the iteration budget, the deadline and
//! cancellation end a run; every other failure becomes feedback for the next
//! plan.

use crate::branch::RunBranch;
use crate::critic::{Critic, ReviewContext};
use crate::diff::DiffModel;
use crate::oracle::{FailingTest, OracleError, TestOracle, TestResult};
use crate::patch::PatchEngine;
use crate::proposer::{FixProposer, ProposerError};
use crate::telemetry::{NullSink, TelemetrySink};
use crate::util::CancelToken;
use crate::validate::PostApplyValidator;
use crate::violation::summarize;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discover,
    Plan,
    Act,
    Critic,
    Apply,
    Verify,
    Reflect,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Discover => "discover",
            Phase::Plan => "plan",
            Phase::Act => "act",
            Phase::Critic => "critic",
            Phase::Apply => "apply",
            Phase::Verify => "verify",
            Phase::Reflect => "reflect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    MaxIterationsExceeded,
    Timeout,
    NoPatch,
    SafetyAborted,
    Interrupted,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::MaxIterationsExceeded => "max_iterations_exceeded",
            RunStatus::Timeout => "timeout",
            RunStatus::NoPatch => "no_patch",
            RunStatus::SafetyAborted => "safety_aborted",
            RunStatus::Interrupted => "interrupted",
            RunStatus::Error => "error",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Error | RunStatus::Running => 1,
            RunStatus::MaxIterationsExceeded => 2,
            RunStatus::Timeout => 3,
            RunStatus::NoPatch => 4,
            RunStatus::SafetyAborted => 5,
            RunStatus::Interrupted => 130,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: usize,
    pub timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Everything the loop knows about a run. Persisted as `metadata.json`.
#[derive(Debug, Clone, Serialize)]
pub struct AgentState {
    pub repo_path: PathBuf,
    pub run_id: String,
    pub iteration: usize,
    pub max_iterations: usize,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub failing_tests: BTreeSet<String>,
    pub initial_failing_count: usize,
    pub patches_applied: usize,
    pub last_critic_feedback: Option<String>,
    pub status: RunStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub iterations: usize,
    pub max_iterations: usize,
    pub branch: String,
    pub files_changed: BTreeSet<PathBuf>,
    pub commits: Vec<String>,
    pub tests_fixed: usize,
    pub tests_remaining: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}: {}", self.run_id, self.status)?;
        writeln!(
            f,
            "  Iterations: {}/{}",
            self.iterations, self.max_iterations
        )?;
        writeln!(f, "  Branch: {}", self.branch)?;
        writeln!(f, "  Commits: {}", self.commits.len())?;
        if !self.files_changed.is_empty() {
            let files: Vec<String> = self
                .files_changed
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            writeln!(f, "  Files changed: {}", files.join(", "))?;
        }
        write!(
            f,
            "  Tests fixed: {}, still failing: {}",
            self.tests_fixed, self.tests_remaining
        )?;
        if let Some(err) = &self.error {
            write!(f, "\n  Error: {}", err)?;
        }
        Ok(())
    }
}

/// Outcome of one pass through the inner phases.
enum Step {
    Stop(RunStatus),
    Retry(String),
    Tested(TestResult),
}

pub struct ControlLoop<'a> {
    run_id: String,
    settings: LoopSettings,
    proposer: Box<dyn FixProposer + 'a>,
    critic: Critic<'a>,
    engine: PatchEngine,
    validator: PostApplyValidator,
    oracle: Box<dyn TestOracle + 'a>,
    telemetry: Box<dyn TelemetrySink + 'a>,
    cancel: CancelToken,
    deadline: Instant,
    failing: Vec<FailingTest>,
    files_changed: BTreeSet<PathBuf>,
}

impl<'a> ControlLoop<'a> {
    pub fn new(
        run_id: impl Into<String>,
        settings: LoopSettings,
        proposer: Box<dyn FixProposer + 'a>,
        critic: Critic<'a>,
        engine: PatchEngine,
        validator: PostApplyValidator,
        oracle: Box<dyn TestOracle + 'a>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            settings,
            proposer,
            critic,
            engine,
            validator,
            oracle,
            telemetry: Box::new(NullSink),
            cancel: CancelToken::new(),
            deadline: Instant::now(),
            failing: Vec::new(),
            files_changed: BTreeSet::new(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Box<dyn TelemetrySink + 'a>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run to a terminal status. Never panics on collaborator failures;
    /// unexpected faults end the run with [`RunStatus::Error`].
    pub fn run(&mut self, branch: &mut RunBranch) -> RunSummary {
        let started = Instant::now();
        self.deadline = started
            .checked_add(self.settings.timeout)
            .unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64));
        let started_at = Utc::now();
        let deadline_at = chrono::Duration::from_std(self.settings.timeout)
            .ok()
            .and_then(|d| started_at.checked_add_signed(d))
            .unwrap_or(started_at);

        let mut state = AgentState {
            repo_path: branch.repo_root().to_path_buf(),
            run_id: self.run_id.clone(),
            iteration: 0,
            max_iterations: self.settings.max_iterations,
            started_at,
            deadline: deadline_at,
            failing_tests: BTreeSet::new(),
            initial_failing_count: 0,
            patches_applied: 0,
            last_critic_feedback: None,
            status: RunStatus::Running,
        };
        self.emit(
            "run_started",
            json!({
                "branch": branch.name(),
                "max_iterations": self.settings.max_iterations,
                "timeout_secs": self.settings.timeout.as_secs(),
            }),
        );

        let mut error = None;
        state.status = match self.drive(&mut state, branch) {
            Ok(status) => status,
            Err(err) => {
                error!("Run failed: {:#}", err);
                error = Some(format!("{:#}", err));
                RunStatus::Error
            }
        };

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            status: state.status,
            iterations: state.iteration,
            max_iterations: state.max_iterations,
            branch: branch.name().to_string(),
            files_changed: self.files_changed.clone(),
            commits: branch.commits().to_vec(),
            tests_fixed: state
                .initial_failing_count
                .saturating_sub(state.failing_tests.len()),
            tests_remaining: state.failing_tests.len(),
            error,
        };
        info!(
            "Run {} finished: {} after {} iterations",
            self.run_id, summary.status, summary.iterations
        );
        self.emit(
            "run_finished",
            serde_json::to_value(&summary).unwrap_or_default(),
        );
        match serde_json::to_vec_pretty(&json!({ "state": state, "summary": summary })) {
            Ok(bytes) => self.save("metadata.json", &bytes),
            Err(err) => warn!("Failed to encode run metadata: {}", err),
        }
        summary
    }

    fn drive(&mut self, state: &mut AgentState, branch: &mut RunBranch) -> anyhow::Result<RunStatus> {
        if let Some(stop) = self.enter(Phase::Discover, state) {
            return Ok(stop);
        }
        let initial = match self.oracle.run() {
            Ok(result) => result,
            Err(OracleError::Interrupted) => return Ok(RunStatus::Interrupted),
            Err(err) => return Err(err).context("Initial test run failed"),
        };
        self.save_report(0, &initial);
        let clean = initial.all_passed();
        state.initial_failing_count = initial.failing.len();
        state.failing_tests = initial.failing_ids();
        self.failing = initial.failing;
        self.emit(
            "discovered",
            json!({ "failing": state.failing_tests, "total": initial.total }),
        );
        if clean {
            info!("No failing tests; nothing to fix");
            return Ok(RunStatus::Success);
        }

        loop {
            if state.iteration >= self.settings.max_iterations {
                return Ok(RunStatus::MaxIterationsExceeded);
            }
            state.iteration += 1;

            let result = match self.iterate(state, branch)? {
                Step::Stop(status) => return Ok(status),
                Step::Retry(feedback) => {
                    warn!("Iteration {}: {}", state.iteration, feedback);
                    self.emit("feedback", json!({ "reason": feedback }));
                    state.last_critic_feedback = Some(feedback);
                    continue;
                }
                Step::Tested(result) => result,
            };

            // Deadline is checked only once the new failing set is known.
            self.announce(Phase::Reflect, state);
            if self.cancel.is_cancelled() {
                return Ok(RunStatus::Interrupted);
            }
            let green = result.all_passed();
            let previous = std::mem::take(&mut state.failing_tests);
            let current = result.failing_ids();
            let feedback = reflect(&previous, &current);
            self.emit(
                "reflected",
                json!({
                    "fixed": previous.difference(&current).collect::<Vec<_>>(),
                    "failing": current,
                }),
            );
            state.failing_tests = current;
            self.failing = result.failing;

            if green {
                return Ok(RunStatus::Success);
            }
            if Instant::now() >= self.deadline {
                return Ok(RunStatus::Timeout);
            }
            state.last_critic_feedback = Some(feedback);
        }
    }

    /// Plan through Verify for one iteration.
    fn iterate(&mut self, state: &mut AgentState, branch: &mut RunBranch) -> anyhow::Result<Step> {
        let iteration = state.iteration;

        if let Some(stop) = self.enter(Phase::Plan, state) {
            return Ok(Step::Stop(stop));
        }
        let plan = match self
            .proposer
            .plan(&self.failing, state.last_critic_feedback.as_deref())
        {
            Ok(plan) => plan,
            Err(err) => return proposer_failure(err),
        };
        self.emit("planned", json!({ "plan": plan }));

        if let Some(stop) = self.enter(Phase::Act, state) {
            return Ok(Step::Stop(stop));
        }
        let diff_text = match self.proposer.act(&plan, &self.failing) {
            Ok(Some(text)) if !text.trim().is_empty() => text,
            Ok(_) => {
                info!("Proposer returned no patch");
                return Ok(Step::Stop(RunStatus::NoPatch));
            }
            Err(err) => return proposer_failure(err),
        };
        self.save(&format!("diffs/step-{}.diff", iteration), diff_text.as_bytes());
        let diff = match DiffModel::parse(&diff_text) {
            Ok(diff) => diff,
            Err(err) => return Ok(Step::Retry(format!("Diff could not be parsed: {}", err))),
        };
        let (added, removed) = diff.stats();
        self.emit(
            "proposed",
            json!({
                "files": diff.touched_paths(),
                "added": added,
                "removed": removed,
            }),
        );

        if let Some(stop) = self.enter(Phase::Critic, state) {
            return Ok(Step::Stop(stop));
        }
        let context = ReviewContext {
            iteration,
            plan: Some(plan),
            failing_tests: self.failing.clone(),
        };
        let verdict = match self.critic.evaluate(&diff, &diff_text, &context) {
            Ok(verdict) => verdict,
            Err(err) => return proposer_failure(err),
        };
        self.emit(
            "critic",
            json!({
                "approved": verdict.approved,
                "reason": verdict.reason,
                "violations": verdict.violations,
            }),
        );
        if verdict.fatal {
            warn!("Aborting run: {}", verdict.reason);
            return Ok(Step::Stop(RunStatus::SafetyAborted));
        }
        if !verdict.approved {
            return Ok(Step::Retry(verdict.reason));
        }

        if let Some(stop) = self.enter(Phase::Apply, state) {
            return Ok(Step::Stop(stop));
        }
        let repo_root = branch.repo_root().to_path_buf();
        let tx = branch.begin(iteration)?;
        let changed = match self.engine.apply(&diff, &repo_root) {
            Ok(changed) => changed,
            Err(err) => {
                tx.discard()?;
                return Ok(Step::Retry(format!("Patch did not apply: {}", err)));
            }
        };
        self.emit(
            "applied",
            json!({ "files": changed, "checkpoint": tx.checkpoint().to_string() }),
        );

        if let Some(stop) = self.enter(Phase::Verify, state) {
            tx.discard()?;
            return Ok(Step::Stop(stop));
        }
        let report = self.validator.check(&repo_root, &changed);
        self.emit(
            "validated",
            json!({ "ok": report.ok, "violations": report.violations }),
        );
        if !report.ok {
            tx.discard()?;
            let blocking: Vec<_> = report.blocking().cloned().collect();
            return Ok(Step::Retry(format!(
                "Post-apply validation failed: {}",
                summarize(&blocking)
            )));
        }
        tx.commit()?;
        state.patches_applied += 1;
        self.record_changed(&repo_root, &changed);

        match self.oracle.run() {
            Ok(result) => {
                self.save_report(iteration, &result);
                Ok(Step::Tested(result))
            }
            Err(OracleError::Interrupted) => Ok(Step::Stop(RunStatus::Interrupted)),
            Err(err) => Ok(Step::Retry(format!("Test run failed: {}", err))),
        }
    }

    /// Log the transition and report a stop condition, if any.
    fn enter(&mut self, phase: Phase, state: &AgentState) -> Option<RunStatus> {
        self.announce(phase, state);
        if self.cancel.is_cancelled() {
            return Some(RunStatus::Interrupted);
        }
        if Instant::now() >= self.deadline {
            return Some(RunStatus::Timeout);
        }
        None
    }

    fn announce(&mut self, phase: Phase, state: &AgentState) {
        info!("Iteration {}: {}", state.iteration, phase.as_str());
        self.emit(
            "phase",
            json!({ "phase": phase, "iteration": state.iteration }),
        );
    }

    fn record_changed(&mut self, repo_root: &Path, changed: &[PathBuf]) {
        let canonical = repo_root.canonicalize().ok();
        for path in changed {
            let relative = canonical
                .as_deref()
                .and_then(|root| path.strip_prefix(root).ok())
                .or_else(|| path.strip_prefix(repo_root).ok())
                .unwrap_or(path);
            self.files_changed.insert(relative.to_path_buf());
        }
    }

    fn emit(&mut self, name: &str, fields: serde_json::Value) {
        if let Err(err) = self.telemetry.log_event(name, fields) {
            warn!("Failed to record {} event: {:#}", name, err);
        }
    }

    fn save(&mut self, rel_path: &str, bytes: &[u8]) {
        if let Err(err) = self.telemetry.save_artifact(rel_path, bytes) {
            warn!("Failed to save {}: {:#}", rel_path, err);
        }
    }

    fn save_report(&mut self, step: usize, result: &TestResult) {
        if let Some(report) = &result.report {
            self.save(&format!("test-reports/step-{}.xml", step), report);
        }
    }
}

fn proposer_failure(err: ProposerError) -> anyhow::Result<Step> {
    match err {
        ProposerError::Interrupted => Ok(Step::Stop(RunStatus::Interrupted)),
        other => Err(other).context("Proposer failed"),
    }
}

/// Feedback line comparing the failing set before and after an iteration.
fn reflect(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> String {
    let join = |set: Vec<&String>| {
        if set.is_empty() {
            "none".to_string()
        } else {
            set.into_iter().cloned().collect::<Vec<_>>().join(", ")
        }
    };
    format!(
        "Tests still failing after the last patch. Fixed: {}. Still failing: {}. Newly failing: {}.",
        join(previous.difference(current).collect()),
        join(previous.intersection(current).collect()),
        join(current.difference(previous).collect()),
    )
}
