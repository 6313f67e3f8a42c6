//! Fix proposers
//!
//! The loop never writes fixes itself. A [`FixProposer`] turns failing tests
//! into a plan and then into a unified diff. [`CommandProposer`] delegates
//! both steps (and, through [`CommandReviewer`], the semantic review) to an
//! external program speaking JSON over stdin/stdout.

use crate::critic::{CriticReviewer, ReviewContext, ReviewOutcome};
use crate::oracle::FailingTest;
use crate::util::{run_command_with_timeout, tail_chars, truncate, CancelToken};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    #[value(name = "openai")]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    #[value(name = "openrouter")]
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenRouter => "openrouter",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub approach: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ProposerError {
    #[error("failed to start proposer: {0}")]
    Spawn(String),
    #[error("proposer timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("proposer interrupted")]
    Interrupted,
    #[error("proposer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("proposer returned an invalid response: {0}")]
    InvalidResponse(String),
}

pub trait FixProposer {
    fn plan(
        &mut self,
        failing: &[FailingTest],
        prior_feedback: Option<&str>,
    ) -> Result<Plan, ProposerError>;

    /// `None` (or an empty diff) means the proposer has nothing to offer.
    fn act(&mut self, plan: &Plan, failing: &[FailingTest])
        -> Result<Option<String>, ProposerError>;
}

/// Requests understood by a proposer command, tagged by `phase`.
#[derive(Debug, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
enum ProposerRequest<'a> {
    Plan {
        #[serde(flatten)]
        meta: RequestMeta<'a>,
        failing_tests: &'a [FailingTest],
        feedback: Option<&'a str>,
    },
    Act {
        #[serde(flatten)]
        meta: RequestMeta<'a>,
        plan: &'a Plan,
        failing_tests: &'a [FailingTest],
    },
    Critic {
        #[serde(flatten)]
        meta: RequestMeta<'a>,
        diff: &'a str,
        context: &'a ReviewContext,
    },
}

#[derive(Debug, Serialize)]
struct RequestMeta<'a> {
    provider: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    repo: &'a Path,
}

#[derive(Debug, Deserialize)]
struct ActResponse {
    #[serde(default)]
    diff: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CriticResponse {
    approved: bool,
    #[serde(default)]
    reason: String,
}

/// Token accounting a proposer may attach to any response.
#[derive(Debug, Clone, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default, alias = "total_cost")]
    cost: Option<f64>,
}

/// External program plus the settings every request carries.
#[derive(Debug, Clone)]
struct CommandChannel {
    argv: Vec<String>,
    provider: ProviderKind,
    model: Option<String>,
    repo_root: PathBuf,
    timeout: Duration,
    cancel: CancelToken,
}

impl CommandChannel {
    fn meta(&self) -> RequestMeta<'_> {
        RequestMeta {
            provider: self.provider,
            model: self.model.as_deref(),
            repo: &self.repo_root,
        }
    }

    fn call<T: serde::de::DeserializeOwned>(
        &self,
        request: &ProposerRequest<'_>,
    ) -> Result<T, ProposerError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ProposerError::InvalidResponse(format!("request encoding: {}", e)))?;
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| ProposerError::Spawn("proposer command is empty".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.repo_root)
            .env("FIXLOOP_PROVIDER", self.provider.as_str());
        if let Some(model) = &self.model {
            cmd.env("FIXLOOP_MODEL", model);
        }

        let output = run_command_with_timeout(&mut cmd, self.timeout, Some(&payload), &self.cancel)
            .map_err(ProposerError::Spawn)?;
        if output.cancelled {
            return Err(ProposerError::Interrupted);
        }
        if output.timed_out {
            return Err(ProposerError::Timeout {
                secs: self.timeout.as_secs(),
            });
        }
        if !output.success() {
            let status = output
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown status".to_string());
            return Err(ProposerError::Failed {
                status,
                stderr: tail_chars(output.stderr.trim(), 500),
            });
        }
        parse_response(&output.stdout)
    }
}

fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start <= end).then(|| &text[start..=end])
}

/// Parse the proposer's stdout, tolerating fences and log noise around the
/// JSON object.
fn parse_response<T: serde::de::DeserializeOwned>(stdout: &str) -> Result<T, ProposerError> {
    let clean = strip_markdown_fences(stdout);
    let json = extract_json_fragment(clean, '{', '}').unwrap_or(clean);
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
        ProposerError::InvalidResponse(format!("{} (response: {})", e, truncate(clean, 200)))
    })?;
    if let Some(usage) = value
        .get("usage")
        .and_then(|u| serde_json::from_value::<Usage>(u.clone()).ok())
    {
        debug!(
            "Proposer usage: {} prompt + {} completion tokens, cost {:.4}",
            usage.prompt_tokens,
            usage.completion_tokens,
            usage.cost.unwrap_or(0.0)
        );
    }
    serde_json::from_value(value).map_err(|e| ProposerError::InvalidResponse(e.to_string()))
}

/// Proposer backed by an external command.
///
/// The command receives one JSON request on stdin per call:
/// `{"phase": "plan", "provider": "openai", "repo": "...", "failing_tests": [...], "feedback": ...}`
/// and must print `{"approach": "...", "steps": [...]}`; for `"phase": "act"`
/// it prints `{"diff": "<unified diff>"}` (or `{"diff": null}`).
#[derive(Debug, Clone)]
pub struct CommandProposer {
    channel: CommandChannel,
}

impl CommandProposer {
    pub fn new(argv: Vec<String>, provider: ProviderKind, repo_root: &Path) -> Self {
        Self {
            channel: CommandChannel {
                argv,
                provider,
                model: None,
                repo_root: repo_root.to_path_buf(),
                timeout: Duration::from_secs(300),
                cancel: CancelToken::new(),
            },
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.channel.model = model;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.channel.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.channel.cancel = cancel;
        self
    }

    /// A reviewer sharing this proposer's command and settings.
    pub fn reviewer(&self) -> CommandReviewer {
        CommandReviewer {
            channel: self.channel.clone(),
        }
    }
}

impl FixProposer for CommandProposer {
    fn plan(
        &mut self,
        failing: &[FailingTest],
        prior_feedback: Option<&str>,
    ) -> Result<Plan, ProposerError> {
        self.channel.call(&ProposerRequest::Plan {
            meta: self.channel.meta(),
            failing_tests: failing,
            feedback: prior_feedback,
        })
    }

    fn act(
        &mut self,
        plan: &Plan,
        failing: &[FailingTest],
    ) -> Result<Option<String>, ProposerError> {
        let response: ActResponse = self.channel.call(&ProposerRequest::Act {
            meta: self.channel.meta(),
            plan,
            failing_tests: failing,
        })?;
        Ok(response.diff.filter(|d| !d.trim().is_empty()))
    }
}

/// Semantic reviewer backed by an external command (`"phase": "critic"`),
/// answering `{"approved": bool, "reason": "..."}`.
#[derive(Debug, Clone)]
pub struct CommandReviewer {
    channel: CommandChannel,
}

impl CriticReviewer for CommandReviewer {
    fn review(
        &mut self,
        diff_text: &str,
        context: &ReviewContext,
    ) -> Result<ReviewOutcome, ProposerError> {
        let response: CriticResponse = self.channel.call(&ProposerRequest::Critic {
            meta: self.channel.meta(),
            diff: diff_text,
            context,
        })?;
        Ok(ReviewOutcome {
            approved: response.approved,
            reason: response.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plan_request_is_tagged_with_phase_and_provider() {
        let failing = vec![FailingTest::new("test_calc::test_add", "assert -1 == 5")];
        let request = ProposerRequest::Plan {
            meta: RequestMeta {
                provider: ProviderKind::Anthropic,
                model: None,
                repo: Path::new("/repo"),
            },
            failing_tests: &failing,
            feedback: Some("try again"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["phase"], "plan");
        assert_eq!(json["provider"], "anthropic");
        assert_eq!(json["failing_tests"][0]["id"], "test_calc::test_add");
        assert_eq!(json["feedback"], "try again");
        assert!(json.get("model").is_none());
    }

    #[test]
    fn provider_names_round_trip() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::OpenRouter,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn response_parsing_tolerates_fences_and_noise() {
        let plan: Plan = parse_response(
            "thinking...\n```json\n{\"approach\": \"fix add\", \"steps\": [\"edit\"], \"usage\": {\"prompt_tokens\": 10}}\n```",
        )
        .unwrap();
        assert_eq!(plan.approach, "fix add");
        assert_eq!(plan.steps, vec!["edit"]);

        let err = parse_response::<Plan>("no json here").unwrap_err();
        assert!(matches!(err, ProposerError::InvalidResponse(_)));
    }

    #[cfg(unix)]
    #[test]
    fn command_proposer_round_trips_through_a_script() {
        let root = tempdir().unwrap();
        let script = r#"read req
case "$req" in
  *'"phase":"plan"'*) echo '{"approach":"flip the sign","steps":[]}' ;;
  *'"phase":"act"'*) printf '%s\n' '{"diff":"--- a/x\n+++ b/x\n"}' ;;
  *'"phase":"critic"'*) echo '{"approved":false,"reason":"nope"}' ;;
esac"#;
        let mut proposer = CommandProposer::new(
            vec!["sh".into(), "-c".into(), script.into()],
            ProviderKind::OpenRouter,
            root.path(),
        );
        let plan = proposer.plan(&[], None).unwrap();
        assert_eq!(plan.approach, "flip the sign");
        let diff = proposer.act(&plan, &[]).unwrap().unwrap();
        assert!(diff.starts_with("--- a/x"));

        let mut reviewer = proposer.reviewer();
        let outcome = reviewer.review("diff", &ReviewContext::default()).unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.reason, "nope");
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_an_error() {
        let root = tempdir().unwrap();
        let mut proposer = CommandProposer::new(
            vec!["sh".into(), "-c".into(), "echo bad >&2; exit 3".into()],
            ProviderKind::OpenAi,
            root.path(),
        );
        let err = proposer.plan(&[], None).unwrap_err();
        assert!(matches!(err, ProposerError::Failed { .. }));
    }
}
