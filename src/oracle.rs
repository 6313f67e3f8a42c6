//! Test oracle
//!
//! Runs the repository's test suite and reports which tests fail. The
//! command-backed oracle prefers a JUnit XML report and falls back to the
//! summary lines pytest, cargo and go print.

use crate::util::{run_command_with_timeout, tail_chars, CancelToken};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable pointing the test command at the report location.
pub const REPORT_ENV: &str = "FIXLOOP_JUNIT_REPORT";
const REPORT_PLACEHOLDER: &str = "{report}";
const MAX_MESSAGE_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FailingTest {
    pub id: String,
    pub message: String,
    pub trace: String,
}

impl FailingTest {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            trace: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub failing: Vec<FailingTest>,
    /// Raw JUnit report, when the runner wrote one.
    #[serde(skip)]
    pub report: Option<Vec<u8>>,
}

impl TestResult {
    pub fn failing_ids(&self) -> BTreeSet<String> {
        self.failing.iter().map(|t| t.id.clone()).collect()
    }

    pub fn all_passed(&self) -> bool {
        self.failing.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("test command timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("test command interrupted")]
    Interrupted,
    #[error("test command could not run: {0}")]
    Failed(String),
}

pub trait TestOracle {
    fn run(&mut self) -> Result<TestResult, OracleError>;
}

/// Detected project type, used to pick a test command when none is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectType {
    Rust,
    Node,
    Python,
    Go,
    Unknown,
}

impl ProjectType {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectType::Rust => "Rust",
            ProjectType::Node => "Node.js",
            ProjectType::Python => "Python",
            ProjectType::Go => "Go",
            ProjectType::Unknown => "Unknown",
        }
    }
}

pub fn detect_project_type(repo_path: &Path) -> ProjectType {
    if repo_path.join("Cargo.toml").exists() {
        ProjectType::Rust
    } else if repo_path.join("package.json").exists() {
        ProjectType::Node
    } else if repo_path.join("pyproject.toml").exists()
        || repo_path.join("setup.py").exists()
        || repo_path.join("requirements.txt").exists()
        || repo_path.join("pytest.ini").exists()
    {
        ProjectType::Python
    } else if repo_path.join("go.mod").exists() {
        ProjectType::Go
    } else {
        ProjectType::Unknown
    }
}

/// Default argv for a project type. `{report}` is replaced by the JUnit path.
pub fn default_test_command(project_type: ProjectType) -> Option<Vec<String>> {
    let argv: &[&str] = match project_type {
        ProjectType::Rust => &["cargo", "test"],
        ProjectType::Node => &["npm", "test"],
        ProjectType::Python => &["python", "-m", "pytest", "-q", "--junitxml={report}"],
        ProjectType::Go => &["go", "test", "./..."],
        ProjectType::Unknown => return None,
    };
    Some(argv.iter().map(|s| s.to_string()).collect())
}

pub struct CommandTestOracle {
    argv: Vec<String>,
    repo_root: PathBuf,
    report_path: PathBuf,
    timeout: Duration,
    cancel: CancelToken,
}

impl CommandTestOracle {
    pub fn new(argv: Vec<String>, repo_root: &Path, report_path: PathBuf) -> Self {
        Self {
            argv,
            repo_root: repo_root.to_path_buf(),
            report_path,
            timeout: Duration::from_secs(600),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn command(&self) -> Result<Command, OracleError> {
        let report = self.report_path.to_string_lossy();
        let mut argv = self
            .argv
            .iter()
            .map(|arg| arg.replace(REPORT_PLACEHOLDER, &report));
        let program = argv
            .next()
            .ok_or_else(|| OracleError::Failed("test command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(argv)
            .current_dir(&self.repo_root)
            .env(REPORT_ENV, self.report_path.as_os_str());
        Ok(cmd)
    }
}

impl TestOracle for CommandTestOracle {
    fn run(&mut self) -> Result<TestResult, OracleError> {
        if let Some(parent) = self.report_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OracleError::Failed(format!("report dir: {}", e)))?;
        }
        // A stale report from the previous iteration must not be mistaken for this one.
        let _ = std::fs::remove_file(&self.report_path);

        let mut cmd = self.command()?;
        info!("Running tests: {}", self.argv.join(" "));
        let output = run_command_with_timeout(&mut cmd, self.timeout, None, &self.cancel)
            .map_err(OracleError::Failed)?;
        if output.cancelled {
            return Err(OracleError::Interrupted);
        }
        if output.timed_out {
            return Err(OracleError::Timeout {
                secs: self.timeout.as_secs(),
            });
        }

        let report = std::fs::read(&self.report_path).ok();
        let mut result = match report.as_deref().map(String::from_utf8_lossy) {
            Some(xml) => parse_junit(&xml),
            None => {
                debug!("No JUnit report; parsing runner output");
                parse_summary(&format!("{}\n{}", output.stdout, output.stderr))
            }
        };
        result.report = report;

        // A failing exit with nothing attributable (collection error, crash)
        // still counts as a failure.
        if !output.success() && result.failing.is_empty() {
            let code = output
                .status
                .and_then(|s| s.code())
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let detail = if output.stderr.trim().is_empty() {
                &output.stdout
            } else {
                &output.stderr
            };
            result.failing.push(FailingTest {
                id: format!("<{}>", self.argv.join(" ")),
                message: format!("test command exited with {}", code),
                trace: tail_chars(detail.trim(), MAX_MESSAGE_CHARS),
            });
            result.errors += 1;
            result.total = result.total.max(1);
        }

        info!(
            "Tests: {} total, {} passed, {} failing",
            result.total,
            result.passed,
            result.failing.len()
        );
        Ok(result)
    }
}

static TESTCASE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)<testcase\b([^>]*?)(?:/>|>(.*?)</testcase>)").ok()
});
static OUTCOME_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)<(failure|error|skipped)\b([^>]*?)(?:/>|>(.*?)</(?:failure|error|skipped)>)")
        .ok()
});
static ATTR_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z_:][\w:.-]*)\s*=\s*"([^"]*)""#).ok());

fn attr(attrs: &str, name: &str) -> Option<String> {
    ATTR_RE.as_ref()?.captures_iter(attrs).find_map(|c| {
        let key = c.get(1)?.as_str();
        let value = c.get(2)?.as_str();
        (key == name).then(|| unescape_xml(value))
    })
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

fn strip_cdata(s: &str) -> &str {
    s.trim()
        .strip_prefix("<![CDATA[")
        .and_then(|rest| rest.strip_suffix("]]>"))
        .unwrap_or(s.trim())
}

/// Parse a JUnit XML report. Test ids are `classname::name`.
pub fn parse_junit(xml: &str) -> TestResult {
    let mut result = TestResult::default();
    let (Some(testcase_re), Some(outcome_re)) = (TESTCASE_RE.as_ref(), OUTCOME_RE.as_ref()) else {
        return result;
    };
    let mut skipped = 0usize;

    for case in testcase_re.captures_iter(xml) {
        let attrs = case.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = case.get(2).map(|m| m.as_str()).unwrap_or_default();
        let name = attr(attrs, "name").unwrap_or_default();
        let id = match attr(attrs, "classname").filter(|c| !c.is_empty()) {
            Some(class) => format!("{}::{}", class, name),
            None => name,
        };
        result.total += 1;

        let Some(outcome) = outcome_re.captures(body) else {
            continue;
        };
        let kind = outcome.get(1).map(|m| m.as_str()).unwrap_or_default();
        if kind == "skipped" {
            skipped += 1;
            continue;
        }
        let outcome_attrs = outcome.get(2).map(|m| m.as_str()).unwrap_or_default();
        let text = outcome
            .get(3)
            .map(|m| unescape_xml(strip_cdata(m.as_str())))
            .unwrap_or_default();
        let message = attr(outcome_attrs, "message")
            .or_else(|| text.lines().last().map(str::to_string))
            .unwrap_or_else(|| kind.to_string());
        if kind == "error" {
            result.errors += 1;
        } else {
            result.failed += 1;
        }
        result.failing.push(FailingTest {
            id,
            message: tail_chars(&message, MAX_MESSAGE_CHARS),
            trace: tail_chars(&text, MAX_MESSAGE_CHARS),
        });
    }
    result.passed = result
        .total
        .saturating_sub(result.failed + result.errors + skipped);
    result
}

static PYTEST_FAILED_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^(FAILED|ERROR) (\S+)(?: - (.*))?$").ok());
static PYTEST_COUNT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d+) (passed|failed|errors?)\b").ok());
static CARGO_FAILED_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^test (\S+) \.\.\. FAILED$").ok());
static CARGO_RESULT_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?m)^test result: \w+\. (\d+) passed; (\d+) failed;").ok()
});
static GO_RESULT_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*--- (PASS|FAIL): (\S+)").ok());

/// Best-effort parse of pytest, cargo test and go test console output.
pub fn parse_summary(output: &str) -> TestResult {
    let mut result = TestResult::default();

    if let Some(re) = CARGO_RESULT_RE.as_ref() {
        for caps in re.captures_iter(output) {
            result.passed += caps[1].parse::<usize>().unwrap_or(0);
            result.failed += caps[2].parse::<usize>().unwrap_or(0);
        }
        if let Some(failed_re) = CARGO_FAILED_RE.as_ref() {
            result.failing.extend(
                failed_re
                    .captures_iter(output)
                    .map(|c| FailingTest::new(&c[1], "test failed")),
            );
        }
        if result.passed + result.failed > 0 {
            result.total = result.passed + result.failed;
            return result;
        }
    }

    if let Some(re) = GO_RESULT_RE.as_ref() {
        for caps in re.captures_iter(output) {
            result.total += 1;
            if &caps[1] == "PASS" {
                result.passed += 1;
            } else {
                result.failed += 1;
                result.failing.push(FailingTest::new(&caps[2], "test failed"));
            }
        }
        if result.total > 0 {
            return result;
        }
    }

    if let Some(re) = PYTEST_FAILED_RE.as_ref() {
        for caps in re.captures_iter(output) {
            let message = caps.get(3).map(|m| m.as_str()).unwrap_or("test failed");
            result.failing.push(FailingTest::new(&caps[2], message));
        }
    }
    if let Some(re) = PYTEST_COUNT_RE.as_ref() {
        // The final summary line carries the authoritative counts.
        if let Some(line) = output
            .lines()
            .rev()
            .find(|l| re.is_match(l) && l.contains(" in "))
        {
            for caps in re.captures_iter(line) {
                let n = caps[1].parse::<usize>().unwrap_or(0);
                match &caps[2] {
                    "passed" => result.passed = n,
                    "failed" => result.failed = n,
                    _ => result.errors = n,
                }
            }
        }
    }
    result.total = result.passed + result.failed + result.errors;
    result
}
