#![allow(dead_code)]

use fixloop::oracle::{FailingTest, OracleError, TestOracle, TestResult};
use fixloop::proposer::{FixProposer, Plan, ProposerError};
use fixloop::telemetry::TelemetrySink;
use git2::{Repository, Signature};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BROKEN_CALCULATOR: &str = "def add(a, b):\n    return a - b\n";
pub const FIXED_CALCULATOR: &str = "def add(a, b):\n    return a + b\n";

pub const CALCULATOR_FIX: &str = "\
--- a/calculator.py
+++ b/calculator.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

pub const CALCULATOR_NOTE: &str = "\
--- a/calculator.py
+++ b/calculator.py
@@ -1,2 +1,3 @@
 def add(a, b):
     return a + b
+# checked
";

/// Applies to the broken calculator without fixing it.
pub const BROKEN_CALCULATOR_NOTE: &str = "\
--- a/calculator.py
+++ b/calculator.py
@@ -1,2 +1,3 @@
 def add(a, b):
     return a - b
+# looked at this
";

pub fn init_repo(root: &Path, files: &[(&str, &str)]) -> Repository {
    let repo = Repository::init(root).unwrap();
    {
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();
    }
    for (path, content) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }
    {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
    }
    repo
}

/// Hands out canned diffs in order, then the repeated diff (or `None`).
/// Records the feedback each plan call received.
#[derive(Clone, Default)]
pub struct ScriptedProposer {
    diffs: Arc<Mutex<VecDeque<Option<String>>>>,
    repeat: Option<String>,
    pub feedback: Arc<Mutex<Vec<Option<String>>>>,
}

impl ScriptedProposer {
    pub fn new(diffs: &[&str]) -> Self {
        Self {
            diffs: Arc::new(Mutex::new(
                diffs.iter().map(|d| Some(d.to_string())).collect(),
            )),
            ..Self::default()
        }
    }

    /// Always propose the same diff.
    pub fn repeating(diff: &str) -> Self {
        Self {
            repeat: Some(diff.to_string()),
            ..Self::default()
        }
    }

    /// Once the scripted diffs run out, keep proposing `diff`.
    pub fn then_repeat(mut self, diff: &str) -> Self {
        self.repeat = Some(diff.to_string());
        self
    }

    pub fn plans(&self) -> usize {
        self.feedback.lock().unwrap().len()
    }

    pub fn feedback_at(&self, index: usize) -> Option<String> {
        self.feedback.lock().unwrap()[index].clone()
    }
}

impl FixProposer for ScriptedProposer {
    fn plan(
        &mut self,
        _failing: &[FailingTest],
        prior_feedback: Option<&str>,
    ) -> Result<Plan, ProposerError> {
        self.feedback
            .lock()
            .unwrap()
            .push(prior_feedback.map(str::to_string));
        Ok(Plan {
            approach: "fix the failing test".to_string(),
            steps: vec!["edit".to_string()],
        })
    }

    fn act(&mut self, _plan: &Plan, _failing: &[FailingTest]) -> Result<Option<String>, ProposerError> {
        if let Some(next) = self.diffs.lock().unwrap().pop_front() {
            return Ok(next);
        }
        Ok(self.repeat.clone())
    }
}

/// `test_add` passes once `path` contains `needle`. Calls are numbered
/// from 1; `slow_call` sleeps before answering and `timeout_call` reports a
/// test-runner timeout instead.
pub struct FileOracle {
    pub path: PathBuf,
    pub needle: String,
    pub runs: Arc<Mutex<usize>>,
    pub slow_call: Option<(usize, Duration)>,
    pub timeout_call: Option<usize>,
}

impl FileOracle {
    pub fn new(path: PathBuf, needle: &str) -> Self {
        Self {
            path,
            needle: needle.to_string(),
            runs: Arc::new(Mutex::new(0)),
            slow_call: None,
            timeout_call: None,
        }
    }
}

impl TestOracle for FileOracle {
    fn run(&mut self) -> Result<TestResult, OracleError> {
        let call = {
            let mut runs = self.runs.lock().unwrap();
            *runs += 1;
            *runs
        };
        if let Some((at, delay)) = self.slow_call {
            if at == call {
                std::thread::sleep(delay);
            }
        }
        if self.timeout_call == Some(call) {
            return Err(OracleError::Timeout { secs: 1 });
        }
        let content = fs::read_to_string(&self.path).map_err(|e| OracleError::Failed(e.to_string()))?;
        let mut result = TestResult {
            total: 1,
            report: Some(b"<testsuite/>".to_vec()),
            ..TestResult::default()
        };
        if content.contains(&self.needle) {
            result.passed = 1;
        } else {
            result.failed = 1;
            result
                .failing
                .push(FailingTest::new("test_calculator.py::test_add", "assert -1 == 3"));
        }
        Ok(result)
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub events: Arc<Mutex<Vec<(String, Value)>>>,
    pub artifacts: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingSink {
    pub fn event_names(&self) -> Vec<String> {
        self.events.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn artifact(&self, rel_path: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == rel_path)
            .map(|(_, b)| b.clone())
    }
}

impl TelemetrySink for RecordingSink {
    fn log_event(&mut self, name: &str, fields: Value) -> anyhow::Result<()> {
        self.events.lock().unwrap().push((name.to_string(), fields));
        Ok(())
    }

    fn save_artifact(&mut self, rel_path: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.artifacts
            .lock()
            .unwrap()
            .push((rel_path.to_string(), bytes.to_vec()));
        Ok(())
    }
}
