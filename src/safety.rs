//! Safety guard
//!
//! Checks a parsed diff against the run's [`SafetyPolicy`] before anything
//! touches disk: size budgets, denied paths, dangerous added content and
//! definitions that duplicate existing ones. Never mutates the working tree.

use crate::diff::{ChangeKind, DiffModel, FileChange};
use crate::util::truncate;
use crate::violation::{Violation, ViolationKind};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

const GLOB_META: &[char] = &['*', '?', '[', '{'];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    pub max_lines_changed: usize,
    pub max_files_modified: usize,
    /// Globs (when they contain `*?[{`) or plain substrings.
    pub denied_path_patterns: Vec<String>,
    /// Regexes matched against every added line.
    pub dangerous_content_patterns: Vec<String>,
    /// How many denied files to name before summarising the rest.
    pub max_reported_denied_paths: usize,
    pub snippet_chars: usize,
    pub check_duplicate_definitions: bool,
    /// Search radius, in lines, for fuzzy hunk placement.
    pub fuzz_window: usize,
    /// Scan the rest of the file when nothing matches within `fuzz_window`.
    pub fuzz_scan_file: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_lines_changed: 500,
            max_files_modified: 6,
            denied_path_patterns: [
                ".git/",
                ".github/workflows/",
                ".gitlab-ci.yml",
                ".circleci/",
                ".env",
                "*.pem",
                "*.key",
                "id_rsa",
                "secrets/",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            dangerous_content_patterns: [
                r"\beval\s*\(",
                r"\bexec\s*\(",
                r"\b__import__\s*\(",
                r"\bos\.(system|popen)\s*\(",
                r"\bsubprocess\.(run|call|Popen|check_call|check_output)\s*\(",
                r"\bchild_process\b",
                r"\bstd::process::Command\b",
                r"\brm\s+-(rf|fr)\b",
                r"\bshutil\.rmtree\s*\(",
                r"\bfs\.(rmSync|rmdirSync)\s*\(",
                r"(?i)\bdrop\s+(table|database|schema)\b",
                r"(?i)\btruncate\s+table\b",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_reported_denied_paths: 3,
            snippet_chars: 80,
            check_duplicate_definitions: true,
            fuzz_window: 10,
            fuzz_scan_file: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid denied-path glob '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
    #[error("invalid dangerous-content regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SafetyReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl SafetyReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            ok: violations.is_empty(),
            violations,
        }
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    /// A denied-path hit signals policy circumvention, not a bad fix.
    pub fn is_fatal(&self) -> bool {
        self.has(ViolationKind::DeniedPath)
    }
}

#[derive(Debug)]
pub struct SafetyGuard {
    max_lines_changed: usize,
    max_files_modified: usize,
    max_reported_denied_paths: usize,
    snippet_chars: usize,
    check_duplicate_definitions: bool,
    denied_globs: GlobSet,
    denied_substrings: Vec<String>,
    dangerous: Vec<(String, Regex)>,
    repo_root: Option<PathBuf>,
}

impl SafetyGuard {
    pub fn new(policy: &SafetyPolicy) -> Result<Self, GuardError> {
        let mut globs = GlobSetBuilder::new();
        let mut denied_substrings = Vec::new();
        for pattern in &policy.denied_path_patterns {
            if pattern.contains(GLOB_META) {
                let glob = Glob::new(pattern).map_err(|source| GuardError::InvalidGlob {
                    pattern: pattern.clone(),
                    source,
                })?;
                globs.add(glob);
            } else {
                denied_substrings.push(pattern.clone());
            }
        }
        let denied_globs = globs.build().map_err(|source| GuardError::InvalidGlob {
            pattern: policy.denied_path_patterns.join(", "),
            source,
        })?;

        let dangerous = policy
            .dangerous_content_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .map(|re| (pattern.clone(), re))
                    .map_err(|source| GuardError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            max_lines_changed: policy.max_lines_changed,
            max_files_modified: policy.max_files_modified,
            max_reported_denied_paths: policy.max_reported_denied_paths,
            snippet_chars: policy.snippet_chars,
            check_duplicate_definitions: policy.check_duplicate_definitions,
            denied_globs,
            denied_substrings,
            dangerous,
            repo_root: None,
        })
    }

    /// Let the duplicate-definition check read current file contents.
    pub fn with_repo_root(mut self, repo_root: &Path) -> Self {
        self.repo_root = Some(repo_root.to_path_buf());
        self
    }

    pub fn validate(&self, diff: &DiffModel) -> SafetyReport {
        let mut violations = Vec::new();

        let lines_changed = diff.lines_changed();
        if lines_changed > self.max_lines_changed {
            violations.push(Violation::new(
                ViolationKind::TooManyLines,
                format!(
                    "Diff changes {} lines (limit {})",
                    lines_changed, self.max_lines_changed
                ),
            ));
        }

        // A rename is one file; both of its paths still go through the
        // denied-path check.
        let files_modified = diff
            .files
            .iter()
            .map(FileChange::target_path)
            .collect::<HashSet<_>>()
            .len();
        if files_modified > self.max_files_modified {
            violations.push(Violation::new(
                ViolationKind::TooManyFiles,
                format!(
                    "Diff modifies {} files (limit {})",
                    files_modified, self.max_files_modified
                ),
            ));
        }

        let touched = diff.touched_paths();

        let denied: Vec<&str> = touched
            .iter()
            .copied()
            .filter(|path| self.is_denied(path))
            .collect();
        if !denied.is_empty() {
            let shown = denied
                .iter()
                .take(self.max_reported_denied_paths)
                .copied()
                .collect::<Vec<_>>()
                .join(", ");
            let hidden = denied.len().saturating_sub(self.max_reported_denied_paths);
            let message = if hidden > 0 {
                format!("Diff touches denied paths: {} (and {} more)", shown, hidden)
            } else {
                format!("Diff touches denied paths: {}", shown)
            };
            violations.push(Violation::new(ViolationKind::DeniedPath, message).at(denied[0]));
        }

        for change in &diff.files {
            self.scan_dangerous_content(change, &mut violations);
        }

        if self.check_duplicate_definitions {
            for change in &diff.files {
                self.check_duplicates(change, &mut violations);
            }
        }

        SafetyReport::from_violations(violations)
    }

    fn is_denied(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        if self.denied_substrings.iter().any(|s| path.contains(s.as_str())) {
            return true;
        }
        if self.denied_globs.is_empty() {
            return false;
        }
        // Match every suffix so `secrets/*.json` also catches `app/secrets/x.json`.
        std::iter::once(path)
            .chain(path.match_indices('/').map(|(i, _)| &path[i + 1..]))
            .any(|candidate| self.denied_globs.is_match(candidate))
    }

    fn scan_dangerous_content(&self, change: &FileChange, violations: &mut Vec<Violation>) {
        let path = change.target_path();
        let mut reported = HashSet::new();
        for line in change.hunks.iter().flat_map(|h| h.added_lines()) {
            for (pattern, re) in &self.dangerous {
                if reported.contains(pattern.as_str()) || !re.is_match(line) {
                    continue;
                }
                reported.insert(pattern.as_str());
                violations.push(
                    Violation::new(
                        ViolationKind::DangerousContent,
                        format!(
                            "Added line in {} matches `{}`: {}",
                            path,
                            pattern,
                            truncate(line.trim(), self.snippet_chars)
                        ),
                    )
                    .at(path),
                );
            }
        }
    }

    fn check_duplicates(&self, change: &FileChange, violations: &mut Vec<Violation>) {
        if change.kind == ChangeKind::Delete {
            return;
        }
        let path = change.target_path();
        let Some(definition) = definition_pattern(path) else {
            return;
        };

        let mut added: HashMap<String, usize> = HashMap::new();
        let mut added_order = Vec::new();
        let mut removed = HashSet::new();
        let mut context = HashSet::new();
        for hunk in &change.hunks {
            for name in hunk.added_lines().filter_map(|l| definition_name(&definition, l)) {
                let count = added.entry(name.clone()).or_insert(0);
                if *count == 0 {
                    added_order.push(name);
                }
                *count += 1;
            }
            removed.extend(hunk.removed_lines().filter_map(|l| definition_name(&definition, l)));
            context.extend(hunk.context_lines().filter_map(|l| definition_name(&definition, l)));
        }
        if added_order.is_empty() {
            return;
        }

        let on_disk = self.existing_definitions(change, &definition);
        for name in added_order {
            if removed.contains(&name) {
                continue;
            }
            let already_defined =
                added[&name] > 1 || context.contains(&name) || on_disk.contains(&name);
            if already_defined {
                violations.push(
                    Violation::new(
                        ViolationKind::DuplicateDefinition,
                        format!(
                            "{} adds another top-level definition of `{}` without replacing the existing one",
                            path, name
                        ),
                    )
                    .at(path),
                );
            }
        }
    }

    fn existing_definitions(&self, change: &FileChange, definition: &Regex) -> HashSet<String> {
        let (Some(root), Some(old_path)) = (self.repo_root.as_ref(), change.old_path.as_deref())
        else {
            return HashSet::new();
        };
        // Missing or unreadable files simply contribute no evidence.
        std::fs::read_to_string(root.join(old_path))
            .map(|content| {
                content
                    .lines()
                    .filter_map(|l| definition_name(definition, l))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Regex capturing the name of an unindented function/class definition for
/// the language implied by `path`'s extension.
fn definition_pattern(path: &str) -> Option<Regex> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    let pattern = match ext.as_str() {
        "py" | "pyi" => r"^(?:async\s+)?(?:def|class)\s+([A-Za-z_]\w*)",
        "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => {
            r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class)\s+([A-Za-z_$][\w$]*)"
        }
        "rs" => {
            r"^(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait)\s+([A-Za-z_]\w*)"
        }
        "go" => r"^(?:func|type)\s+([A-Za-z_]\w*)",
        _ => return None,
    };
    Regex::new(pattern).ok()
}

fn definition_name(definition: &Regex, line: &str) -> Option<String> {
    definition
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn guard() -> SafetyGuard {
        SafetyGuard::new(&SafetyPolicy::default()).unwrap()
    }

    fn diff_touching(paths: &[&str]) -> DiffModel {
        let text: String = paths
            .iter()
            .map(|p| format!("--- a/{p}\n+++ b/{p}\n@@ -1 +1 @@\n-a\n+b\n"))
            .collect();
        DiffModel::parse(&text).unwrap()
    }

    #[test]
    fn rename_counts_as_one_file() {
        let policy = SafetyPolicy {
            max_files_modified: 1,
            ..SafetyPolicy::default()
        };
        let diff = DiffModel::parse(
            "diff --git a/old_name.py b/new_name.py\nsimilarity index 100%\nrename from old_name.py\nrename to new_name.py\n",
        )
        .unwrap();
        let report = SafetyGuard::new(&policy).unwrap().validate(&diff);
        assert!(!report.has(ViolationKind::TooManyFiles), "{:?}", report.violations);

        let two = diff_touching(&["a.py", "b.py"]);
        let report = SafetyGuard::new(&policy).unwrap().validate(&two);
        assert!(report.has(ViolationKind::TooManyFiles));
    }

    #[test]
    fn small_clean_diff_passes() {
        let diff = diff_touching(&["calculator.py"]);
        let report = guard().validate(&diff);
        assert!(report.ok, "{:?}", report.violations);
    }

    #[test]
    fn too_many_files_fails_regardless_of_line_count() {
        let policy = SafetyPolicy {
            max_files_modified: 2,
            max_lines_changed: 10_000,
            ..SafetyPolicy::default()
        };
        let guard = SafetyGuard::new(&policy).unwrap();
        let report = guard.validate(&diff_touching(&["a.py", "b.py", "c.py"]));
        assert!(!report.ok);
        assert!(report.has(ViolationKind::TooManyFiles));
        assert!(!report.has(ViolationKind::TooManyLines));
    }

    #[test]
    fn too_many_lines_is_reported() {
        let policy = SafetyPolicy {
            max_lines_changed: 1,
            ..SafetyPolicy::default()
        };
        let report = SafetyGuard::new(&policy)
            .unwrap()
            .validate(&diff_touching(&["a.py"]));
        assert!(report.has(ViolationKind::TooManyLines));
    }

    #[test]
    fn denied_path_by_substring_and_glob() {
        let g = guard();
        let report = g.validate(&diff_touching(&[".github/workflows/ci.yml"]));
        assert!(report.is_fatal());

        let report = g.validate(&diff_touching(&["config/certs/server.pem"]));
        assert!(report.has(ViolationKind::DeniedPath));
    }

    #[test]
    fn denied_path_message_caps_listed_files() {
        let policy = SafetyPolicy {
            max_files_modified: 100,
            max_reported_denied_paths: 2,
            ..SafetyPolicy::default()
        };
        let report = SafetyGuard::new(&policy).unwrap().validate(&diff_touching(&[
            "a.pem", "b.pem", "c.pem", "d.pem",
        ]));
        let denied = report
            .violations
            .iter()
            .find(|v| v.kind == ViolationKind::DeniedPath)
            .unwrap();
        assert!(denied.message.contains("a.pem, b.pem"));
        assert!(denied.message.contains("and 2 more"));
    }

    #[test]
    fn dangerous_added_content_is_flagged_but_removed_content_is_not() {
        let diff = DiffModel::parse(
            "--- a/run.py\n+++ b/run.py\n@@ -1,2 +1,2 @@\n-os.system('ls')\n+import subprocess\n x = 1\n",
        )
        .unwrap();
        assert!(guard().validate(&diff).ok);

        let diff = DiffModel::parse(
            "--- a/run.py\n+++ b/run.py\n@@ -1 +1 @@\n-x = 1\n+x = eval(user_input)\n",
        )
        .unwrap();
        let report = guard().validate(&diff);
        assert!(report.has(ViolationKind::DangerousContent));
        assert!(!report.is_fatal());
    }

    #[test]
    fn duplicate_definition_from_context_evidence() {
        let diff = DiffModel::parse(
            "\
--- a/calculator.py
+++ b/calculator.py
@@ -1,2 +1,5 @@
 def add(a, b):
     return a - b
+
+def add(a, b):
+    return a + b
",
        )
        .unwrap();
        let report = guard().validate(&diff);
        assert!(report.has(ViolationKind::DuplicateDefinition));
    }

    #[test]
    fn replacing_a_definition_is_not_a_duplicate() {
        let diff = DiffModel::parse(
            "\
--- a/calculator.py
+++ b/calculator.py
@@ -1,2 +1,2 @@
-def add(a, b):
-    return a - b
+def add(a, b):
+    return a + b
",
        )
        .unwrap();
        assert!(guard().validate(&diff).ok);
    }

    #[test]
    fn new_definition_is_fine_without_evidence() {
        let diff = DiffModel::parse(
            "--- a/calculator.py\n+++ b/calculator.py\n@@ -2,0 +3,2 @@\n+def mul(a, b):\n+    return a * b\n",
        )
        .unwrap();
        assert!(guard().validate(&diff).ok);
    }

    #[test]
    fn duplicate_definition_detected_from_disk() {
        let root = tempdir().unwrap();
        std::fs::write(
            root.path().join("calculator.py"),
            "def add(a, b):\n    return a - b\n\n\ndef sub(a, b):\n    return a - b\n",
        )
        .unwrap();
        let diff = DiffModel::parse(
            "--- a/calculator.py\n+++ b/calculator.py\n@@ -6,0 +7,2 @@\n+def add(a, b):\n+    return a + b\n",
        )
        .unwrap();
        let report = guard().with_repo_root(root.path()).validate(&diff);
        assert!(report.has(ViolationKind::DuplicateDefinition));
    }

    #[test]
    fn invalid_regex_is_a_construction_error() {
        let policy = SafetyPolicy {
            dangerous_content_patterns: vec!["(unclosed".to_string()],
            ..SafetyPolicy::default()
        };
        assert!(matches!(
            SafetyGuard::new(&policy),
            Err(GuardError::InvalidRegex { .. })
        ));
    }
}
