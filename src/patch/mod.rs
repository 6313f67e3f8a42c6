//! Patch application
//!
//! [`PatchEngine::apply`] tries an ordered list of strategies until one
//! applies the whole diff. Each strategy is a path rewrite (or a relaxed
//! hunk placement) on top of the same native hunk applier, and every attempt
//! runs inside its own [`Transaction`] so a failed attempt leaves the tree
//! exactly as it was.

pub mod transaction;

use crate::diff::{ChangeKind, DiffHunk, DiffModel, FileChange};
use crate::safety::SafetyPolicy;
use crate::util::resolve_repo_path_allow_new;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub use transaction::Transaction;

/// Directories probed when a diff path is missing the source root.
const CONVENTIONAL_ROOTS: &[&str] = &["src", "lib", "app", "pkg", "source"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    PrefixStrip,
    RootInsertion,
    FuzzyContext,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::PrefixStrip => "prefix_strip",
            Strategy::RootInsertion => "root_insertion",
            Strategy::FuzzyContext => "fuzzy_context",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("unsafe path {path}: {reason}")]
    UnsafePath { path: String, reason: String },
    #[error("{path} does not exist")]
    MissingFile { path: String },
    #[error("{path} already exists")]
    TargetExists { path: String },
    #[error("{path} is not UTF-8 text")]
    NotText { path: String },
    #[error("hunk {hunk} of {path} does not match near line {line}")]
    HunkMismatch {
        path: String,
        hunk: usize,
        line: usize,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("no strategy applied the diff: {}", summarize_attempts(.attempts))]
    NoStrategyApplied { attempts: Vec<(Strategy, String)> },
}

fn summarize_attempts(attempts: &[(Strategy, String)]) -> String {
    attempts
        .iter()
        .map(|(strategy, err)| format!("{}: {}", strategy, err))
        .collect::<Vec<_>>()
        .join("; ")
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ApplyError + '_ {
    move |source| ApplyError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Exact,
    Fuzzy { window: usize, scan_file: bool },
}

#[derive(Debug, Clone)]
pub struct PatchEngine {
    fuzz_window: usize,
    fuzz_scan_file: bool,
}

impl PatchEngine {
    pub fn new(policy: &SafetyPolicy) -> Self {
        Self {
            fuzz_window: policy.fuzz_window,
            fuzz_scan_file: policy.fuzz_scan_file,
        }
    }

    /// Apply `diff` under `repo_root`, all-or-nothing. Returns the sorted
    /// absolute paths that were written, created or removed.
    pub fn apply(&self, diff: &DiffModel, repo_root: &Path) -> Result<Vec<PathBuf>, ApplyError> {
        if diff.is_empty() {
            return Ok(Vec::new());
        }
        for path in diff.touched_paths() {
            check_relative(path)?;
        }

        let mut candidates: Vec<(Strategy, DiffModel)> = vec![(Strategy::Direct, diff.clone())];
        if let Some(stripped) = strip_shared_prefix(diff, repo_root) {
            candidates.push((Strategy::PrefixStrip, stripped));
        }
        if let Some(rooted) = insert_source_root(diff, repo_root) {
            if !candidates.iter().any(|(_, c)| *c == rooted) {
                candidates.push((Strategy::RootInsertion, rooted));
            }
        }

        let mut attempts = Vec::new();
        let fuzzy = Placement::Fuzzy {
            window: self.fuzz_window,
            scan_file: self.fuzz_scan_file,
        };
        let exact_passes = candidates.iter().map(|(s, c)| (*s, c, Placement::Exact));
        let fuzzy_passes = candidates
            .iter()
            .map(|(_, c)| (Strategy::FuzzyContext, c, fuzzy));

        for (strategy, candidate, placement) in exact_passes.chain(fuzzy_passes) {
            debug!("Trying {} patch strategy", strategy);
            match apply_native(candidate, repo_root, placement) {
                Ok(changed) => {
                    info!(
                        "Applied diff with {} strategy ({} files)",
                        strategy,
                        changed.len()
                    );
                    return Ok(changed);
                }
                Err(err @ ApplyError::UnsafePath { .. }) => return Err(err),
                Err(err) => {
                    debug!("{} strategy failed: {}", strategy, err);
                    attempts.push((strategy, err.to_string()));
                }
            }
        }

        Err(ApplyError::NoStrategyApplied { attempts })
    }
}

fn check_relative(path: &str) -> Result<(), ApplyError> {
    let unsafe_path = |reason: &str| ApplyError::UnsafePath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    let p = Path::new(path);
    if path.is_empty() {
        return Err(unsafe_path("empty path"));
    }
    if p.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        return Err(unsafe_path("absolute paths are not allowed"));
    }
    if p.components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(unsafe_path("parent traversal is not allowed"));
    }
    Ok(())
}

/// `demo/src/a.py` against a repo that has `src/` but no `demo/`.
fn strip_shared_prefix(diff: &DiffModel, repo_root: &Path) -> Option<DiffModel> {
    let paths = diff.touched_paths();
    let first = paths.first()?.split_once('/')?.0;
    if first.is_empty() || repo_root.join(first).exists() {
        return None;
    }
    let prefix = format!("{}/", first);
    if !paths.iter().all(|p| p.starts_with(&prefix)) {
        return None;
    }
    Some(diff.map_paths(|p| p.strip_prefix(prefix.as_str()).unwrap_or(p).to_string()))
}

/// `utils.py` against a repo that keeps it at `src/utils.py`.
fn insert_source_root(diff: &DiffModel, repo_root: &Path) -> Option<DiffModel> {
    let rooted_path = |path: &str| -> Option<String> {
        if repo_root.join(path).exists() {
            return None;
        }
        let parent = Path::new(path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty());
        CONVENTIONAL_ROOTS.iter().find_map(|root| {
            let base = repo_root.join(root);
            let file_there = base.join(path).exists();
            let dir_there = parent.is_some_and(|p| base.join(p).is_dir() && !repo_root.join(p).exists());
            (file_there || dir_there).then(|| format!("{}/{}", root, path))
        })
    };

    if !diff.touched_paths().iter().any(|p| rooted_path(p).is_some()) {
        return None;
    }
    Some(diff.map_paths(|p| rooted_path(p).unwrap_or_else(|| p.to_string())))
}

fn apply_native(
    diff: &DiffModel,
    repo_root: &Path,
    placement: Placement,
) -> Result<Vec<PathBuf>, ApplyError> {
    let mut tx = Transaction::begin();
    for change in &diff.files {
        apply_change(&mut tx, repo_root, change, placement)?;
    }
    Ok(tx.commit())
}

fn resolve(repo_root: &Path, path: &str) -> Result<PathBuf, ApplyError> {
    resolve_repo_path_allow_new(repo_root, Path::new(path))
        .map(|resolved| resolved.absolute)
        .map_err(|reason| ApplyError::UnsafePath {
            path: path.to_string(),
            reason,
        })
}

fn apply_change(
    tx: &mut Transaction,
    repo_root: &Path,
    change: &FileChange,
    placement: Placement,
) -> Result<(), ApplyError> {
    let label = change.target_path().to_string();
    match change.kind {
        ChangeKind::Delete => {
            let path = resolve(repo_root, &label)?;
            if path.exists() {
                tx.remove(&path).map_err(io_err(&path))?;
            }
        }
        ChangeKind::Add => {
            let path = resolve(repo_root, &label)?;
            if path.exists() {
                return Err(ApplyError::TargetExists { path: label });
            }
            let mut file = TextFile::empty();
            apply_hunks(&mut file, &change.hunks, placement, &label)?;
            tx.write(&path, file.render().as_bytes())
                .map_err(io_err(&path))?;
        }
        ChangeKind::Modify => {
            let path = resolve(repo_root, &label)?;
            let mut file = read_text(&path, &label)?;
            apply_hunks(&mut file, &change.hunks, placement, &label)?;
            tx.write(&path, file.render().as_bytes())
                .map_err(io_err(&path))?;
        }
        ChangeKind::Rename => {
            let from_label = change.old_path.clone().unwrap_or_default();
            let from = resolve(repo_root, &from_label)?;
            let to = resolve(repo_root, &label)?;
            if to.exists() {
                return Err(ApplyError::TargetExists { path: label });
            }
            let mut file = read_text(&from, &from_label)?;
            tx.remove(&from).map_err(io_err(&from))?;
            apply_hunks(&mut file, &change.hunks, placement, &label)?;
            tx.write(&to, file.render().as_bytes()).map_err(io_err(&to))?;
        }
    }
    Ok(())
}

fn read_text(path: &Path, label: &str) -> Result<TextFile, ApplyError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ApplyError::MissingFile {
                path: label.to_string(),
            })
        }
        Err(err) => return Err(io_err(path)(err)),
    };
    let text = String::from_utf8(bytes).map_err(|_| ApplyError::NotText {
        path: label.to_string(),
    })?;
    Ok(TextFile::parse(&text))
}

/// File content split into lines with its line-ending conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TextFile {
    lines: Vec<String>,
    crlf: bool,
    trailing_newline: bool,
}

impl TextFile {
    fn empty() -> Self {
        Self {
            lines: Vec::new(),
            crlf: false,
            trailing_newline: false,
        }
    }

    fn parse(text: &str) -> Self {
        let crlf = text.contains("\r\n");
        let trailing_newline = text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);
        let lines = if text.is_empty() {
            Vec::new()
        } else {
            body.split('\n')
                .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
                .collect()
        };
        Self {
            lines,
            crlf,
            trailing_newline,
        }
    }

    fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let eol = if self.crlf { "\r\n" } else { "\n" };
        let mut out = self.lines.join(eol);
        if self.trailing_newline {
            out.push_str(eol);
        }
        out
    }
}

fn lines_match(file: &[String], at: usize, expected: &[&str], placement: Placement) -> bool {
    if at + expected.len() > file.len() {
        return false;
    }
    file[at..at + expected.len()]
        .iter()
        .zip(expected)
        .all(|(have, want)| match placement {
            Placement::Exact => have == want,
            // Models routinely drop or add trailing whitespace.
            Placement::Fuzzy { .. } => have.trim_end() == want.trim_end(),
        })
}

/// Where `old` sits in `file`, searching from `expected` and never before
/// `floor` (the end of the previous hunk).
fn locate(
    file: &[String],
    old: &[&str],
    expected: usize,
    floor: usize,
    placement: Placement,
) -> Option<usize> {
    let fits = |at: usize| at >= floor && lines_match(file, at, old, placement);
    if old.is_empty() {
        return (expected >= floor && expected <= file.len()).then_some(expected);
    }
    if fits(expected) {
        return Some(expected);
    }
    let Placement::Fuzzy { window, scan_file } = placement else {
        return None;
    };
    for distance in 1..=window {
        if let Some(before) = expected.checked_sub(distance) {
            if fits(before) {
                return Some(before);
            }
        }
        if fits(expected + distance) {
            return Some(expected + distance);
        }
    }
    if !scan_file {
        return None;
    }
    (floor..file.len()).find(|&at| fits(at))
}

fn apply_hunks(
    file: &mut TextFile,
    hunks: &[DiffHunk],
    placement: Placement,
    label: &str,
) -> Result<(), ApplyError> {
    if hunks.is_empty() {
        return Ok(());
    }
    let was_empty = file.lines.is_empty();
    let mut out: Vec<String> = Vec::with_capacity(file.lines.len());
    let mut cursor = 0usize;
    let mut delta: isize = 0;
    let mut touches_end = false;

    for (idx, hunk) in hunks.iter().enumerate() {
        let old: Vec<&str> = hunk.old_lines().collect();
        // Pure insertions are stated as "after line N"; everything else as
        // "starting at line N".
        let stated = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let expected = (stated as isize + delta).max(cursor as isize) as usize;
        let at = locate(&file.lines, &old, expected, cursor, placement).ok_or_else(|| {
            ApplyError::HunkMismatch {
                path: label.to_string(),
                hunk: idx + 1,
                line: expected + 1,
            }
        })?;
        if at != expected {
            debug!(
                "Hunk {} of {} matched at line {} instead of {}",
                idx + 1,
                label,
                at + 1,
                expected + 1
            );
        }

        out.extend(file.lines[cursor..at].iter().cloned());
        out.extend(hunk.new_lines().map(str::to_string));
        cursor = at + old.len();
        delta = at as isize - stated as isize;
        touches_end = cursor == file.lines.len();
    }
    out.extend(file.lines[cursor..].iter().cloned());

    if let Some(last) = hunks.last() {
        if was_empty {
            file.trailing_newline = !last.new_missing_newline;
        } else if touches_end {
            if last.new_missing_newline {
                file.trailing_newline = false;
            } else if last.old_missing_newline {
                file.trailing_newline = true;
            }
        }
    }
    file.lines = out;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn engine() -> PatchEngine {
        PatchEngine::new(&SafetyPolicy::default())
    }

    fn parse(text: &str) -> DiffModel {
        DiffModel::parse(text).unwrap()
    }

    #[test]
    fn direct_apply_modifies_file() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join("calculator.py"),
            "def add(a, b):\n    return a - b\n",
        )
        .unwrap();
        let diff = parse(
            "--- a/calculator.py\n+++ b/calculator.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n",
        );

        let changed = engine().apply(&diff, root.path()).unwrap();
        assert_eq!(changed.len(), 1);
        assert!(changed[0].ends_with("calculator.py"));
        assert_eq!(
            fs::read_to_string(root.path().join("calculator.py")).unwrap(),
            "def add(a, b):\n    return a + b\n"
        );
    }

    #[test]
    fn empty_diff_touches_nothing() {
        let root = tempdir().unwrap();
        let changed = engine().apply(&DiffModel::default(), root.path()).unwrap();
        assert!(changed.is_empty());
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn prefix_strip_drops_unknown_leading_directory() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("src")).unwrap();
        fs::write(root.path().join("src/a.py"), "x = 1\n").unwrap();
        let diff = parse("--- a/demo/src/a.py\n+++ b/demo/src/a.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n");

        engine().apply(&diff, root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("src/a.py")).unwrap(),
            "x = 2\n"
        );
        assert!(!root.path().join("demo").exists());
    }

    #[test]
    fn root_insertion_finds_file_under_src() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("src")).unwrap();
        fs::write(root.path().join("src/utils.py"), "y = 1\n").unwrap();
        let diff = parse("--- a/utils.py\n+++ b/utils.py\n@@ -1 +1 @@\n-y = 1\n+y = 3\n");

        engine().apply(&diff, root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("src/utils.py")).unwrap(),
            "y = 3\n"
        );
    }

    #[test]
    fn fuzzy_context_applies_hunk_off_by_three() {
        let root = tempdir().unwrap();
        let original = "import os\nimport sys\nimport re\n\ndef add(a, b):\n    return a - b\n\ndef sub(a, b):\n    return a - b\n";
        fs::write(root.path().join("calc.py"), original).unwrap();
        // Stated at line 2, actually at line 5.
        let diff = parse(
            "--- a/calc.py\n+++ b/calc.py\n@@ -2,2 +2,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n",
        );

        engine().apply(&diff, root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("calc.py")).unwrap(),
            original.replacen("return a - b", "return a + b", 1)
        );
    }

    #[test]
    fn fuzzy_context_rejects_hunk_outside_window() {
        let root = tempdir().unwrap();
        let mut body: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        body.push_str("target\n");
        fs::write(root.path().join("f.txt"), &body).unwrap();
        let diff = parse("--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-target\n+hit\n");

        let policy = SafetyPolicy {
            fuzz_window: 3,
            ..SafetyPolicy::default()
        };
        let err = PatchEngine::new(&policy).apply(&diff, root.path()).unwrap_err();
        assert!(matches!(err, ApplyError::NoStrategyApplied { .. }));
        assert_eq!(fs::read_to_string(root.path().join("f.txt")).unwrap(), body);
    }

    #[test]
    fn fuzzy_context_scans_whole_file_when_enabled() {
        let root = tempdir().unwrap();
        let mut body: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        body.push_str("target\n");
        fs::write(root.path().join("f.txt"), &body).unwrap();
        let diff = parse("--- a/f.txt\n+++ b/f.txt\n@@ -1 +1 @@\n-target\n+hit\n");

        let policy = SafetyPolicy {
            fuzz_window: 3,
            fuzz_scan_file: true,
            ..SafetyPolicy::default()
        };
        PatchEngine::new(&policy).apply(&diff, root.path()).unwrap();
        assert!(fs::read_to_string(root.path().join("f.txt"))
            .unwrap()
            .ends_with("hit\n"));
    }

    #[test]
    fn failure_in_second_file_rolls_back_first() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "one\n").unwrap();
        fs::write(root.path().join("b.txt"), "two\n").unwrap();
        let diff = parse(
            "\
--- a/a.txt
+++ b/a.txt
@@ -1 +1 @@
-one
+uno
--- /dev/null
+++ b/new/c.txt
@@ -0,0 +1 @@
+tres
--- a/b.txt
+++ b/b.txt
@@ -1 +1 @@
-nothing like this
+dos
",
        );

        let err = engine().apply(&diff, root.path()).unwrap_err();
        assert!(matches!(err, ApplyError::NoStrategyApplied { .. }));
        assert_eq!(fs::read_to_string(root.path().join("a.txt")).unwrap(), "one\n");
        assert_eq!(fs::read_to_string(root.path().join("b.txt")).unwrap(), "two\n");
        assert!(!root.path().join("new").exists());
    }

    #[test]
    fn add_delete_and_rename() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("old.py"), "a = 1\nb = 2\n").unwrap();
        fs::write(root.path().join("gone.py"), "bye\n").unwrap();
        let diff = parse(
            "\
diff --git a/old.py b/new.py
rename from old.py
rename to new.py
--- a/old.py
+++ b/new.py
@@ -1,2 +1,2 @@
 a = 1
-b = 2
+b = 3
diff --git a/gone.py b/gone.py
deleted file mode 100644
--- a/gone.py
+++ /dev/null
@@ -1 +0,0 @@
-bye
diff --git a/pkg/fresh.py b/pkg/fresh.py
new file mode 100644
--- /dev/null
+++ b/pkg/fresh.py
@@ -0,0 +1,2 @@
+def fresh():
+    return 1
",
        );

        let changed = engine().apply(&diff, root.path()).unwrap();
        assert_eq!(changed.len(), 4);
        assert!(!root.path().join("old.py").exists());
        assert!(!root.path().join("gone.py").exists());
        assert_eq!(
            fs::read_to_string(root.path().join("new.py")).unwrap(),
            "a = 1\nb = 3\n"
        );
        assert_eq!(
            fs::read_to_string(root.path().join("pkg/fresh.py")).unwrap(),
            "def fresh():\n    return 1\n"
        );
    }

    #[test]
    fn rejects_paths_outside_repo() {
        let root = tempdir().unwrap();
        let diff = parse("--- a/../escape.txt\n+++ b/../escape.txt\n@@ -0,0 +1 @@\n+x\n");
        assert!(matches!(
            engine().apply(&diff, root.path()),
            Err(ApplyError::UnsafePath { .. })
        ));
    }

    #[test]
    fn preserves_crlf_and_missing_trailing_newline() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("w.txt"), "a\r\nb\r\nc").unwrap();
        let diff = parse(
            "--- a/w.txt\n+++ b/w.txt\n@@ -2,2 +2,2 @@\n b\n-c\n\\ No newline at end of file\n+d\n\\ No newline at end of file\n",
        );

        engine().apply(&diff, root.path()).unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("w.txt")).unwrap(),
            "a\r\nb\r\nd"
        );
    }

    #[test]
    fn multiple_hunks_track_offset() {
        let root = tempdir().unwrap();
        let original: String = (1..=12).map(|i| format!("l{}\n", i)).collect();
        fs::write(root.path().join("m.txt"), &original).unwrap();
        let diff = parse(
            "\
--- a/m.txt
+++ b/m.txt
@@ -2,1 +2,3 @@
-l2
+l2a
+l2b
+l2c
@@ -10,1 +12,1 @@
-l10
+L10
",
        );

        engine().apply(&diff, root.path()).unwrap();
        let result = fs::read_to_string(root.path().join("m.txt")).unwrap();
        assert_eq!(
            result,
            original
                .replace("l2\n", "l2a\nl2b\nl2c\n")
                .replace("l10\n", "L10\n")
        );
    }
}
