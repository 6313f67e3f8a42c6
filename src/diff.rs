//! Unified diff parsing
//!
//! Turns proposer output into a structured, multi-file [`DiffModel`].
//! Understands plain `---`/`+++` diffs as well as `git diff` extended
//! headers (new/deleted file modes and renames). Prose surrounding the diff
//! (markdown fences, commentary) is skipped.

use std::fmt::{self, Write as _};
use thiserror::Error;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) => s,
            DiffLine::Add(s) => s,
            DiffLine::Remove(s) => s,
        }
    }

    fn prefix(&self) -> char {
        match self {
            DiffLine::Context(_) => ' ',
            DiffLine::Add(_) => '+',
            DiffLine::Remove(_) => '-',
        }
    }
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
    /// The last old-side line carried `\ No newline at end of file`.
    pub old_missing_newline: bool,
    /// The last new-side line carried `\ No newline at end of file`.
    pub new_missing_newline: bool,
}

impl DiffHunk {
    /// (additions, removals) in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Add(_)))
            .count();
        let removes = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Remove(_)))
            .count();
        (adds, removes)
    }

    /// Lines the hunk expects to find in the original file.
    pub fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Remove(s) => Some(s.as_str()),
            DiffLine::Add(_) => None,
        })
    }

    /// Lines the hunk leaves behind once applied.
    pub fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Context(s) | DiffLine::Add(s) => Some(s.as_str()),
            DiffLine::Remove(_) => None,
        })
    }

    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Add(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn removed_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Remove(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn context_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            DiffLine::Context(s) => Some(s.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
    Rename,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
            ChangeKind::Rename => "rename",
        }
    }
}

/// One file's worth of changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: ChangeKind,
    /// `None` for additions (`--- /dev/null`)
    pub old_path: Option<String>,
    /// `None` for deletions (`+++ /dev/null`)
    pub new_path: Option<String>,
    pub hunks: Vec<DiffHunk>,
}

impl FileChange {
    /// The path this change leaves behind (or removes, for deletions).
    pub fn target_path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    /// Every distinct path this change reads or writes.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(2);
        if let Some(old) = self.old_path.as_deref() {
            out.push(old);
        }
        if let Some(new) = self.new_path.as_deref() {
            if !out.contains(&new) {
                out.push(new);
            }
        }
        out
    }

    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }
}

/// A parsed, multi-file unified diff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffModel {
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("no file headers found in diff")]
    NoFileHeaders,
    #[error("hunk at line {line} appears before any file header")]
    HunkWithoutHeader { line: usize },
    #[error("invalid hunk header at line {line}: {header}")]
    InvalidHunkHeader { line: usize, header: String },
    #[error("hunk at line {line} in {path} does not match its header line counts")]
    HunkCountMismatch { line: usize, path: String },
    #[error("binary patches are not supported ({path})")]
    BinaryPatch { path: String },
}

impl DiffModel {
    /// Parse a unified diff string into structured data.
    ///
    /// Blank input parses to an empty model.
    pub fn parse(text: &str) -> Result<Self, DiffError> {
        Parser::new(text).run()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total (additions, removals) across all files
    pub fn stats(&self) -> (usize, usize) {
        self.files.iter().fold((0, 0), |acc, f| {
            let (a, r) = f.stats();
            (acc.0 + a, acc.1 + r)
        })
    }

    pub fn lines_changed(&self) -> usize {
        let (a, r) = self.stats();
        a + r
    }

    /// Distinct touched paths, in diff order.
    pub fn touched_paths(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for change in &self.files {
            for path in change.touched_paths() {
                if !out.contains(&path) {
                    out.push(path);
                }
            }
        }
        out
    }

    /// A copy of this diff with every path passed through `rewrite`.
    pub fn map_paths(&self, rewrite: impl Fn(&str) -> String) -> DiffModel {
        let files = self
            .files
            .iter()
            .map(|change| FileChange {
                kind: change.kind,
                old_path: change.old_path.as_deref().map(&rewrite),
                new_path: change.new_path.as_deref().map(&rewrite),
                hunks: change.hunks.clone(),
            })
            .collect();
        DiffModel { files }
    }

    /// Render back to unified diff text (git flavour).
    pub fn render(&self) -> String {
        let mut out = String::new();
        for change in &self.files {
            let old = change.old_path.as_deref().unwrap_or(change.target_path());
            let new = change.new_path.as_deref().unwrap_or(change.target_path());
            let _ = writeln!(out, "diff --git a/{} b/{}", old, new);
            match change.kind {
                ChangeKind::Add => out.push_str("new file mode 100644\n"),
                ChangeKind::Delete => out.push_str("deleted file mode 100644\n"),
                ChangeKind::Rename => {
                    let _ = writeln!(out, "rename from {}", old);
                    let _ = writeln!(out, "rename to {}", new);
                }
                ChangeKind::Modify => {}
            }
            if change.hunks.is_empty() {
                continue;
            }
            match &change.old_path {
                Some(p) => {
                    let _ = writeln!(out, "--- a/{}", p);
                }
                None => out.push_str("--- /dev/null\n"),
            }
            match &change.new_path {
                Some(p) => {
                    let _ = writeln!(out, "+++ b/{}", p);
                }
                None => out.push_str("+++ /dev/null\n"),
            }
            for hunk in &change.hunks {
                render_hunk(&mut out, hunk);
            }
        }
        out
    }
}

impl fmt::Display for DiffModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn render_hunk(out: &mut String, hunk: &DiffHunk) {
    let _ = writeln!(
        out,
        "@@ -{},{} +{},{} @@",
        hunk.old_start, hunk.old_count, hunk.new_start, hunk.new_count
    );
    let last_old = hunk
        .lines
        .iter()
        .rposition(|l| !matches!(l, DiffLine::Add(_)));
    let last_new = hunk
        .lines
        .iter()
        .rposition(|l| !matches!(l, DiffLine::Remove(_)));
    for (idx, line) in hunk.lines.iter().enumerate() {
        out.push(line.prefix());
        out.push_str(line.content());
        out.push('\n');
        let old_eof = hunk.old_missing_newline && Some(idx) == last_old;
        let new_eof = hunk.new_missing_newline && Some(idx) == last_new;
        if old_eof || new_eof {
            out.push_str("\\ No newline at end of file\n");
        }
    }
}

#[derive(Debug, Default)]
struct GitHeader {
    old_path: Option<String>,
    new_path: Option<String>,
    new_file: bool,
    deleted: bool,
    rename_from: Option<String>,
    rename_to: Option<String>,
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    idx: usize,
    files: Vec<FileChange>,
    pending: Option<GitHeader>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().collect(),
            idx: 0,
            files: Vec::new(),
            pending: None,
        }
    }

    fn run(mut self) -> Result<DiffModel, DiffError> {
        let has_content = self.lines.iter().any(|l| !l.trim().is_empty());

        while self.idx < self.lines.len() {
            let line = self.lines[self.idx];

            if let Some(rest) = line.strip_prefix("diff --git ") {
                self.flush_pending();
                self.pending = Some(parse_git_header(rest));
                self.idx += 1;
                continue;
            }

            if self.pending.is_some() && self.consume_extended_header(line)? {
                self.idx += 1;
                continue;
            }

            if self.at_file_header() {
                self.parse_file_section()?;
                continue;
            }

            if line.starts_with("@@ ") {
                return Err(DiffError::HunkWithoutHeader { line: self.idx + 1 });
            }

            self.idx += 1;
        }
        self.flush_pending();

        if self.files.is_empty() && has_content {
            return Err(DiffError::NoFileHeaders);
        }
        Ok(DiffModel { files: self.files })
    }

    fn at_file_header(&self) -> bool {
        self.lines[self.idx].starts_with("--- ")
            && self
                .lines
                .get(self.idx + 1)
                .is_some_and(|next| next.starts_with("+++ "))
    }

    /// Returns true when `line` was a recognised git extended header.
    fn consume_extended_header(&mut self, line: &str) -> Result<bool, DiffError> {
        let Some(header) = self.pending.as_mut() else {
            return Ok(false);
        };
        if line.starts_with("new file mode") {
            header.new_file = true;
        } else if line.starts_with("deleted file mode") {
            header.deleted = true;
        } else if let Some(from) = line.strip_prefix("rename from ") {
            header.rename_from = Some(unquote(from).to_string());
        } else if let Some(to) = line.strip_prefix("rename to ") {
            header.rename_to = Some(unquote(to).to_string());
        } else if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            let path = header
                .new_path
                .clone()
                .or_else(|| header.old_path.clone())
                .unwrap_or_default();
            return Err(DiffError::BinaryPatch { path });
        } else if line.starts_with("index ")
            || line.starts_with("similarity index")
            || line.starts_with("dissimilarity index")
            || line.starts_with("old mode")
            || line.starts_with("new mode")
        {
            // Informational only.
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn parse_file_section(&mut self) -> Result<(), DiffError> {
        let old_path = parse_header_path(&self.lines[self.idx][4..], "a/");
        let new_path = parse_header_path(&self.lines[self.idx + 1][4..], "b/");
        self.idx += 2;

        let display_path = new_path
            .clone()
            .or_else(|| old_path.clone())
            .unwrap_or_default();

        let mut hunks = Vec::new();
        while self.idx < self.lines.len() && self.lines[self.idx].starts_with("@@") {
            hunks.push(self.parse_hunk(&display_path)?);
        }

        // Leftover body lines mean the header counts undercounted the hunk.
        if let Some(next) = self.lines.get(self.idx) {
            let looks_like_body = next.starts_with('+') || next.starts_with('-');
            if looks_like_body && !self.at_file_header() {
                return Err(DiffError::HunkCountMismatch {
                    line: self.idx + 1,
                    path: display_path,
                });
            }
        }

        let header = self.pending.take().unwrap_or_default();
        self.files.push(build_change(old_path, new_path, header, hunks));
        Ok(())
    }

    fn parse_hunk(&mut self, path: &str) -> Result<DiffHunk, DiffError> {
        let header_line = self.idx + 1;
        let header = self.lines[self.idx];
        let (old_start, old_count, new_start, new_count) =
            parse_hunk_header(header).ok_or_else(|| DiffError::InvalidHunkHeader {
                line: header_line,
                header: header.to_string(),
            })?;
        self.idx += 1;

        let mismatch = || DiffError::HunkCountMismatch {
            line: header_line,
            path: path.to_string(),
        };

        let mut hunk = DiffHunk {
            old_start,
            old_count,
            new_start,
            new_count,
            lines: Vec::new(),
            old_missing_newline: false,
            new_missing_newline: false,
        };
        let mut old_seen = 0usize;
        let mut new_seen = 0usize;

        loop {
            let satisfied = old_seen == old_count && new_seen == new_count;
            let Some(line) = self.lines.get(self.idx).copied() else {
                if satisfied {
                    break;
                }
                return Err(mismatch());
            };

            if line.starts_with('\\') {
                match hunk.lines.last() {
                    Some(DiffLine::Remove(_)) => hunk.old_missing_newline = true,
                    Some(DiffLine::Add(_)) => hunk.new_missing_newline = true,
                    Some(DiffLine::Context(_)) => {
                        hunk.old_missing_newline = true;
                        hunk.new_missing_newline = true;
                    }
                    None => return Err(mismatch()),
                }
                self.idx += 1;
                continue;
            }

            if satisfied {
                break;
            }

            let parsed = if let Some(rest) = line.strip_prefix('+') {
                new_seen += 1;
                DiffLine::Add(rest.to_string())
            } else if let Some(rest) = line.strip_prefix('-') {
                old_seen += 1;
                DiffLine::Remove(rest.to_string())
            } else if let Some(rest) = line.strip_prefix(' ') {
                old_seen += 1;
                new_seen += 1;
                DiffLine::Context(rest.to_string())
            } else if line.is_empty() {
                // Editors and LLMs strip the single space off blank context lines.
                old_seen += 1;
                new_seen += 1;
                DiffLine::Context(String::new())
            } else {
                return Err(mismatch());
            };

            if old_seen > old_count || new_seen > new_count {
                return Err(mismatch());
            }
            hunk.lines.push(parsed);
            self.idx += 1;
        }

        Ok(hunk)
    }

    /// A `diff --git` block with no `---`/`+++` pair (pure rename, empty
    /// file creation or deletion) still describes a change.
    fn flush_pending(&mut self) {
        let Some(header) = self.pending.take() else {
            return;
        };
        if header.rename_from.is_some() || header.new_file || header.deleted {
            let old = header.rename_from.clone().or_else(|| header.old_path.clone());
            let new = header.rename_to.clone().or_else(|| header.new_path.clone());
            let old = if header.new_file { None } else { old };
            let new = if header.deleted { None } else { new };
            self.files.push(build_change(old, new, header, Vec::new()));
        }
    }
}

fn build_change(
    old_path: Option<String>,
    new_path: Option<String>,
    header: GitHeader,
    hunks: Vec<DiffHunk>,
) -> FileChange {
    let kind = match (&old_path, &new_path) {
        (None, Some(_)) => ChangeKind::Add,
        (Some(_), None) => ChangeKind::Delete,
        (Some(old), Some(new)) if old != new => ChangeKind::Rename,
        _ if header.rename_from.is_some() => ChangeKind::Rename,
        _ if header.new_file => ChangeKind::Add,
        _ if header.deleted => ChangeKind::Delete,
        _ => ChangeKind::Modify,
    };
    let (old_path, new_path) = match kind {
        ChangeKind::Add => (None, new_path.or(old_path)),
        ChangeKind::Delete => (old_path.or(new_path), None),
        _ => (old_path, new_path),
    };
    FileChange {
        kind,
        old_path,
        new_path,
        hunks,
    }
}

fn parse_git_header(rest: &str) -> GitHeader {
    let (old_path, new_path) = match rest.rfind(" b/") {
        Some(pos) => (
            Some(strip_side_prefix(unquote(&rest[..pos]), "a/").to_string()),
            Some(rest[pos + 3..].to_string()),
        ),
        None => (None, None),
    };
    GitHeader {
        old_path,
        new_path,
        ..GitHeader::default()
    }
}

/// Parse the path out of a `---`/`+++` header, stripping the `a/`/`b/`
/// prefix and any trailing timestamp. `/dev/null` maps to `None`.
fn parse_header_path(raw: &str, prefix: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    let raw = unquote(raw);
    if raw == "/dev/null" {
        return None;
    }
    Some(strip_side_prefix(raw, prefix).to_string())
}

fn strip_side_prefix<'s>(path: &'s str, prefix: &str) -> &'s str {
    path.strip_prefix(prefix).unwrap_or(path)
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

/// Parse `@@ -old_start,old_count +new_start,new_count @@ ...`
fn parse_hunk_header(header: &str) -> Option<(usize, usize, usize, usize)> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" {
        return None;
    }
    let (old_start, old_count) = parse_range(parts[1].strip_prefix('-')?)?;
    let (new_start, new_count) = parse_range(parts[2].strip_prefix('+')?)?;
    Some((old_start, old_count, new_start, new_count))
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Option<(usize, usize)> {
    match s.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_diff() {
        let diff = r#"--- a/src/example.ts
+++ b/src/example.ts
@@ -1,4 +1,5 @@
 function hello() {
-  console.log("old");
+  console.log("new");
+  console.log("extra");
   return true;
 }
"#;
        let parsed = DiffModel::parse(diff).unwrap();
        assert_eq!(parsed.files.len(), 1);
        let change = &parsed.files[0];
        assert_eq!(change.kind, ChangeKind::Modify);
        assert_eq!(change.old_path.as_deref(), Some("src/example.ts"));
        assert_eq!(change.hunks.len(), 1);
        assert_eq!(parsed.stats(), (2, 1));
    }

    #[test]
    fn parses_multi_file_git_diff_with_add_delete_and_rename() {
        let diff = "\
Here is the fix:
```diff
diff --git a/old_name.py b/new_name.py
similarity index 90%
rename from old_name.py
rename to new_name.py
--- a/old_name.py
+++ b/new_name.py
@@ -1,2 +1,2 @@
 import os
-x = 1
+x = 2
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
diff --git a/fresh.txt b/fresh.txt
new file mode 100644
--- /dev/null
+++ b/fresh.txt
@@ -0,0 +1,2 @@
+hello
+world
```
";
        let parsed = DiffModel::parse(diff).unwrap();
        let kinds: Vec<ChangeKind> = parsed.files.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::Rename, ChangeKind::Delete, ChangeKind::Add]
        );
        assert_eq!(parsed.files[1].new_path, None);
        assert_eq!(parsed.files[2].old_path, None);
        assert_eq!(
            parsed.touched_paths(),
            vec!["old_name.py", "new_name.py", "gone.txt", "fresh.txt"]
        );
    }

    #[test]
    fn pure_rename_without_hunks_is_kept() {
        let diff = "\
diff --git a/a.txt b/b.txt
similarity index 100%
rename from a.txt
rename to b.txt
";
        let parsed = DiffModel::parse(diff).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].kind, ChangeKind::Rename);
        assert!(parsed.files[0].hunks.is_empty());
    }

    #[test]
    fn rejects_hunk_with_wrong_counts() {
        let diff = "\
--- a/x.py
+++ b/x.py
@@ -1,3 +1,3 @@
 a
-b
+c
";
        let err = DiffModel::parse(diff).unwrap_err();
        assert!(matches!(err, DiffError::HunkCountMismatch { .. }));
    }

    #[test]
    fn rejects_hunk_with_extra_lines() {
        let diff = "\
--- a/x.py
+++ b/x.py
@@ -1,1 +1,1 @@
-b
+c
+d
";
        assert!(matches!(
            DiffModel::parse(diff),
            Err(DiffError::HunkCountMismatch { .. })
        ));
    }

    #[test]
    fn tracks_missing_newline_markers() {
        let diff = "\
--- a/x.txt
+++ b/x.txt
@@ -1 +1 @@
-old
\\ No newline at end of file
+new
";
        let parsed = DiffModel::parse(diff).unwrap();
        let hunk = &parsed.files[0].hunks[0];
        assert!(hunk.old_missing_newline);
        assert!(!hunk.new_missing_newline);
    }

    #[test]
    fn blank_input_is_empty_model() {
        assert!(DiffModel::parse("  \n").unwrap().is_empty());
        assert_eq!(
            DiffModel::parse("I could not find a fix."),
            Err(DiffError::NoFileHeaders)
        );
    }

    #[test]
    fn render_reparses_to_same_model() {
        let diff = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";
        let parsed = DiffModel::parse(diff).unwrap();
        let again = DiffModel::parse(&parsed.render()).unwrap();
        assert_eq!(parsed, again);
    }

    #[test]
    fn map_paths_rewrites_both_sides() {
        let diff = "\
--- a/demo/src/a.rs
+++ b/demo/src/a.rs
@@ -1 +1 @@
-a
+b
";
        let parsed = DiffModel::parse(diff).unwrap();
        let stripped = parsed.map_paths(|p| p.trim_start_matches("demo/").to_string());
        assert_eq!(stripped.files[0].old_path.as_deref(), Some("src/a.rs"));
        assert_eq!(stripped.files[0].new_path.as_deref(), Some("src/a.rs"));
    }
}
