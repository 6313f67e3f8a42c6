//! Post-apply validation
//!
//! Re-reads every changed file after a patch lands and reports problems the
//! diff text alone cannot reveal: broken syntax, malformed JSON/TOML, mixed
//! indentation and relative imports that point nowhere. The validator only
//! reports; undoing the change is the caller's decision.

pub mod parser;

use crate::violation::{Severity, Violation, ViolationKind};
use parser::{first_syntax_error, Language};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

static PY_RELATIVE_IMPORT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*from\s+(\.+)([\w.]*)\s+import\s+(.+)$").ok());
static JS_RELATIVE_IMPORT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\bfrom\s+|^\s*import\s+|\brequire\(\s*|\bimport\(\s*)['"](\.{1,2}/[^'"]*)['"]"#,
    )
    .ok()
});

const JS_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json", "d.ts"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorPolicy {
    pub check_syntax: bool,
    pub check_data_files: bool,
    pub check_indentation: bool,
    pub check_imports: bool,
    /// Promote mixed-indentation warnings to blocking.
    pub style_hazards_block: bool,
    pub unresolved_imports_block: bool,
}

impl Default for ValidatorPolicy {
    fn default() -> Self {
        Self {
            check_syntax: true,
            check_data_files: true,
            check_indentation: true,
            check_imports: true,
            style_hazards_block: false,
            unresolved_imports_block: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn blocking(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.is_blocking())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostApplyValidator {
    policy: ValidatorPolicy,
}

impl PostApplyValidator {
    pub fn new(policy: ValidatorPolicy) -> Self {
        Self { policy }
    }

    /// Check `paths` (absolute, or relative to `repo_root`). Paths that no
    /// longer exist were deleted by the patch and are skipped.
    pub fn check(&self, repo_root: &Path, paths: &[PathBuf]) -> ValidationReport {
        let mut violations = Vec::new();
        for path in paths {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                repo_root.join(path)
            };
            if !absolute.is_file() {
                continue;
            }
            let shown = display_path(repo_root, &absolute);
            let content = match std::fs::read(&absolute) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!("Skipping non-text file {}", shown.display());
                        continue;
                    }
                },
                Err(err) => {
                    violations.push(
                        Violation::new(
                            ViolationKind::MalformedData,
                            format!("Could not read {}: {}", shown.display(), err),
                        )
                        .at(&shown),
                    );
                    continue;
                }
            };
            self.check_file(&absolute, &shown, &content, &mut violations);
        }

        for violation in &mut violations {
            let promote = match violation.kind {
                ViolationKind::StyleHazard => self.policy.style_hazards_block,
                ViolationKind::UnresolvedImport => self.policy.unresolved_imports_block,
                _ => false,
            };
            if promote {
                violation.severity = Severity::Blocking;
            }
        }

        ValidationReport {
            ok: !violations.iter().any(|v| v.is_blocking()),
            violations,
        }
    }

    fn check_file(
        &self,
        absolute: &Path,
        shown: &Path,
        content: &str,
        violations: &mut Vec<Violation>,
    ) {
        let language = Language::from_path(absolute);
        let ext = absolute
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if self.policy.check_syntax && language != Language::Unknown {
            match first_syntax_error(absolute, content, language) {
                Ok(Some(issue)) => violations.push(
                    Violation::new(
                        ViolationKind::SyntaxError,
                        format!(
                            "{}:{}:{}: {}",
                            shown.display(),
                            issue.line,
                            issue.column,
                            issue.detail
                        ),
                    )
                    .at(shown),
                ),
                Ok(None) => {}
                Err(err) => debug!("Syntax check skipped for {}: {}", shown.display(), err),
            }
        }

        if self.policy.check_data_files {
            if let Some(message) = data_file_error(&ext, content) {
                violations.push(
                    Violation::new(
                        ViolationKind::MalformedData,
                        format!("{}: {}", shown.display(), message),
                    )
                    .at(shown),
                );
            }
        }

        if self.policy.check_indentation && indentation_matters(absolute, language) {
            if let Some((tab_line, space_line)) = mixed_indentation(content) {
                violations.push(
                    Violation::new(
                        ViolationKind::StyleHazard,
                        format!(
                            "{} mixes tab (line {}) and space (line {}) indentation",
                            shown.display(),
                            tab_line,
                            space_line
                        ),
                    )
                    .at(shown),
                );
            }
        }

        if self.policy.check_imports {
            let unresolved = match language {
                Language::Python => unresolved_python_imports(absolute, content),
                Language::JavaScript | Language::TypeScript => {
                    unresolved_js_imports(absolute, content)
                }
                _ => Vec::new(),
            };
            for (line, target) in unresolved {
                violations.push(
                    Violation::new(
                        ViolationKind::UnresolvedImport,
                        format!(
                            "{}:{}: relative import `{}` does not resolve to a file",
                            shown.display(),
                            line,
                            target
                        ),
                    )
                    .at(shown),
                );
            }
        }
    }
}

fn display_path(repo_root: &Path, absolute: &Path) -> PathBuf {
    if let Ok(rel) = absolute.strip_prefix(repo_root) {
        return rel.to_path_buf();
    }
    repo_root
        .canonicalize()
        .ok()
        .and_then(|root| absolute.strip_prefix(root).ok().map(Path::to_path_buf))
        .unwrap_or_else(|| absolute.to_path_buf())
}

fn data_file_error(ext: &str, content: &str) -> Option<String> {
    match ext {
        "json" => serde_json::from_str::<serde_json::Value>(content)
            .err()
            .map(|e| format!("invalid JSON at line {}: {}", e.line(), e)),
        "toml" => toml::from_str::<toml::Table>(content)
            .err()
            .map(|e| format!("invalid TOML: {}", e.message())),
        _ => None,
    }
}

/// Go and Makefiles mandate tabs; everything else is checked.
fn indentation_matters(path: &Path, language: Language) -> bool {
    if language == Language::Go {
        return false;
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    !(name == "Makefile" || name == "makefile" || name == "GNUmakefile" || name.ends_with(".mk"))
}

/// First (tab-indented line, space-indented line) pair, 1-based.
fn mixed_indentation(content: &str) -> Option<(usize, usize)> {
    let mut tab_line = None;
    let mut space_line = None;
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('\t') {
            tab_line.get_or_insert(idx + 1);
        } else if line.starts_with("  ") {
            // Single spaces are usually comment continuations (` * ...`).
            space_line.get_or_insert(idx + 1);
        }
        if let (Some(t), Some(s)) = (tab_line, space_line) {
            return Some((t, s));
        }
    }
    None
}

fn unresolved_python_imports(path: &Path, content: &str) -> Vec<(usize, String)> {
    let Some(re) = PY_RELATIVE_IMPORT.as_ref() else {
        return Vec::new();
    };
    let Some(dir) = path.parent() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let dots = caps.get(1).map(|m| m.as_str().len()).unwrap_or(1);
        let module = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let mut base = dir.to_path_buf();
        for _ in 1..dots {
            base.pop();
        }

        let resolves = if module.is_empty() {
            // `from . import name`: a sibling module or a package attribute.
            let names = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
            base.join("__init__.py").exists()
                || names
                    .trim_matches(|c| c == '(' || c == ')')
                    .split(',')
                    .filter_map(|n| n.split_whitespace().next())
                    .all(|name| python_module_exists(&base, name))
        } else {
            let module_path = module.replace('.', "/");
            python_module_exists(&base, &module_path)
        };
        if !resolves {
            out.push((idx + 1, format!("{}{}", ".".repeat(dots), module)));
        }
    }
    out
}

fn python_module_exists(base: &Path, module_path: &str) -> bool {
    let candidate = base.join(module_path);
    candidate.with_extension("py").exists()
        || candidate.with_extension("pyi").exists()
        || candidate.is_dir()
}

fn unresolved_js_imports(path: &Path, content: &str) -> Vec<(usize, String)> {
    let Some(re) = JS_RELATIVE_IMPORT.as_ref() else {
        return Vec::new();
    };
    let Some(dir) = path.parent() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        for caps in re.captures_iter(line) {
            let Some(specifier) = caps.get(1).map(|m| m.as_str()) else {
                continue;
            };
            if !js_module_exists(dir, specifier) {
                out.push((idx + 1, specifier.to_string()));
            }
        }
    }
    out
}

fn js_module_exists(dir: &Path, specifier: &str) -> bool {
    let target = dir.join(specifier);
    if target.is_file() {
        return true;
    }
    let raw = target.to_string_lossy().to_string();
    let with_ext = |base: &str| {
        JS_EXTENSIONS
            .iter()
            .any(|ext| Path::new(&format!("{}.{}", base, ext)).is_file())
    };
    if with_ext(&raw) {
        return true;
    }
    if target.is_dir() && with_ext(&target.join("index").to_string_lossy()) {
        return true;
    }
    // TypeScript sources import their compiled `.js` names.
    for js_ext in [".js", ".jsx", ".mjs", ".cjs"] {
        if let Some(stem) = raw.strip_suffix(js_ext) {
            if with_ext(stem) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn check(root: &Path, files: &[&str]) -> ValidationReport {
        let paths: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
        PostApplyValidator::default().check(root, &paths)
    }

    #[test]
    fn syntax_error_blocks_with_line_number() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("broken.rs"), "fn ok() {}\nfn broken( {\n").unwrap();
        let report = check(root.path(), &["broken.rs"]);
        assert!(!report.ok);
        let violation = &report.violations[0];
        assert_eq!(violation.kind, ViolationKind::SyntaxError);
        assert!(violation.message.starts_with("broken.rs:"));
    }

    #[test]
    fn valid_python_passes() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join("calculator.py"),
            "def add(a, b):\n    return a + b\n",
        )
        .unwrap();
        assert!(check(root.path(), &["calculator.py"]).ok);
    }

    #[test]
    fn malformed_json_and_toml_block() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("a.json"), "{\"a\": 1,}").unwrap();
        fs::write(root.path().join("b.toml"), "name = \n").unwrap();
        let report = check(root.path(), &["a.json", "b.toml"]);
        assert!(!report.ok);
        assert_eq!(
            report
                .violations
                .iter()
                .filter(|v| v.kind == ViolationKind::MalformedData)
                .count(),
            2
        );
    }

    #[test]
    fn mixed_indentation_warns_unless_promoted() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join("mix.js"),
            "function a() {\n\treturn 1;\n}\nfunction b() {\n    return 2;\n}\n",
        )
        .unwrap();
        let report = check(root.path(), &["mix.js"]);
        assert!(report.ok);
        assert_eq!(report.violations[0].kind, ViolationKind::StyleHazard);

        let strict = PostApplyValidator::new(ValidatorPolicy {
            style_hazards_block: true,
            ..ValidatorPolicy::default()
        });
        assert!(!strict.check(root.path(), &[PathBuf::from("mix.js")]).ok);
    }

    #[test]
    fn go_tabs_are_not_a_hazard() {
        let root = tempdir().unwrap();
        fs::write(
            root.path().join("main.go"),
            "package main\n\nfunc main() {\n\tx := 1\n\t_ = x\n}\n\n/*\n  note\n*/\n",
        )
        .unwrap();
        assert!(check(root.path(), &["main.go"]).violations.is_empty());
    }

    #[test]
    fn unresolved_relative_imports_are_reported() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("pkg")).unwrap();
        fs::write(root.path().join("pkg/helpers.py"), "X = 1\n").unwrap();
        fs::write(
            root.path().join("pkg/main.py"),
            "from .helpers import X\nfrom .missing import Y\n",
        )
        .unwrap();
        fs::write(root.path().join("util.ts"), "export const u = 1;\n").unwrap();
        fs::write(
            root.path().join("app.ts"),
            "import { u } from './util.js';\nimport { v } from './nope';\n",
        )
        .unwrap();

        let report = check(root.path(), &["pkg/main.py", "app.ts"]);
        assert!(report.ok);
        let targets: Vec<&str> = report
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::UnresolvedImport)
            .map(|v| v.message.as_str())
            .collect();
        assert_eq!(targets.len(), 2, "{targets:?}");
        assert!(targets[0].contains(".missing"));
        assert!(targets[1].contains("./nope"));
    }

    #[test]
    fn deleted_paths_are_skipped() {
        let root = tempdir().unwrap();
        let report = check(root.path(), &["gone.py"]);
        assert!(report.ok);
        assert!(report.violations.is_empty());
    }
}
