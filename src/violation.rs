//! Violations reported by the safety guard and the post-apply validator.
//!
//! These are plain values. Callers decide what a violation means for the
//! run; nothing here is raised as an error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TooManyLines,
    TooManyFiles,
    DeniedPath,
    DangerousContent,
    DuplicateDefinition,
    SyntaxError,
    MalformedData,
    StyleHazard,
    UnresolvedImport,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::TooManyLines => "too_many_lines",
            ViolationKind::TooManyFiles => "too_many_files",
            ViolationKind::DeniedPath => "denied_path",
            ViolationKind::DangerousContent => "dangerous_content",
            ViolationKind::DuplicateDefinition => "duplicate_definition",
            ViolationKind::SyntaxError => "syntax_error",
            ViolationKind::MalformedData => "malformed_data",
            ViolationKind::StyleHazard => "style_hazard",
            ViolationKind::UnresolvedImport => "unresolved_import",
        }
    }

    /// Default severity. The validator policy may promote warnings.
    pub fn default_severity(&self) -> Severity {
        match self {
            ViolationKind::StyleHazard | ViolationKind::UnresolvedImport => Severity::Warning,
            _ => Severity::Blocking,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocking,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Violation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            path: None,
        }
    }

    pub fn at(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

/// Join violation messages into one feedback line for the next plan.
pub fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
