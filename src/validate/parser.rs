//! Tree-sitter syntax checks for changed source files

use std::cell::RefCell;
use std::path::Path;
use tracing::warn;
use tree_sitter::{Node, Parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    JavaScript,
    TypeScript,
    Python,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rs" => Language::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Language::from_extension)
            .unwrap_or(Language::Unknown)
    }
}

// Parsers are costly to build and reusable across files of one language, so
// each thread keeps one per grammar.
thread_local! {
    static RUST_PARSER: RefCell<Parser> =
        pooled_parser(tree_sitter_rust::LANGUAGE.into(), "Rust");
    static JS_PARSER: RefCell<Parser> =
        pooled_parser(tree_sitter_javascript::LANGUAGE.into(), "JavaScript");
    static TS_PARSER: RefCell<Parser> =
        pooled_parser(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(), "TypeScript");
    static TSX_PARSER: RefCell<Parser> =
        pooled_parser(tree_sitter_typescript::LANGUAGE_TSX.into(), "TSX");
    static PYTHON_PARSER: RefCell<Parser> =
        pooled_parser(tree_sitter_python::LANGUAGE.into(), "Python");
    static GO_PARSER: RefCell<Parser> =
        pooled_parser(tree_sitter_go::LANGUAGE.into(), "Go");
}

/// A grammar/ABI mismatch leaves the parser without a language; every parse
/// then fails, so say so once when the parser is built.
fn pooled_parser(grammar: tree_sitter::Language, name: &str) -> RefCell<Parser> {
    let mut parser = Parser::new();
    if let Err(err) = parser.set_language(&grammar) {
        warn!(
            "{} grammar could not be loaded; syntax checks for {} files are off: {}",
            name, name, err
        );
    }
    RefCell::new(parser)
}

fn parse_with_pooled_parser(
    content: &str,
    language: Language,
    path: &Path,
) -> anyhow::Result<tree_sitter::Tree> {
    let parse_result = match language {
        Language::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::TypeScript => {
            let use_tsx = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("tsx"))
                .unwrap_or(false);
            if use_tsx {
                TSX_PARSER.with(|p| p.borrow_mut().parse(content, None))
            } else {
                TS_PARSER.with(|p| p.borrow_mut().parse(content, None))
            }
        }
        Language::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Go => GO_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Unknown => return Err(anyhow::anyhow!("Unknown language")),
    };

    parse_result.ok_or_else(|| anyhow::anyhow!("Failed to parse {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    /// 1-based
    pub line: usize,
    pub column: usize,
    pub detail: String,
}

/// First syntax error in `content`, if any. Unknown languages never fail.
pub fn first_syntax_error(
    path: &Path,
    content: &str,
    language: Language,
) -> anyhow::Result<Option<SyntaxIssue>> {
    if language == Language::Unknown {
        return Ok(None);
    }
    let tree = parse_with_pooled_parser(content, language, path)?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(None);
    }
    let node = first_error_node(root).unwrap_or(root);
    let position = node.start_position();
    let detail = if node.is_missing() {
        format!("missing `{}`", node.kind())
    } else {
        "unexpected syntax".to_string()
    };
    Ok(Some(SyntaxIssue {
        line: position.row + 1,
        column: position.column + 1,
        detail,
    }))
}

fn first_error_node(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error_node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_pooled_parser_has_a_grammar() {
        let pools: [&'static std::thread::LocalKey<RefCell<Parser>>; 6] = [
            &RUST_PARSER,
            &JS_PARSER,
            &TS_PARSER,
            &TSX_PARSER,
            &PYTHON_PARSER,
            &GO_PARSER,
        ];
        for pool in pools {
            assert!(pool.with(|p| p.borrow().language().is_some()));
        }
    }

    #[test]
    fn test_valid_sources_have_no_errors() {
        let cases = [
            ("ok.rs", "pub fn hello() -> i32 { 1 }\n"),
            ("ok.py", "def add(a, b):\n    return a + b\n"),
            ("ok.js", "function hello() { return 1; }\n"),
            ("ok.go", "package main\n\nfunc main() {}\n"),
        ];
        for (name, content) in cases {
            let path = Path::new(name);
            let issue = first_syntax_error(path, content, Language::from_path(path)).unwrap();
            assert!(issue.is_none(), "{name}: {issue:?}");
        }
    }

    #[test]
    fn test_tsx_parsing_uses_tsx_grammar() {
        let content = r#"
            import React from "react";

            export function Widget() {
                return <div className="x">Hello</div>;
            }
        "#;
        let path = Path::new("widget.tsx");
        assert!(first_syntax_error(path, content, Language::TypeScript)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reports_line_of_first_error() {
        let content = "def ok():\n    return 1\n\ndef broken(:\n    pass\n";
        let path = Path::new("bad.py");
        let issue = first_syntax_error(path, content, Language::Python)
            .unwrap()
            .unwrap();
        assert_eq!(issue.line, 4);
    }

    #[test]
    fn test_unknown_language_is_skipped() {
        let path = Path::new("notes.txt");
        assert_eq!(Language::from_path(path), Language::Unknown);
        assert!(first_syntax_error(path, "((((", Language::Unknown)
            .unwrap()
            .is_none());
    }
}
