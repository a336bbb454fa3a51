//! Structural validation report.
//!
//! A stricter, line-aware companion to [`crate::analyzer`]: environments are
//! checked with a stack so interleavings are caught, and every finding is
//! attributed to a line where possible.

use crate::analyzer::{environment_tags, is_escaped, TagKind};
use crate::error::EditResult;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

const COMMON_TYPOS: &[(&str, &str)] = &[
    ("\\begn{", "\\begin{"),
    ("\\ened{", "\\end{"),
    ("\\docmentclass", "\\documentclass"),
    ("\\usepackge", "\\usepackage"),
];

/// Byte sequences left behind by a double decode of CJK text.
const GARBLED_MARKERS: &[&str] = &["锟斤拷", "鎮ㄧ殑", "\u{FFFD}"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Syntax,
    Structure,
    Encoding,
}

impl IssueKind {
    fn label(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Structure => "structure",
            Self::Encoding => "encoding",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// 1-based line, 0 when the finding concerns the whole file
    pub line: usize,
    pub message: String,
    pub kind: IssueKind,
}

impl Issue {
    fn new(line: usize, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Human-readable report, as returned by the agent's validation tool.
    pub fn render(&self, name: &str) -> String {
        let mut out = format!("Validation report for {name}\n");
        out.push_str(if self.is_valid() { "PASSED\n" } else { "FAILED\n" });
        for (title, issues) in [("Errors", &self.errors), ("Warnings", &self.warnings)] {
            if issues.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{title} ({}):", issues.len());
            for (i, issue) in issues.iter().enumerate() {
                if issue.line > 0 {
                    let _ = writeln!(
                        out,
                        "  {}. line {}: {} [{}]",
                        i + 1,
                        issue.line,
                        issue.message,
                        issue.kind.label()
                    );
                } else {
                    let _ = writeln!(out, "  {}. {} [{}]", i + 1, issue.message, issue.kind.label());
                }
            }
        }
        if self.is_valid() && self.warnings.is_empty() {
            out.push_str("No issues found.\n");
        }
        out
    }
}

/// Drop an unescaped `%` comment from a line.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    match (0..bytes.len()).find(|&i| bytes[i] == b'%' && !is_escaped(bytes, i)) {
        Some(i) => &line[..i],
        None => line,
    }
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

pub fn validate(text: &str) -> ValidationReport {
    let mut report = ValidationReport::default();
    check_balance(text, &mut report);
    check_environments(text, &mut report);
    check_lines(text, &mut report);
    check_document(text, &mut report);
    report
}

pub fn validate_file(path: &Path) -> EditResult<ValidationReport> {
    Ok(validate(&fs::read_to_string(path)?))
}

fn check_balance(text: &str, report: &mut ValidationReport) {
    let (mut braces, mut squares, mut parens) = ((0i64, 0i64), (0i64, 0i64), (0i64, 0i64));
    for (n, raw) in text.lines().enumerate() {
        let line = strip_comment(raw);
        let bytes = line.as_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if is_escaped(bytes, i) {
                continue;
            }
            match b {
                b'{' => braces.0 += 1,
                b'}' => {
                    braces.1 += 1;
                    if braces.1 > braces.0 {
                        report.errors.push(Issue::new(
                            n + 1,
                            IssueKind::Syntax,
                            "Unexpected closing brace '}'",
                        ));
                        braces.1 -= 1;
                    }
                }
                b'[' => squares.0 += 1,
                b']' => squares.1 += 1,
                b'(' => parens.0 += 1,
                b')' => parens.1 += 1,
                _ => {}
            }
        }
    }
    if braces.0 != braces.1 {
        report.errors.push(Issue::new(
            0,
            IssueKind::Syntax,
            format!("Unbalanced braces: {} open, {} close", braces.0, braces.1),
        ));
    }
    if squares.0 != squares.1 {
        report.warnings.push(Issue::new(
            0,
            IssueKind::Syntax,
            format!("Unbalanced square brackets: {} open, {} close", squares.0, squares.1),
        ));
    }
    if parens.0 != parens.1 {
        report.warnings.push(Issue::new(
            0,
            IssueKind::Syntax,
            format!("Unbalanced parentheses: {} open, {} close", parens.0, parens.1),
        ));
    }
}

fn check_environments(text: &str, report: &mut ValidationReport) {
    let mut stack: Vec<String> = Vec::new();
    for tag in environment_tags(text) {
        let start = text[..tag.start].rfind('\n').map_or(0, |i| i + 1);
        if strip_comment(&text[start..tag.end]).len() < tag.end - start {
            continue;
        }
        let line = line_of(text, tag.start);
        match tag.kind {
            TagKind::Begin => stack.push(tag.name),
            TagKind::End => match stack.pop() {
                None => report.errors.push(Issue::new(
                    line,
                    IssueKind::Structure,
                    format!("\\end{{{}}} without matching \\begin", tag.name),
                )),
                Some(open) if open != tag.name => report.errors.push(Issue::new(
                    line,
                    IssueKind::Structure,
                    format!("Mismatched environment: \\begin{{{open}}} closed by \\end{{{}}}", tag.name),
                )),
                Some(_) => {}
            },
        }
    }
    if !stack.is_empty() {
        report.errors.push(Issue::new(
            0,
            IssueKind::Structure,
            format!("Unclosed environments: {}", stack.join(", ")),
        ));
    }
}

fn check_lines(text: &str, report: &mut ValidationReport) {
    for (n, raw) in text.lines().enumerate() {
        let line = strip_comment(raw);
        for (typo, fix) in COMMON_TYPOS {
            if line.contains(typo) {
                report.errors.push(Issue::new(
                    n + 1,
                    IssueKind::Syntax,
                    format!("Possible typo '{typo}' (did you mean '{fix}'?)"),
                ));
            }
        }

        let bytes = line.as_bytes();
        let dollars = (0..bytes.len())
            .filter(|&i| bytes[i] == b'$' && !is_escaped(bytes, i))
            .count();
        if dollars % 2 != 0 {
            report.warnings.push(Issue::new(
                n + 1,
                IssueKind::Syntax,
                "Odd number of $ signs (possible unclosed math mode)",
            ));
        }

        if GARBLED_MARKERS.iter().any(|m| raw.contains(m)) {
            report.errors.push(Issue::new(
                n + 1,
                IssueKind::Encoding,
                "Possible encoding damage (garbled text)",
            ));
        }
    }
}

fn check_document(text: &str, report: &mut ValidationReport) {
    if !text.contains("\\begin{document}") {
        report
            .errors
            .push(Issue::new(0, IssueKind::Structure, "Missing \\begin{document}"));
    }
    let Some(end) = text.find("\\end{document}") else {
        report
            .errors
            .push(Issue::new(0, IssueKind::Structure, "Missing \\end{document}"));
        return;
    };
    let after = &text[end + "\\end{document}".len()..];
    let trailing = after
        .lines()
        .map(str::trim)
        .any(|l| !l.is_empty() && !l.starts_with('%'));
    if trailing {
        report.warnings.push(Issue::new(
            0,
            IssueKind::Structure,
            "Content found after \\end{document}",
        ));
    }
}
