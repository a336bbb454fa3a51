//! Diagnostic log parsing and complexity classification
//!
//! Turns the combined log of a compilation into ordered [`DiagnosticError`]
//! records (the first is treated as the root cause) and a [`ComplexityTier`]
//! that decides which repair tier handles the failure.

use crate::text;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^!\s*(.+)$").unwrap());

static LINE_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^l\.(\d+)\s*(.*)$").unwrap());

static FILE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\.?/?([^()]+\.tex)").unwrap());

/// Fatal aborts: the engine gave up on the document as a whole.
static HIGH_COMPLEXITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)emergency stop|no legal \\end found|ended by \\end\{document\}|fatal error|tex capacity exceeded|missing \\begin\{document\}",
    )
    .unwrap()
});

/// Structural or ambiguous failures where a local patch is likely to mislead.
static MEDIUM_COMPLEXITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)mismatched|extra \}|missing \}|ended by \\end\{|lonely \\item|package (?:xcolor|hyperref) error|environment \S+ undefined|undefined control sequence",
    )
    .unwrap()
});

/// Lines of log kept before an error line in its context snippet.
const CONTEXT_BEFORE: usize = 2;
/// Lines kept from the error line onward.
const CONTEXT_AFTER: usize = 5;

/// One error reported by the typesetting engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticError {
    /// Source file active when the error was reported (empty if unknown)
    pub file: String,
    /// 1-based source line from the `l.N` marker, 0 if none followed
    pub line: usize,
    /// Error message without the leading `!`
    pub message: String,
    /// Surrounding log lines
    pub context: String,
}

impl fmt::Display for DiagnosticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = if self.file.is_empty() { "?" } else { &self.file };
        if self.line > 0 {
            write!(f, "{}:{}: {}", file, self.line, self.message)
        } else {
            write!(f, "{}: {}", file, self.message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Low,
    Medium,
    High,
}

impl ComplexityTier {
    /// Medium and high failures go straight to the agent tier.
    pub fn needs_agent(self) -> bool {
        matches!(self, Self::Medium | Self::High)
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Parse a compilation log into its error records, in log order.
///
/// An error's line is taken from the first `l.N` marker after its `!` line.
/// TeX prints that marker at the point where the error was raised; later
/// markers before the next `!` come from recovery output and are ignored.
pub fn parse_errors(log: &str) -> Vec<DiagnosticError> {
    let lines: Vec<&str> = log.lines().collect();
    let mut errors = Vec::new();
    let mut current: Option<DiagnosticError> = None;
    let mut current_file = String::new();

    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = FILE_REFERENCE.captures(line) {
            current_file = caps[1].to_string();
        }

        if let Some(caps) = ERROR_LINE.captures(line) {
            if let Some(done) = current.take() {
                errors.push(done);
            }
            let start = i.saturating_sub(CONTEXT_BEFORE);
            let end = (i + CONTEXT_AFTER).min(lines.len());
            current = Some(DiagnosticError {
                file: current_file.clone(),
                line: 0,
                message: caps[1].trim_end().to_string(),
                context: lines[start..end].join("\n"),
            });
            continue;
        }

        if let Some(err) = current.as_mut().filter(|e| e.line == 0) {
            if let Some(n) = LINE_MARKER
                .captures(line)
                .and_then(|caps| caps[1].parse::<usize>().ok())
            {
                err.line = n;
            }
        }
    }

    if let Some(done) = current {
        errors.push(done);
    }
    errors
}

/// Tier for an already-parsed log. The first matching rule wins.
pub fn complexity(errors: &[DiagnosticError], log: &str) -> ComplexityTier {
    if errors.is_empty() {
        return ComplexityTier::Low;
    }
    if HIGH_COMPLEXITY.is_match(log) {
        return ComplexityTier::High;
    }
    if MEDIUM_COMPLEXITY.is_match(log) {
        return ComplexityTier::Medium;
    }
    match errors.len() {
        n if n > 5 => ComplexityTier::High,
        n if n > 2 => ComplexityTier::Medium,
        _ => ComplexityTier::Low,
    }
}

/// Parse `log` and assign its tier.
pub fn classify(log: &str) -> (Vec<DiagnosticError>, ComplexityTier) {
    let errors = parse_errors(log);
    let tier = complexity(&errors, log);
    (errors, tier)
}

/// Excerpt of `log` no longer than roughly `max_len` bytes that keeps error
/// sections and the lines around `.tex` file references. Falls back to the
/// log's tail when nothing relevant is found.
pub fn extract_relevant_log_portion(log: &str, max_len: usize) -> String {
    if log.len() <= max_len {
        return log.to_string();
    }

    let lines: Vec<&str> = log.lines().collect();
    let mut relevant: Vec<&str> = Vec::new();
    let mut in_error = false;

    for (i, line) in lines.iter().enumerate() {
        let is_error = line.starts_with('!') || line.contains("Error");
        if is_error {
            in_error = true;
        }
        if in_error {
            relevant.push(line);
            if relevant.len() > 50 && !is_error {
                in_error = false;
            }
        }
        if line.contains(".tex") && relevant.len() < 100 {
            let start = i.saturating_sub(2);
            let end = (i + 3).min(lines.len());
            relevant.extend_from_slice(&lines[start..end]);
        }
    }

    let joined = relevant.join("\n");
    if joined.is_empty() {
        return text::tail(log, max_len).to_string();
    }
    if joined.len() > max_len {
        return format!("{}\n...[truncated]", text::head(&joined, max_len));
    }
    joined
}
