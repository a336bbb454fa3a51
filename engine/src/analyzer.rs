//! Structural analysis of LaTeX source text
//!
//! Reports brace balance, `\begin`/`\end` counts per environment, and the
//! scaling-wrapper state of table floats. Everything here is a pure function
//! over `&str` and runs in a single pass over the input.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static ENV_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(begin|end)\{([^}]+)\}").unwrap());

static SCALING_WRAPPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(resizebox|scalebox|adjustbox)\b").unwrap());

static TABULAR_SPEC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\begin\{tabular\*?\}(?:\{[^}]*\})?\{((?:[^{}]|\{[^{}]*\})*)\}").unwrap());

/// Environments whose blocks are inspected for scaling wrappers.
pub const TABLE_ENVIRONMENTS: &[&str] = &["table", "table*"];

/// Begin/end tallies for one environment name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvCounts {
    pub begins: usize,
    pub ends: usize,
}

impl EnvCounts {
    /// Closed means the counts agree; nesting order is not checked.
    pub fn is_closed(&self) -> bool {
        self.begins == self.ends
    }

    pub fn missing_ends(&self) -> usize {
        self.begins.saturating_sub(self.ends)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Begin,
    End,
}

/// One `\begin{name}` or `\end{name}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTag {
    pub kind: TagKind,
    pub name: String,
    /// Byte offset of the backslash.
    pub start: usize,
    /// Byte offset just past the closing brace of the name.
    pub end: usize,
}

/// A scaling command (`\resizebox`, `\scalebox`, `\adjustbox`) found inside a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingWrapper {
    pub command: String,
    pub offset: usize,
    /// Braces opened from the wrapper onwards that are still open at the table close.
    pub missing_closers: usize,
}

/// Scaffolding state of one `table` / `table*` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableScaffold {
    pub env: String,
    /// Offset of `\begin{table}`.
    pub begin: usize,
    /// Offset of the matching `\end{table}`, if there is one.
    pub end: Option<usize>,
    pub wrapper: Option<ScalingWrapper>,
}

impl TableScaffold {
    pub fn has_unclosed_wrapper(&self) -> bool {
        self.wrapper
            .as_ref()
            .is_some_and(|w| w.missing_closers > 0)
    }
}

/// Full structural report for a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureReport {
    /// Unescaped `{` minus unescaped `}`. Positive means closers are missing.
    pub brace_balance: i64,
    pub open_braces: usize,
    pub close_braces: usize,
    pub environments: BTreeMap<String, EnvCounts>,
    pub tables: Vec<TableScaffold>,
}

impl StructureReport {
    pub fn is_balanced(&self) -> bool {
        self.brace_balance == 0 && self.environments.values().all(EnvCounts::is_closed)
    }

    /// Environment names with more begins than ends.
    pub fn unclosed(&self) -> Vec<(&str, usize)> {
        self.environments
            .iter()
            .filter(|(_, c)| c.missing_ends() > 0)
            .map(|(name, c)| (name.as_str(), c.missing_ends()))
            .collect()
    }
}

/// Run every structural check over `text`.
pub fn analyze(text: &str) -> StructureReport {
    let (open_braces, close_braces) = count_braces(text);
    let tags = environment_tags(text);

    StructureReport {
        brace_balance: open_braces as i64 - close_braces as i64,
        open_braces,
        close_braces,
        environments: analyze_tags(&tags),
        tables: tables_from_tags(text, &tags),
    }
}

/// True when the byte at `idx` is preceded by a backslash.
pub fn is_escaped(bytes: &[u8], idx: usize) -> bool {
    idx > 0 && bytes[idx - 1] == b'\\'
}

/// Count unescaped opening and closing braces.
pub fn count_braces(text: &str) -> (usize, usize) {
    let bytes = text.as_bytes();
    let mut open = 0;
    let mut close = 0;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'{' if !is_escaped(bytes, i) => open += 1,
            b'}' if !is_escaped(bytes, i) => close += 1,
            _ => {}
        }
    }
    (open, close)
}

/// Unescaped `{` minus unescaped `}`.
pub fn brace_balance(text: &str) -> i64 {
    let (open, close) = count_braces(text);
    open as i64 - close as i64
}

/// Every `\begin{..}` / `\end{..}` tag in document order.
pub fn environment_tags(text: &str) -> Vec<EnvTag> {
    ENV_TAG
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = if &caps[1] == "begin" {
                TagKind::Begin
            } else {
                TagKind::End
            };
            Some(EnvTag {
                kind,
                name: caps[2].to_string(),
                start: whole.start(),
                end: whole.end(),
            })
        })
        .collect()
}

/// Begin/end counts per environment name.
pub fn environment_counts(text: &str) -> BTreeMap<String, EnvCounts> {
    analyze_tags(&environment_tags(text))
}

fn analyze_tags(tags: &[EnvTag]) -> BTreeMap<String, EnvCounts> {
    let mut counts: BTreeMap<String, EnvCounts> = BTreeMap::new();
    for tag in tags {
        let entry = counts.entry(tag.name.clone()).or_default();
        match tag.kind {
            TagKind::Begin => entry.begins += 1,
            TagKind::End => entry.ends += 1,
        }
    }
    counts
}

/// Environments with missing `\end` tags, in order of their first `\begin`,
/// paired with how many closers each one lacks.
pub fn unclosed_environments(text: &str) -> Vec<(String, usize)> {
    let tags = environment_tags(text);
    let counts = analyze_tags(&tags);

    let mut seen: Vec<&str> = Vec::new();
    for tag in tags.iter().filter(|t| t.kind == TagKind::Begin) {
        if !seen.contains(&tag.name.as_str()) {
            seen.push(tag.name.as_str());
        }
    }

    seen.into_iter()
        .filter_map(|name| {
            let missing = counts.get(name).map(EnvCounts::missing_ends).unwrap_or(0);
            (missing > 0).then(|| (name.to_string(), missing))
        })
        .collect()
}

/// Locate table blocks and report any scaling wrapper still open at the table close.
pub fn find_tables(text: &str) -> Vec<TableScaffold> {
    tables_from_tags(text, &environment_tags(text))
}

fn tables_from_tags(text: &str, tags: &[EnvTag]) -> Vec<TableScaffold> {
    let mut tables = Vec::new();
    let mut open: Option<&EnvTag> = None;

    for tag in tags {
        if !TABLE_ENVIRONMENTS.contains(&tag.name.as_str()) {
            continue;
        }
        match (tag.kind, open) {
            (TagKind::Begin, None) => open = Some(tag),
            (TagKind::Begin, Some(prev)) => {
                // A second begin before any end: report the first as unterminated.
                tables.push(scaffold(text, prev, None));
                open = Some(tag);
            }
            (TagKind::End, Some(begin)) if begin.name == tag.name => {
                tables.push(scaffold(text, begin, Some(tag.start)));
                open = None;
            }
            (TagKind::End, _) => {}
        }
    }
    if let Some(begin) = open {
        tables.push(scaffold(text, begin, None));
    }
    tables
}

fn scaffold(text: &str, begin: &EnvTag, end: Option<usize>) -> TableScaffold {
    let body_end = end.unwrap_or(text.len());
    let body = &text[begin.end..body_end];

    let wrapper = SCALING_WRAPPER.captures(body).and_then(|caps| {
        let m = caps.get(0)?;
        let offset = begin.end + m.start();
        let net = brace_balance(&text[offset..body_end]);
        Some(ScalingWrapper {
            command: caps[1].to_string(),
            offset,
            missing_closers: net.max(0) as usize,
        })
    });

    TableScaffold {
        env: begin.name.clone(),
        begin: begin.start,
        end,
        wrapper,
    }
}

/// Number of columns declared by a tabular column spec such as `|l|c|p{3cm}|`.
///
/// Brace groups that belong to `p`/`m`/`b`/`@`/`!`/`>`/`<` are skipped and
/// `*{n}{spec}` repeats are expanded; absurd repeat counts saturate.
pub fn count_columns(spec: &str) -> usize {
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    let mut columns: usize = 0;

    while i < chars.len() {
        match chars[i] {
            'l' | 'c' | 'r' | 'X' | 'S' => {
                columns += 1;
                i += 1;
            }
            'p' | 'm' | 'b' => {
                columns += 1;
                i = skip_group(&chars, i + 1);
            }
            '@' | '!' | '>' | '<' => {
                i = skip_group(&chars, i + 1);
            }
            '*' => {
                let (count, after_count) = read_group(&chars, i + 1);
                let (inner, after_inner) = read_group(&chars, after_count);
                let repeat: usize = count.trim().parse().unwrap_or(1);
                columns = columns.saturating_add(repeat.saturating_mul(count_columns(&inner)));
                i = after_inner;
            }
            _ => i += 1,
        }
    }
    columns
}

/// Column count of the first tabular in `line`, if the line opens one.
pub fn tabular_columns(line: &str) -> Option<usize> {
    TABULAR_SPEC
        .captures(line)
        .map(|caps| count_columns(&caps[1]))
}

fn skip_group(chars: &[char], start: usize) -> usize {
    read_group(chars, start).1
}

/// Read a `{...}` group starting at `start` (leading spaces allowed).
/// Returns its inner text and the index after the closing brace.
fn read_group(chars: &[char], start: usize) -> (String, usize) {
    let mut i = start;
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    if i >= chars.len() || chars[i] != '{' {
        return (String::new(), i);
    }
    let mut depth = 0usize;
    let mut inner = String::new();
    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' => {
                if depth > 0 {
                    inner.push(c);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return (inner, i + 1);
                }
                inner.push(c);
            }
            _ => inner.push(c),
        }
        i += 1;
    }
    (inner, i)
}
