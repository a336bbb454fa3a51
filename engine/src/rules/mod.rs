//! Deterministic rule fixer
//!
//! An ordered list of independent text rewrites. Each [`Rule`] is a pure
//! `&str -> (String, bool)` function that is idempotent on its own; the
//! [`RuleChain`] runs them in order and repeats the whole pass until nothing
//! changes (bounded by [`RuleChain::max_passes`]), so the chain as a whole is
//! idempotent as well.
//!
//! ```text
//!  text ──► commands ──► line splits ──► targeted brace repair ──► global balance
//!                                                                      │
//!  text' ◄── layout ◄── preamble ◄── lists ◄── environment closure ◄───┘
//! ```
//!
//! Order matters: line-splitting rules run before any brace or environment
//! rule, because those count tags per line. Targeted brace rules run before
//! the global balance rule so a missing closer lands where it belongs instead
//! of before `\end{document}`.

mod adjacency;
mod braces;
mod commands;
mod environments;
mod figures;
mod lists;
mod preamble;
mod reference;
mod tables;

use crate::analyzer::{brace_balance, is_escaped};
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::debug;

pub use reference::{repair_against, ReferenceFix, ReferenceOutcome};

/// Largest brace deficit the balance rule will try to close.
pub const MAX_BRACE_DEFICIT: i64 = 50;

/// Largest brace surplus the balance rule will trim from the end.
pub const MAX_TRIMMED_SURPLUS: i64 = 3;

/// Default number of chain passes before giving up on convergence.
pub const DEFAULT_MAX_PASSES: usize = 4;

type RewriteFn = fn(&str) -> Option<String>;

/// A single named rewrite.
#[derive(Clone, Copy)]
pub struct Rule {
    pub name: &'static str,
    pub description: &'static str,
    rewrite: RewriteFn,
}

impl Rule {
    const fn new(name: &'static str, description: &'static str, rewrite: RewriteFn) -> Self {
        Self {
            name,
            description,
            rewrite,
        }
    }

    /// Apply the rule, reporting whether the text changed.
    pub fn apply(&self, text: &str) -> (String, bool) {
        match (self.rewrite)(text) {
            Some(out) if out != text => (out, true),
            _ => (text.to_string(), false),
        }
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule").field("name", &self.name).finish()
    }
}

/// Result of running the chain over one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixOutcome {
    pub text: String,
    pub changed: bool,
    /// Names of rules that changed the text, in firing order (a rule may repeat across passes).
    pub applied: Vec<&'static str>,
    pub passes: usize,
}

impl FixOutcome {
    pub fn fired(&self, rule: &str) -> bool {
        self.applied.contains(&rule)
    }
}

/// Ordered collection of rules.
#[derive(Debug, Clone)]
pub struct RuleChain {
    rules: Vec<Rule>,
    max_passes: usize,
}

impl Default for RuleChain {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleChain {
    /// The full repair chain in its canonical order.
    pub fn standard() -> Self {
        Self {
            rules: standard_rules(),
            max_passes: DEFAULT_MAX_PASSES,
        }
    }

    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            max_passes: DEFAULT_MAX_PASSES,
        }
    }

    pub fn with_max_passes(mut self, passes: usize) -> Self {
        self.max_passes = passes.max(1);
        self
    }

    pub fn max_passes(&self) -> usize {
        self.max_passes
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// Index of a rule in the chain.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Run every rule once, in order.
    pub fn apply_once(&self, text: &str) -> FixOutcome {
        let mut current = text.to_string();
        let mut applied = Vec::new();

        for rule in &self.rules {
            let (next, changed) = rule.apply(&current);
            if changed {
                debug!(rule = rule.name, "rule applied");
                applied.push(rule.name);
                current = next;
            }
        }

        FixOutcome {
            changed: !applied.is_empty(),
            text: current,
            applied,
            passes: 1,
        }
    }

    /// Run passes until one makes no change or `max_passes` is reached.
    pub fn fix(&self, text: &str) -> FixOutcome {
        let mut current = text.to_string();
        let mut applied = Vec::new();
        let mut passes = 0;

        while passes < self.max_passes {
            passes += 1;
            let outcome = self.apply_once(&current);
            if !outcome.changed {
                break;
            }
            applied.extend(outcome.applied);
            current = outcome.text;
        }

        if passes == self.max_passes && !applied.is_empty() {
            debug!(passes, "rule chain stopped at pass limit");
        }

        FixOutcome {
            changed: current != text,
            text: current,
            applied,
            passes,
        }
    }
}

/// Run the standard chain to a fixed point.
pub fn fix(text: &str) -> FixOutcome {
    RuleChain::standard().fix(text)
}

fn standard_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "translated_commands",
            "map command names rewritten into another script back to LaTeX",
            commands::translated_commands,
        ),
        Rule::new(
            "incomplete_end_document",
            "close a truncated \\end{document tag",
            commands::incomplete_end_document,
        ),
        Rule::new(
            "end_list_item",
            "split \\item that follows a list close on the same line",
            adjacency::end_list_item,
        ),
        Rule::new(
            "end_begin_split",
            "split \\begin that follows \\end on the same line",
            adjacency::end_begin,
        ),
        Rule::new(
            "end_section_split",
            "split a sectioning command that follows \\end on the same line",
            adjacency::end_section,
        ),
        Rule::new(
            "text_before_list",
            "start list environments on their own line",
            adjacency::text_before_list,
        ),
        Rule::new(
            "list_end_text",
            "move text after a list close to the next line",
            adjacency::list_end_text,
        ),
        Rule::new(
            "nested_resizebox",
            "collapse directly nested \\resizebox wrappers",
            tables::nested_resizebox,
        ),
        Rule::new(
            "extra_braces_after_end",
            "drop surplus closing braces glued to an \\end tag",
            braces::extra_braces_after_end,
        ),
        Rule::new(
            "nested_tabular_brace",
            "drop a surplus brace after a cell-level \\end{tabular}",
            braces::nested_tabular,
        ),
        Rule::new(
            "end_document_braces",
            "remove braces after \\end{document}",
            braces::after_end_document,
        ),
        Rule::new(
            "document_end",
            "remove duplicate \\end{document} and stray braces before it",
            braces::document_end,
        ),
        Rule::new(
            "trailing_garbage_braces",
            "strip surplus brace runs at end of file",
            braces::trailing_garbage,
        ),
        Rule::new(
            "resizebox_closure",
            "close a scaling wrapper left open inside a table",
            tables::close_scaling_wrapper,
        ),
        Rule::new(
            "newenvironment_braces",
            "close the end-code group of a \\newenvironment",
            environments::newenvironment_braces,
        ),
        Rule::new(
            "definition_closer",
            "close definition groups left open before \\makeatother",
            environments::definition_closer,
        ),
        Rule::new(
            "brace_balance",
            "close missing braces before \\end{document} or trim a small surplus",
            braces::reconcile,
        ),
        Rule::new(
            "float_end_mismatch",
            "make a float's \\end agree with its \\begin on the star",
            figures::float_end_mismatch,
        ),
        Rule::new(
            "environment_closure",
            "add missing \\end tags in reverse declaration order",
            environments::close_environments,
        ),
        Rule::new(
            "lonely_items",
            "move stray \\item lines back into the list they belong to",
            lists::lonely_items,
        ),
        Rule::new(
            "orphaned_list",
            "comment out a list \\begin whose body and \\end are commented",
            lists::orphaned_list,
        ),
        Rule::new(
            "bibliography_order",
            "put \\bibliographystyle before \\bibliography",
            preamble::bibliography_order,
        ),
        Rule::new(
            "breakurl_xelatex",
            "define the pdf@ helpers breakurl needs under xelatex",
            preamble::breakurl_xelatex,
        ),
        Rule::new(
            "subfigure_conflict",
            "drop subfigure when subcaption is loaded",
            preamble::subfigure_conflict,
        ),
        Rule::new(
            "graphicspath_prefix",
            "drop a \\graphicspath directory repeated in \\includegraphics",
            figures::graphicspath_prefix,
        ),
        Rule::new(
            "table_layout",
            "float placement, column spacing and scaling for tables",
            tables::table_layout,
        ),
        Rule::new(
            "figure_layout",
            "float placement and width caps for figures",
            figures::figure_layout,
        ),
        Rule::new(
            "wide_table",
            "promote tables with 14 or more columns to table*",
            tables::wide_table,
        ),
    ]
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Closing braces the document has in excess (0 when balanced or short).
pub(crate) fn surplus(text: &str) -> usize {
    (-brace_balance(text)).max(0) as usize
}

/// Closing braces the document is missing (0 when balanced or in excess).
pub(crate) fn deficit(text: &str) -> usize {
    brace_balance(text).max(0) as usize
}

/// Whether `pos` sits after an unescaped `%` on its line.
pub(crate) fn in_comment(text: &str, pos: usize) -> bool {
    let pos = pos.min(text.len());
    let line_start = text[..pos].rfind('\n').map_or(0, |i| i + 1);
    let bytes = text.as_bytes();
    (line_start..pos).any(|i| bytes[i] == b'%' && !is_escaped(bytes, i))
}

/// `replace_all` that leaves matches inside comments untouched.
pub(crate) fn replace_in_code(re: &Regex, text: &str, replacement: &str) -> Option<String> {
    let out = re.replace_all(text, |caps: &Captures| {
        let end = caps.get(0).map_or(0, |m| m.end());
        if in_comment(text, end) {
            caps[0].to_string()
        } else {
            let mut expanded = String::new();
            caps.expand(replacement, &mut expanded);
            expanded
        }
    });
    (out != text).then(|| out.into_owned())
}

/// Back `pos` off by `window` bytes, landing on a char boundary.
pub(crate) fn window_start(text: &str, pos: usize, window: usize) -> usize {
    let mut start = pos.saturating_sub(window);
    while start < pos && !text.is_char_boundary(start) {
        start += 1;
    }
    start
}

/// Leading spaces and tabs of a line.
pub(crate) fn indent_of(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}
