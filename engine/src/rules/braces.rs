//! Brace repairs.
//!
//! Rules that remove braces only act while the document has a surplus of
//! closing braces and never remove more than that surplus. Rules that add
//! braces only act on a deficit. This keeps the rules from undoing each
//! other across chain passes.

use super::{in_comment, surplus, window_start, MAX_BRACE_DEFICIT, MAX_TRIMMED_SURPLUS};
use crate::analyzer::{brace_balance, is_escaped};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static END_WITH_BRACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\end\{([^}]+)\}(\}+)").unwrap());

pub(crate) static DEFINITION_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:newcommand|renewcommand|providecommand|def|gdef|edef|xdef)\b").unwrap()
});

static TRAILING_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\}+\s*\z").unwrap());

static OPEN_TAG_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(?:begin|end)\{[^{}]*\z").unwrap());

static ENDS_WITH_CLOSER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\\balance|\\end\{[^{}]+\})\s*\z").unwrap());

static BRACES_AFTER_END_DOCUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\end\{document\})\s*\}+\s*\z").unwrap());

static DUPLICATE_END_DOCUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\end\{document\})\s*\\end\{document\}").unwrap());

static BRACE_LINE_BEFORE_END_DOCUMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n[ \t]*(\}+)[ \t]*\n(?:[ \t]*\n)*[ \t]*\\end\{document\}").unwrap()
});

static TABULAR_CLOSE_BRACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\end\{tabular\})\}(\s*[&\\])").unwrap());

const BEGIN_LOOKBACK: usize = 5000;
const DEFINITION_LOOKBACK: usize = 200;

// ── Surplus removal ─────────────────────────────────────────────────

pub(crate) fn extra_braces_after_end(text: &str) -> Option<String> {
    let mut budget = surplus(text);
    if budget == 0 {
        return None;
    }

    let runs: Vec<(usize, String, usize, usize)> = END_WITH_BRACES
        .captures_iter(text)
        .filter_map(|caps| {
            let tag = caps.get(0)?;
            let run = caps.get(2)?;
            Some((tag.start(), caps[1].to_string(), run.start(), run.len()))
        })
        .collect();

    let mut out = text.to_string();
    for (tag_start, name, run_start, run_len) in runs.into_iter().rev() {
        if in_comment(text, tag_start) {
            continue;
        }
        let keep = braces_owed_to_definition(text, tag_start, &name);
        let remove = run_len.saturating_sub(keep).min(budget);
        if remove == 0 {
            continue;
        }
        out.replace_range(run_start..run_start + remove, "");
        budget -= remove;
        if budget == 0 {
            break;
        }
    }

    (out != text).then_some(out)
}

/// Braces after `\end{name}` that close a macro definition wrapping the environment.
fn braces_owed_to_definition(text: &str, end_tag: usize, name: &str) -> usize {
    let search_from = window_start(text, end_tag, BEGIN_LOOKBACK);
    let begin_tag = format!("\\begin{{{name}}}");
    let Some(rel) = text[search_from..end_tag].rfind(&begin_tag) else {
        return 0;
    };
    let begin = search_from + rel;

    let def_from = window_start(text, begin, DEFINITION_LOOKBACK);
    let Some(def) = DEFINITION_KEYWORD.find_iter(&text[def_from..begin]).last() else {
        return 0;
    };
    brace_balance(&text[def_from + def.start()..end_tag]).max(0) as usize
}

pub(crate) fn trailing_garbage(text: &str) -> Option<String> {
    let budget = surplus(text);
    if budget == 0 {
        return None;
    }
    let m = TRAILING_RUN.find(text)?;
    let bytes = text.as_bytes();

    let mut run_start = m.start();
    let run_end = m.start() + text[m.start()..].trim_end().len();
    if OPEN_TAG_NAME.is_match(&text[..run_start]) || is_escaped(bytes, run_start) {
        run_start += 1;
    }
    let run = run_end.saturating_sub(run_start);
    let before = &text[..run_start];

    let qualifies = (run >= 3 && before.ends_with(char::is_whitespace))
        || (run >= 2 && ENDS_WITH_CLOSER.is_match(before));
    if !qualifies {
        return None;
    }

    let remove = run.min(budget);
    Some(format!(
        "{}{}{}",
        before,
        "}".repeat(run - remove),
        &text[run_end..]
    ))
}

pub(crate) fn after_end_document(text: &str) -> Option<String> {
    if !BRACES_AFTER_END_DOCUMENT.is_match(text) {
        return None;
    }
    Some(
        BRACES_AFTER_END_DOCUMENT
            .replace(text, "${1}\n")
            .into_owned(),
    )
}

pub(crate) fn document_end(text: &str) -> Option<String> {
    let mut out = text.to_string();
    while DUPLICATE_END_DOCUMENT.is_match(&out) {
        out = DUPLICATE_END_DOCUMENT.replace_all(&out, "${1}").into_owned();
    }

    let budget = surplus(&out);
    if budget > 0 {
        let found = BRACE_LINE_BEFORE_END_DOCUMENT
            .captures_iter(&out)
            .last()
            .and_then(|caps| Some((caps.get(0)?.start(), caps.get(1)?.range())));
        if let Some((line_start, run)) = found {
            let remove = run.len().min(budget);
            if remove == run.len() {
                let line_end = out[run.end..]
                    .find('\n')
                    .map_or(out.len(), |i| run.end + i);
                out.replace_range(line_start..line_end, "");
            } else {
                out.replace_range(run.start..run.start + remove, "");
            }
        }
    }

    (out != text).then_some(out)
}

pub(crate) fn nested_tabular(text: &str) -> Option<String> {
    let mut budget = surplus(text);
    if budget == 0 {
        return None;
    }
    let out = TABULAR_CLOSE_BRACE.replace_all(text, |caps: &regex::Captures| {
        let start = caps.get(0).map_or(0, |m| m.start());
        if budget > 0 && !in_comment(text, start) {
            budget -= 1;
            format!("{}{}", &caps[1], &caps[2])
        } else {
            caps[0].to_string()
        }
    });
    (out != text).then(|| out.into_owned())
}

// ── Global reconciliation ───────────────────────────────────────────

pub(crate) fn reconcile(text: &str) -> Option<String> {
    let balance = brace_balance(text);
    if balance > MAX_BRACE_DEFICIT {
        debug!(balance, "brace deficit too large to close automatically");
        return None;
    }
    if balance > 0 {
        return Some(insert_closers(text, balance as usize));
    }
    if balance < -MAX_TRIMMED_SURPLUS {
        debug!(balance, "brace surplus too large to trim automatically");
        return None;
    }
    if balance < 0 {
        return trim_closers(text, balance.unsigned_abs() as usize);
    }
    None
}

fn insert_closers(text: &str, count: usize) -> String {
    let braces = "}".repeat(count);
    match text.rfind("\\end{document}") {
        Some(pos) => format!("{}{}\n{}", &text[..pos], braces, &text[pos..]),
        None => format!("{text}{braces}"),
    }
}

/// Remove the last `count` unescaped closing braces, sparing those that
/// close a `\begin{..}` or `\end{..}` tag name.
///
/// One backward scan: a candidate `}` stays pending until the nearest
/// `{`, `}` or newline before it is reached, which decides whether it
/// closes a tag name.
fn trim_closers(text: &str, count: usize) -> Option<String> {
    let bytes = text.as_bytes();
    let mut doomed = Vec::with_capacity(count);
    let mut pending: Option<usize> = None;
    let mut i = bytes.len();
    while i > 0 && doomed.len() < count {
        i -= 1;
        let b = bytes[i];
        if !matches!(b, b'{' | b'}' | b'\n') {
            continue;
        }
        if let Some(close) = pending.take() {
            if !opens_tag_name(text, i) {
                doomed.push(close);
                if doomed.len() == count {
                    break;
                }
            }
        }
        if b == b'}' && !is_escaped(bytes, i) {
            pending = Some(i);
        }
    }
    if doomed.len() < count {
        doomed.extend(pending);
    }
    if doomed.is_empty() {
        return None;
    }
    let out = text
        .char_indices()
        .filter(|(idx, _)| !doomed.contains(idx))
        .map(|(_, c)| c)
        .collect();
    Some(out)
}

fn opens_tag_name(text: &str, open: usize) -> bool {
    if text.as_bytes()[open] != b'{' {
        return false;
    }
    let head = &text[..open];
    head.ends_with("\\begin") || head.ends_with("\\end")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extra_braces_after_end_removed() {
        let text = "\\begin{center}\nx\n\\end{center}}}\n";
        assert_eq!(
            extra_braces_after_end(text).unwrap(),
            "\\begin{center}\nx\n\\end{center}\n"
        );
    }

    #[test]
    fn test_extra_braces_after_end_needs_surplus() {
        let text = "\\mbox{\\begin{center}x\\end{center}}";
        assert!(extra_braces_after_end(text).is_none());
    }

    #[test]
    fn test_extra_braces_after_end_capped_by_surplus() {
        let text = "\\fbox{\\begin{minipage}{2cm}x\\end{minipage}}}";
        assert_eq!(
            extra_braces_after_end(text).unwrap(),
            "\\fbox{\\begin{minipage}{2cm}x\\end{minipage}}"
        );
    }

    #[test]
    fn test_extra_braces_keep_definition_closers() {
        let text = "\\newcommand{\\boxed}{\\fbox{\\begin{tabular}{c}x\\end{tabular}}}}\n";
        // one closer belongs to \fbox, one to \newcommand, one is surplus
        assert_eq!(brace_balance(text), -1);
        let out = extra_braces_after_end(text).unwrap();
        assert_eq!(
            out,
            "\\newcommand{\\boxed}{\\fbox{\\begin{tabular}{c}x\\end{tabular}}}\n"
        );
        assert_eq!(brace_balance(&out), 0);
    }

    #[test]
    fn test_reconcile_inserts_before_end_document() {
        let text = "\\begin{document}\n\\textbf{a\n\\end{document}\n";
        assert_eq!(
            reconcile(text).unwrap(),
            "\\begin{document}\n\\textbf{a\n}\n\\end{document}\n"
        );
    }

    #[test]
    fn test_reconcile_appends_without_terminal_marker() {
        assert_eq!(reconcile("\\section{Intro").unwrap(), "\\section{Intro}");
    }

    #[test]
    fn test_reconcile_trims_from_end_sparing_tags() {
        let text = "\\begin{document}\nx}\n\\end{document}\n";
        assert_eq!(
            reconcile(text).unwrap(),
            "\\begin{document}\nx\n\\end{document}\n"
        );
    }

    #[test]
    fn test_reconcile_limits() {
        let deep = format!("{}x", "{".repeat(51));
        assert!(reconcile(&deep).is_none());
        assert!(reconcile("a}}}}").is_none());
        assert!(reconcile("{a}").is_none());
    }

    #[test]
    fn test_trailing_garbage_after_end_tag() {
        let text = "\\end{figure*}[ht]\n...\n\\end{figure*}}}}";
        assert_eq!(
            trailing_garbage(text).unwrap(),
            "\\end{figure*}[ht]\n...\n\\end{figure*}"
        );
    }

    #[test]
    fn test_trailing_garbage_after_balance() {
        let text = "\\balance}}\n";
        assert_eq!(trailing_garbage(text).unwrap(), "\\balance\n");
    }

    #[test]
    fn test_trailing_garbage_run_on_own_line() {
        let text = "{a}\n}}}\n";
        assert_eq!(trailing_garbage(text).unwrap(), "{a}\n\n");
    }

    #[test]
    fn test_trailing_garbage_needs_surplus() {
        assert!(trailing_garbage("\\a{\\b{\\c{x\n}}}").is_none());
    }

    #[test]
    fn test_after_end_document() {
        assert_eq!(
            after_end_document("x\n\\end{document}\n}}\n").unwrap(),
            "x\n\\end{document}\n"
        );
        assert!(after_end_document("x\n\\end{document}\n").is_none());
    }

    #[test]
    fn test_duplicate_end_document() {
        let text = "x\n\\end{document}\n\\end{document}\n";
        assert_eq!(document_end(text).unwrap(), "x\n\\end{document}\n");
    }

    #[test]
    fn test_brace_line_before_end_document() {
        let text = "\\begin{document}\nx\n}}\n\n\\end{document}\n";
        assert_eq!(
            document_end(text).unwrap(),
            "\\begin{document}\nx\n\n\\end{document}\n"
        );
    }

    #[test]
    fn test_brace_line_before_end_document_partial() {
        let text = "\\begin{document}\n{x\n}}}\n\\end{document}\n";
        assert_eq!(
            document_end(text).unwrap(),
            "\\begin{document}\n{x\n}\n\\end{document}\n"
        );
    }

    #[test]
    fn test_nested_tabular_brace() {
        let text = "a & \\begin{tabular}{c}x\\end{tabular}} & b \\\\";
        assert_eq!(
            nested_tabular(text).unwrap(),
            "a & \\begin{tabular}{c}x\\end{tabular} & b \\\\"
        );
        let balanced = "\\makecell{\\begin{tabular}{c}x\\end{tabular}} & b";
        assert!(nested_tabular(balanced).is_none());
    }

    #[test]
    fn test_opens_tag_name() {
        let text = "\\end{document}";
        assert!(opens_tag_name(text, 4));
        let text = "\\textbf{x}";
        assert!(!opens_tag_name(text, 7));
        assert!(!opens_tag_name(text, text.len() - 1));
    }

    #[test]
    fn test_trim_closers_spares_tag_names() {
        let text = "\\begin{center}x}\n\\end{center}";
        assert_eq!(trim_closers(text, 1).unwrap(), "\\begin{center}x\n\\end{center}");
    }

    #[test]
    fn test_trim_closers_reaches_start_of_text() {
        assert_eq!(trim_closers("a}b", 1).unwrap(), "ab");
        assert_eq!(trim_closers("}\\end{x}", 2).unwrap(), "\\end{x}");
        assert!(trim_closers("\\end{x}", 1).is_none());
    }

    #[test]
    fn test_trim_closers_long_line() {
        let mut text = "x".repeat(200_000);
        text.push_str("}}");
        assert_eq!(trim_closers(&text, 2).unwrap().len(), 200_000);
    }
}
