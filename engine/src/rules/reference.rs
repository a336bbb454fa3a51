//! Repairs that use a known-good version of the same file as reference.
//!
//! A derived document (a translation, a heavy edit) often breaks structure
//! its source got right. When the source is at hand, its structure tells us
//! what the derived text should look like: how many environments close,
//! whether a table's scaling wrapper is closed, whether a caption balances,
//! how many braces end the file. Each check only fires where the reference
//! is sound and the derived text is not.

use crate::analyzer::{brace_balance, environment_counts, find_tables, is_escaped};
use crate::rules::{FixOutcome, RuleChain};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

/// Trailing characters compared when looking for brace garbage at the end.
const TAIL_WINDOW: usize = 20;

/// Trailing closers the derived text may have beyond the reference's.
const TAIL_SLACK: usize = 2;

/// Formatting and sectioning commands whose argument braces are compared.
const BRACED_COMMANDS: &[&str] = &["textbf", "textit", "emph", "underline", "section", "subsection"];

/// `\textbf{\textit{x}` directly followed by punctuation lost its outer closer.
static NESTED_EMPHASIS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\textbf\{\\textit\{[^}]+)\}([=,;:，；：）)])").unwrap()
});

/// One change made against the reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceFix {
    /// 1-based line in the text as it was when the fix was made.
    pub line: Option<usize>,
    pub description: String,
}

impl ReferenceFix {
    fn at(line: usize, description: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            description: description.into(),
        }
    }

    fn whole(description: impl Into<String>) -> Self {
        Self {
            line: None,
            description: description.into(),
        }
    }
}

/// Reference repairs plus the rule chain run after them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceOutcome {
    pub text: String,
    pub changed: bool,
    pub fixes: Vec<ReferenceFix>,
    pub rules: FixOutcome,
}

impl RuleChain {
    /// Repair `text` against `reference` when one is given, then run the
    /// chain. Reference repairs go first so a closer lands where the
    /// reference puts it before the global balance rule guesses a place.
    /// Without a reference this is [`RuleChain::fix`].
    pub fn fix_with_reference(&self, text: &str, reference: Option<&str>) -> ReferenceOutcome {
        let (repaired, fixes) = match reference.filter(|r| !r.trim().is_empty()) {
            Some(reference) => repair_against(reference, text),
            None => (text.to_string(), Vec::new()),
        };
        for fix in &fixes {
            debug!(line = ?fix.line, description = %fix.description, "Reference fix applied");
        }
        let rules = self.fix(&repaired);
        ReferenceOutcome {
            changed: rules.text != text,
            text: rules.text.clone(),
            fixes,
            rules,
        }
    }

    /// [`RuleChain::fix_with_reference`] over a set of files. Files without
    /// a reference of the same name only get the rule chain.
    pub fn fix_files_with_reference(
        &self,
        files: &BTreeMap<String, String>,
        references: &BTreeMap<String, String>,
    ) -> BTreeMap<String, ReferenceOutcome> {
        files
            .iter()
            .map(|(name, text)| {
                let reference = references.get(name).map(String::as_str);
                (name.clone(), self.fix_with_reference(text, reference))
            })
            .collect()
    }
}

/// Apply every reference check to `text`, in order: environment closers,
/// table wrappers, captions, trailing braces, command braces.
pub fn repair_against(reference: &str, text: &str) -> (String, Vec<ReferenceFix>) {
    let mut fixes = Vec::new();
    let mut current = text.to_string();
    for check in [
        close_environments,
        close_table_wrappers,
        balance_captions,
        trim_trailing_braces,
        close_command_braces,
    ] {
        if let Some(next) = check(reference, &current, &mut fixes) {
            current = next;
        }
    }
    (current, fixes)
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

// ── Environments ────────────────────────────────────────────────────

fn close_environments(reference: &str, text: &str, fixes: &mut Vec<ReferenceFix>) -> Option<String> {
    let expected = environment_counts(reference);
    let actual = environment_counts(text);
    let mut current = text.to_string();

    for (name, want) in &expected {
        let have = actual.get(name).copied().unwrap_or_default();
        let missing = want.ends.saturating_sub(have.ends).min(have.missing_ends());
        for _ in 0..missing {
            let Some((next, line)) = insert_end(&current, name) else {
                break;
            };
            current = next;
            fixes.push(ReferenceFix::at(line, format!("Added missing \\end{{{name}}}")));
        }
    }
    (current != text).then_some(current)
}

/// Insert `\end{name}` after the last unmatched `\begin{name}`: before the
/// next `\begin` that does not directly follow it, before `\end{document}`,
/// or at the end of the text.
fn insert_end(text: &str, name: &str) -> Option<(String, usize)> {
    let begin_tag = format!("\\begin{{{name}}}");
    let end_tag = format!("\\end{{{name}}}");
    let lines: Vec<&str> = text.split('\n').collect();

    let begins = lines.iter().filter(|l| l.contains(&begin_tag)).count();
    let ends = lines.iter().filter(|l| l.contains(&end_tag)).count();
    if begins <= ends {
        return None;
    }
    let last_begin = lines.iter().rposition(|l| l.contains(&begin_tag))?;

    let insert_at = (last_begin + 1..lines.len())
        .find(|&i| {
            lines[i].contains("\\end{document}")
                || (i > last_begin + 1 && lines[i].contains("\\begin{"))
        })
        .unwrap_or(lines.len());

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..insert_at]);
    out.push(&end_tag);
    out.extend_from_slice(&lines[insert_at..]);
    Some((out.join("\n"), insert_at + 1))
}

// ── Tables ──────────────────────────────────────────────────────────

fn close_table_wrappers(reference: &str, text: &str, fixes: &mut Vec<ReferenceFix>) -> Option<String> {
    let expected = find_tables(reference);
    let actual = find_tables(text);
    let mut current = text.to_string();
    let mut added = Vec::new();

    // Back to front so earlier offsets stay valid.
    for (want, have) in expected.iter().zip(actual.iter()).rev() {
        let reference_closed = want.wrapper.as_ref().is_some_and(|w| w.missing_closers == 0);
        if !reference_closed || !have.has_unclosed_wrapper() {
            continue;
        }
        let body_end = have.end.unwrap_or(current.len());
        let Some(pos) = open_tabular_end(&current[have.begin..body_end]) else {
            continue;
        };
        let at = have.begin + pos;
        current.insert(at, '}');
        added.push(ReferenceFix::at(line_of(&current, at), "Added missing } for the scaling wrapper"));
    }
    added.reverse();
    fixes.extend(added);
    (current != text).then_some(current)
}

/// Offset just past the first `\end{tabular}` in `body` that is not already
/// followed by a closing brace.
fn open_tabular_end(body: &str) -> Option<usize> {
    const END_TABULAR: &str = "\\end{tabular}";
    body.match_indices(END_TABULAR)
        .map(|(i, _)| i + END_TABULAR.len())
        .find(|&after| !body[after..].starts_with('}'))
}

// ── Captions ────────────────────────────────────────────────────────

fn balance_captions(reference: &str, text: &str, fixes: &mut Vec<ReferenceFix>) -> Option<String> {
    let expected: Vec<&str> = reference.split('\n').filter(|l| l.contains("\\caption{")).collect();
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    let mut changed = false;

    let caption_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.contains("\\caption{"))
        .map(|(i, _)| i)
        .collect();

    for (idx, want) in caption_lines.into_iter().zip(expected) {
        if brace_balance(want) != 0 || brace_balance(&lines[idx]) == 0 {
            continue;
        }
        let fixed = NESTED_EMPHASIS
            .replace_all(&lines[idx], "${1}}}${2}")
            .into_owned();
        if fixed != lines[idx] {
            lines[idx] = fixed;
            changed = true;
            fixes.push(ReferenceFix::at(idx + 1, "Fixed brace balance in caption"));
        }
    }
    changed.then(|| lines.join("\n"))
}

// ── Trailing braces ─────────────────────────────────────────────────

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let skip = trimmed.chars().count().saturating_sub(TAIL_WINDOW);
    trimmed.chars().skip(skip).collect()
}

fn trim_trailing_braces(reference: &str, text: &str, fixes: &mut Vec<ReferenceFix>) -> Option<String> {
    let expected = tail(reference).matches('}').count();
    let actual = tail(text).matches('}').count();
    if actual <= expected + TAIL_SLACK {
        return None;
    }
    let extra = actual - expected;

    let mut out = text.trim().to_string();
    let mut removed = 0;
    while removed < extra {
        match out.chars().last() {
            Some('}') => {
                out.pop();
                removed += 1;
            }
            Some(c) if c.is_whitespace() => {
                out.pop();
            }
            _ => break,
        }
    }
    if removed == 0 {
        return None;
    }
    out.push('\n');
    fixes.push(ReferenceFix::whole(format!("Removed {removed} extra trailing braces")));
    Some(out)
}

// ── Command braces ──────────────────────────────────────────────────

/// Byte offsets of every `\cmd{` whose argument never closes.
fn unclosed_arguments(text: &str, command: &str) -> Vec<usize> {
    let needle = format!("\\{command}{{");
    let bytes = text.as_bytes();
    text.match_indices(&needle)
        .filter(|&(start, _)| {
            let mut depth = 0i64;
            for i in start + needle.len() - 1..bytes.len() {
                match bytes[i] {
                    b'{' if !is_escaped(bytes, i) => depth += 1,
                    b'}' if !is_escaped(bytes, i) => {
                        depth -= 1;
                        if depth == 0 {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            true
        })
        .map(|(start, _)| start)
        .collect()
}

fn close_command_braces(reference: &str, text: &str, fixes: &mut Vec<ReferenceFix>) -> Option<String> {
    let mut current = text.to_string();
    for command in BRACED_COMMANDS {
        if !unclosed_arguments(reference, command).is_empty() {
            continue;
        }
        let open = unclosed_arguments(&current, command);
        if open.is_empty() {
            continue;
        }
        let mut closed = 0;
        for start in open.into_iter().rev() {
            // The first closer inside the argument belongs to a nested
            // group; the argument's own closer is assumed to follow it.
            let arg = start + command.len() + 2;
            let Some(rel) = current[arg..].find('}') else {
                continue;
            };
            let after = arg + rel + 1;
            if current[after..].starts_with('}') || after == current.len() {
                continue;
            }
            current.insert(after, '}');
            closed += 1;
        }
        if closed > 0 {
            fixes.push(ReferenceFix::whole(format!("Fixed brace balance in \\{command} commands")));
        }
    }
    (current != text).then_some(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resizebox_closer_restored() {
        let reference = "\\begin{table}[h]\n\\resizebox{\\columnwidth}{!}{\n\\begin{tabular}{c|ccc}\nHeader1 & Header2 & Header3 \\\\\n\\end{tabular}}\n\\caption{Test table}\n\\end{table}";
        let text = "\\begin{table}[h]\n\\resizebox{\\columnwidth}{!}{\n\\begin{tabular}{c|ccc}\n表头1 & 表头2 & 表头3 \\\\\n\\end{tabular}\n\\caption{测试表格}\n\\end{table}";
        let (fixed, fixes) = repair_against(reference, text);
        assert!(fixed.contains("\\end{tabular}}\n\\caption{测试表格}"));
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].line, Some(5));
        assert_eq!(brace_balance(&fixed), 0);
    }

    #[test]
    fn test_wrapper_left_alone_when_reference_also_open() {
        let text = "\\begin{table}\n\\resizebox{1cm}{!}{\n\\begin{tabular}{c}\nx\n\\end{tabular}\n\\end{table}";
        let (fixed, fixes) = repair_against(text, text);
        assert_eq!(fixed, text);
        assert!(fixes.is_empty());
    }

    #[test]
    fn test_caption_nested_emphasis_closed() {
        let reference = "\\caption{Test with \\textbf{\\textit{n}}=64}";
        let text = "\\caption{测试 \\textbf{\\textit{n}=64}";
        let (fixed, fixes) = repair_against(reference, text);
        assert_eq!(fixed, "\\caption{测试 \\textbf{\\textit{n}}=64}");
        assert_eq!(brace_balance(&fixed), 0);
        assert_eq!(fixes[0].description, "Fixed brace balance in caption");
    }

    #[test]
    fn test_caption_with_fullwidth_paren() {
        let reference = "\\caption{A (\\textbf{\\textit{k}})}";
        let text = "\\caption{甲（\\textbf{\\textit{k}）}";
        let (fixed, _) = repair_against(reference, text);
        assert_eq!(fixed, "\\caption{甲（\\textbf{\\textit{k}}）}");
    }

    #[test]
    fn test_trailing_braces_removed() {
        let reference = "\\section{Test}\nContent here\n\\end{document}";
        let text = "\\section{测试}\n内容在这里\n\\end{document}}}}}}";
        let (fixed, fixes) = repair_against(reference, text);
        assert_eq!(fixed, "\\section{测试}\n内容在这里\n\\end{document}\n");
        assert_eq!(fixes, vec![ReferenceFix::whole("Removed 5 extra trailing braces")]);
    }

    #[test]
    fn test_trailing_braces_within_slack_kept() {
        let reference = "x\n\\end{document}";
        let text = "x\n\\end{document}}}";
        let (fixed, fixes) = repair_against(reference, text);
        assert_eq!(fixed, text);
        assert!(fixes.is_empty());
    }

    #[test]
    fn test_missing_environment_end_added() {
        let reference = "\\begin{figure*}[h]\n\\includegraphics{test.png}\n\\caption{Test}\n\\end{figure*}";
        let text = "\\begin{figure*}[h]\n\\includegraphics{test.png}\n\\caption{测试}";
        let (fixed, fixes) = repair_against(reference, text);
        assert_eq!(
            fixed,
            "\\begin{figure*}[h]\n\\includegraphics{test.png}\n\\caption{测试}\n\\end{figure*}"
        );
        assert_eq!(fixes[0], ReferenceFix::at(4, "Added missing \\end{figure*}"));
    }

    #[test]
    fn test_environment_end_inserted_before_next_block() {
        let reference = "\\begin{itemize}\n\\item a\n\\end{itemize}\n\\begin{center}\nx\n\\end{center}\n\\end{document}";
        let text = "\\begin{itemize}\n\\item a\n\\begin{center}\nx\n\\end{center}\n\\end{document}";
        let (fixed, _) = repair_against(reference, text);
        assert_eq!(
            fixed,
            "\\begin{itemize}\n\\item a\n\\end{itemize}\n\\begin{center}\nx\n\\end{center}\n\\end{document}"
        );
    }

    #[test]
    fn test_environment_not_closed_when_reference_is_open_too() {
        let text = "\\begin{figure}\nx";
        let (fixed, fixes) = repair_against(text, text);
        assert_eq!(fixed, text);
        assert!(fixes.is_empty());
    }

    #[test]
    fn test_command_argument_closed_after_nested_group() {
        let reference = "\\section{Results}\n\\textbf{\\emph{a}} b\n";
        let text = "\\section{结果}\n\\textbf{\\emph{a} b\n";
        let (fixed, fixes) = repair_against(reference, text);
        assert_eq!(fixed, "\\section{结果}\n\\textbf{\\emph{a}} b\n");
        assert_eq!(fixes, vec![ReferenceFix::whole("Fixed brace balance in \\textbf commands")]);
    }

    #[test]
    fn test_closed_commands_untouched() {
        let reference = "\\textbf{a} and \\emph{b}\n";
        let text = "\\textbf{甲} 和 \\emph{乙}\n";
        let (fixed, fixes) = repair_against(reference, text);
        assert_eq!(fixed, text);
        assert!(fixes.is_empty());
    }

    #[test]
    fn test_reference_repair_runs_before_chain() {
        let reference = "\\begin{table}[h]\n\\resizebox{\\columnwidth}{!}{\n\\begin{tabular}{c|c}\nA & B \\\\\n\\end{tabular}}\n\\end{table}";
        let text = "\\begin{table}[h]\n\\resizebox{\\columnwidth}{!}{\n\\begin{tabular}{c|c}\n甲 & 乙 \\\\\n\\end{tabular}\n\\end{table}";
        let outcome = RuleChain::standard().fix_with_reference(text, Some(reference));
        assert!(outcome.changed);
        assert!(outcome.text.contains("\\end{tabular}}"));
        assert_eq!(brace_balance(&outcome.text), 0);
    }

    #[test]
    fn test_without_reference_matches_chain() {
        let text = "\\end{itemize}\\item text";
        let outcome = RuleChain::standard().fix_with_reference(text, None);
        assert_eq!(outcome.text, RuleChain::standard().fix(text).text);
        assert!(outcome.fixes.is_empty());
        let blank = RuleChain::standard().fix_with_reference(text, Some("  \n"));
        assert_eq!(blank.text, outcome.text);
    }

    #[test]
    fn test_files_without_reference_get_rules_only() {
        let mut files = BTreeMap::new();
        files.insert("a.tex".to_string(), "\\caption{甲 \\textbf{\\textit{n}=1}".to_string());
        files.insert("b.tex".to_string(), "plain\n".to_string());
        let mut references = BTreeMap::new();
        references.insert("a.tex".to_string(), "\\caption{A \\textbf{\\textit{n}}=1}".to_string());

        let out = RuleChain::standard().fix_files_with_reference(&files, &references);
        assert_eq!(out["a.tex"].text, "\\caption{甲 \\textbf{\\textit{n}}=1}");
        assert_eq!(out["a.tex"].fixes.len(), 1);
        assert!(!out["b.tex"].changed);
    }
}
