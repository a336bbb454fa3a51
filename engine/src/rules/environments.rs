//! Environment and definition-group completion.

use super::braces::DEFINITION_KEYWORD;
use super::{deficit, window_start};
use crate::analyzer::{count_braces, is_escaped, unclosed_environments};

const DEFINITION_LOOKBACK: usize = 2000;

/// Append missing `\end` tags, innermost (last declared) first.
///
/// Closers go right before `\end{document}` when the document has one;
/// otherwise they are appended.
pub(crate) fn close_environments(text: &str) -> Option<String> {
    let unclosed: Vec<(String, usize)> = unclosed_environments(text)
        .into_iter()
        .filter(|(name, _)| !name.contains(['#', '\\']))
        .collect();
    if unclosed.is_empty() {
        return None;
    }

    let terminal = text.rfind("\\end{document}");
    let mut inner = String::new();
    let mut trailing = String::new();
    for (name, missing) in unclosed.iter().rev() {
        let target = if terminal.is_some() && name != "document" {
            &mut inner
        } else {
            &mut trailing
        };
        for _ in 0..*missing {
            target.push_str(&format!("\\end{{{name}}}\n"));
        }
    }

    let mut out = String::with_capacity(text.len() + inner.len() + trailing.len() + 2);
    match terminal {
        Some(pos) if !inner.is_empty() => {
            let head = &text[..pos];
            out.push_str(head);
            if !head.is_empty() && !head.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&inner);
            out.push_str(&text[pos..]);
        }
        _ => out.push_str(text),
    }
    if !trailing.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&trailing);
    }
    Some(out)
}

/// Close the end-code group of a `\newenvironment`: a line opening with
/// `{\end{..}` that leaves braces open right before the next command.
pub(crate) fn newenvironment_braces(text: &str) -> Option<String> {
    let mut budget = deficit(text);
    if budget == 0 || !text.contains("{\\end{") {
        return None;
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if budget > 0 && line.trim_start().starts_with("{\\end{") && ends_definition(&lines, i) {
            let cut = code_end(line);
            let (open, close) = count_braces(&line[..cut]);
            let add = open.saturating_sub(close).min(budget);
            if add > 0 {
                budget -= add;
                out.push(insert_braces(line, cut, add));
                continue;
            }
        }
        out.push((*line).to_string());
    }

    let joined = out.join("\n");
    (joined != text).then_some(joined)
}

/// Close definition groups still open at a `{\end{..}` line that is
/// directly followed by `\makeatother`.
pub(crate) fn definition_closer(text: &str) -> Option<String> {
    let mut budget = deficit(text);
    if budget == 0 || !text.contains("\\makeatother") {
        return None;
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut offset = 0;
    let mut inserts: Vec<(usize, usize)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let line_start = offset;
        offset += line.len() + 1;
        if budget == 0 {
            break;
        }
        if !line.trim_start().starts_with("{\\end{") || !followed_by_makeatother(&lines, i) {
            continue;
        }
        let at = line_start + code_end(line);
        let owed = open_definition_braces(text, at);
        let add = owed.min(budget);
        if add > 0 {
            budget -= add;
            inserts.push((at, add));
        }
    }
    if inserts.is_empty() {
        return None;
    }

    let mut out = text.to_string();
    for (at, count) in inserts.into_iter().rev() {
        out.insert_str(at, &"}".repeat(count));
    }
    Some(out)
}

/// Largest number of braces still open from any definition keyword in the
/// lookback window up to `at`.
fn open_definition_braces(text: &str, at: usize) -> usize {
    let from = window_start(text, at, DEFINITION_LOOKBACK);
    let window = &text[from..at];
    DEFINITION_KEYWORD
        .find_iter(window)
        .map(|m| {
            let (open, close) = count_braces(&window[m.start()..]);
            open.saturating_sub(close)
        })
        .max()
        .unwrap_or(0)
}

fn ends_definition(lines: &[&str], i: usize) -> bool {
    match next_non_blank(lines, i) {
        Some(next) => next.starts_with('\\'),
        None => true,
    }
}

fn followed_by_makeatother(lines: &[&str], i: usize) -> bool {
    next_non_blank(lines, i).is_some_and(|next| next.starts_with("\\makeatother"))
}

fn next_non_blank<'a>(lines: &[&'a str], i: usize) -> Option<&'a str> {
    lines[i + 1..]
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
}

/// Byte offset where code ends on a line: the first unescaped `%`, or the
/// end of the trimmed line.
pub(crate) fn code_end(line: &str) -> usize {
    let bytes = line.as_bytes();
    let comment = (0..bytes.len()).find(|&i| bytes[i] == b'%' && !is_escaped(bytes, i));
    match comment {
        Some(i) => line[..i].trim_end().len(),
        None => line.trim_end().len(),
    }
}

fn insert_braces(line: &str, at: usize, count: usize) -> String {
    format!("{}{}{}", &line[..at], "}".repeat(count), &line[at..])
}
