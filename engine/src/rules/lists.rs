//! List-structure repairs.

use crate::analyzer::{environment_tags, TagKind};
use std::ops::Range;
use tracing::debug;

const LIST_ENVIRONMENTS: &[&str] = &["itemize", "enumerate", "description"];
const ORPHAN_LOOKAHEAD: usize = 20;

/// `\item` lines that ended up outside every list.
#[derive(Debug)]
struct LonelyItems {
    /// Line holding the `\end{..}` that closed the list too early.
    close: usize,
    blocks: Vec<Range<usize>>,
    /// A later `\end` of the same list type with no open list left to close.
    orphan_end: bool,
}

/// Move stray `\item` lines back into the list they follow.
///
/// When a later unmatched `\end` of the same list type exists, the earlier
/// close was premature and is dropped instead.
pub(crate) fn lonely_items(text: &str) -> Option<String> {
    if !text.contains("\\item") {
        return None;
    }
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    let mut changed = false;

    for _ in 0..lines.len() {
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let Some(found) = find_lonely_items(&refs) else {
            break;
        };
        debug!(line = found.close + 1, items = found.blocks.len(), "moving lonely items into list");
        lines = if found.orphan_end {
            drop_premature_close(lines, found.close)
        } else {
            move_blocks_before(lines, &found)
        };
        changed = true;
    }

    changed.then(|| lines.join("\n"))
}

fn find_lonely_items(lines: &[&str]) -> Option<LonelyItems> {
    let mut depth = 0usize;
    let mut last_close: Option<(usize, String)> = None;
    let mut other_open: i64 = 0;
    let mut found: Option<LonelyItems> = None;

    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim_start();
        if trimmed.starts_with('%') {
            i += 1;
            continue;
        }
        if is_item_line(trimmed) && depth == 0 && other_open == 0 {
            if let Some((close, _)) = &last_close {
                let end = item_block_end(lines, i);
                found
                    .get_or_insert_with(|| LonelyItems {
                        close: *close,
                        blocks: Vec::new(),
                        orphan_end: false,
                    })
                    .blocks
                    .push(i..end);
                i = end;
                continue;
            }
        }

        for tag in environment_tags(lines[i]) {
            let is_list = LIST_ENVIRONMENTS.contains(&tag.name.as_str());
            match (tag.kind, is_list) {
                (TagKind::Begin, true) => {
                    if found.is_some() {
                        return found;
                    }
                    depth += 1;
                }
                (TagKind::End, true) if depth == 0 => {
                    if let Some(mut lonely) = found {
                        lonely.orphan_end = last_close
                            .as_ref()
                            .is_some_and(|(_, name)| *name == tag.name);
                        return Some(lonely);
                    }
                }
                (TagKind::End, true) => {
                    depth -= 1;
                    if depth == 0 {
                        last_close = Some((i, tag.name.clone()));
                        other_open = 0;
                    }
                }
                (TagKind::Begin, false) if depth == 0 => {
                    if found.is_some() {
                        return found;
                    }
                    other_open += 1;
                }
                (TagKind::End, false) if depth == 0 => {
                    if found.is_some() {
                        return found;
                    }
                    other_open -= 1;
                    if other_open < 0 {
                        last_close = None;
                        other_open = 0;
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    found
}

fn is_item_line(trimmed: &str) -> bool {
    trimmed
        .strip_prefix("\\item")
        .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_alphabetic()))
}

/// An item's block runs until a blank line or the next structural command.
fn item_block_end(lines: &[&str], start: usize) -> usize {
    const STOPS: &[&str] = &[
        "\\item",
        "\\begin{",
        "\\end{",
        "\\section",
        "\\subsection",
        "\\chapter",
        "\\paragraph",
    ];
    let mut end = start + 1;
    while end < lines.len() {
        let trimmed = lines[end].trim_start();
        if trimmed.is_empty() || STOPS.iter().any(|s| trimmed.starts_with(s)) {
            break;
        }
        end += 1;
    }
    end
}

fn drop_premature_close(mut lines: Vec<String>, close: usize) -> Vec<String> {
    let line = &lines[close];
    let tag = environment_tags(line)
        .into_iter()
        .rev()
        .find(|t| t.kind == TagKind::End);
    match tag {
        Some(tag) if line.trim() == &line[tag.start..tag.end] => {
            lines.remove(close);
        }
        Some(tag) => {
            let mut kept = line.clone();
            kept.replace_range(tag.start..tag.end, "");
            lines[close] = kept;
        }
        None => {}
    }
    lines
}

fn move_blocks_before(lines: Vec<String>, found: &LonelyItems) -> Vec<String> {
    let in_block = |idx: usize| found.blocks.iter().any(|b| b.contains(&idx));
    let moved: Vec<String> = found
        .blocks
        .iter()
        .flat_map(|b| lines[b.clone()].iter().cloned())
        .collect();

    let mut out = Vec::with_capacity(lines.len());
    for (idx, line) in lines.into_iter().enumerate() {
        if idx == found.close {
            out.extend(moved.iter().cloned());
        }
        if !in_block(idx) {
            out.push(line);
        }
    }
    out
}

/// Comment out a list `\begin` whose following lines are all commented up to
/// a commented `\end` of the same list.
pub(crate) fn orphaned_list(text: &str) -> Option<String> {
    if !text.contains('%') {
        return None;
    }
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    let mut changed = false;

    for env in LIST_ENVIRONMENTS {
        let begin_tag = format!("\\begin{{{env}}}");
        let end_tag = format!("\\end{{{env}}}");

        for i in 0..lines.len() {
            let trimmed = lines[i].trim();
            if trimmed.starts_with('%') || !trimmed.contains(&begin_tag) {
                continue;
            }
            if body_commented_out(&lines[i + 1..], &end_tag) {
                debug!(env, line = i + 1, "commenting out orphaned list begin");
                lines[i] = format!("% {}", lines[i]);
                changed = true;
            }
        }
    }

    changed.then(|| lines.join("\n"))
}

fn body_commented_out(following: &[String], end_tag: &str) -> bool {
    for line in following.iter().take(ORPHAN_LOOKAHEAD - 1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some(comment) = trimmed.strip_prefix('%') else {
            return false;
        };
        if comment.trim_start().starts_with(end_tag) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premature_close_dropped() {
        let text = "\\begin{itemize}\n\\item a\n\\end{itemize}\n\\item b\n\\end{itemize}\n";
        assert_eq!(
            lonely_items(text).unwrap(),
            "\\begin{itemize}\n\\item a\n\\item b\n\\end{itemize}\n"
        );
    }

    #[test]
    fn test_lonely_item_moved_into_list() {
        let text = "\\begin{enumerate}\n\\item a\n\\end{enumerate}\n\\item b\n\nMore text.\n";
        assert_eq!(
            lonely_items(text).unwrap(),
            "\\begin{enumerate}\n\\item a\n\\item b\n\\end{enumerate}\n\nMore text.\n"
        );
    }

    #[test]
    fn test_lonely_item_keeps_continuation() {
        let text = "\\begin{itemize}\n\\item a\n\\end{itemize}\n\\item b first\nsecond line\n\\section{Next}\n";
        assert_eq!(
            lonely_items(text).unwrap(),
            "\\begin{itemize}\n\\item a\n\\item b first\nsecond line\n\\end{itemize}\n\\section{Next}\n"
        );
    }

    #[test]
    fn test_nested_list_item_untouched() {
        let text = "\\begin{itemize}\n\\item a\n\\begin{enumerate}\n\\item x\n\\end{enumerate}\n\\item b\n\\end{itemize}\n";
        assert!(lonely_items(text).is_none());
    }

    #[test]
    fn test_custom_list_untouched() {
        let text = "\\begin{itemize}\n\\item a\n\\end{itemize}\n\\begin{compactitem}\n\\item x\n\\end{compactitem}\n";
        assert!(lonely_items(text).is_none());
    }

    #[test]
    fn test_itemsep_not_an_item() {
        let text = "\\begin{itemize}\n\\item a\n\\end{itemize}\n\\itemsep=2pt\n";
        assert!(lonely_items(text).is_none());
    }

    #[test]
    fn test_lonely_items_idempotent() {
        let text = "\\begin{itemize}\n\\item a\n\\end{itemize}\n\\item b\n\\item c\n\\end{itemize}\n";
        let once = lonely_items(text).unwrap();
        assert_eq!(once, "\\begin{itemize}\n\\item a\n\\item b\n\\item c\n\\end{itemize}\n");
        assert!(lonely_items(&once).is_none());
    }

    #[test]
    fn test_orphaned_list_commented() {
        let text = "\\begin{itemize}\n% \\item old\n\n%\\item older\n% \\end{itemize}\nText\n";
        assert_eq!(
            orphaned_list(text).unwrap(),
            "% \\begin{itemize}\n% \\item old\n\n%\\item older\n% \\end{itemize}\nText\n"
        );
    }

    #[test]
    fn test_orphaned_list_live_body() {
        let text = "\\begin{itemize}\n% \\item old\n\\item live\n% \\end{itemize}\n";
        assert!(orphaned_list(text).is_none());
    }

    #[test]
    fn test_orphaned_list_already_commented() {
        let text = "% \\begin{itemize}\n% \\item old\n% \\end{itemize}\n";
        assert!(orphaned_list(text).is_none());
    }
}
