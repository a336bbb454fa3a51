//! Table repairs: scaling wrappers, layout and wide-table promotion.

use super::{deficit, indent_of};
use crate::analyzer::{find_tables, tabular_columns};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static NESTED_RESIZEBOX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\\resizebox\s*\{[^}]+\}\s*\{[^}]+\}\s*\{%?\s*)(?:\\resizebox\s*\{[^}]+\}\s*\{[^}]+\}\s*\{%?\s*)+",
    )
    .unwrap()
});

static TABULAR_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\end\{tabular\*?\}").unwrap());

static TABLE_PLACEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\begin\{table\}\[(?:!?t|!h)\]").unwrap());

static TABLE_STAR_PLACEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\begin\{table\*\}\[!?t\]").unwrap());

static TABLE_BEGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\begin\{table\}(?:\[[^\]]*\])?").unwrap());

const SCALING_COMMANDS: &[&str] = &["\\resizebox", "\\scalebox", "\\adjustbox"];
const SCALING_CLOSER: &str = "}% end scaling";
const TABCOLSEP: &str = "\\setlength{\\tabcolsep}{1.5pt}";

/// Column count at which a single-column table becomes `table*`.
pub const WIDE_TABLE_COLUMNS: usize = 14;

/// A float environment spanning whole lines `begin..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct FloatBlock {
    pub begin: usize,
    pub end: usize,
    pub starred: bool,
}

/// Uncommented `\begin{env}`/`\begin{env*}` lines paired with the next line
/// closing either variant.
pub(super) fn float_blocks(lines: &[&str], env: &str) -> Vec<FloatBlock> {
    let begin_plain = format!("\\begin{{{env}}}");
    let begin_star = format!("\\begin{{{env}*}}");
    let end_plain = format!("\\end{{{env}}}");
    let end_star = format!("\\end{{{env}*}}");

    let mut blocks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let starred = line.contains(&begin_star);
        if line.trim_start().starts_with('%') || !(starred || line.contains(&begin_plain)) {
            i += 1;
            continue;
        }
        let end = (i + 1..lines.len()).find(|&j| {
            !lines[j].trim_start().starts_with('%')
                && (lines[j].contains(&end_plain) || lines[j].contains(&end_star))
        });
        match end {
            Some(end) => {
                blocks.push(FloatBlock {
                    begin: i,
                    end,
                    starred,
                });
                i = end + 1;
            }
            None => i += 1,
        }
    }
    blocks
}

pub(crate) fn nested_resizebox(text: &str) -> Option<String> {
    if !NESTED_RESIZEBOX.is_match(text) {
        return None;
    }
    Some(NESTED_RESIZEBOX.replace_all(text, "${1}").into_owned())
}

/// Close a scaling wrapper that is still open when its table ends, right
/// after the table's last `\end{tabular}`.
pub(crate) fn close_scaling_wrapper(text: &str) -> Option<String> {
    let mut budget = deficit(text);
    if budget == 0 {
        return None;
    }

    let mut inserts: Vec<(usize, usize)> = Vec::new();
    for table in find_tables(text) {
        if budget == 0 {
            break;
        }
        let (Some(wrapper), Some(end)) = (&table.wrapper, table.end) else {
            continue;
        };
        if wrapper.missing_closers == 0 {
            continue;
        }
        let Some(close) = TABULAR_CLOSE.find_iter(&text[wrapper.offset..end]).last() else {
            continue;
        };
        let add = wrapper.missing_closers.min(budget);
        budget -= add;
        debug!(command = %wrapper.command, add, "closing scaling wrapper");
        inserts.push((wrapper.offset + close.end(), add));
    }
    if inserts.is_empty() {
        return None;
    }

    let mut out = text.to_string();
    inserts.sort_unstable();
    for (at, count) in inserts.into_iter().rev() {
        out.insert_str(at, &"}".repeat(count));
    }
    Some(out)
}

/// Scaling wrapper opener for a tabular with `columns` columns.
fn scaling_for(starred: bool, columns: usize) -> Option<String> {
    let scale = |factor: &str| format!("\\scalebox{{{factor}}}{{%");
    match (starred, columns) {
        (true, c) if c >= 14 => Some(scale("0.65")),
        (true, c) if c >= 12 => Some(scale("0.7")),
        (true, c) if c >= 8 => Some("\\resizebox{\\textwidth}{!}{%".to_string()),
        (false, c) if c >= 10 => Some(scale("0.7")),
        (false, c) if c >= 8 => Some(scale("0.75")),
        (false, c) if c >= 6 => Some("\\resizebox{\\columnwidth}{!}{%".to_string()),
        _ => None,
    }
}

/// Scaling commands come from graphicx; only add them where it is in use.
fn graphics_available(text: &str) -> bool {
    text.contains("graphicx")
        || text.contains("\\includegraphics")
        || SCALING_COMMANDS.iter().any(|c| text.contains(c))
}

/// Float placement, tighter column spacing and scaling for tables that are
/// too wide for their column.
pub(crate) fn table_layout(text: &str) -> Option<String> {
    if !text.contains("\\begin{table") {
        return None;
    }
    let lines: Vec<&str> = text.split('\n').collect();
    let can_scale = graphics_available(text);

    let mut out: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
    let mut before: Vec<Vec<String>> = vec![Vec::new(); lines.len()];
    let mut after: Vec<Vec<String>> = vec![Vec::new(); lines.len()];

    for block in float_blocks(&lines, "table") {
        let placement = if block.starred {
            &TABLE_STAR_PLACEMENT
        } else {
            &TABLE_PLACEMENT
        };
        let head = &out[block.begin];
        let env = if block.starred { "table*" } else { "table" };
        let normalized = placement.replace(head, format!("\\begin{{{env}}}[!htbp]").as_str());
        out[block.begin] = normalized.into_owned();

        let body = block.begin..=block.end;
        if !lines[body.clone()].iter().any(|l| l.contains("\\tabcolsep")) {
            if let Some(c) = body.clone().find(|&i| lines[i].contains("\\centering")) {
                before[c].push(format!("{}{}", indent_of(lines[c]), TABCOLSEP));
            }
        }

        let wrapped = lines[body.clone()]
            .iter()
            .any(|l| SCALING_COMMANDS.iter().any(|c| l.contains(c)));
        if !can_scale || wrapped {
            continue;
        }
        let Some(start) = body.clone().find(|&i| lines[i].contains("\\begin{tabular")) else {
            continue;
        };
        let Some(opener) = tabular_columns(lines[start]).and_then(|c| scaling_for(block.starred, c))
        else {
            continue;
        };
        let Some(stop) = (start..=block.end).find(|&i| lines[i].contains("\\end{tabular")) else {
            continue;
        };
        let indent = indent_of(lines[start]);
        before[start].push(format!("{indent}{opener}"));
        after[stop].push(format!("{}{}", indent_of(lines[stop]), SCALING_CLOSER));
    }

    let mut assembled = Vec::with_capacity(out.len());
    for (i, line) in out.into_iter().enumerate() {
        assembled.append(&mut before[i]);
        assembled.push(line);
        assembled.append(&mut after[i]);
    }
    let joined = assembled.join("\n");
    (joined != text).then_some(joined)
}

/// Promote single-column tables with at least [`WIDE_TABLE_COLUMNS`]
/// columns to the page-wide `table*`.
pub(crate) fn wide_table(text: &str) -> Option<String> {
    if !text.contains("\\begin{table}") {
        return None;
    }
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
    let mut changed = false;

    for block in float_blocks(&lines, "table") {
        if block.starred {
            continue;
        }
        let columns = (block.begin..=block.end)
            .find(|&i| lines[i].contains("\\begin{tabular"))
            .and_then(|i| tabular_columns(lines[i]));
        let Some(columns) = columns.filter(|&c| c >= WIDE_TABLE_COLUMNS) else {
            continue;
        };
        debug!(columns, line = block.begin + 1, "promoting wide table");
        out[block.begin] = TABLE_BEGIN
            .replace(&out[block.begin], "\\begin{table*}[!htbp]")
            .into_owned();
        out[block.end] = out[block.end].replacen("\\end{table}", "\\end{table*}", 1);
        changed = true;
    }

    changed.then(|| out.join("\n"))
}
