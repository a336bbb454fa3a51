//! Figure and float repairs.

use super::tables::float_blocks;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static FIGURE_PLACEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\begin\{figure\}\[(?:!?t|!h)\]").unwrap());

static FIGURE_STAR_PLACEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\begin\{figure\*\}\[!?t\]").unwrap());

static GRAPHIC_WIDTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\includegraphics\s*\[[^\]]*?width\s*=\s*)([0-9]*\.?[0-9]+)\s*(\\textwidth|\\columnwidth)")
        .unwrap()
});

static GRAPHICSPATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\graphicspath\s*\{\s*(?:\{[^}]+\}\s*)+\}").unwrap());

static GRAPHICSPATH_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\.?/?[^{}/]+/?)\}").unwrap());

const FIGURE_STAR_MAX_WIDTH: f64 = 0.85;
const FIGURE_MAX_WIDTH: f64 = 0.9;

/// Make a float's `\end` match its `\begin` when only the star differs.
pub(crate) fn float_end_mismatch(text: &str) -> Option<String> {
    if !text.contains("\\begin{figure") && !text.contains("\\begin{table") {
        return None;
    }
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
    let mut changed = false;

    for env in ["figure", "table"] {
        let plain = format!("\\end{{{env}}}");
        let star = format!("\\end{{{env}*}}");
        for block in float_blocks(&lines, env) {
            let line = &out[block.end];
            let fixed = if block.starred && line.contains(&plain) && !line.contains(&star) {
                line.replacen(&plain, &star, 1)
            } else if !block.starred && line.contains(&star) && !line.contains(&plain) {
                line.replacen(&star, &plain, 1)
            } else {
                continue;
            };
            out[block.end] = fixed;
            changed = true;
        }
    }

    changed.then(|| out.join("\n"))
}

/// Float placement and width caps for figures.
pub(crate) fn figure_layout(text: &str) -> Option<String> {
    if !text.contains("\\begin{figure") {
        return None;
    }
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();

    for block in float_blocks(&lines, "figure") {
        let (placement, env, max_width, unit) = if block.starred {
            (&FIGURE_STAR_PLACEMENT, "figure*", FIGURE_STAR_MAX_WIDTH, "\\textwidth")
        } else {
            (&FIGURE_PLACEMENT, "figure", FIGURE_MAX_WIDTH, "\\columnwidth")
        };
        out[block.begin] = placement
            .replace(&out[block.begin], format!("\\begin{{{env}}}[!htbp]").as_str())
            .into_owned();

        for line in &mut out[block.begin..=block.end] {
            if line.contains("\\includegraphics") {
                *line = cap_width(line, unit, max_width);
            }
        }
    }

    let joined = out.join("\n");
    (joined != text).then_some(joined)
}

fn cap_width(line: &str, unit: &str, max: f64) -> String {
    GRAPHIC_WIDTH
        .replace_all(line, |caps: &Captures| {
            let too_wide = &caps[3] == unit && caps[2].parse::<f64>().is_ok_and(|w| w > max);
            if too_wide {
                format!("{}{}{}", &caps[1], max, &caps[3])
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Strip a `\graphicspath` directory that `\includegraphics` repeats.
pub(crate) fn graphicspath_prefix(text: &str) -> Option<String> {
    let decl = GRAPHICSPATH.find(text)?;
    let dirs: Vec<String> = GRAPHICSPATH_ENTRY
        .captures_iter(decl.as_str())
        .map(|caps| {
            caps[1]
                .trim_start_matches("./")
                .trim_start_matches('/')
                .trim_end_matches('/')
                .to_string()
        })
        .filter(|dir| !dir.is_empty())
        .collect();

    let mut out = text.to_string();
    for dir in dirs {
        let pattern = format!(
            r"(\\includegraphics\s*(?:\[[^\]]*\])?\s*\{{){}/([^}}]+\}})",
            regex::escape(&dir)
        );
        let Ok(prefixed) = Regex::new(&pattern) else {
            continue;
        };
        out = prefixed.replace_all(&out, "${1}${2}").into_owned();
    }
    (out != text).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_figure_star_end_fixed() {
        let text = "\\begin{figure*}[t]\nx\n\\end{figure}\n";
        assert_eq!(
            float_end_mismatch(text).unwrap(),
            "\\begin{figure*}[t]\nx\n\\end{figure*}\n"
        );
    }

    #[test]
    fn test_figure_end_unstarred() {
        let text = "\\begin{table}\nx\n\\end{table*}\n";
        assert_eq!(
            float_end_mismatch(text).unwrap(),
            "\\begin{table}\nx\n\\end{table}\n"
        );
    }

    #[test]
    fn test_matching_floats_untouched() {
        assert!(float_end_mismatch("\\begin{figure}\nx\n\\end{figure}\n").is_none());
    }

    #[test]
    fn test_figure_placement_and_width() {
        let text = "\\begin{figure}[!h]\n\\includegraphics[width=1.3\\columnwidth]{a}\n\\end{figure}";
        assert_eq!(
            figure_layout(text).unwrap(),
            "\\begin{figure}[!htbp]\n\\includegraphics[width=0.9\\columnwidth]{a}\n\\end{figure}"
        );
    }

    #[test]
    fn test_narrow_subfigures_kept() {
        let text = "\\begin{figure*}[!htbp]\n\\includegraphics[width=0.3\\textwidth]{a}\\includegraphics[width=0.3\\textwidth]{b}\n\\end{figure*}";
        assert!(figure_layout(text).is_none());
    }

    #[test]
    fn test_figure_star_width_capped() {
        let text = "\\begin{figure*}[t]\n\\includegraphics[height=2cm, width=1\\textwidth]{a}\n\\end{figure*}";
        let out = figure_layout(text).unwrap();
        assert!(out.contains("[!htbp]"));
        assert!(out.contains("width=0.85\\textwidth"));
        assert!(figure_layout(&out).is_none());
    }

    #[test]
    fn test_graphicspath_prefix() {
        let text = "\\graphicspath{ {./images/} }\n\\includegraphics[width=2cm]{images/a.png}\n\\includegraphics{images/b.png}\n\\includegraphics{other/c.png}";
        assert_eq!(
            graphicspath_prefix(text).unwrap(),
            "\\graphicspath{ {./images/} }\n\\includegraphics[width=2cm]{a.png}\n\\includegraphics{b.png}\n\\includegraphics{other/c.png}"
        );
    }

    #[test]
    fn test_graphicspath_absent() {
        assert!(graphicspath_prefix("\\includegraphics{images/b.png}").is_none());
    }
}
