//! Bibliography handling between passes.
//!
//! Decides whether the bibliography processor must run, keeps auxiliary
//! files in sync between the output and source directories, and inlines a
//! precompiled `.bbl` when the markup points at `.bib` files that are not
//! shipped with the sources.

use regex::{Captures, Regex};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static BIBLIOGRAPHY_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([^%\n]*)\\bibliography\{([^}]+)\}[^\n]*").unwrap());

static BURL_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\ifx\s*\\burl\s*\\undefined\s*\\def\s*\\burl#1\{(?:[^{}]|\{[^{}]*\})*\}\s*\\fi")
        .unwrap()
});

const BURL_FALLBACK: &str = "\\ifx \\burl \\undefined
  \\ifx \\url \\undefined
    \\def \\burl#1{\\textsf{#1}}
  \\else
    \\def \\burl#1{\\url{#1}}
  \\fi
\\fi";

const THEBIBLIOGRAPHY: &str = "\\begin{thebibliography}";

/// True when the first pass recorded citations or bibliography data, or the
/// source directory ships a `.bib` file.
pub fn needs_bibliography(aux_path: &Path, src_dir: &Path) -> bool {
    if let Ok(aux) = fs::read_to_string(aux_path) {
        if aux.contains("\\citation{") || aux.contains("\\bibdata{") {
            debug!(aux = %aux_path.display(), "Citations recorded, bibliography pass needed");
            return true;
        }
    }
    has_extension_in(src_dir, "bib")
}

fn has_extension_in(dir: &Path, ext: &str) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .any(|e| e.path().extension().and_then(|x| x.to_str()) == Some(ext))
        })
        .unwrap_or(false)
}

/// Copy `name` from `from` into `to`. A missing source is not an error.
pub fn sync_file(from: &Path, to: &Path, name: &str) {
    if from == to {
        return;
    }
    let src = from.join(name);
    let Ok(content) = fs::read(&src) else {
        return;
    };
    if let Err(e) = fs::write(to.join(name), content) {
        warn!(file = name, error = %e, "Failed to sync auxiliary file");
    }
}

/// Replace the first uncommented `\bibliography{..}` after `\begin{document}`
/// with `bbl`, keeping whatever precedes the directive on its line.
///
/// Returns `None` when the text already carries a bibliography environment
/// or has no such directive.
pub fn inline_bibliography(text: &str, bbl: &str) -> Option<String> {
    if text.contains(THEBIBLIOGRAPHY) {
        return None;
    }
    let directive = BIBLIOGRAPHY_DIRECTIVE.find(text)?;
    if let Some(begin) = text.find("\\begin{document}") {
        if directive.start() < begin {
            debug!("Bibliography directive sits in the preamble, not inlining");
            return None;
        }
    }
    let bbl = with_burl_fallback(bbl);
    Some(
        BIBLIOGRAPHY_DIRECTIVE
            .replacen(text, 1, |caps: &Captures| format!("{}{}", &caps[1], bbl))
            .into_owned(),
    )
}

/// Make a `.bbl`-local `\burl` fall back to `\url`, which every engine has.
pub fn with_burl_fallback(bbl: &str) -> String {
    if !bbl.contains("\\burl") {
        return bbl.to_string();
    }
    BURL_DEFINITION
        .replace_all(bbl, regex::NoExpand(BURL_FALLBACK))
        .into_owned()
}

/// Inline a precompiled bibliography when the referenced `.bib` files are
/// missing from `src_dir`.
///
/// Candidates are `<base>.bbl`, `<bib>.bbl` for each referenced name, then
/// any `.bbl` in the directory; the first one holding a bibliography
/// environment wins.
pub fn inline_missing_bibliography(text: &str, src_dir: &Path, base: &str) -> Option<String> {
    if text.contains(THEBIBLIOGRAPHY) {
        return None;
    }
    let caps = BIBLIOGRAPHY_DIRECTIVE.captures(text)?;
    let names: Vec<&str> = caps[2]
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .collect();

    let all_present = names.iter().all(|name| {
        let file = if name.ends_with(".bib") {
            (*name).to_string()
        } else {
            format!("{name}.bib")
        };
        src_dir.join(file).exists()
    });
    if all_present {
        return None;
    }

    let mut candidates = vec![format!("{base}.bbl")];
    candidates.extend(
        names
            .iter()
            .map(|n| format!("{}.bbl", n.trim_end_matches(".bib"))),
    );
    if let Ok(entries) = fs::read_dir(src_dir) {
        let mut others: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| n.ends_with(".bbl"))
            .collect();
        others.sort();
        candidates.extend(others);
    }

    let bbl = candidates.iter().find_map(|name| {
        let content = fs::read_to_string(src_dir.join(name)).ok()?;
        content.contains(THEBIBLIOGRAPHY).then(|| {
            info!(bbl = %name, size = content.len(), "Inlining precompiled bibliography");
            content
        })
    });
    match bbl {
        Some(bbl) => inline_bibliography(text, &bbl),
        None => {
            warn!(dir = %src_dir.display(), "Bibliography source missing and no usable .bbl found");
            None
        }
    }
}
