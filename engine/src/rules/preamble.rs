//! Preamble and bibliography directive repairs.

use regex::Regex;
use std::sync::LazyLock;

static BIBLIOGRAPHY_BEFORE_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\bibliography\{([^}]+)\}\s*\\bibliographystyle\{([^}]+)\}").unwrap()
});

static XELATEX_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\usepackage(?:\[[^\]]*\])?\{(?:ctex|xeCJK)\}").unwrap()
});

static SUBFIGURE_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\usepackage(?:\[[^\]]*\])?\{subfigure\}[ \t]*\n?").unwrap());

static SUBCAPTION_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\usepackage(?:\[[^\]]*\])?\{subcaption\}").unwrap());

pub(crate) const BREAKURL_MARKER: &str = "% breakurl compatibility under xelatex";

/// Stand-ins for the `\pdf@` primitives breakurl expects, plus a `\burl`
/// that falls back to `\url`.
const BREAKURL_SHIM: &str = r"% breakurl compatibility under xelatex
\makeatletter
\@ifundefined{pdf@box}{%
  \newsavebox{\pdf@box}%
}{}
\@ifundefined{pdf@addtoksx}{%
  \def\pdf@addtoksx#1{}%
}{}
\@ifundefined{headerps@out}{%
  \def\headerps@out#1{}%
}{}
\@ifundefined{burl@stx}{%
  \def\burl@stx{}%
}{}
\@ifundefined{burl@etx}{%
  \def\burl@etx{}%
}{}
\@ifundefined{burl}{%
  \newcommand{\burl}[1]{\url{#1}}%
}{%
  \renewcommand{\burl}[1]{\url{#1}}%
}
\makeatother

";

pub(crate) fn bibliography_order(text: &str) -> Option<String> {
    if !BIBLIOGRAPHY_BEFORE_STYLE.is_match(text) {
        return None;
    }
    Some(
        BIBLIOGRAPHY_BEFORE_STYLE
            .replace_all(text, "\\bibliographystyle{${2}}\n\\bibliography{${1}}")
            .into_owned(),
    )
}

pub(crate) fn breakurl_xelatex(text: &str) -> Option<String> {
    if text.contains(BREAKURL_MARKER) || !XELATEX_PACKAGE.is_match(text) {
        return None;
    }
    let pos = text.find("\\begin{document}")?;
    let mut out = String::with_capacity(text.len() + BREAKURL_SHIM.len() + 1);
    out.push_str(&text[..pos]);
    if pos > 0 && !text[..pos].ends_with('\n') {
        out.push('\n');
    }
    out.push_str(BREAKURL_SHIM);
    out.push_str(&text[pos..]);
    Some(out)
}

pub(crate) fn subfigure_conflict(text: &str) -> Option<String> {
    if !SUBFIGURE_PACKAGE.is_match(text) || !SUBCAPTION_PACKAGE.is_match(text) {
        return None;
    }
    Some(SUBFIGURE_PACKAGE.replace_all(text, "").into_owned())
}
