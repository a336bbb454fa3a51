//! Same-line adjacency splits.
//!
//! Translation passes tend to glue tags together on one line. These rules
//! only ever insert newlines between two tokens on the same physical line, so
//! they never change brace or environment counts.

use super::replace_in_code;
use regex::Regex;
use std::sync::LazyLock;

static END_LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\end\{(?:itemize|enumerate|description)\})[ \t]*(\\item\b)").unwrap()
});

static END_BEGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\end\{[^}]+\})[ \t]*(\\begin\{[^}]+\})").unwrap());

static END_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\end\{[^}]+\})[ \t]*(\\(?:chapter|section|subsection|subsubsection|paragraph)\b)")
        .unwrap()
});

static TEXT_BEFORE_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^\s{])[ \t]*(\\begin\{(?:itemize|enumerate|description)\})").unwrap()
});

static LIST_END_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\end\{(?:itemize|enumerate|description)\})[ \t]*([^\s\\%}])").unwrap()
});

pub(crate) fn end_list_item(text: &str) -> Option<String> {
    replace_in_code(&END_LIST_ITEM, text, "$1\n$2")
}

pub(crate) fn end_begin(text: &str) -> Option<String> {
    replace_in_code(&END_BEGIN, text, "$1\n$2")
}

pub(crate) fn end_section(text: &str) -> Option<String> {
    replace_in_code(&END_SECTION, text, "$1\n\n$2")
}

pub(crate) fn text_before_list(text: &str) -> Option<String> {
    replace_in_code(&TEXT_BEFORE_LIST, text, "$1\n$2")
}

pub(crate) fn list_end_text(text: &str) -> Option<String> {
    replace_in_code(&LIST_END_TEXT, text, "$1\n$2")
}
