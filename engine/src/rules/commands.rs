//! Command-name repairs.

use regex::Regex;
use std::sync::LazyLock;

/// Command names that came back from a translation pass in Chinese.
const TRANSLATED_COMMANDS: &[(&str, &str)] = &[
    ("\\引用", "\\cite"),
    ("\\参考", "\\ref"),
    ("\\标签", "\\label"),
    ("\\章节", "\\section"),
    ("\\小节", "\\subsection"),
    ("\\段落", "\\paragraph"),
    ("\\图", "\\figure"),
    ("\\表", "\\table"),
    ("\\公式", "\\equation"),
    ("\\开始", "\\begin"),
    ("\\结束", "\\end"),
    ("\\文本", "\\text"),
    ("\\粗体", "\\textbf"),
    ("\\斜体", "\\textit"),
    ("\\下划线", "\\underline"),
    ("\\脚注", "\\footnote"),
    ("\\项目", "\\item"),
];

static TRUNCATED_END_DOCUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\end\{document([^}a-zA-Z*]|\z)").unwrap());

pub(crate) fn translated_commands(text: &str) -> Option<String> {
    if !TRANSLATED_COMMANDS.iter().any(|(from, _)| text.contains(from)) {
        return None;
    }
    let mut out = text.to_string();
    for (from, to) in TRANSLATED_COMMANDS {
        if out.contains(from) {
            out = out.replace(from, to);
        }
    }
    Some(out)
}

pub(crate) fn incomplete_end_document(text: &str) -> Option<String> {
    if !TRUNCATED_END_DOCUMENT.is_match(text) {
        return None;
    }
    Some(
        TRUNCATED_END_DOCUMENT
            .replace_all(text, "\\end{document}${1}")
            .into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translated_commands() {
        let out = translated_commands("见\\引用{knuth}，\\粗体{重要}").unwrap();
        assert_eq!(out, "见\\cite{knuth}，\\textbf{重要}");
    }

    #[test]
    fn test_translated_environment_tags() {
        let out = translated_commands("\\开始{itemize}\n\\项目 a\n\\结束{itemize}").unwrap();
        assert_eq!(out, "\\begin{itemize}\n\\item a\n\\end{itemize}");
    }

    #[test]
    fn test_no_translated_commands() {
        assert!(translated_commands("\\cite{a} 中文正文").is_none());
    }

    #[test]
    fn test_truncated_end_document() {
        assert_eq!(
            incomplete_end_document("text\n\\end{document\n").unwrap(),
            "text\n\\end{document}\n"
        );
        assert_eq!(
            incomplete_end_document("text\n\\end{document").unwrap(),
            "text\n\\end{document}"
        );
        assert!(incomplete_end_document("\\end{document}\n").is_none());
    }
}
