//! Tree-wide rule pass run before the first compilation.

use crate::rules::RuleChain;
use ignore::WalkBuilder;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files seen and rewritten by [`preprocess_dir`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessReport {
    pub scanned: usize,
    pub fixed: Vec<PathBuf>,
}

/// Every `.tex` file under `root`, sorted. Hidden and git-ignored paths are
/// skipped.
pub fn tex_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .build()
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("tex"))
        })
        .collect();
    files.sort();
    files
}

/// Run the rule chain over the `.tex` files under `root` whose file name
/// starts with `prefix` (all of them when `prefix` is empty) and write back
/// the ones that changed. Unreadable or unwritable files are skipped.
pub fn preprocess_dir(root: &Path, prefix: &str, chain: &RuleChain) -> PreprocessReport {
    let mut report = PreprocessReport::default();
    for path in tex_files(root) {
        report.scanned += 1;
        let selected = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(prefix));
        if !selected {
            continue;
        }
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };
        let outcome = chain.fix(&text);
        if !outcome.changed {
            continue;
        }
        if let Err(e) = fs::write(&path, &outcome.text) {
            warn!(path = %path.display(), error = %e, "Failed to write fixed file");
            continue;
        }
        debug!(path = %path.display(), rules = ?outcome.applied, "Preprocessed");
        report.fixed.push(path);
    }
    info!(
        root = %root.display(),
        scanned = report.scanned,
        fixed = report.fixed.len(),
        "Preprocessing complete"
    );
    report
}

/// Like [`preprocess_dir`] over every `.tex` file, but each file is first
/// repaired against the file at the same relative path under
/// `reference_root` when one exists there.
pub fn preprocess_with_reference(
    root: &Path,
    reference_root: &Path,
    chain: &RuleChain,
) -> PreprocessReport {
    let mut report = PreprocessReport::default();
    for path in tex_files(root) {
        report.scanned += 1;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };
        let reference = path
            .strip_prefix(root)
            .ok()
            .map(|rel| reference_root.join(rel))
            .and_then(|p| fs::read_to_string(p).ok());
        let outcome = chain.fix_with_reference(&text, reference.as_deref());
        if !outcome.changed {
            continue;
        }
        if let Err(e) = fs::write(&path, &outcome.text) {
            warn!(path = %path.display(), error = %e, "Failed to write fixed file");
            continue;
        }
        debug!(
            path = %path.display(),
            rules = ?outcome.rules.applied,
            reference_fixes = outcome.fixes.len(),
            "Preprocessed"
        );
        report.fixed.push(path);
    }
    info!(
        root = %root.display(),
        reference = %reference_root.display(),
        scanned = report.scanned,
        fixed = report.fixed.len(),
        "Reference preprocessing complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_prefixed_files_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let broken = "\\bibliography{refs}\n\\bibliographystyle{plain}\n";
        fs::write(dir.path().join("translated_main.tex"), broken).unwrap();
        fs::write(dir.path().join("main.tex"), broken).unwrap();
        fs::create_dir(dir.path().join("sec")).unwrap();
        fs::write(dir.path().join("sec/translated_intro.tex"), broken).unwrap();
        fs::write(dir.path().join("translated_notes.txt"), broken).unwrap();

        let report = preprocess_dir(dir.path(), "translated_", &RuleChain::standard());
        assert_eq!(report.scanned, 3);
        assert_eq!(report.fixed.len(), 2);
        assert_eq!(fs::read_to_string(dir.path().join("main.tex")).unwrap(), broken);
        assert!(fs::read_to_string(dir.path().join("translated_main.tex"))
            .unwrap()
            .starts_with("\\bibliographystyle{plain}"));
    }

    #[test]
    fn test_empty_prefix_selects_all() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.tex"), "\\end{itemize}\\item x\n").unwrap();
        let report = preprocess_dir(dir.path(), "", &RuleChain::standard());
        assert_eq!(report.fixed.len(), 1);
    }

    #[test]
    fn test_reference_tree_guides_repair() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let original = dir.path().join("original");
        fs::create_dir_all(work.join("sec")).unwrap();
        fs::create_dir_all(original.join("sec")).unwrap();
        fs::write(
            original.join("sec/results.tex"),
            "\\caption{Runs with \\textbf{\\textit{n}}=64}\n",
        )
        .unwrap();
        fs::write(
            work.join("sec/results.tex"),
            "\\caption{运行 \\textbf{\\textit{n}=64}\n",
        )
        .unwrap();
        fs::write(work.join("extra.tex"), "clean\n").unwrap();

        let report = preprocess_with_reference(&work, &original, &RuleChain::standard());
        assert_eq!(report.scanned, 2);
        assert_eq!(report.fixed, vec![work.join("sec/results.tex")]);
        assert_eq!(
            fs::read_to_string(work.join("sec/results.tex")).unwrap(),
            "\\caption{运行 \\textbf{\\textit{n}}=64}\n"
        );
    }
}
