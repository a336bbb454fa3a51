//! Source-tree helpers shared by the repair tiers: collecting the files a
//! prompt should show and writing proposed replacements back.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use ignore::WalkBuilder;
use regex::Regex;
use texmend_engine::DiagnosticError;
use tracing::warn;

/// Files at or above this size are left out of the comprehensive context.
pub const MAX_RELATED_FILE_BYTES: u64 = 50_000;

static INPUT_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(?:input|include)\{([^}]+)\}").unwrap());

/// Whether `name` is a plain relative path that stays inside its root.
pub fn is_contained(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Forward-slash relative name of `path` under `root`.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn read_into(files: &mut BTreeMap<String, String>, src_dir: &Path, name: &str) {
    if files.contains_key(name) || !is_contained(name) {
        return;
    }
    if let Ok(content) = fs::read_to_string(src_dir.join(name)) {
        files.insert(name.to_string(), content);
    }
}

/// Files named by `errors`, plus the main file.
pub fn collect_file_contents(
    src_dir: &Path,
    main_name: &str,
    errors: &[DiagnosticError],
) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for error in errors.iter().filter(|e| !e.file.is_empty()) {
        let name = error.file.trim_start_matches("./");
        read_into(&mut files, src_dir, name);
    }
    read_into(&mut files, src_dir, main_name);
    files
}

/// The main file, its `\input`/`\include` targets, and every other `.tex`
/// file under `src_dir` smaller than [`MAX_RELATED_FILE_BYTES`].
pub fn collect_all_related_files(src_dir: &Path, main_name: &str) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    read_into(&mut files, src_dir, main_name);

    let targets: Vec<String> = files
        .get(main_name)
        .map(|main| {
            INPUT_DIRECTIVE
                .captures_iter(main)
                .map(|c| {
                    let name = c[1].trim().to_string();
                    if name.ends_with(".tex") {
                        name
                    } else {
                        format!("{name}.tex")
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    for name in &targets {
        read_into(&mut files, src_dir, name);
    }

    for entry in WalkBuilder::new(src_dir)
        .hidden(true)
        .git_ignore(true)
        .build()
        .flatten()
    {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("tex") {
            continue;
        }
        let Some(name) = relative_name(src_dir, path) else {
            continue;
        };
        if files.contains_key(&name) {
            continue;
        }
        let small = entry
            .metadata()
            .map(|m| m.len() < MAX_RELATED_FILE_BYTES)
            .unwrap_or(false);
        if small {
            read_into(&mut files, src_dir, &name);
        }
    }
    files
}

/// Write whole-file replacements under `src_dir`. Names escaping the
/// directory and failed writes are skipped; the written names are returned.
pub fn write_fixes(src_dir: &Path, fixes: &BTreeMap<String, String>) -> Vec<String> {
    let mut written = Vec::new();
    for (name, content) in fixes {
        if !is_contained(name) {
            warn!(file = %name, "Refusing to write outside the source directory");
            continue;
        }
        let path: PathBuf = src_dir.join(name);
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(file = %name, error = %e, "Failed to create parent directory");
                continue;
            }
        }
        match fs::write(&path, content) {
            Ok(()) => written.push(name.clone()),
            Err(e) => warn!(file = %name, error = %e, "Failed to write fixed file"),
        }
    }
    written
}
