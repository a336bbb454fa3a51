//! Path confinement for agent tools.

use std::path::{Path, PathBuf};

use crate::error::ToolError;

/// Resolve `relative_path` under `root` and make sure the result stays
/// inside it. Paths that do not exist yet are resolved through their parent
/// so writes can create new files.
pub fn sandbox_check(root: &Path, relative_path: &str) -> Result<PathBuf, ToolError> {
    if relative_path.trim().is_empty() {
        return Err(ToolError::Sandbox(relative_path.to_string()));
    }
    let candidate = root.join(relative_path);
    let resolved = candidate.canonicalize().or_else(|_| {
        let parent = candidate
            .parent()
            .ok_or_else(|| ToolError::Sandbox(relative_path.to_string()))?;
        let name = candidate
            .file_name()
            .ok_or_else(|| ToolError::Sandbox(relative_path.to_string()))?;
        Ok::<_, ToolError>(parent.canonicalize()?.join(name))
    })?;

    let canon_root = root.canonicalize()?;
    if !resolved.starts_with(&canon_root) {
        return Err(ToolError::Sandbox(relative_path.to_string()));
    }
    Ok(resolved)
}
