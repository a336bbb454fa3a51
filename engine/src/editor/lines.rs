//! 1-based line editing primitives.
//!
//! Files are rewritten whole with a trailing newline; a line number past the
//! end is an [`EditError::LineOutOfRange`].

use crate::error::{EditError, EditResult};
use std::fs;
use std::path::Path;
use tracing::debug;

fn read_all(path: &Path) -> EditResult<Vec<String>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::to_string)
        .collect())
}

fn write_all(path: &Path, lines: &[String]) -> EditResult<()> {
    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(path, out)?;
    Ok(())
}

fn check_line(line: usize, total: usize) -> EditResult<()> {
    if line == 0 || line > total {
        return Err(EditError::LineOutOfRange { line, total });
    }
    Ok(())
}

pub fn count_lines(path: &Path) -> EditResult<usize> {
    Ok(read_all(path)?.len())
}

/// Lines `start..=end`; `end == None` reads to the end of the file.
pub fn read_lines(path: &Path, start: usize, end: Option<usize>) -> EditResult<Vec<String>> {
    let lines = read_all(path)?;
    let end = end.unwrap_or(lines.len()).min(lines.len());
    if start == 0 {
        return Err(EditError::LineOutOfRange {
            line: 0,
            total: lines.len(),
        });
    }
    if start > end {
        if start > lines.len() {
            return Err(EditError::LineOutOfRange {
                line: start,
                total: lines.len(),
            });
        }
        return Err(EditError::InvalidRange { start, end });
    }
    Ok(lines[start - 1..end].to_vec())
}

pub fn replace_line(path: &Path, line: usize, content: &str) -> EditResult<()> {
    let mut lines = read_all(path)?;
    check_line(line, lines.len())?;
    lines[line - 1] = content.to_string();
    debug!(path = %path.display(), line, "Replaced line");
    write_all(path, &lines)
}

/// Insert before `line`; `line == count + 1` appends.
pub fn insert_line(path: &Path, line: usize, content: &str) -> EditResult<()> {
    let mut lines = read_all(path)?;
    check_line(line, lines.len() + 1)?;
    lines.insert(line - 1, content.to_string());
    debug!(path = %path.display(), line, "Inserted line");
    write_all(path, &lines)
}

pub fn delete_line(path: &Path, line: usize) -> EditResult<()> {
    let mut lines = read_all(path)?;
    check_line(line, lines.len())?;
    lines.remove(line - 1);
    debug!(path = %path.display(), line, "Deleted line");
    write_all(path, &lines)
}

/// 1-based numbers of lines containing `needle`.
pub fn search_lines(path: &Path, needle: &str) -> EditResult<Vec<usize>> {
    Ok(read_all(path)?
        .iter()
        .enumerate()
        .filter(|(_, l)| l.contains(needle))
        .map(|(i, _)| i + 1)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tex");
        fs::write(&path, "one\ntwo\nthree\n").unwrap();
        (dir, path)
    }

    #[test]
    fn test_read_range() {
        let (_dir, path) = sample();
        assert_eq!(read_lines(&path, 2, Some(3)).unwrap(), vec!["two", "three"]);
        assert_eq!(read_lines(&path, 2, None).unwrap(), vec!["two", "three"]);
        assert_eq!(read_lines(&path, 1, Some(99)).unwrap().len(), 3);
        assert!(matches!(
            read_lines(&path, 5, None),
            Err(EditError::LineOutOfRange { line: 5, total: 3 })
        ));
        assert!(matches!(
            read_lines(&path, 3, Some(2)),
            Err(EditError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_replace_insert_delete() {
        let (_dir, path) = sample();
        replace_line(&path, 2, "TWO").unwrap();
        insert_line(&path, 1, "zero").unwrap();
        insert_line(&path, 5, "four").unwrap();
        delete_line(&path, 4).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "zero\none\nTWO\nfour\n");
    }

    #[test]
    fn test_out_of_range_edits() {
        let (_dir, path) = sample();
        assert!(replace_line(&path, 4, "x").is_err());
        assert!(insert_line(&path, 5, "x").is_err());
        assert!(delete_line(&path, 0).is_err());
        assert_eq!(count_lines(&path).unwrap(), 3);
    }

    #[test]
    fn test_search_lines() {
        let (_dir, path) = sample();
        assert_eq!(search_lines(&path, "t").unwrap(), vec![2, 3]);
    }
}
