//! Timestamped file snapshots.
//!
//! Backups are named `<file>.backup_<YYYYmmdd_HHMMSS>` and live next to the
//! original unless a backup directory is configured. Restoring is always the
//! caller's decision.

use crate::error::{EditError, EditResult};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BACKUP_MARKER: &str = ".backup_";

#[derive(Debug, Clone, Default)]
pub struct BackupManager {
    backup_dir: Option<PathBuf>,
}

impl BackupManager {
    pub fn new(backup_dir: Option<PathBuf>) -> Self {
        Self { backup_dir }
    }

    fn dir_for(&self, path: &Path) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    fn prefix_for(path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{name}{BACKUP_MARKER}")
    }

    /// Copy `path` to a fresh backup file and return the backup's path.
    pub fn create_backup(&self, path: &Path) -> EditResult<PathBuf> {
        if !path.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file does not exist: {}", path.display()),
            )
            .into());
        }
        let dir = self.dir_for(path);
        fs::create_dir_all(&dir)?;

        let stem = format!(
            "{}{}",
            Self::prefix_for(path),
            Local::now().format("%Y%m%d_%H%M%S")
        );
        // Same-second snapshots get a counter suffix instead of overwriting.
        let mut backup = dir.join(&stem);
        let mut n = 1;
        while backup.exists() {
            backup = dir.join(format!("{stem}_{n}"));
            n += 1;
        }

        fs::copy(path, &backup)?;
        info!(original = %path.display(), backup = %backup.display(), "Backup created");
        Ok(backup)
    }

    pub fn restore(&self, backup: &Path, original: &Path) -> EditResult<()> {
        if !backup.is_file() {
            return Err(EditError::NoBackup {
                path: backup.to_path_buf(),
            });
        }
        fs::copy(backup, original)?;
        info!(original = %original.display(), backup = %backup.display(), "Restored from backup");
        Ok(())
    }

    /// Backups of `path`, newest first.
    pub fn list_backups(&self, path: &Path) -> EditResult<Vec<PathBuf>> {
        let dir = self.dir_for(path);
        let prefix = Self::prefix_for(path);
        let mut backups: Vec<PathBuf> = fs::read_dir(&dir)?
            .flatten()
            .filter(|e| e.path().is_file())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .collect();
        backups.sort_by_cached_key(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            std::cmp::Reverse(order_key(&name[prefix.len()..]))
        });
        debug!(path = %path.display(), count = backups.len(), "Listed backups");
        Ok(backups)
    }

    pub fn latest_backup(&self, path: &Path) -> EditResult<PathBuf> {
        self.list_backups(path)?
            .into_iter()
            .next()
            .ok_or_else(|| EditError::NoBackup {
                path: path.to_path_buf(),
            })
    }
}

/// `(timestamp, counter)` for a backup suffix such as `20260101_120000_2`.
fn order_key(suffix: &str) -> (String, u32) {
    let mut parts = suffix.splitn(3, '_');
    let date = parts.next().unwrap_or_default();
    let time = parts.next().unwrap_or_default();
    let counter = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
    (format!("{date}_{time}"), counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.tex");
        fs::write(&file, "original").unwrap();

        let manager = BackupManager::default();
        let backup = manager.create_backup(&file).unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("main.tex.backup_"));

        fs::write(&file, "mangled").unwrap();
        manager.restore(&backup, &file).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "original");
    }

    #[test]
    fn test_latest_backup_is_newest() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.tex");
        fs::write(&file, "v1").unwrap();
        let manager = BackupManager::default();
        manager.create_backup(&file).unwrap();
        fs::write(&file, "v2").unwrap();
        let second = manager.create_backup(&file).unwrap();

        assert_eq!(manager.list_backups(&file).unwrap().len(), 2);
        assert_eq!(manager.latest_backup(&file).unwrap(), second);
    }

    #[test]
    fn test_backup_dir_and_missing_backup() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.tex");
        fs::write(&file, "x").unwrap();
        let manager = BackupManager::new(Some(dir.path().join("backups")));
        assert!(matches!(
            manager.latest_backup(&file),
            Err(EditError::Io(_))
        ));
        let backup = manager.create_backup(&file).unwrap();
        assert!(backup.starts_with(dir.path().join("backups")));
        assert!(matches!(
            manager.restore(&dir.path().join("nope"), &file),
            Err(EditError::NoBackup { .. })
        ));
    }

    #[test]
    fn test_backup_of_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BackupManager::default()
            .create_backup(&dir.path().join("absent.tex"))
            .is_err());
    }
}
