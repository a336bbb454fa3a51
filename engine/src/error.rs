//! Engine error types
//!
//! Compilation failures and timeouts are outcomes, not errors: they are
//! captured in [`crate::compiler::CompileResult`]. The errors here cover the
//! cases where a compile or an edit could not even be attempted.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for file-editing operations
pub type EditResult<T> = Result<T, EditError>;

/// Errors that prevent a compilation attempt from starting.
#[derive(Error, Debug)]
pub enum CompileError {
    /// Main source file does not exist
    #[error("Main file not found: {path}")]
    MainFileNotFound { path: PathBuf },

    /// Main source path has no usable file stem
    #[error("Invalid main file path: {path}")]
    InvalidMainFile { path: PathBuf },

    /// Output directory could not be created
    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub fn main_file_not_found(path: impl Into<PathBuf>) -> Self {
        Self::MainFileNotFound { path: path.into() }
    }

    pub fn invalid_main_file(path: impl Into<PathBuf>) -> Self {
        Self::InvalidMainFile { path: path.into() }
    }
}

/// Errors from the file-editing collaborators.
#[derive(Error, Debug)]
pub enum EditError {
    /// Requested line is outside the file
    #[error("Line {line} out of range (file has {total} lines)")]
    LineOutOfRange { line: usize, total: usize },

    /// Requested line range is inverted
    #[error("Invalid line range {start}-{end}")]
    InvalidRange { start: usize, end: usize },

    /// No backup exists for the file
    #[error("No backup found for {path}")]
    NoBackup { path: PathBuf },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CompileError::main_file_not_found("/tmp/main.tex");
        assert_eq!(err.to_string(), "Main file not found: /tmp/main.tex");

        let err = EditError::LineOutOfRange { line: 12, total: 10 };
        assert_eq!(err.to_string(), "Line 12 out of range (file has 10 lines)");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EditError = io.into();
        assert!(matches!(err, EditError::Io(_)));
    }
}
