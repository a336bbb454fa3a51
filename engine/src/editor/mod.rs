//! File-level collaborators used by the repair tiers: encoding normalisation,
//! line edits, backups and the structural validation report.

pub mod backup;
pub mod encoding;
pub mod lines;
pub mod validator;

pub use backup::BackupManager;
pub use encoding::{detect_encoding, ensure_utf8, Encoding};
pub use lines::{count_lines, delete_line, insert_line, read_lines, replace_line, search_lines};
pub use validator::{validate, validate_file, Issue, IssueKind, ValidationReport};
