//! Last-resort single-shot repair with the whole document in context: the
//! main file, its included files, the error list and a log excerpt.

use std::collections::BTreeMap;
use std::sync::Arc;

use texmend_engine::classifier::extract_relevant_log_portion;
use texmend_engine::{BackoffPolicy, DiagnosticError};
use tracing::info;

use super::{render_errors, render_files, request_proposal, FixProposal};
use crate::error::ApiError;
use crate::llm::ChatBackend;

pub const FILE_LIMIT: usize = 20_000;
pub const FILE_KEEP: usize = 10_000;
/// Size of the log excerpt included in the prompt.
pub const LOG_EXCERPT: usize = 3_000;

const SYSTEM_PROMPT: &str = r#"You are an expert LaTeX debugging agent. Your task is to analyze and fix complex LaTeX compilation errors that simpler fixes couldn't resolve.

ANALYSIS APPROACH:
1. First, understand the document structure by examining all provided files
2. Identify the root cause of each error, not just the symptoms
3. Consider interactions between files (e.g., \input, \include)
4. Check for package conflicts, missing dependencies, or encoding issues
5. Look for corrupted LaTeX command names

COMMON COMPLEX ISSUES:
- Nested environment mismatches across multiple files
- Package conflicts (especially with CJK/ctex packages)
- Encoding issues with non-ASCII text
- Corrupted LaTeX commands
- Missing or incorrect package options
- Cross-reference issues between files

FIX STRATEGY:
1. Make minimal changes to fix the errors
2. Preserve all document content
3. Keep existing language and font support intact
4. Fix all related issues, not just the first error
5. Consider the document as a whole, not just individual files

OUTPUT FORMAT (JSON only):
{
  "analysis": "Brief analysis of the root cause",
  "fixes": {
    "filename.tex": "full fixed content of the file"
  },
  "description": "Summary of all fixes applied"
}

If you cannot fix the error, return:
{
  "analysis": "Explanation of why the error cannot be fixed",
  "fixes": {},
  "description": "Suggested manual intervention"
}"#;

pub struct ComprehensiveFixer {
    backend: Arc<dyn ChatBackend>,
    model: String,
    backoff: BackoffPolicy,
}

impl ComprehensiveFixer {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            backend,
            model: model.into(),
            backoff,
        }
    }

    pub fn build_prompt(
        errors: &[DiagnosticError],
        files: &BTreeMap<String, String>,
        log: &str,
    ) -> String {
        let mut prompt = String::from(
            "Please analyze and fix the following LaTeX compilation errors.\n\n=== COMPILATION ERRORS ===\n",
        );
        render_errors(&mut prompt, errors);
        prompt.push_str("\n=== COMPILATION LOG (relevant portion) ===\n");
        prompt.push_str(&extract_relevant_log_portion(log, LOG_EXCERPT));
        prompt.push_str("\n\n=== FILE CONTENTS ===\n");
        render_files(
            &mut prompt,
            files,
            FILE_LIMIT,
            FILE_KEEP,
            "[File truncated for size]\n",
            "\n...[middle truncated]...\n",
        );
        prompt.push_str("\n\nPlease provide your analysis and fixes in JSON format.");
        prompt
    }

    pub async fn fix(
        &self,
        errors: &[DiagnosticError],
        files: &BTreeMap<String, String>,
        log: &str,
    ) -> Result<FixProposal, ApiError> {
        info!(model = %self.model, files = files.len(), "Requesting comprehensive fix");
        let proposal = request_proposal(
            self.backend.as_ref(),
            &self.model,
            SYSTEM_PROMPT,
            Self::build_prompt(errors, files, log),
            &self.backoff,
        )
        .await?;
        if let Some(analysis) = &proposal.analysis {
            info!(%analysis, "Comprehensive analysis");
        }
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_sections() {
        let mut files = BTreeMap::new();
        files.insert("main.tex".to_string(), "\\input{a}".to_string());
        files.insert("a.tex".to_string(), "body".to_string());
        let log = "(./main.tex\n! Emergency stop.\n";
        let prompt = ComprehensiveFixer::build_prompt(&[], &files, log);

        let errors_at = prompt.find("=== COMPILATION ERRORS ===").unwrap();
        let log_at = prompt.find("=== COMPILATION LOG (relevant portion) ===").unwrap();
        let files_at = prompt.find("=== FILE CONTENTS ===").unwrap();
        assert!(errors_at < log_at && log_at < files_at);
        assert!(prompt.contains("! Emergency stop."));
        assert!(prompt.contains("--- a.tex ---\nbody"));
    }

    #[test]
    fn test_large_file_cut_to_head_and_tail() {
        let mut files = BTreeMap::new();
        files.insert("big.tex".to_string(), "x".repeat(FILE_LIMIT + 1));
        let prompt = ComprehensiveFixer::build_prompt(&[], &files, "");
        assert!(prompt.contains("[File truncated for size]"));
        assert!(prompt.contains("...[middle truncated]..."));
    }
}
