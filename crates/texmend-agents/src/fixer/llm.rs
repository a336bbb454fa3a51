//! LLM tier: one prompt with the parsed errors and the implicated files.

use std::collections::BTreeMap;
use std::sync::Arc;

use texmend_engine::{BackoffPolicy, DiagnosticError};
use tracing::info;

use super::{render_errors, render_files, request_proposal, FixProposal};
use crate::error::ApiError;
use crate::llm::ChatBackend;

/// Files above this many bytes are shown as head and tail only.
pub const FILE_LIMIT: usize = 15_000;
/// Bytes kept from each end of a truncated file.
pub const FILE_KEEP: usize = 7_500;

const SYSTEM_PROMPT: &str = r#"You are a LaTeX expert. Your task is to fix LaTeX compilation errors.

IMPORTANT RULES:
1. Analyze the error messages and file contents carefully.
2. Return ONLY the fixed file contents in the specified JSON format.
3. Do NOT add any explanations outside the JSON.
4. Preserve all content - only fix the errors, don't remove or change other content.
5. Common fixes include:
   - Adding missing \end{...} or \begin{...} commands
   - Fixing mismatched braces
   - Ensuring \item commands are on separate lines from \end{itemize}
   - Fixing "Lonely \item" errors by ensuring proper list environment structure
   - Adding missing packages

OUTPUT FORMAT (JSON only):
{
  "fixes": {
    "filename.tex": "full fixed content of the file"
  },
  "description": "brief description of what was fixed"
}

If you cannot fix the error, return:
{
  "fixes": {},
  "description": "explanation of why it cannot be fixed"
}"#;

/// Stateless single-shot fixer; every call is independent.
pub struct LlmFixer {
    backend: Arc<dyn ChatBackend>,
    model: String,
    backoff: BackoffPolicy,
}

impl LlmFixer {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            backend,
            model: model.into(),
            backoff,
        }
    }

    pub fn build_prompt(errors: &[DiagnosticError], files: &BTreeMap<String, String>) -> String {
        let mut prompt = String::from("Please fix the following LaTeX compilation errors:\n\n=== ERRORS ===\n");
        render_errors(&mut prompt, errors);
        prompt.push_str("\n=== FILE CONTENTS ===\n");
        render_files(
            &mut prompt,
            files,
            FILE_LIMIT,
            FILE_KEEP,
            "[File truncated, showing relevant sections]\n",
            "\n...[truncated]...\n",
        );
        prompt.push_str("\n\nPlease provide the fixed file contents in JSON format.");
        prompt
    }

    pub async fn fix(
        &self,
        errors: &[DiagnosticError],
        files: &BTreeMap<String, String>,
    ) -> Result<FixProposal, ApiError> {
        info!(
            model = %self.model,
            errors = errors.len(),
            files = files.len(),
            "Requesting LLM fix"
        );
        let prompt = Self::build_prompt(errors, files);
        request_proposal(
            self.backend.as_ref(),
            &self.model,
            SYSTEM_PROMPT,
            prompt,
            &self.backoff,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_lists_errors_and_files() {
        let errors = vec![DiagnosticError {
            file: "main.tex".into(),
            line: 12,
            message: "Lonely \\item--perhaps a missing list environment.".into(),
            context: "l.12 \\item".into(),
        }];
        let mut files = BTreeMap::new();
        files.insert("main.tex".to_string(), "\\begin{document}".to_string());

        let prompt = LlmFixer::build_prompt(&errors, &files);
        assert!(prompt.contains("Error 1:\nFile: main.tex\nLine: 12\n"));
        assert!(prompt.contains("Context:\nl.12 \\item"));
        assert!(prompt.contains("--- main.tex ---\n\\begin{document}"));
        assert!(prompt.ends_with("in JSON format."));
    }

    #[test]
    fn test_prompt_truncates_large_files() {
        let mut files = BTreeMap::new();
        let content = format!("{}{}{}", "h".repeat(FILE_KEEP), "m".repeat(1000), "t".repeat(FILE_KEEP));
        files.insert("big.tex".to_string(), content);
        let prompt = LlmFixer::build_prompt(&[], &files);
        assert!(prompt.contains("[File truncated, showing relevant sections]"));
        assert!(prompt.contains("...[truncated]..."));
        assert!(!prompt.contains(&"m".repeat(10)));
    }
}
