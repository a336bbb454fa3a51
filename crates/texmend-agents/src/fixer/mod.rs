//! Single-shot model repairs: the model sees errors and whole files and
//! answers with whole-file replacements.

pub mod comprehensive;
pub mod llm;

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use texmend_engine::text::truncate_middle;
use texmend_engine::{BackoffPolicy, DiagnosticError};
use tracing::debug;

use crate::error::ApiError;
use crate::llm::{extract_json, ChatBackend, ChatMessage, ChatRequest};

pub use comprehensive::ComprehensiveFixer;
pub use llm::LlmFixer;

/// Replacement files proposed by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixProposal {
    #[serde(default)]
    pub fixes: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
}

impl FixProposal {
    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }
}

/// Decode the model's answer, tolerating prose and code fences around it.
pub fn parse_proposal(content: &str) -> Result<FixProposal, ApiError> {
    serde_json::from_str(extract_json(content)).map_err(|e| {
        debug!(content = %texmend_engine::text::head(content, 500), "Unparseable fix proposal");
        ApiError::Malformed(format!("fix proposal: {e}"))
    })
}

/// Numbered error list used by both prompt styles.
pub(crate) fn render_errors(out: &mut String, errors: &[DiagnosticError]) {
    for (i, err) in errors.iter().enumerate() {
        let _ = write!(
            out,
            "\nError {}:\nFile: {}\nLine: {}\nMessage: {}\n",
            i + 1,
            err.file,
            err.line,
            err.message
        );
        if !err.context.is_empty() {
            let _ = writeln!(out, "Context:\n{}", err.context);
        }
    }
}

/// `--- name ---` sections, with files over `limit` bytes cut to their
/// first and last `keep` bytes.
pub(crate) fn render_files(
    out: &mut String,
    files: &BTreeMap<String, String>,
    limit: usize,
    keep: usize,
    notice: &str,
    marker: &str,
) {
    for (name, content) in files {
        let _ = writeln!(out, "\n--- {name} ---");
        match truncate_middle(content, limit, keep, marker) {
            Some(cut) => {
                out.push_str(notice);
                out.push_str(&cut);
            }
            None => out.push_str(content),
        }
    }
}

/// One request/response round trip. Transport and parse failures are
/// retried under `backoff`.
pub(crate) async fn request_proposal(
    backend: &dyn ChatBackend,
    model: &str,
    system: &str,
    user: String,
    backoff: &BackoffPolicy,
) -> Result<FixProposal, ApiError> {
    let request = ChatRequest::new(
        model,
        vec![ChatMessage::system(system), ChatMessage::user(user)],
    );
    let request = &request;
    backoff
        .retry(
            |_| async move {
                let response = backend.chat(request).await?;
                parse_proposal(&response.content)
            },
            ApiError::is_retriable,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> ApiError,
    }

    #[async_trait]
    impl ChatBackend for Flaky {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err((self.error)())
            } else {
                Ok(ChatResponse::text(r#"{"fixes": {}, "description": "ok"}"#))
            }
        }
    }

    async fn propose(backend: &Flaky) -> Result<FixProposal, ApiError> {
        request_proposal(backend, "m", "sys", "hi".into(), &BackoffPolicy::immediate(3)).await
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let backend = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            error: || ApiError::Network("reset".into()),
        };
        let proposal = propose(&backend).await.unwrap();
        assert_eq!(proposal.description, "ok");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let backend = Flaky {
            failures: 5,
            calls: AtomicU32::new(0),
            error: || ApiError::from_status(401, "bad key"),
        };
        let err = propose(&backend).await.unwrap_err();
        assert!(matches!(err, ApiError::Auth { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_bounded() {
        let backend = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: || ApiError::from_status(429, ""),
        };
        let err = propose(&backend).await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited { .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_parse_proposal_fenced() {
        let content = "```json\n{\"fixes\": {\"main.tex\": \"\\\\begin{document}\"}, \"description\": \"closed env\"}\n```";
        let proposal = parse_proposal(content).unwrap();
        assert_eq!(proposal.fixes["main.tex"], "\\begin{document}");
        assert_eq!(proposal.description, "closed env");
        assert!(proposal.analysis.is_none());
    }

    #[test]
    fn test_parse_proposal_empty_fixes() {
        let proposal =
            parse_proposal("{\"fixes\": {}, \"description\": \"cannot fix\"}").unwrap();
        assert!(proposal.is_empty());
    }

    #[test]
    fn test_parse_proposal_garbage() {
        assert!(matches!(parse_proposal("I am sorry."), Err(ApiError::Malformed(_))));
    }

    #[test]
    fn test_render_files_truncates_middle() {
        let mut files = BTreeMap::new();
        files.insert("big.tex".to_string(), format!("{}{}", "a".repeat(30), "b".repeat(30)));
        files.insert("small.tex".to_string(), "tiny".to_string());
        let mut out = String::new();
        render_files(&mut out, &files, 50, 10, "[cut]\n", "\n...\n");
        assert!(out.contains("--- big.tex ---\n[cut]\naaaaaaaaaa\n...\nbbbbbbbbbb"));
        assert!(out.contains("--- small.tex ---\ntiny"));
    }
}
