//! Error taxonomy for the model-backed repair tiers.
//!
//! API failures carry a [`RetryCategory`] so the controller can decide
//! whether to back off and retry or abandon the tier, without string
//! matching on messages.
//!
//! | Category   | Retriable | Source                                    |
//! |------------|-----------|-------------------------------------------|
//! | Transient  | yes       | network, 5xx, malformed or empty response |
//! | RateLimit  | yes       | HTTP 429                                  |
//! | Permanent  | no        | auth, bad request, missing key            |

use std::fmt;
use std::path::PathBuf;

use texmend_engine::{CompileError, EditError};
use thiserror::Error;

use crate::escalation::HierarchicalFixResult;

/// Classification used by the repair tiers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network or backend hiccup; safe to retry after a delay.
    Transient,
    /// Provider rate limit; retry after a delay.
    RateLimit,
    /// Retrying the same request cannot succeed; abandon the tier.
    Permanent,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failures talking to the language-model backend.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No API key configured")]
    MissingApiKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited (HTTP 429): {body}")]
    RateLimited { body: String },

    #[error("Server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("Authentication rejected (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("Request rejected (HTTP {status}): {body}")]
    BadRequest { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Response contained no choices")]
    NoChoices,
}

impl ApiError {
    /// Map a non-success HTTP status to its error variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => Self::RateLimited { body },
            401 | 403 => Self::Auth { status, body },
            400..=499 => Self::BadRequest { status, body },
            _ => Self::Server { status, body },
        }
    }

    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Network(_) | Self::Server { .. } | Self::Malformed(_) | Self::NoChoices => {
                RetryCategory::Transient
            }
            Self::RateLimited { .. } => RetryCategory::RateLimit,
            Self::MissingApiKey | Self::Auth { .. } | Self::BadRequest { .. } => {
                RetryCategory::Permanent
            }
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Failures executing one agent tool call. They are reported back to the
/// model as the tool's result and never abort the loop.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Path `{0}` escapes the source directory")]
    Sandbox(String),

    #[error("Invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn invalid_arguments(tool: &str, message: impl fmt::Display) -> Self {
        Self::InvalidArguments {
            tool: tool.to_string(),
            message: message.to_string(),
        }
    }
}

/// Fatal conditions of a recovery session.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Failed to read main file {path}: {source}")]
    MainFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(
        "All repair tiers exhausted after {} iterations ({} fixes applied)",
        .0.total_iterations,
        .0.history.len()
    )]
    BudgetExhausted(Box<HierarchicalFixResult>),
}
