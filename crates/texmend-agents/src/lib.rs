//! texmend agents
//!
//! The model-backed half of LaTeX compile-error recovery:
//! - [`llm`]: chat-completion backend trait and the HTTP client
//! - [`fixer`]: single-shot LLM and comprehensive repairs
//! - [`agent`]: the bounded tool-calling agent loop
//! - [`escalation`]: the controller that sequences rule, LLM and agent tiers
//!
//! The deterministic tiers and the compiler live in `texmend-engine`.

pub mod agent;
pub mod config;
pub mod error;
pub mod escalation;
pub mod files;
pub mod fixer;
pub mod llm;

pub use agent::{AgentFixer, AgentProfile, AgentResult, AgentTerminal};
pub use config::{AppConfig, FixerConfig};
pub use error::{ApiError, RecoveryError, RetryCategory, ToolError};
pub use escalation::{EscalationController, FixLevel, FixRecord, HierarchicalFixResult, ProgressCallback};
pub use llm::{ChatBackend, OpenAiClient};
