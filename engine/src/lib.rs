//! texmend engine
//!
//! The deterministic half of LaTeX compile-error recovery:
//! - [`analyzer`]: brace balance, environment counts, table scaffolding
//! - [`rules`]: the ordered, idempotent rule chain, plus repairs against a
//!   reference copy of the source
//! - [`compiler`]: the multi-pass compilation orchestrator
//! - [`classifier`]: log parsing and complexity tiers
//! - [`editor`]: encoding, line edits, backups, validation report
//!
//! Nothing in this crate talks to the network; the LLM and agent tiers live
//! in `texmend-agents`.

pub mod analyzer;
pub mod backoff;
pub mod classifier;
pub mod compiler;
pub mod editor;
pub mod error;
pub mod preprocess;
pub mod rules;
pub mod text;

pub use analyzer::{analyze, brace_balance, StructureReport};
pub use backoff::BackoffPolicy;
pub use classifier::{classify, parse_errors, ComplexityTier, DiagnosticError};
pub use compiler::{Compile, CompileResult, CompilerConfig, Engine, LatexCompiler};
pub use error::{CompileError, EditError, EditResult};
pub use preprocess::{preprocess_dir, preprocess_with_reference, PreprocessReport};
pub use rules::{FixOutcome, ReferenceOutcome, Rule, RuleChain};
