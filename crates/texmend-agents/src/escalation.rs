//! Escalation controller
//!
//! Sequences the repair tiers for one failed compilation:
//!
//! ```text
//!  Start ──► Rule ──► LLM ──► Agent(primary ─► tool-calling ─► comprehensive) ──► Exhausted
//!    │                          ▲
//!    └── medium/high tier ──────┘
//! ```
//!
//! Every tier ends its attempts with a recompilation; only a compile that
//! produces the artifact counts as success. Fix records are appended after
//! each durable write and never retracted.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use texmend_engine::classifier::extract_relevant_log_portion;
use texmend_engine::editor::BackupManager;
use texmend_engine::{
    classify, parse_errors, Compile, CompileResult, ComplexityTier, DiagnosticError, RuleChain,
};
use tracing::{debug, info, warn};

use crate::agent::{AgentFixer, AgentProfile};
use crate::config::FixerConfig;
use crate::error::RecoveryError;
use crate::files::{collect_all_related_files, collect_file_contents, write_fixes};
use crate::fixer::{ComprehensiveFixer, FixProposal, LlmFixer};
use crate::llm::ChatBackend;

/// Rounds of rule fixing, each followed by a recompilation.
pub const MAX_RULE_ROUNDS: u32 = 2;
/// Single-shot whole-document attempts after both agent profiles fail.
pub const MAX_COMPREHENSIVE_ATTEMPTS: u32 = 2;
/// Log context attached to an error synthesized from an unparseable log.
const SYNTHETIC_CONTEXT: usize = 2_000;

/// Called with the active tier and a human-readable message.
pub type ProgressCallback = Arc<dyn Fn(FixLevel, &str) + Send + Sync>;

// ── Records ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixLevel {
    /// Nothing had to change
    None,
    Rule,
    Llm,
    Agent,
}

impl fmt::Display for FixLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Rule => write!(f, "rule"),
            Self::Llm => write!(f, "llm"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// Audit entry for one durable mutation of the source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRecord {
    pub level: FixLevel,
    pub description: String,
    pub files_changed: BTreeSet<String>,
    /// Attempt number within the tier, or agent steps for agent sessions
    pub iterations: u32,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a recovery session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalFixResult {
    pub success: bool,
    pub fixed_files: BTreeSet<String>,
    pub description: String,
    pub total_iterations: u32,
    pub rule_attempts: u32,
    pub llm_attempts: u32,
    pub agent_attempts: u32,
    /// Tier whose fix made the document compile
    pub final_fix_level: FixLevel,
    pub history: Vec<FixRecord>,
    /// Snapshot of the main file taken before the first mutation
    pub backup_path: Option<PathBuf>,
    pub initial_tier: ComplexityTier,
    /// The diagnostic log the session started from
    pub initial_log: String,
}

impl HierarchicalFixResult {
    pub fn new(initial_tier: ComplexityTier, initial_log: impl Into<String>) -> Self {
        Self {
            success: false,
            fixed_files: BTreeSet::new(),
            description: String::new(),
            total_iterations: 0,
            rule_attempts: 0,
            llm_attempts: 0,
            agent_attempts: 0,
            final_fix_level: FixLevel::None,
            history: Vec::new(),
            backup_path: None,
            initial_tier,
            initial_log: initial_log.into(),
        }
    }

    /// Every tier ran without producing a compiling document.
    pub fn exhausted(&self) -> bool {
        !self.success
    }

    pub fn into_outcome(self) -> Result<Self, RecoveryError> {
        if self.success {
            Ok(self)
        } else {
            Err(RecoveryError::BudgetExhausted(Box::new(self)))
        }
    }

    /// Levels that produced a record, in first-use order.
    pub fn levels_used(&self) -> Vec<FixLevel> {
        let mut levels = Vec::new();
        for record in &self.history {
            if !levels.contains(&record.level) {
                levels.push(record.level);
            }
        }
        levels
    }

    fn record<I>(&mut self, level: FixLevel, description: impl Into<String>, files: I, iterations: u32)
    where
        I: IntoIterator<Item = String>,
    {
        let files_changed: BTreeSet<String> = files.into_iter().collect();
        self.fixed_files.extend(files_changed.iter().cloned());
        self.history.push(FixRecord {
            level,
            description: description.into(),
            files_changed,
            iterations,
            timestamp: Utc::now(),
        });
    }

    fn succeed(&mut self, level: FixLevel, description: impl Into<String>) {
        self.success = true;
        self.final_fix_level = level;
        self.description = description.into();
    }
}

// ── Session state ─────────────────────────────────────────────────────

struct Session<'a> {
    main: &'a Path,
    out: &'a Path,
    src_dir: PathBuf,
    main_name: String,
    result: HierarchicalFixResult,
    log: String,
    errors: Vec<DiagnosticError>,
    last: Option<CompileResult>,
    backup_attempted: bool,
}

impl Session<'_> {
    fn read_main(&self) -> Result<String, RecoveryError> {
        fs::read_to_string(self.main).map_err(|source| RecoveryError::MainFileUnreadable {
            path: self.main.to_path_buf(),
            source,
        })
    }

    fn write_main(&self, text: &str) -> Result<(), RecoveryError> {
        fs::write(self.main, text).map_err(|source| RecoveryError::WriteFailed {
            path: self.main.to_path_buf(),
            source,
        })
    }

    /// Take in a compile result; returns whether it succeeded.
    fn absorb(&mut self, compiled: CompileResult) -> bool {
        let success = compiled.success;
        if !success {
            self.log = compiled.log.clone();
            self.errors = parse_errors(&self.log);
        }
        self.last = Some(compiled);
        success
    }
}

// ── Controller ────────────────────────────────────────────────────────

pub struct EscalationController {
    compiler: Arc<dyn Compile>,
    backend: Option<Arc<dyn ChatBackend>>,
    config: FixerConfig,
    rules: RuleChain,
    backups: BackupManager,
    primary: AgentProfile,
    fallback: AgentProfile,
    progress: Option<ProgressCallback>,
}

impl EscalationController {
    /// Rule tier only, until a backend is attached with [`Self::with_backend`].
    pub fn new(compiler: Arc<dyn Compile>, config: FixerConfig) -> Self {
        Self {
            compiler,
            backend: None,
            config,
            rules: RuleChain::standard(),
            backups: BackupManager::default(),
            primary: AgentProfile::primary(),
            fallback: AgentProfile::tool_calling(),
            progress: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ChatBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_rules(mut self, rules: RuleChain) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_backups(mut self, backups: BackupManager) -> Self {
        self.backups = backups;
        self
    }

    pub fn with_agent_profiles(mut self, primary: AgentProfile, fallback: AgentProfile) -> Self {
        self.primary = primary;
        self.fallback = fallback;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn agent_enabled(&self) -> bool {
        self.config.enable_agent && self.backend.is_some()
    }

    fn report(&self, level: FixLevel, message: &str) {
        debug!(%level, "{message}");
        if let Some(progress) = &self.progress {
            progress(level, message);
        }
    }

    /// Repair the document rooted at `main_file` after a compilation that
    /// produced `initial_log`. The returned compile result is the last one
    /// run; exhaustion is reported through the fix result, not as an error.
    pub async fn fix_and_compile(
        &self,
        main_file: &Path,
        output_dir: &Path,
        initial_log: &str,
    ) -> Result<(HierarchicalFixResult, CompileResult), RecoveryError> {
        let (errors, tier) = classify(initial_log);
        let mut session = Session {
            main: main_file,
            out: output_dir,
            src_dir: main_file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
            main_name: main_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            result: HierarchicalFixResult::new(tier, initial_log),
            log: initial_log.to_string(),
            errors,
            last: None,
            backup_attempted: false,
        };
        session.read_main()?;

        info!(
            main = %main_file.display(),
            errors = session.errors.len(),
            %tier,
            agent = self.agent_enabled(),
            "Starting hierarchical fix"
        );

        if !self.escalate(&mut session, tier).await? {
            warn!(
                iterations = session.result.total_iterations,
                fixes = session.result.history.len(),
                "All repair tiers exhausted"
            );
            if session.result.description.is_empty() {
                session.result.description = "All repair tiers exhausted without a successful compilation".to_string();
            }
        }

        let compiled = match session.last.take() {
            Some(compiled) => compiled,
            None => self.compiler.compile(main_file, output_dir).await?,
        };
        Ok((session.result, compiled))
    }

    async fn escalate(&self, s: &mut Session<'_>, tier: ComplexityTier) -> Result<bool, RecoveryError> {
        if tier.needs_agent() && self.agent_enabled() {
            info!(%tier, "Complex errors detected, going straight to the agent tier");
            self.report(
                FixLevel::Agent,
                &format!("{tier} complexity errors, using the agent tier directly"),
            );
            return self.agent_tier(s).await;
        }

        if self.rule_tier(s).await? || self.llm_tier(s).await? {
            return Ok(true);
        }

        if !self.agent_enabled() {
            info!("Agent tier disabled, stopping after the LLM tier");
            s.result.description =
                "Rule and LLM tiers did not resolve the errors; the agent tier is disabled".to_string();
            return Ok(false);
        }
        self.agent_tier(s).await
    }

    async fn recompile(&self, s: &mut Session<'_>) -> Result<bool, RecoveryError> {
        let compiled = self.compiler.compile(s.main, s.out).await?;
        Ok(s.absorb(compiled))
    }

    fn ensure_backup(&self, s: &mut Session<'_>) {
        if s.backup_attempted {
            return;
        }
        s.backup_attempted = true;
        match self.backups.create_backup(s.main) {
            Ok(path) => {
                info!(backup = %path.display(), "Backed up main file");
                s.result.backup_path = Some(path);
            }
            Err(e) => warn!(error = %e, "Failed to back up main file"),
        }
    }

    /// Errors to hand a model. With nothing parseable, compile once if that
    /// has not happened yet; `None` means the document already compiles.
    async fn current_errors(
        &self,
        s: &mut Session<'_>,
    ) -> Result<Option<Vec<DiagnosticError>>, RecoveryError> {
        if !s.errors.is_empty() {
            return Ok(Some(s.errors.clone()));
        }
        if s.last.is_none() && self.recompile(s).await? {
            return Ok(None);
        }
        if !s.errors.is_empty() {
            return Ok(Some(s.errors.clone()));
        }
        let message = s
            .last
            .as_ref()
            .and_then(|c| c.error_message.clone())
            .unwrap_or_else(|| "Compilation failed".to_string());
        Ok(Some(vec![DiagnosticError {
            file: s.main_name.clone(),
            line: 0,
            message,
            context: extract_relevant_log_portion(&s.log, SYNTHETIC_CONTEXT),
        }]))
    }

    /// Write a proposal; returns whether anything landed on disk.
    fn apply(&self, s: &mut Session<'_>, level: FixLevel, proposal: &FixProposal, attempt: u32) -> bool {
        self.ensure_backup(s);
        let written = write_fixes(&s.src_dir, &proposal.fixes);
        if written.is_empty() {
            warn!(%level, "No proposed file could be written");
            return false;
        }
        info!(%level, files = ?written, attempt, "Applied model fixes");
        s.result.record(level, proposal.description.clone(), written, attempt);
        true
    }

    fn already_compiles(&self, s: &mut Session<'_>) -> bool {
        info!("Document compiles without further changes");
        let level = s.result.history.last().map(|r| r.level).unwrap_or(FixLevel::None);
        s.result.succeed(level, "Document compiles without further changes");
        true
    }

    async fn rule_tier(&self, s: &mut Session<'_>) -> Result<bool, RecoveryError> {
        info!("Attempting rule-based fixes");
        for round in 1..=MAX_RULE_ROUNDS {
            s.result.rule_attempts += 1;
            s.result.total_iterations += 1;
            self.report(
                FixLevel::Rule,
                &format!("Rule-based fix round {round}/{MAX_RULE_ROUNDS}"),
            );

            let text = s.read_main()?;
            let outcome = self.rules.fix(&text);
            if !outcome.changed {
                debug!(round, "No rule applies");
                break;
            }
            self.ensure_backup(s);
            s.write_main(&outcome.text)?;

            let mut names: Vec<&str> = Vec::new();
            for &name in &outcome.applied {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
            info!(round, rules = ?names, "Applied rule-based fixes");
            s.result.record(
                FixLevel::Rule,
                format!("Applied rules: {}", names.join(", ")),
                [s.main_name.clone()],
                round,
            );

            if self.recompile(s).await? {
                info!("Compilation succeeded after rule-based fixes");
                s.result.succeed(FixLevel::Rule, "Rule-based fixes resolved the errors");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn llm_tier(&self, s: &mut Session<'_>) -> Result<bool, RecoveryError> {
        let Some(backend) = &self.backend else {
            info!("No chat backend configured, skipping the LLM tier");
            return Ok(false);
        };
        info!("Attempting LLM fixes");
        let fixer = LlmFixer::new(Arc::clone(backend), &self.config.model, self.config.backoff.clone());
        let max = self.config.max_retries.max(1);

        for attempt in 1..=max {
            s.result.llm_attempts += 1;
            s.result.total_iterations += 1;
            self.report(FixLevel::Llm, &format!("LLM fix attempt {attempt}/{max}"));

            let Some(errors) = self.current_errors(s).await? else {
                return Ok(self.already_compiles(s));
            };
            let files = collect_file_contents(&s.src_dir, &s.main_name, &errors);
            let proposal = match fixer.fix(&errors, &files).await {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(attempt, error = %e, category = %e.retry_category(), "LLM tier abandoned");
                    break;
                }
            };
            if proposal.is_empty() {
                warn!(attempt, description = %proposal.description, "LLM returned no fixes");
                continue;
            }
            if !self.apply(s, FixLevel::Llm, &proposal, attempt) {
                continue;
            }
            if self.recompile(s).await? {
                info!("Compilation succeeded after LLM fix");
                s.result.succeed(FixLevel::Llm, proposal.description);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn agent_tier(&self, s: &mut Session<'_>) -> Result<bool, RecoveryError> {
        let Some(backend) = &self.backend else {
            return Ok(false);
        };
        info!("Attempting agent fixes");
        self.ensure_backup(s);

        for profile in [self.primary.clone(), self.fallback.clone()] {
            let name = profile.name;
            self.report(FixLevel::Agent, &format!("Running the {name} agent"));
            let agent = AgentFixer::new(
                Arc::clone(backend),
                Arc::clone(&self.compiler),
                self.config.agent_model(),
                profile,
                self.config.backoff.clone(),
            )
            .with_backups(self.backups.clone());
            let run = match agent
                .run(s.main, s.out, &s.log, &|_, message| self.report(FixLevel::Agent, message))
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    warn!(profile = name, error = %e, "Agent session could not start");
                    continue;
                }
            };

            s.result.agent_attempts += run.steps;
            s.result.total_iterations += run.steps;
            if !run.files_changed.is_empty() {
                s.result.record(
                    FixLevel::Agent,
                    format!("{name} agent: {}", run.summary),
                    run.files_changed.iter().cloned(),
                    run.steps,
                );
            }
            if let Some(verification) = run.verification {
                s.absorb(verification);
            }
            if run.success {
                info!(profile = name, summary = %run.summary, "Compilation succeeded after agent fix");
                s.result.succeed(FixLevel::Agent, run.summary);
                return Ok(true);
            }
            info!(profile = name, terminal = ?run.terminal, "Agent did not resolve the errors");
        }

        self.comprehensive_attempts(s, backend).await
    }

    async fn comprehensive_attempts(
        &self,
        s: &mut Session<'_>,
        backend: &Arc<dyn ChatBackend>,
    ) -> Result<bool, RecoveryError> {
        let fixer = ComprehensiveFixer::new(
            Arc::clone(backend),
            self.config.agent_model(),
            self.config.backoff.clone(),
        );
        for attempt in 1..=MAX_COMPREHENSIVE_ATTEMPTS {
            s.result.agent_attempts += 1;
            s.result.total_iterations += 1;
            self.report(
                FixLevel::Agent,
                &format!("Comprehensive fix attempt {attempt}/{MAX_COMPREHENSIVE_ATTEMPTS}"),
            );

            let Some(errors) = self.current_errors(s).await? else {
                return Ok(self.already_compiles(s));
            };
            let files = collect_all_related_files(&s.src_dir, &s.main_name);
            let proposal = match fixer.fix(&errors, &files, &s.log).await {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(attempt, error = %e, "Comprehensive fixes abandoned");
                    break;
                }
            };
            if proposal.is_empty() {
                warn!(attempt, description = %proposal.description, "Comprehensive fixer returned no fixes");
                continue;
            }
            if !self.apply(s, FixLevel::Agent, &proposal, attempt) {
                continue;
            }
            if self.recompile(s).await? {
                info!("Compilation succeeded after comprehensive fix");
                s.result.succeed(FixLevel::Agent, proposal.description);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates_files() {
        let mut result = HierarchicalFixResult::new(ComplexityTier::Low, "log");
        result.record(FixLevel::Rule, "rules", ["main.tex".to_string()], 1);
        result.record(
            FixLevel::Llm,
            "llm",
            ["main.tex".to_string(), "a.tex".to_string()],
            1,
        );
        assert_eq!(result.history.len(), 2);
        assert_eq!(result.fixed_files.len(), 2);
        assert_eq!(result.levels_used(), vec![FixLevel::Rule, FixLevel::Llm]);
        assert!(result.exhausted());
    }

    #[test]
    fn test_into_outcome() {
        let mut result = HierarchicalFixResult::new(ComplexityTier::High, "log");
        result.total_iterations = 4;
        let err = result.clone().into_outcome().unwrap_err();
        assert_eq!(
            err.to_string(),
            "All repair tiers exhausted after 4 iterations (0 fixes applied)"
        );
        match err {
            RecoveryError::BudgetExhausted(inner) => assert_eq!(inner.initial_log, "log"),
            other => panic!("unexpected error: {other}"),
        }

        result.succeed(FixLevel::Rule, "ok");
        let ok = result.into_outcome().unwrap();
        assert_eq!(ok.final_fix_level, FixLevel::Rule);
    }

    #[test]
    fn test_fix_level_serde() {
        assert_eq!(serde_json::to_string(&FixLevel::Llm).unwrap(), "\"llm\"");
        assert_eq!(FixLevel::Agent.to_string(), "agent");
    }
}
