//! Autonomous agent tier.
//!
//! A bounded, strictly turn-based tool-calling loop. The backend sees the
//! running history and the profile's tools; every returned call is executed
//! in order and its result appended before the next backend call. A
//! `fix_complete` claim is only accepted after an independent compile.
//!
//! Every backend call, failed or not, consumes one step, so a session never
//! makes more backend calls than its step budget. A retriable failure is
//! paced by the backoff policy and retried on the next step.

pub mod profile;
pub mod sandbox;
pub mod tools;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use texmend_engine::classifier::extract_relevant_log_portion;
use texmend_engine::editor::BackupManager;
use texmend_engine::{BackoffPolicy, Compile, CompileResult};
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::llm::{ChatBackend, ChatMessage, ChatRequest, ToolCall};

pub use profile::AgentProfile;
pub use sandbox::sandbox_check;
pub use tools::{describe_compile, AgentTool, ToolContext, ToolKind};

/// Log excerpt handed to the agent in its first message.
pub const INITIAL_LOG_EXCERPT: usize = 4_000;

const STILL_FAILING: &str = "Compilation still fails. Please continue fixing.";

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTerminal {
    /// An independent compile succeeded.
    Success,
    /// The step budget ran out.
    Exhausted,
    /// The backend answered without tool calls.
    Stalled,
    /// The backend failed permanently, or on the last step.
    Error(String),
}

/// One executed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: String,
    pub result: String,
}

/// Conversation state of one agent run; dropped when the run ends.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub messages: Vec<ChatMessage>,
    pub step_budget: u32,
    pub steps_used: u32,
    pub terminal: Option<AgentTerminal>,
}

impl AgentSession {
    fn new(step_budget: u32, system: &str, user: String) -> Self {
        Self {
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            step_budget,
            steps_used: 0,
            terminal: None,
        }
    }

    fn has_budget(&self) -> bool {
        self.terminal.is_none() && self.steps_used < self.step_budget
    }
}

#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub files_changed: BTreeSet<String>,
    pub summary: String,
    /// Backend calls made.
    pub steps: u32,
    pub terminal: AgentTerminal,
    pub invocations: Vec<ToolInvocation>,
    /// Result of the last verification compile, if one ran.
    pub verification: Option<CompileResult>,
}

pub struct AgentFixer {
    backend: Arc<dyn ChatBackend>,
    compiler: Arc<dyn Compile>,
    model: String,
    profile: AgentProfile,
    backoff: BackoffPolicy,
    backups: BackupManager,
}

impl AgentFixer {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        compiler: Arc<dyn Compile>,
        model: impl Into<String>,
        profile: AgentProfile,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            backend,
            compiler,
            model: model.into(),
            profile,
            backoff,
            backups: BackupManager::default(),
        }
    }

    /// Backup collaborator used by the `create_backup` tool.
    pub fn with_backups(mut self, backups: BackupManager) -> Self {
        self.backups = backups;
        self
    }

    pub fn profile(&self) -> &AgentProfile {
        &self.profile
    }

    pub fn initial_message(main_name: &str, log: &str) -> String {
        format!(
            "Please fix the LaTeX compilation errors in this document.\n\n\
             Main file: {main_name}\n\n\
             Compilation log (relevant portion):\n```\n{}\n```\n\n\
             Start by listing the files and reading the main tex file to understand the document structure.",
            extract_relevant_log_portion(log, INITIAL_LOG_EXCERPT)
        )
    }

    /// Run one session against `main_file`. Only a context that cannot be
    /// set up is an error; backend failures end the session with
    /// [`AgentTerminal::Error`] so the files it changed are still reported.
    pub async fn run(
        &self,
        main_file: &Path,
        output_dir: &Path,
        log: &str,
        progress: &(dyn Fn(u32, &str) + Send + Sync),
    ) -> Result<AgentResult, ToolError> {
        let ctx = ToolContext::new(main_file, output_dir, Arc::clone(&self.compiler))?
            .with_backups(self.backups.clone());
        let main_name = ctx
            .main_file()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(
            profile = self.profile.name,
            main = %main_name,
            max_steps = self.profile.max_steps,
            "Starting agent session"
        );

        let mut session = AgentSession::new(
            self.profile.max_steps,
            self.profile.system_prompt,
            Self::initial_message(&main_name, log),
        );
        let tools = self.profile.tool_specs();
        let mut result = AgentResult {
            success: false,
            files_changed: BTreeSet::new(),
            summary: String::new(),
            steps: 0,
            terminal: AgentTerminal::Exhausted,
            invocations: Vec::new(),
            verification: None,
        };
        // Files written since the last verification compile.
        let mut dirty = false;
        let mut consecutive_failures = 0;

        while session.has_budget() {
            session.steps_used += 1;
            progress(
                session.steps_used,
                &format!("Agent step {}/{}", session.steps_used, session.step_budget),
            );

            let request = ChatRequest::new(&self.model, session.messages.clone()).with_tools(tools.clone());
            let response = match self.backend.chat(&request).await {
                Ok(response) => {
                    consecutive_failures = 0;
                    response
                }
                Err(e) if e.is_retriable() && session.has_budget() => {
                    consecutive_failures += 1;
                    let delay = self.backoff.delay_for(consecutive_failures);
                    warn!(
                        error = %e,
                        step = session.steps_used,
                        delay_ms = delay.as_millis() as u64,
                        "Agent backend call failed, retrying on the next step"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, step = session.steps_used, "Agent backend call failed");
                    session.terminal = Some(AgentTerminal::Error(e.to_string()));
                    break;
                }
            };

            if response.tool_calls.is_empty() {
                debug!(
                    content = %texmend_engine::text::head(&response.content, 200),
                    "Agent answered without tool calls"
                );
                session.terminal = Some(AgentTerminal::Stalled);
                break;
            }

            session.messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let output = self
                    .handle_call(&ctx, call, &mut session, &mut result, &mut dirty)
                    .await;
                result.invocations.push(ToolInvocation {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    result: output.clone(),
                });
                session.messages.push(ChatMessage::tool_result(&call.id, output));
                if session.terminal.is_some() {
                    break;
                }
            }
        }

        result.steps = session.steps_used;
        result.terminal = session.terminal.unwrap_or(AgentTerminal::Exhausted);

        if result.terminal != AgentTerminal::Success && dirty {
            let verification = ctx.verify().await;
            if verification.success {
                info!(profile = self.profile.name, "Final verification compile succeeded");
                result.terminal = AgentTerminal::Success;
                if result.summary.is_empty() {
                    result.summary = "Compilation succeeds after agent edits".to_string();
                }
            }
            result.verification = Some(verification);
        }

        result.success = result.terminal == AgentTerminal::Success;
        if !result.success && result.summary.is_empty() {
            result.summary = match &result.terminal {
                AgentTerminal::Stalled => "Agent stopped without calling any tool".to_string(),
                AgentTerminal::Error(e) => format!("Agent backend failed: {e}"),
                _ => "Agent reached maximum steps without fully resolving errors".to_string(),
            };
        }
        info!(
            profile = self.profile.name,
            success = result.success,
            steps = result.steps,
            files = result.files_changed.len(),
            "Agent session finished"
        );
        Ok(result)
    }

    async fn handle_call(
        &self,
        ctx: &ToolContext,
        call: &ToolCall,
        session: &mut AgentSession,
        result: &mut AgentResult,
        dirty: &mut bool,
    ) -> String {
        let tool = match AgentTool::decode(&call.name, &call.arguments) {
            Ok(tool) if self.profile.offers(tool.kind()) => tool,
            Ok(_) => return format!("Error: {}", ToolError::UnknownTool(call.name.clone())),
            Err(e) => return format!("Error: {e}"),
        };
        info!(tool = %call.name, step = session.steps_used, "Agent executing tool");

        if let AgentTool::FixComplete(args) = &tool {
            let verification = ctx.verify().await;
            *dirty = false;
            let accepted = verification.success;
            let reply = if accepted {
                result.summary = args.summary.clone();
                session.terminal = Some(AgentTerminal::Success);
                info!(summary = %args.summary, "Agent completion verified");
                "Compilation verified. Fix accepted.".to_string()
            } else {
                warn!("Agent claimed completion but compilation still fails");
                format!("{STILL_FAILING}\n\n{}", describe_compile(&verification))
            };
            result.verification = Some(verification);
            return reply;
        }

        match ctx.execute(&tool).await {
            Ok(output) => {
                if let Some(name) = tool.mutated_file() {
                    result
                        .files_changed
                        .insert(name.trim_start_matches("./").to_string());
                    *dirty = true;
                }
                output
            }
            Err(e) => {
                debug!(tool = %call.name, error = %e, "Tool failed");
                format!("Error: {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::llm::ChatResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use texmend_engine::CompileError;

    /// Replays canned responses, then repeats the last one.
    struct Scripted {
        responses: Mutex<VecDeque<ChatResponse>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut queue = self.responses.lock().unwrap();
            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap())
            } else {
                Ok(queue.front().cloned().unwrap_or_default())
            }
        }
    }

    /// Fails with a network error `failures` times, then lists files.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatBackend for Flaky {
        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ApiError::Network("connection reset".into()))
            } else {
                Ok(call("1", "list_files", "{}"))
            }
        }
    }

    /// Succeeds once the main file contains `needle`.
    struct Needle {
        needle: &'static str,
        compiles: AtomicU32,
    }

    #[async_trait]
    impl Compile for Needle {
        async fn compile(&self, main: &Path, _out: &Path) -> Result<CompileResult, CompileError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            let text = std::fs::read_to_string(main)?;
            if text.contains(self.needle) {
                Ok(CompileResult {
                    success: true,
                    ..CompileResult::default()
                })
            } else {
                Ok(CompileResult::failure("PDF file was not generated", "! Missing } inserted."))
            }
        }
    }

    fn call(id: &str, name: &str, args: &str) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: args.into(),
            }],
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<Needle>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.tex"), "broken\n").unwrap();
        let compiler = Arc::new(Needle {
            needle: "fixed",
            compiles: AtomicU32::new(0),
        });
        (dir, compiler)
    }

    fn fixer(backend: Arc<Scripted>, compiler: Arc<Needle>, profile: AgentProfile) -> AgentFixer {
        AgentFixer::new(backend, compiler, "m", profile, BackoffPolicy::immediate(1))
    }

    #[tokio::test]
    async fn test_completion_claim_rejected_until_compile_passes() {
        let (dir, compiler) = setup();
        let backend = Scripted::new(vec![
            call("1", "fix_complete", r#"{"summary": "done"}"#),
            call("2", "write_file", r#"{"filename": "main.tex", "content": "fixed\n"}"#),
            call("3", "fix_complete", r#"{"summary": "really done"}"#),
        ]);
        let agent = fixer(backend.clone(), compiler.clone(), AgentProfile::primary());
        let result = agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|_, _| {})
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.terminal, AgentTerminal::Success);
        assert_eq!(result.summary, "really done");
        assert_eq!(result.steps, 3);
        assert!(result.invocations[0].result.starts_with(STILL_FAILING));
        assert!(result.files_changed.contains("main.tex"));
        assert_eq!(compiler.compiles.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_budget_bounds_backend_calls() {
        let (dir, compiler) = setup();
        let backend = Scripted::new(vec![call("1", "list_files", "{}")]);
        let agent = fixer(
            backend.clone(),
            compiler.clone(),
            AgentProfile::primary().with_max_steps(4),
        );
        let result = agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|_, _| {})
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.terminal, AgentTerminal::Exhausted);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        // Nothing written, so no final verification.
        assert_eq!(compiler.compiles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dirty_tree_verified_once_at_the_end() {
        let (dir, compiler) = setup();
        let backend = Scripted::new(vec![
            call("1", "write_file", r#"{"filename": "main.tex", "content": "fixed\n"}"#),
            ChatResponse::text("I think that should do it."),
        ]);
        let agent = fixer(backend.clone(), compiler.clone(), AgentProfile::primary());
        let result = agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|_, _| {})
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.steps, 2);
        assert_eq!(compiler.compiles.load(Ordering::SeqCst), 1);
        assert!(result.verification.unwrap().success);
    }

    #[tokio::test]
    async fn test_tools_outside_profile_refused() {
        let (dir, compiler) = setup();
        let backend = Scripted::new(vec![
            call("1", "delete_line", r#"{"filename": "main.tex", "line_number": 1}"#),
            ChatResponse::text(""),
        ]);
        let agent = fixer(backend, compiler, AgentProfile::primary());
        let result = agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|_, _| {})
            .await
            .unwrap();

        assert_eq!(result.terminal, AgentTerminal::Stalled);
        assert!(result.invocations[0].result.starts_with("Error: Unknown tool"));
        assert_eq!(std::fs::read_to_string(dir.path().join("main.tex")).unwrap(), "broken\n");
    }

    #[tokio::test]
    async fn test_progress_reports_each_step() {
        let (dir, compiler) = setup();
        let backend = Scripted::new(vec![call("1", "list_files", "{}")]);
        let agent = fixer(backend, compiler, AgentProfile::tool_calling().with_max_steps(3));
        let seen = Mutex::new(Vec::new());
        agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|step, msg| {
                seen.lock().unwrap().push((step, msg.to_string()));
            })
            .await
            .unwrap();
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], (3, "Agent step 3/3".to_string()));
    }

    #[tokio::test]
    async fn test_transient_failures_consume_steps() {
        let (dir, compiler) = setup();
        let backend = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let agent = AgentFixer::new(
            backend.clone(),
            compiler,
            "m",
            AgentProfile::primary().with_max_steps(1),
            BackoffPolicy::immediate(3),
        );
        let result = agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|_, _| {})
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.steps, 1);
        assert!(matches!(result.terminal, AgentTerminal::Error(_)));
    }

    #[tokio::test]
    async fn test_transient_failure_retried_on_next_step() {
        let (dir, compiler) = setup();
        let backend = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let agent = AgentFixer::new(
            backend.clone(),
            compiler,
            "m",
            AgentProfile::primary().with_max_steps(3),
            BackoffPolicy::immediate(3),
        );
        let result = agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|_, _| {})
            .await
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.terminal, AgentTerminal::Exhausted);
        assert_eq!(result.invocations.len(), 1);
        assert_eq!(result.invocations[0].name, "list_files");
    }

    #[tokio::test]
    async fn test_create_backup_uses_configured_directory() {
        let (dir, compiler) = setup();
        let backup_dir = dir.path().join("snapshots");
        let backend = Scripted::new(vec![
            call("1", "create_backup", r#"{"filename": "main.tex"}"#),
            ChatResponse::text(""),
        ]);
        let agent = fixer(backend, compiler, AgentProfile::tool_calling())
            .with_backups(BackupManager::new(Some(backup_dir.clone())));
        let result = agent
            .run(&dir.path().join("main.tex"), &dir.path().join("out"), "", &|_, _| {})
            .await
            .unwrap();

        assert!(result.invocations[0].result.starts_with("Backup created: "));
        let saved: Vec<_> = std::fs::read_dir(&backup_dir).unwrap().collect();
        assert_eq!(saved.len(), 1);
    }
}
