//! Controller behaviour against a scripted chat backend and a fake compiler.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use texmend_agents::llm::{ChatRequest, ChatResponse, ToolCall};
use texmend_agents::{
    ApiError, ChatBackend, EscalationController, FixLevel, FixerConfig, RecoveryError,
};
use texmend_engine::{BackoffPolicy, Compile, CompileError, CompileResult, RuleChain};

const HIGH_LOG: &str = "(./main.tex\n! Emergency stop.\n<*> main.tex\n";
const MEDIUM_LOG: &str = "(./main.tex\n! Undefined control sequence.\nl.5 \\foo\n";
const LOW_LOG: &str = "(./main.tex\n! LaTeX Error: File `foo.sty' not found.\nl.2 \\usepackage{foo}\n";

const LONELY_ITEM: &str = "\\documentclass{article}\n\\begin{document}\n\\begin{itemize}\n\\item a\n\\end{itemize}\\item b\n\\end{document}\n";

// ── Fakes ─────────────────────────────────────────────────────────────

type Handler = dyn Fn(&ChatRequest, u32) -> Result<ChatResponse, ApiError> + Send + Sync;

struct ScriptedBackend {
    handler: Box<Handler>,
    calls: AtomicU32,
}

impl ScriptedBackend {
    fn new(
        handler: impl Fn(&ChatRequest, u32) -> Result<ChatResponse, ApiError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ApiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.handler)(request, n)
    }
}

/// Succeeds when the main file satisfies `accept`.
struct FakeCompiler {
    accept: fn(&str) -> bool,
    failure_log: &'static str,
    compiles: AtomicU32,
}

impl FakeCompiler {
    fn new(accept: fn(&str) -> bool, failure_log: &'static str) -> Arc<Self> {
        Arc::new(Self {
            accept,
            failure_log,
            compiles: AtomicU32::new(0),
        })
    }

    fn compiles(&self) -> u32 {
        self.compiles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compile for FakeCompiler {
    async fn compile(&self, main: &Path, out: &Path) -> Result<CompileResult, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let text = fs::read_to_string(main)?;
        if (self.accept)(&text) {
            Ok(CompileResult {
                success: true,
                artifact_path: Some(out.join("main.pdf")),
                engine_runs: 2,
                ..CompileResult::default()
            })
        } else {
            Ok(CompileResult::failure("PDF file was not generated", self.failure_log))
        }
    }
}

fn contains_fixed(text: &str) -> bool {
    text.contains("fixed")
}

fn no_lonely_item(text: &str) -> bool {
    !text.contains("\\end{itemize}\\item")
}

fn tool_call(id: &str, name: &str, arguments: &str) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }],
    }
}

fn proposal(content: &str, description: &str) -> ChatResponse {
    ChatResponse::text(
        serde_json::json!({"fixes": {"main.tex": content}, "description": description}).to_string(),
    )
}

fn config(enable_agent: bool) -> FixerConfig {
    FixerConfig {
        api_key: "test".into(),
        enable_agent,
        max_retries: 2,
        backoff: BackoffPolicy::immediate(1),
        ..FixerConfig::default()
    }
}

fn document(text: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.tex");
    fs::write(&main, text).unwrap();
    (dir, main)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_high_tier_goes_straight_to_agent() {
    let (dir, main) = document(LONELY_ITEM);
    let compiler = FakeCompiler::new(contains_fixed, HIGH_LOG);
    let backend = ScriptedBackend::new(|request, n| {
        assert!(!request.tools.is_empty(), "only the agent should be consulted");
        Ok(match n {
            0 => tool_call("1", "write_file", r#"{"filename": "main.tex", "content": "fixed\n"}"#),
            _ => tool_call("2", "fix_complete", r#"{"summary": "rewrote the list"}"#),
        })
    });
    let controller = EscalationController::new(compiler.clone(), config(true)).with_backend(backend.clone());

    let (result, compiled) = controller
        .fix_and_compile(&main, &dir.path().join("out"), HIGH_LOG)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.final_fix_level, FixLevel::Agent);
    assert_eq!(result.rule_attempts, 0);
    assert_eq!(result.llm_attempts, 0);
    assert_eq!(result.levels_used(), vec![FixLevel::Agent]);
    assert_eq!(result.description, "rewrote the list");
    assert!(compiled.success);
    assert_eq!(backend.calls(), 2);
    // The completion claim is the only verification needed.
    assert_eq!(compiler.compiles(), 1);
    assert!(result.backup_path.as_ref().is_some_and(|p| p.exists()));
}

#[tokio::test]
async fn test_low_tier_fixed_by_rules() {
    let (dir, main) = document(LONELY_ITEM);
    let compiler = FakeCompiler::new(no_lonely_item, LOW_LOG);
    let controller = EscalationController::new(compiler.clone(), config(true));

    let (result, compiled) = controller
        .fix_and_compile(&main, &dir.path().join("out"), LOW_LOG)
        .await
        .unwrap();

    assert!(result.success);
    assert!(compiled.success);
    assert_eq!(result.final_fix_level, FixLevel::Rule);
    assert_eq!(result.rule_attempts, 1);
    assert_eq!(result.history.len(), 1);
    assert!(result.history[0].description.starts_with("Applied rules:"));
    assert!(result.fixed_files.contains("main.tex"));

    let backup = result.backup_path.unwrap();
    assert_eq!(fs::read_to_string(backup).unwrap(), LONELY_ITEM);
}

#[tokio::test]
async fn test_medium_tier_without_agent_uses_rules() {
    let (dir, main) = document(LONELY_ITEM);
    let compiler = FakeCompiler::new(no_lonely_item, MEDIUM_LOG);
    let controller = EscalationController::new(compiler, config(false));

    let (result, _) = controller
        .fix_and_compile(&main, &dir.path().join("out"), MEDIUM_LOG)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.final_fix_level, FixLevel::Rule);
}

#[tokio::test]
async fn test_llm_tier_applies_whole_file_fix() {
    let (dir, main) = document("\\documentclass{article}\n\\usepackage{foo}\n\\begin{document}\nx\n\\end{document}\n");
    let compiler = FakeCompiler::new(contains_fixed, LOW_LOG);
    let backend = ScriptedBackend::new(|request, _| {
        assert!(request.tools.is_empty());
        let prompt = &request.messages[1].content;
        assert!(prompt.contains("File `foo.sty' not found."));
        assert!(prompt.contains("--- main.tex ---"));
        Ok(proposal("fixed\n", "removed missing package"))
    });
    let controller = EscalationController::new(compiler.clone(), config(false))
        .with_backend(backend.clone())
        .with_rules(RuleChain::from_rules(Vec::new()));

    let (result, _) = controller
        .fix_and_compile(&main, &dir.path().join("out"), LOW_LOG)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.final_fix_level, FixLevel::Llm);
    assert_eq!(result.llm_attempts, 1);
    assert_eq!(result.description, "removed missing package");
    assert_eq!(fs::read_to_string(&main).unwrap(), "fixed\n");
    assert_eq!(backend.calls(), 1);
    assert_eq!(compiler.compiles(), 1);
}

#[tokio::test]
async fn test_permanent_api_error_abandons_tier() {
    let (dir, main) = document("\\documentclass{article}\n\\begin{document}\nx\n\\end{document}\n");
    let compiler = FakeCompiler::new(contains_fixed, LOW_LOG);
    let backend = ScriptedBackend::new(|_, _| Err(ApiError::from_status(401, "invalid key")));
    let controller = EscalationController::new(compiler.clone(), config(false))
        .with_backend(backend.clone())
        .with_rules(RuleChain::from_rules(Vec::new()));

    let (result, compiled) = controller
        .fix_and_compile(&main, &dir.path().join("out"), LOW_LOG)
        .await
        .unwrap();

    assert!(result.exhausted());
    assert!(!compiled.success);
    assert_eq!(result.llm_attempts, 1);
    assert_eq!(backend.calls(), 1);
    assert!(result.description.contains("agent tier is disabled"));
    assert_eq!(result.initial_log, LOW_LOG);
    // Nothing was compiled during the session, so one final compile runs.
    assert_eq!(compiler.compiles(), 1);
    assert!(matches!(
        result.into_outcome(),
        Err(RecoveryError::BudgetExhausted(_))
    ));
}

#[tokio::test]
async fn test_agent_fallback_chain_reaches_comprehensive_fixer() {
    let (dir, main) = document("\\documentclass{article}\n\\begin{document}\nx\n");
    let compiler = FakeCompiler::new(contains_fixed, HIGH_LOG);
    let backend = ScriptedBackend::new(|request, _| {
        if request.tools.is_empty() {
            assert!(request.messages[1]
                .content
                .contains("=== COMPILATION LOG (relevant portion) ==="));
            Ok(proposal("fixed\n", "closed the document"))
        } else {
            Ok(ChatResponse::text("I am not sure what to do."))
        }
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let controller = EscalationController::new(compiler.clone(), config(true))
        .with_backend(backend.clone())
        .with_progress(Arc::new(move |level: FixLevel, message: &str| {
            sink.lock().unwrap().push((level, message.to_string()));
        }));

    let (result, _) = controller
        .fix_and_compile(&main, &dir.path().join("out"), HIGH_LOG)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.final_fix_level, FixLevel::Agent);
    assert_eq!(result.description, "closed the document");
    // One stalled step per agent profile, then one comprehensive attempt.
    assert_eq!(result.agent_attempts, 3);
    assert_eq!(backend.calls(), 3);
    assert_eq!(compiler.compiles(), 1);
    assert_eq!(result.history.len(), 1);

    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|(level, _)| *level == FixLevel::Agent));
    assert!(seen.iter().any(|(_, m)| m == "Running the tool-calling agent"));
    assert!(seen.iter().any(|(_, m)| m == "Comprehensive fix attempt 1/2"));
}

#[tokio::test]
async fn test_agent_exhaustion_is_bounded() {
    let (dir, main) = document("\\documentclass{article}\n\\begin{document}\nx\n");
    let compiler = FakeCompiler::new(contains_fixed, HIGH_LOG);
    let backend = ScriptedBackend::new(|request, n| {
        if request.tools.is_empty() {
            Ok(ChatResponse::text(r#"{"fixes": {}, "description": "cannot fix"}"#))
        } else {
            Ok(tool_call(&n.to_string(), "list_files", "{}"))
        }
    });
    let controller = EscalationController::new(compiler.clone(), config(true))
        .with_backend(backend.clone())
        .with_agent_profiles(
            texmend_agents::AgentProfile::primary().with_max_steps(3),
            texmend_agents::AgentProfile::tool_calling().with_max_steps(2),
        );

    let (result, compiled) = controller
        .fix_and_compile(&main, &dir.path().join("out"), HIGH_LOG)
        .await
        .unwrap();

    assert!(result.exhausted());
    assert!(!compiled.success);
    assert_eq!(backend.calls(), 3 + 2 + 2);
    assert_eq!(result.agent_attempts, 3 + 2 + 2);
    assert!(result.history.is_empty());
    assert_eq!(compiler.compiles(), 1);
}

#[tokio::test]
async fn test_unreadable_main_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let compiler = FakeCompiler::new(contains_fixed, LOW_LOG);
    let controller = EscalationController::new(compiler, config(false));
    let err = controller
        .fix_and_compile(&dir.path().join("missing.tex"), dir.path(), LOW_LOG)
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::MainFileUnreadable { .. }));
}
