//! Multi-pass compilation orchestrator
//!
//! Runs the typesetting engine as a subprocess, decides whether a
//! bibliography pass is needed, keeps `.aux`/`.bbl` state in the source
//! directory when output goes elsewhere, and reports the outcome as a
//! [`CompileResult`].
//!
//! ```text
//! first pass ─┬─ citations / .bib ─► bibtex ─► second pass ─► third pass
//!             ├─ inlined .bbl ─────────────► second pass ─► third pass
//!             └─ otherwise ────────────────► second pass
//! ```
//!
//! Success means the artifact exists after the last pass. Exit codes are
//! logged but ignored: engines in nonstop mode exit non-zero on recoverable
//! errors and still produce output.

pub mod bibliography;
pub(crate) mod process;

use crate::error::CompileError;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use process::PassOutput;

/// Default deadline for one engine pass.
pub const DEFAULT_PASS_TIMEOUT_SECS: u64 = 300;
/// Default deadline for the bibliography processor.
pub const DEFAULT_BIBLIOGRAPHY_TIMEOUT_SECS: u64 = 120;

pub const NO_ARTIFACT_MESSAGE: &str = "PDF file was not generated";

static UNICODE_ENGINE_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:usepackage|RequirePackage)(?:\[[^\]]*\])?\{(?:fontspec|xeCJK|ctex)\}").unwrap()
});

// ── Engine selection ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Pdflatex,
    Xelatex,
    Lualatex,
}

impl Engine {
    pub fn program(self) -> &'static str {
        match self {
            Self::Pdflatex => "pdflatex",
            Self::Xelatex => "xelatex",
            Self::Lualatex => "lualatex",
        }
    }

    /// `xelatex` when the main file or a class file next to it loads a
    /// package that needs a Unicode engine, `pdflatex` otherwise.
    pub fn detect(main_file: &Path) -> Self {
        if fs::read_to_string(main_file).is_ok_and(|t| UNICODE_ENGINE_PACKAGE.is_match(&t)) {
            return Self::Xelatex;
        }
        let Some(dir) = main_file.parent() else {
            return Self::Pdflatex;
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return Self::Pdflatex;
        };
        let needs_unicode = entries.flatten().any(|e| {
            let path = e.path();
            path.extension().and_then(|x| x.to_str()) == Some("cls")
                && fs::read_to_string(&path).is_ok_and(|t| UNICODE_ENGINE_PACKAGE.is_match(&t))
        });
        if needs_unicode {
            debug!(dir = %dir.display(), "Class file requires a Unicode engine");
            Self::Xelatex
        } else {
            Self::Pdflatex
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for Engine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdflatex" => Ok(Self::Pdflatex),
            "xelatex" => Ok(Self::Xelatex),
            "lualatex" => Ok(Self::Lualatex),
            other => Err(format!("unknown engine '{other}' (expected pdflatex, xelatex or lualatex)")),
        }
    }
}

// ── Configuration ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Forced engine; detected from the sources when `None`.
    pub engine: Option<Engine>,
    /// Executable to run instead of the engine's own name.
    pub engine_program: Option<String>,
    pub bibtex_program: String,
    pub timeout_secs: u64,
    pub bibliography_timeout_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            engine: std::env::var("TEXMEND_ENGINE")
                .ok()
                .and_then(|s| s.parse().ok()),
            engine_program: None,
            bibtex_program: "bibtex".into(),
            timeout_secs: std::env::var("TEXMEND_COMPILE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PASS_TIMEOUT_SECS),
            bibliography_timeout_secs: DEFAULT_BIBLIOGRAPHY_TIMEOUT_SECS,
        }
    }
}

impl CompilerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn bibliography_timeout(&self) -> Duration {
        Duration::from_secs(self.bibliography_timeout_secs.max(1))
    }
}

// ── Results ───────────────────────────────────────────────────────────

/// Outcome of one full compilation. Replaced, never mutated, by the next run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompileResult {
    pub success: bool,
    pub artifact_path: Option<PathBuf>,
    /// Logs of every pass under `=== <Pass> ===` headers
    pub log: String,
    pub error_message: Option<String>,
    /// A subprocess hit its deadline
    pub timed_out: bool,
    pub engine_runs: u32,
    pub bibliography_runs: u32,
}

impl CompileResult {
    /// A failed result that never reached the engine.
    pub fn failure(message: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            log: log.into(),
            ..Self::default()
        }
    }
}

/// Anything that can turn a main file into an artifact.
#[async_trait]
pub trait Compile: Send + Sync {
    async fn compile(&self, main_file: &Path, output_dir: &Path)
        -> Result<CompileResult, CompileError>;
}

// ── LaTeX compiler ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LatexCompiler {
    config: CompilerConfig,
}

impl LatexCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn select_engine(&self, main_file: &Path) -> Engine {
        self.config.engine.unwrap_or_else(|| Engine::detect(main_file))
    }

    fn program_for(&self, engine: Engine) -> String {
        self.config
            .engine_program
            .clone()
            .unwrap_or_else(|| engine.program().to_string())
    }
}

/// Paths and accumulated logs of one compilation.
struct Run<'a> {
    config: &'a CompilerConfig,
    program: String,
    file_name: String,
    base: String,
    src_dir: PathBuf,
    out_dir: PathBuf,
    sections: Vec<String>,
    engine_runs: u32,
    bibliography_runs: u32,
    /// Deadline of the pass that timed out, if one did.
    expired: Option<Duration>,
}

impl Run<'_> {
    fn separate_output(&self) -> bool {
        self.src_dir != self.out_dir
    }

    fn record(&mut self, label: &str, output: PassOutput, deadline: Duration) -> bool {
        self.sections.push(format!("=== {label} ==="));
        self.sections.push(output.log);
        if output.timed_out {
            self.expired = Some(deadline);
            self.sections.push("=== Timeout ===".to_string());
            self.sections
                .push(format!("{label} did not finish within its deadline"));
            return false;
        }
        if let Some(code) = output.exit_code.filter(|c| *c != 0) {
            debug!(pass = label, code, "Non-zero exit");
        }
        true
    }

    async fn engine_pass(&mut self, label: &str) -> bool {
        let mut args = vec!["-interaction=nonstopmode".to_string()];
        if self.separate_output() {
            args.push(format!("-output-directory={}", self.out_dir.display()));
        }
        args.push(self.file_name.clone());
        let texinputs = process::search_path(&[Path::new("."), &self.src_dir]);

        debug!(pass = label, program = %self.program, "Engine pass");
        let deadline = self.config.timeout();
        let output = process::run(
            &self.program,
            &args,
            &self.src_dir,
            &[("TEXINPUTS", texinputs)],
            deadline,
        )
        .await;
        self.engine_runs += 1;
        let finished = self.record(label, output, deadline);
        bibliography::sync_file(&self.out_dir, &self.src_dir, &format!("{}.aux", self.base));
        finished
    }

    async fn bibliography_pass(&mut self) -> bool {
        let inputs = process::search_path(&[&self.src_dir, &self.out_dir]);
        debug!(program = %self.config.bibtex_program, "Bibliography pass");
        let deadline = self.config.bibliography_timeout();
        let output = process::run(
            &self.config.bibtex_program,
            std::slice::from_ref(&self.base),
            &self.out_dir,
            &[("BIBINPUTS", inputs.clone()), ("BSTINPUTS", inputs)],
            deadline,
        )
        .await;
        self.bibliography_runs += 1;
        let finished = self.record("BibTeX", output, deadline);
        bibliography::sync_file(&self.out_dir, &self.src_dir, &format!("{}.bbl", self.base));
        finished
    }

    fn finish(self) -> CompileResult {
        let artifact = self.out_dir.join(format!("{}.pdf", self.base));
        let log = self.sections.join("\n");
        let timed_out = self.expired.is_some();
        let produced = !timed_out && artifact.is_file();

        let error_message = if let Some(deadline) = self.expired {
            Some(format!("Compilation timed out after {}s", deadline.as_secs()))
        } else if !produced {
            Some(NO_ARTIFACT_MESSAGE.to_string())
        } else {
            None
        };

        if produced {
            info!(artifact = %artifact.display(), passes = self.engine_runs, "Compilation succeeded");
        } else {
            warn!(
                main = %self.file_name,
                passes = self.engine_runs,
                timed_out,
                "Compilation failed"
            );
        }

        CompileResult {
            success: produced,
            artifact_path: produced.then_some(artifact),
            log,
            error_message,
            timed_out,
            engine_runs: self.engine_runs,
            bibliography_runs: self.bibliography_runs,
        }
    }
}

#[async_trait]
impl Compile for LatexCompiler {
    async fn compile(
        &self,
        main_file: &Path,
        output_dir: &Path,
    ) -> Result<CompileResult, CompileError> {
        if !main_file.is_file() {
            return Err(CompileError::main_file_not_found(main_file));
        }
        let main_file = fs::canonicalize(main_file)?;
        let (Some(src_dir), Some(file_name), Some(base)) = (
            main_file.parent(),
            main_file.file_name().and_then(|n| n.to_str()),
            main_file.file_stem().and_then(|n| n.to_str()),
        ) else {
            return Err(CompileError::invalid_main_file(&main_file));
        };

        fs::create_dir_all(output_dir).map_err(|source| CompileError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let out_dir = fs::canonicalize(output_dir)?;

        let engine = self.select_engine(&main_file);
        info!(
            main = %main_file.display(),
            output = %out_dir.display(),
            %engine,
            "Compiling"
        );

        let mut run = Run {
            config: &self.config,
            program: self.program_for(engine),
            file_name: file_name.to_string(),
            base: base.to_string(),
            src_dir: src_dir.to_path_buf(),
            out_dir,
            sections: Vec::new(),
            engine_runs: 0,
            bibliography_runs: 0,
            expired: None,
        };

        // A stale artifact would make a failed run look successful.
        let artifact = run.out_dir.join(format!("{}.pdf", run.base));
        if artifact.exists() {
            fs::remove_file(&artifact)?;
        }

        if run.separate_output() {
            let aux = run.src_dir.join(format!("{}.aux", run.base));
            if !aux.exists() {
                if let Err(e) = fs::write(&aux, "\\relax \n") {
                    warn!(error = %e, "Failed to seed empty .aux in source dir");
                }
            }
        }

        let mut inlined = false;
        let text = fs::read_to_string(&main_file)?;
        if let Some(fixed) = bibliography::inline_missing_bibliography(&text, &run.src_dir, &run.base)
        {
            fs::write(&main_file, fixed)?;
            info!(main = %main_file.display(), "Inlined precompiled bibliography");
            inlined = true;
        }

        if !run.engine_pass("First Pass").await {
            return Ok(run.finish());
        }

        let aux = run.out_dir.join(format!("{}.aux", run.base));
        let bibtex = !inlined && bibliography::needs_bibliography(&aux, &run.src_dir);
        if bibtex && !run.bibliography_pass().await {
            return Ok(run.finish());
        }

        let remaining: &[&str] = if bibtex || inlined {
            &["Second Pass", "Third Pass"]
        } else {
            &["Second Pass"]
        };
        for label in remaining {
            if !run.engine_pass(label).await {
                break;
            }
        }

        Ok(run.finish())
    }
}
