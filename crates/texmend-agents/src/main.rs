//! `texmend`: compile LaTeX documents and repair them when compilation fails.
//!
//! # Usage
//!
//! ```bash
//! # Compile only
//! texmend compile paper/main.tex --output-dir build
//!
//! # Compile, and run the repair tiers on failure
//! TEXMEND_API_KEY=... texmend fix paper/main.tex --output-dir build
//!
//! # Offline helpers
//! texmend rules paper/section.tex --write
//! texmend rules translated/main.tex --reference original/main.tex
//! texmend analyze paper/main.tex
//! texmend classify build/main.log
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use texmend_agents::{AppConfig, EscalationController, FixLevel, OpenAiClient};
use texmend_engine::classifier::extract_relevant_log_portion;
use texmend_engine::editor::validate;
use texmend_engine::{
    analyze, classify, preprocess_dir, preprocess_with_reference, Compile, Engine,
    LatexCompiler, RuleChain,
};
use tracing::{info, warn};

/// Log excerpt printed when compilation fails.
const FAILURE_LOG_EXCERPT: usize = 3_000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// TOML file with [fixer] and [compiler] sections
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the compiler only
    Compile {
        main: PathBuf,
        /// Defaults to the main file's directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// pdflatex, xelatex or lualatex (auto-detected by default)
        #[arg(long)]
        engine: Option<Engine>,
    },
    /// Compile, and repair the document if compilation fails
    Fix {
        main: PathBuf,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        engine: Option<Engine>,
        /// Stop after the LLM tier
        #[arg(long, default_value_t = false)]
        no_agent: bool,
        /// Run the rule chain over every .tex file first
        #[arg(long, default_value_t = false)]
        preprocess: bool,
        /// Source tree the document was derived from; preprocessing then
        /// repairs each file against its counterpart there
        #[arg(long)]
        reference_dir: Option<PathBuf>,
        /// Print the fix result as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run the deterministic rule chain over one file
    Rules {
        file: PathBuf,
        /// Known-good version of the same file to repair against
        #[arg(long)]
        reference: Option<PathBuf>,
        /// Write the fixed text back
        #[arg(long, default_value_t = false)]
        write: bool,
    },
    /// Print the structural and validation reports for one file
    Analyze { file: PathBuf },
    /// Parse a compilation log and print its errors and complexity tier
    Classify { log: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Command::Compile {
            main,
            output_dir,
            engine,
        } => compile(config, &main, output_dir, engine).await,
        Command::Fix {
            main,
            output_dir,
            engine,
            no_agent,
            preprocess,
            reference_dir,
            json,
        } => {
            let options = FixOptions {
                no_agent,
                preprocess,
                reference_dir,
                json,
            };
            fix(config, &main, output_dir, engine, options).await
        }
        Command::Rules {
            file,
            reference,
            write,
        } => rules(&file, reference.as_deref(), write),
        Command::Analyze { file } => analyze_file(&file),
        Command::Classify { log } => classify_log(&log),
    }
}

/// Canonical main path and the output directory to use with it.
fn resolve_paths(main: &Path, output_dir: Option<PathBuf>) -> Result<(PathBuf, PathBuf)> {
    let main = main
        .canonicalize()
        .with_context(|| format!("Main file not found: {}", main.display()))?;
    let out = match output_dir {
        Some(dir) => dir,
        None => main
            .parent()
            .map(Path::to_path_buf)
            .context("Main file has no parent directory")?,
    };
    Ok((main, out))
}

fn compiler_for(config: &AppConfig, engine: Option<Engine>) -> Arc<LatexCompiler> {
    let mut compiler_config = config.compiler.clone();
    if engine.is_some() {
        compiler_config.engine = engine;
    }
    Arc::new(LatexCompiler::new(compiler_config))
}

async fn compile(
    config: AppConfig,
    main: &Path,
    output_dir: Option<PathBuf>,
    engine: Option<Engine>,
) -> Result<()> {
    let (main, out) = resolve_paths(main, output_dir)?;
    let compiler = compiler_for(&config, engine);
    let result = compiler.compile(&main, &out).await?;
    if result.success {
        if let Some(pdf) = &result.artifact_path {
            println!("Compiled {}", pdf.display());
        }
        println!(
            "Engine passes: {}, bibliography passes: {}",
            result.engine_runs, result.bibliography_runs
        );
        return Ok(());
    }
    println!("{}", extract_relevant_log_portion(&result.log, FAILURE_LOG_EXCERPT));
    bail!(
        "Compilation failed: {}",
        result.error_message.as_deref().unwrap_or("unknown error")
    )
}

struct FixOptions {
    no_agent: bool,
    preprocess: bool,
    reference_dir: Option<PathBuf>,
    json: bool,
}

async fn fix(
    config: AppConfig,
    main: &Path,
    output_dir: Option<PathBuf>,
    engine: Option<Engine>,
    options: FixOptions,
) -> Result<()> {
    let FixOptions {
        no_agent,
        preprocess,
        reference_dir,
        json,
    } = options;
    let (main, out) = resolve_paths(main, output_dir)?;
    if let Some(src_dir) = main.parent() {
        let chain = RuleChain::standard();
        let report = match &reference_dir {
            Some(reference) => Some(preprocess_with_reference(src_dir, reference, &chain)),
            None if preprocess => Some(preprocess_dir(src_dir, "", &chain)),
            None => None,
        };
        if let Some(report) = report {
            info!(scanned = report.scanned, fixed = report.fixed.len(), "Preprocessed source tree");
        }
    }

    let compiler = compiler_for(&config, engine);
    let first = compiler.compile(&main, &out).await?;
    if first.success {
        println!("Document compiles; nothing to fix.");
        return Ok(());
    }

    let mut fixer_config = config.fixer;
    if no_agent {
        fixer_config.enable_agent = false;
    }
    let mut controller = EscalationController::new(compiler.clone(), fixer_config.clone())
        .with_progress(Arc::new(|level: FixLevel, message: &str| {
            eprintln!("[{level}] {message}");
        }));
    if fixer_config.has_api_key() {
        match OpenAiClient::new(&fixer_config) {
            Ok(client) => controller = controller.with_backend(Arc::new(client)),
            Err(e) => warn!(error = %e, "Chat backend unavailable, only rule fixes will run"),
        }
    } else {
        warn!("No API key configured, only rule fixes will run");
    }

    let (result, compiled) = controller.fix_and_compile(&main, &out, &first.log).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Initial complexity: {}; iterations: {} (rule {}, llm {}, agent {})",
            result.initial_tier,
            result.total_iterations,
            result.rule_attempts,
            result.llm_attempts,
            result.agent_attempts
        );
        for (i, record) in result.history.iter().enumerate() {
            let files: Vec<&str> = record.files_changed.iter().map(String::as_str).collect();
            println!(
                "{:>3}. [{}] {} ({})",
                i + 1,
                record.level,
                record.description,
                files.join(", ")
            );
        }
        if let Some(backup) = &result.backup_path {
            println!("Backup of the original main file: {}", backup.display());
        }
        if result.success {
            println!("Fixed at the {} tier: {}", result.final_fix_level, result.description);
            if let Some(pdf) = &compiled.artifact_path {
                println!("Compiled {}", pdf.display());
            }
        } else {
            println!("{}", extract_relevant_log_portion(&compiled.log, FAILURE_LOG_EXCERPT));
        }
    }
    result.into_outcome()?;
    Ok(())
}

fn rules(file: &Path, reference: Option<&Path>, write: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let reference = reference
        .map(|path| {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read reference {}", path.display()))
        })
        .transpose()?;
    let outcome = RuleChain::standard().fix_with_reference(&text, reference.as_deref());
    if !outcome.changed {
        println!("No rule applies.");
        return Ok(());
    }
    for fix in &outcome.fixes {
        match fix.line {
            Some(line) => println!("  reference, line {line}: {}", fix.description),
            None => println!("  reference: {}", fix.description),
        }
    }
    if outcome.rules.changed {
        println!("Rules applied in {} pass(es):", outcome.rules.passes);
        for name in &outcome.rules.applied {
            println!("  {name}");
        }
    }
    if write {
        std::fs::write(file, &outcome.text)
            .with_context(|| format!("Failed to write {}", file.display()))?;
        println!("Wrote {}", file.display());
    }
    Ok(())
}

fn analyze_file(file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let report = analyze(&text);
    println!(
        "Brace balance: {} ({} open, {} close)",
        report.brace_balance, report.open_braces, report.close_braces
    );
    for (name, counts) in &report.environments {
        let mark = if counts.is_closed() { "" } else { "  <- unbalanced" };
        println!("  {name}: {} begin / {} end{mark}", counts.begins, counts.ends);
    }
    for table in report.tables.iter().filter(|t| t.has_unclosed_wrapper()) {
        println!("  {} at byte {} has an unclosed scaling wrapper", table.env, table.begin);
    }
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!();
    print!("{}", validate(&text).render(&name));
    Ok(())
}

fn classify_log(log: &Path) -> Result<()> {
    let content = std::fs::read(log).with_context(|| format!("Failed to read {}", log.display()))?;
    let content = String::from_utf8_lossy(&content);
    let (errors, tier) = classify(&content);
    for (i, error) in errors.iter().enumerate() {
        println!("{:>3}. {}", i + 1, error);
    }
    println!("Complexity: {tier} ({} errors)", errors.len());
    Ok(())
}
