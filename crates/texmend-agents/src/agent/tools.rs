//! The agent's tool catalogue.
//!
//! Arguments arrive as JSON strings; [`AgentTool::decode`] turns each call
//! into a typed variant once, at the loop boundary, and [`ToolContext`]
//! executes it against the source tree.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use texmend_engine::classifier::extract_relevant_log_portion;
use texmend_engine::editor::{self, BackupManager, Encoding};
use texmend_engine::text::truncate_middle;
use texmend_engine::{Compile, CompileResult};
use tracing::debug;

use super::sandbox::sandbox_check;
use crate::error::ToolError;
use crate::files::relative_name;
use crate::llm::ToolSpec;

/// Files above this size are returned as head and tail.
pub const READ_LIMIT: usize = 30_000;
pub const READ_KEEP: usize = 15_000;
/// Size of the log excerpt returned by `compile_latex`.
pub const COMPILE_LOG_EXCERPT: usize = 5_000;
pub const MAX_SEARCH_MATCHES: usize = 50;

const LISTED_EXTENSIONS: &[&str] = &["tex", "sty", "bbl"];

// ── Catalogue ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadFile,
    ReadLines,
    WriteFile,
    ReplaceLine,
    InsertLine,
    DeleteLine,
    DetectEncoding,
    FixEncoding,
    ValidateLatex,
    CreateBackup,
    CompileLatex,
    ListFiles,
    SearchInFiles,
    FixComplete,
}

impl ToolKind {
    pub const ALL: &'static [ToolKind] = &[
        Self::ReadFile,
        Self::ReadLines,
        Self::WriteFile,
        Self::ReplaceLine,
        Self::InsertLine,
        Self::DeleteLine,
        Self::DetectEncoding,
        Self::FixEncoding,
        Self::ValidateLatex,
        Self::CreateBackup,
        Self::CompileLatex,
        Self::ListFiles,
        Self::SearchInFiles,
        Self::FixComplete,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::ReadLines => "read_lines",
            Self::WriteFile => "write_file",
            Self::ReplaceLine => "replace_line",
            Self::InsertLine => "insert_line",
            Self::DeleteLine => "delete_line",
            Self::DetectEncoding => "detect_encoding",
            Self::FixEncoding => "fix_encoding",
            Self::ValidateLatex => "validate_latex",
            Self::CreateBackup => "create_backup",
            Self::CompileLatex => "compile_latex",
            Self::ListFiles => "list_files",
            Self::SearchInFiles => "search_in_files",
            Self::FixComplete => "fix_complete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    fn description(self) -> &'static str {
        match self {
            Self::ReadFile => "Read the content of a LaTeX file. Use this to understand the document structure and find errors.",
            Self::ReadLines => "Read specific lines from a file. Use this to examine a specific section of a file.",
            Self::WriteFile => "Write content to a LaTeX file. Use this to apply fixes to the document.",
            Self::ReplaceLine => "Replace a single line in a file. Use this for targeted fixes.",
            Self::InsertLine => "Insert a new line at a specific position in a file.",
            Self::DeleteLine => "Delete a line from a file.",
            Self::DetectEncoding => "Detect the encoding of a file. Use this when you suspect encoding issues.",
            Self::FixEncoding => "Fix encoding issues by converting a file to UTF-8.",
            Self::ValidateLatex => "Validate LaTeX structure in a file (braces, environments, document markers).",
            Self::CreateBackup => "Create a backup of a file before making risky changes.",
            Self::CompileLatex => "Compile the LaTeX document and return the result. Use this to test if your fixes work.",
            Self::ListFiles => "List all .tex, .sty and .bbl files in the directory.",
            Self::SearchInFiles => "Search for a regex pattern in all tex files. Returns file:line: text matches.",
            Self::FixComplete => "Call this when you have fixed all errors and compilation succeeds.",
        }
    }

    fn parameters(self) -> serde_json::Value {
        let filename = json!({
            "type": "string",
            "description": "Path of the file relative to the document directory"
        });
        let line_number = json!({"type": "integer", "description": "Line number (1-based)"});
        match self {
            Self::ReadFile
            | Self::DetectEncoding
            | Self::FixEncoding
            | Self::ValidateLatex
            | Self::CreateBackup => json!({
                "type": "object",
                "properties": {"filename": filename},
                "required": ["filename"]
            }),
            Self::ReadLines => json!({
                "type": "object",
                "properties": {
                    "filename": filename,
                    "start": {"type": "integer", "description": "Starting line number (1-based)"},
                    "end": {"type": "integer", "description": "Ending line number (-1 for end of file)"}
                },
                "required": ["filename", "start", "end"]
            }),
            Self::WriteFile => json!({
                "type": "object",
                "properties": {
                    "filename": filename,
                    "content": {"type": "string", "description": "The complete content to write to the file"}
                },
                "required": ["filename", "content"]
            }),
            Self::ReplaceLine => json!({
                "type": "object",
                "properties": {
                    "filename": filename,
                    "line_number": line_number,
                    "new_content": {"type": "string", "description": "New content for the line"}
                },
                "required": ["filename", "line_number", "new_content"]
            }),
            Self::InsertLine => json!({
                "type": "object",
                "properties": {
                    "filename": filename,
                    "line_number": {"type": "integer", "description": "Insert before this line (1-based); one past the last line appends"},
                    "content": {"type": "string", "description": "Content to insert"}
                },
                "required": ["filename", "line_number", "content"]
            }),
            Self::DeleteLine => json!({
                "type": "object",
                "properties": {"filename": filename, "line_number": line_number},
                "required": ["filename", "line_number"]
            }),
            Self::CompileLatex => json!({
                "type": "object",
                "properties": {
                    "main_file": {"type": "string", "description": "The main tex file to compile (defaults to the document's main file)"}
                }
            }),
            Self::ListFiles => json!({"type": "object", "properties": {}}),
            Self::SearchInFiles => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression to search for"}
                },
                "required": ["pattern"]
            }),
            Self::FixComplete => json!({
                "type": "object",
                "properties": {
                    "summary": {"type": "string", "description": "A summary of all fixes applied"}
                },
                "required": ["summary"]
            }),
        }
    }

    pub fn spec(self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

// ── Typed arguments ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileArgs {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReadLinesArgs {
    pub filename: String,
    pub start: usize,
    /// Negative means end of file
    #[serde(default = "end_of_file")]
    pub end: i64,
}

fn end_of_file() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriteFileArgs {
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplaceLineArgs {
    pub filename: String,
    pub line_number: usize,
    pub new_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InsertLineArgs {
    pub filename: String,
    pub line_number: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeleteLineArgs {
    pub filename: String,
    pub line_number: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CompileArgs {
    #[serde(default)]
    pub main_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchArgs {
    pub pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FixCompleteArgs {
    #[serde(default)]
    pub summary: String,
}

/// One decoded tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentTool {
    ReadFile(FileArgs),
    ReadLines(ReadLinesArgs),
    WriteFile(WriteFileArgs),
    ReplaceLine(ReplaceLineArgs),
    InsertLine(InsertLineArgs),
    DeleteLine(DeleteLineArgs),
    DetectEncoding(FileArgs),
    FixEncoding(FileArgs),
    ValidateLatex(FileArgs),
    CreateBackup(FileArgs),
    CompileLatex(CompileArgs),
    ListFiles,
    SearchInFiles(SearchArgs),
    FixComplete(FixCompleteArgs),
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: &str) -> Result<T, ToolError> {
    let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
    serde_json::from_str(arguments).map_err(|e| ToolError::invalid_arguments(tool, e))
}

impl AgentTool {
    pub fn decode(name: &str, arguments: &str) -> Result<Self, ToolError> {
        let kind = ToolKind::from_name(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        Ok(match kind {
            ToolKind::ReadFile => Self::ReadFile(parse_args(name, arguments)?),
            ToolKind::ReadLines => Self::ReadLines(parse_args(name, arguments)?),
            ToolKind::WriteFile => Self::WriteFile(parse_args(name, arguments)?),
            ToolKind::ReplaceLine => Self::ReplaceLine(parse_args(name, arguments)?),
            ToolKind::InsertLine => Self::InsertLine(parse_args(name, arguments)?),
            ToolKind::DeleteLine => Self::DeleteLine(parse_args(name, arguments)?),
            ToolKind::DetectEncoding => Self::DetectEncoding(parse_args(name, arguments)?),
            ToolKind::FixEncoding => Self::FixEncoding(parse_args(name, arguments)?),
            ToolKind::ValidateLatex => Self::ValidateLatex(parse_args(name, arguments)?),
            ToolKind::CreateBackup => Self::CreateBackup(parse_args(name, arguments)?),
            ToolKind::CompileLatex => Self::CompileLatex(parse_args(name, arguments)?),
            ToolKind::ListFiles => Self::ListFiles,
            ToolKind::SearchInFiles => Self::SearchInFiles(parse_args(name, arguments)?),
            ToolKind::FixComplete => Self::FixComplete(parse_args(name, arguments)?),
        })
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            Self::ReadFile(_) => ToolKind::ReadFile,
            Self::ReadLines(_) => ToolKind::ReadLines,
            Self::WriteFile(_) => ToolKind::WriteFile,
            Self::ReplaceLine(_) => ToolKind::ReplaceLine,
            Self::InsertLine(_) => ToolKind::InsertLine,
            Self::DeleteLine(_) => ToolKind::DeleteLine,
            Self::DetectEncoding(_) => ToolKind::DetectEncoding,
            Self::FixEncoding(_) => ToolKind::FixEncoding,
            Self::ValidateLatex(_) => ToolKind::ValidateLatex,
            Self::CreateBackup(_) => ToolKind::CreateBackup,
            Self::CompileLatex(_) => ToolKind::CompileLatex,
            Self::ListFiles => ToolKind::ListFiles,
            Self::SearchInFiles(_) => ToolKind::SearchInFiles,
            Self::FixComplete(_) => ToolKind::FixComplete,
        }
    }

    /// The file this call rewrites, if it mutates the tree.
    pub fn mutated_file(&self) -> Option<&str> {
        match self {
            Self::WriteFile(a) => Some(&a.filename),
            Self::ReplaceLine(a) => Some(&a.filename),
            Self::InsertLine(a) => Some(&a.filename),
            Self::DeleteLine(a) => Some(&a.filename),
            Self::FixEncoding(a) => Some(&a.filename),
            _ => None,
        }
    }
}

// ── Execution ─────────────────────────────────────────────────────────

/// Everything a tool call may touch: the source directory (sandbox root),
/// the compiler and the backup collaborator.
pub struct ToolContext {
    src_dir: PathBuf,
    main_file: PathBuf,
    output_dir: PathBuf,
    compiler: Arc<dyn Compile>,
    backups: BackupManager,
}

impl ToolContext {
    pub fn new(
        main_file: &Path,
        output_dir: &Path,
        compiler: Arc<dyn Compile>,
    ) -> Result<Self, ToolError> {
        let main_file = main_file.canonicalize()?;
        let src_dir = main_file
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ToolError::Sandbox(main_file.display().to_string()))?;
        Ok(Self {
            src_dir,
            main_file,
            output_dir: output_dir.to_path_buf(),
            compiler,
            backups: BackupManager::default(),
        })
    }

    pub fn with_backups(mut self, backups: BackupManager) -> Self {
        self.backups = backups;
        self
    }

    pub fn src_dir(&self) -> &Path {
        &self.src_dir
    }

    pub fn main_file(&self) -> &Path {
        &self.main_file
    }

    /// Compile the main file; an orchestrator error becomes a failed result.
    pub async fn verify(&self) -> CompileResult {
        self.compile(&self.main_file).await
    }

    async fn compile(&self, main: &Path) -> CompileResult {
        match self.compiler.compile(main, &self.output_dir).await {
            Ok(result) => result,
            Err(e) => CompileResult::failure(e.to_string(), String::new()),
        }
    }

    pub async fn execute(&self, tool: &AgentTool) -> Result<String, ToolError> {
        debug!(tool = tool.kind().name(), "Executing tool");
        match tool {
            AgentTool::ReadFile(a) => self.read_file(&a.filename),
            AgentTool::ReadLines(a) => self.read_lines(a),
            AgentTool::WriteFile(a) => {
                let path = sandbox_check(&self.src_dir, &a.filename)?;
                fs::write(&path, &a.content)?;
                Ok(format!(
                    "Successfully wrote {} bytes to {}",
                    a.content.len(),
                    a.filename
                ))
            }
            AgentTool::ReplaceLine(a) => {
                let path = sandbox_check(&self.src_dir, &a.filename)?;
                editor::replace_line(&path, a.line_number, &a.new_content)?;
                Ok(format!("Successfully replaced line {} in {}", a.line_number, a.filename))
            }
            AgentTool::InsertLine(a) => {
                let path = sandbox_check(&self.src_dir, &a.filename)?;
                editor::insert_line(&path, a.line_number, &a.content)?;
                Ok(format!("Successfully inserted line at {} in {}", a.line_number, a.filename))
            }
            AgentTool::DeleteLine(a) => {
                let path = sandbox_check(&self.src_dir, &a.filename)?;
                editor::delete_line(&path, a.line_number)?;
                Ok(format!("Successfully deleted line {} from {}", a.line_number, a.filename))
            }
            AgentTool::DetectEncoding(a) => self.detect_encoding(&a.filename),
            AgentTool::FixEncoding(a) => {
                let path = sandbox_check(&self.src_dir, &a.filename)?;
                let before = editor::ensure_utf8(&path)?;
                Ok(if before == Encoding::Utf8 {
                    format!("File {} is already in UTF-8 encoding", a.filename)
                } else {
                    format!("Successfully converted {} from {} to UTF-8", a.filename, before)
                })
            }
            AgentTool::ValidateLatex(a) => {
                let path = sandbox_check(&self.src_dir, &a.filename)?;
                Ok(editor::validate_file(&path)?.render(&a.filename))
            }
            AgentTool::CreateBackup(a) => {
                let path = sandbox_check(&self.src_dir, &a.filename)?;
                let backup = self.backups.create_backup(&path)?;
                Ok(format!("Backup created: {}", backup.display()))
            }
            AgentTool::CompileLatex(a) => {
                let main = match &a.main_file {
                    Some(name) if !name.trim().is_empty() => sandbox_check(&self.src_dir, name)?,
                    _ => self.main_file.clone(),
                };
                let result = self.compile(&main).await;
                Ok(describe_compile(&result))
            }
            AgentTool::ListFiles => Ok(self.list_files()),
            AgentTool::SearchInFiles(a) => self.search(&a.pattern),
            AgentTool::FixComplete(a) => Ok(format!("Fix complete: {}", a.summary)),
        }
    }

    fn read_file(&self, filename: &str) -> Result<String, ToolError> {
        let path = sandbox_check(&self.src_dir, filename)?;
        let content = fs::read_to_string(&path)?;
        Ok(truncate_middle(&content, READ_LIMIT, READ_KEEP, "\n...[truncated]...\n")
            .unwrap_or(content))
    }

    fn read_lines(&self, args: &ReadLinesArgs) -> Result<String, ToolError> {
        let path = sandbox_check(&self.src_dir, &args.filename)?;
        let end = usize::try_from(args.end).ok();
        let start = args.start.max(1);
        let lines = editor::read_lines(&path, start, end)?;
        let mut out = format!(
            "Lines {}-{} from {}:\n",
            start,
            start + lines.len().saturating_sub(1),
            args.filename
        );
        for (i, line) in lines.iter().enumerate() {
            let _ = writeln!(out, "{:>5}: {}", start + i, line);
        }
        Ok(out)
    }

    fn detect_encoding(&self, filename: &str) -> Result<String, ToolError> {
        let path = sandbox_check(&self.src_dir, filename)?;
        let data = fs::read(&path)?;
        let encoding = Encoding::from_bytes(&data);
        let has_bom = matches!(
            encoding,
            Encoding::Utf8Bom | Encoding::Utf16Le | Encoding::Utf16Be
        );
        let mut out = format!("Encoding information for {filename}:\n");
        let _ = writeln!(out, "  Encoding: {encoding}");
        let _ = writeln!(out, "  Has BOM: {has_bom}");
        let _ = writeln!(out, "  Is Valid UTF-8: {}", std::str::from_utf8(&data).is_ok());
        let _ = writeln!(out, "  File Size: {} bytes", data.len());
        let sample = String::from_utf8_lossy(&data[..data.len().min(200)]);
        if !sample.trim().is_empty() {
            let _ = writeln!(out, "  Sample: {}", sample.replace('\n', " "));
        }
        Ok(out)
    }

    fn walk(&self, extensions: &[&str]) -> Vec<(PathBuf, String)> {
        let mut files: Vec<(PathBuf, String)> = WalkBuilder::new(&self.src_dir)
            .hidden(true)
            .git_ignore(true)
            .build()
            .flatten()
            .filter(|entry| {
                entry.path().is_file()
                    && entry
                        .path()
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| extensions.contains(&e))
            })
            .filter_map(|entry| {
                let name = relative_name(&self.src_dir, entry.path())?;
                Some((entry.into_path(), name))
            })
            .collect();
        files.sort_by(|a, b| a.1.cmp(&b.1));
        files
    }

    fn list_files(&self) -> String {
        let names: Vec<String> = self
            .walk(LISTED_EXTENSIONS)
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        format!("Files found:\n{}", names.join("\n"))
    }

    fn search(&self, pattern: &str) -> Result<String, ToolError> {
        let re = Regex::new(pattern)?;
        let mut matches = Vec::new();
        'files: for (path, name) in self.walk(&["tex"]) {
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            for (i, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!("{}:{}: {}", name, i + 1, line.trim()));
                    if matches.len() >= MAX_SEARCH_MATCHES {
                        break 'files;
                    }
                }
            }
        }
        if matches.is_empty() {
            return Ok("No matches found".to_string());
        }
        Ok(format!("Found {} matches:\n{}", matches.len(), matches.join("\n")))
    }
}

/// Tool-facing summary of a compilation.
pub fn describe_compile(result: &CompileResult) -> String {
    if result.success {
        return "Compilation successful! PDF generated.".to_string();
    }
    if result.log.is_empty() {
        if let Some(message) = &result.error_message {
            return format!("Compilation error: {message}");
        }
    }
    format!(
        "Compilation failed.\n\nError log:\n{}",
        extract_relevant_log_portion(&result.log, COMPILE_LOG_EXCERPT)
    )
}
