//! Agent profiles: a step budget, the tools offered and the system prompt.

use super::tools::ToolKind;
use crate::llm::ToolSpec;

pub const PRIMARY_MAX_STEPS: u32 = 20;
pub const TOOL_CALLING_MAX_STEPS: u32 = 10;

const CORE_TOOLS: &[ToolKind] = &[
    ToolKind::ReadFile,
    ToolKind::WriteFile,
    ToolKind::CompileLatex,
    ToolKind::ListFiles,
    ToolKind::SearchInFiles,
    ToolKind::FixComplete,
];

const PRIMARY_PROMPT: &str = r#"You are a LaTeX debugging agent. Your job is to fix compilation errors by locating the problem, understanding it, and making precise fixes.

TOOLS:
- read_file(filename): Read file content
- write_file(filename, content): Write file
- compile_latex(main_file): Compile and get error log
- search_in_files(pattern): Regex search across files
- list_files(): List all tex files
- fix_complete(summary): Call when compilation succeeds

WORKFLOW - Follow this process for each error:

STEP 1: PARSE THE ERROR
From the compilation log, extract:
- Error type (e.g., "Too many }'s", "Undefined control sequence", "Missing $ inserted")
- File name (from lines like "(./filename.tex")
- Line number (from "l.XXX")

STEP 2: READ THE ERROR LOCATION
Use read_file and study at least 10-20 lines around the error line.

STEP 3: ANALYZE AND FIX
For "Too many }'s" or "Extra }":
- Look for a standalone } that doesn't match any {
- Check for a } right before \end{document} that shouldn't be there

For "Missing } inserted" or "Missing { inserted":
- Find the unclosed brace, or a \begin{} without its \end{}

For "Undefined control sequence":
- Check whether a command name got corrupted or a package is missing

For "Missing $ inserted":
- Look for unescaped _, ^ or & outside math mode

STEP 4: APPLY THE FIX
Make the minimal change needed. Keep ALL existing content.

STEP 5: VERIFY
Compile again. If there are more errors, repeat from Step 1.

RULES:
1. Always read the file before fixing - don't guess
2. Never delete document content
3. Fix one error at a time, then recompile
4. The first error in the log is usually the root cause

When compilation succeeds (PDF generated), call fix_complete. Your claim will be checked by an independent compilation."#;

const TOOL_CALLING_PROMPT: &str = r#"You are a LaTeX debugging agent. Your job is to fix compilation errors by locating the problem, understanding it, and making precise fixes.

TOOLS:
- read_file(filename): Read complete file
- read_lines(filename, start, end): Read specific lines (use for large files)
- write_file(filename, content): Write complete file
- replace_line(filename, line_number, new_content): Replace single line
- delete_line(filename, line_number): Delete a line
- insert_line(filename, line_number, content): Insert a line
- search_in_files(pattern): Regex search across files
- list_files(): List all tex files
- validate_latex(filename): Check syntax (braces, environments)
- detect_encoding(filename): Check file encoding
- fix_encoding(filename): Convert to UTF-8
- compile_latex(main_file): Compile and get error log
- create_backup(filename): Backup before risky changes
- fix_complete(summary): Call when compilation succeeds

WORKFLOW:
1. Parse the error type, file and line number ("l.XXX") from the log.
2. Use read_lines(filename, line-10, line+10) to see the context.
   For garbled text, run detect_encoding first.
3. Fix with the most precise tool: delete_line to remove a stray }, replace_line
   to change a line, write_file only when several changes are needed.
4. Compile again. If more errors remain, repeat.

RULES:
1. Always read before fixing - don't guess
2. Prefer replace_line/delete_line over write_file
3. Never delete document content
4. The first error is usually the root cause

When compilation succeeds, call fix_complete. Your claim will be checked by an independent compilation."#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub name: &'static str,
    pub max_steps: u32,
    pub tools: Vec<ToolKind>,
    pub system_prompt: &'static str,
}

impl AgentProfile {
    /// Long-horizon agent with the core read/write/compile tools.
    pub fn primary() -> Self {
        Self {
            name: "primary",
            max_steps: PRIMARY_MAX_STEPS,
            tools: CORE_TOOLS.to_vec(),
            system_prompt: PRIMARY_PROMPT,
        }
    }

    /// Shorter loop with the full line-level catalogue.
    pub fn tool_calling() -> Self {
        Self {
            name: "tool-calling",
            max_steps: TOOL_CALLING_MAX_STEPS,
            tools: ToolKind::ALL.to_vec(),
            system_prompt: TOOL_CALLING_PROMPT,
        }
    }

    /// Budgets below one are raised to one.
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn offers(&self, kind: ToolKind) -> bool {
        self.tools.contains(&kind)
    }

    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|k| k.spec()).collect()
    }
}
