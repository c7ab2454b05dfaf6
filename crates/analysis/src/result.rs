//! Analysis configuration and results.

use crate::diagnostics::Diagnostic;

/// How local frame sizes are computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalysisMode {
    /// Sum of allocation sizes, rounded up to the stack alignment.
    Ir,
    /// ABI-style frame emulation: a minimum frame for defined functions and
    /// a caller-save slot when the function calls out.
    Abi,
}

impl AnalysisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::Ir => "IR",
            AnalysisMode::Abi => "ABI",
        }
    }
}

/// Default stack limit: 8 MiB.
pub const DEFAULT_STACK_LIMIT: u64 = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub mode: AnalysisMode,
    /// Worst-case stack budget in bytes.
    pub stack_limit: u64,
    /// Restrict analysis to functions from these files (empty = all).
    pub only_files: Vec<String>,
    /// Restrict analysis to functions from these directories (empty = all).
    pub only_dirs: Vec<String>,
    /// Restrict analysis to these functions (empty = all).
    pub only_functions: Vec<String>,
    /// Extra arguments forwarded to the compile-to-IR invocation.
    pub extra_compile_args: Vec<String>,
    /// Log every filter decision.
    pub dump_filter: bool,
    /// Report direct calls that capture a stack address
    /// (`StackPointerEscape.CallArg`). Off by default.
    pub escape_call_args: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mode: AnalysisMode::Ir,
            stack_limit: DEFAULT_STACK_LIMIT,
            only_files: Vec::new(),
            only_dirs: Vec::new(),
            only_functions: Vec::new(),
            extra_compile_args: Vec::new(),
            dump_filter: false,
            escape_call_args: false,
        }
    }
}

/// Per-function stack summary.
#[derive(Clone, Debug, Default)]
pub struct FunctionResult {
    pub name: String,
    pub file_path: String,
    pub line: u32,
    pub column: u32,
    /// Local frame size in bytes; a lower bound when
    /// `local_stack_unknown`.
    pub local_stack: u64,
    pub local_stack_unknown: bool,
    /// Worst-case transitive stack in bytes; a lower bound when
    /// `max_stack_unknown`.
    pub max_stack: u64,
    pub max_stack_unknown: bool,
    pub has_dynamic_alloca: bool,
    pub is_recursive: bool,
    pub has_infinite_self_recursion: bool,
    pub exceeds_limit: bool,
}

/// Everything produced by one `analyze_module` call.
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub config: AnalysisConfig,
    pub functions: Vec<FunctionResult>,
    pub diagnostics: Vec<Diagnostic>,
}
