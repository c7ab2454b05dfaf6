//! `stackscan <inputs>`: analyze IR or source inputs and emit a report.

use anyhow::{bail, Context, Result};
use clap::Parser;
use stackscan_analysis::compile_commands::CompilationDatabase;
use stackscan_analysis::report;
use stackscan_analysis::{analyze_file, AnalysisConfig, AnalysisMode, AnalysisResult};
use std::io::Write;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    Ir,
    Abi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum FormatArg {
    Json,
    Sarif,
}

/// Static stack- and memory-safety analysis of C/C++ translation units
/// lowered to LLVM IR.
#[derive(Parser)]
#[command(name = "stackscan", version, about)]
pub struct AnalyzeCommand {
    /// Input files: textual LLVM IR (.ll) or C/C++ sources.
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<String>,

    /// Frame-size model.
    #[arg(long, value_enum, default_value = "ir")]
    mode: ModeArg,

    /// Worst-case stack budget in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = 8 * 1024 * 1024)]
    stack_limit: u64,

    /// Only analyze functions defined in this file (repeatable).
    #[arg(long = "only-file", value_name = "PATH")]
    only_files: Vec<String>,

    /// Only analyze functions defined under this directory (repeatable).
    #[arg(long = "only-dir", value_name = "PATH")]
    only_dirs: Vec<String>,

    /// Only analyze this function; accepts mangled or demangled forms
    /// (repeatable).
    #[arg(long = "only-function", value_name = "NAME")]
    only_functions: Vec<String>,

    /// Extra argument for the compile-to-IR invocation (repeatable).
    #[arg(long = "extra-arg", value_name = "ARG")]
    extra_args: Vec<String>,

    /// Path to a compile_commands.json providing per-file compile flags.
    #[arg(long = "compile-commands", value_name = "FILE")]
    compile_commands: Option<String>,

    /// Report format.
    #[arg(long, value_enum, default_value = "json")]
    format: FormatArg,

    /// Write the report here instead of stdout.
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Log every function-filter decision.
    #[arg(long)]
    dump_filter: bool,

    /// Report direct calls that capture a stack address
    /// (StackPointerEscape.CallArg).
    #[arg(long)]
    escape_call_args: bool,
}

impl AnalyzeCommand {
    fn config(&self) -> AnalysisConfig {
        AnalysisConfig {
            mode: match self.mode {
                ModeArg::Ir => AnalysisMode::Ir,
                ModeArg::Abi => AnalysisMode::Abi,
            },
            stack_limit: self.stack_limit,
            only_files: self.only_files.clone(),
            only_dirs: self.only_dirs.clone(),
            only_functions: self.only_functions.clone(),
            extra_compile_args: self.extra_args.clone(),
            dump_filter: self.dump_filter,
            escape_call_args: self.escape_call_args,
        }
    }

    pub fn execute(&self) -> Result<()> {
        let config = self.config();

        let compdb = match &self.compile_commands {
            Some(path) => Some(
                CompilationDatabase::load_from_file(path)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("loading compilation database")?,
            ),
            None => None,
        };

        let mut merged: Option<AnalysisResult> = None;
        for input in &self.inputs {
            log::info!("analyzing {input}");
            let result = analyze_file(input, &config, compdb.as_ref())
                .with_context(|| format!("analysis of {input} failed"))?;
            match &mut merged {
                None => merged = Some(result),
                Some(acc) => {
                    acc.functions.extend(result.functions);
                    acc.diagnostics.extend(result.diagnostics);
                }
            }
        }
        let Some(result) = merged else {
            bail!("no inputs");
        };

        let text = match self.format {
            FormatArg::Json => report::to_json(&result, &self.inputs),
            FormatArg::Sarif => report::to_sarif(
                &result,
                self.inputs.first().map(String::as_str).unwrap_or(""),
                "stackscan",
                env!("CARGO_PKG_VERSION"),
            ),
        };

        match &self.output {
            Some(path) => {
                std::fs::write(path, text.as_bytes())
                    .with_context(|| format!("writing report to {}", path.display()))?;
            }
            None => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(text.as_bytes())?;
                lock.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}
