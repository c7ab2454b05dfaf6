//! IR acquisition: read textual IR directly, or compile C/C++ sources with
//! an external `clang` invocation first.

use crate::compile_commands::CompilationDatabase;
use crate::result::AnalysisConfig;
use stackscan_ir::Module;
use std::process::Command;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Language {
    LlvmIr,
    C,
    Cxx,
    Unknown,
}

/// One top-level failure; no diagnostics are produced when this is
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("unsupported input file type: {0}")]
    UnsupportedInput(String),
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("compilation failed:\n{0}")]
    CompileFailed(String),
    #[error("failed to parse LLVM IR from {path}: {source}")]
    Parse {
        path: String,
        source: stackscan_reader::ParseError,
    },
}

pub fn detect_from_extension(path: &str) -> Language {
    let ext = match path.rfind('.') {
        Some(pos) => path[pos + 1..].to_ascii_lowercase(),
        None => return Language::Unknown,
    };
    match ext.as_str() {
        "ll" => Language::LlvmIr,
        "c" => Language::C,
        "cpp" | "cc" | "cxx" | "c++" | "cp" => Language::Cxx,
        _ => Language::Unknown,
    }
}

/// Compiler executable for the compile-to-IR step; override with
/// `STACKSCAN_CLANG`.
fn clang_executable() -> String {
    std::env::var("STACKSCAN_CLANG").unwrap_or_else(|_| "clang".to_string())
}

fn compile_to_ir(
    path: &str,
    language: Language,
    config: &AnalysisConfig,
    compdb: Option<&CompilationDatabase>,
) -> Result<String, AnalysisError> {
    let mut args: Vec<String> = vec![
        "-emit-llvm".to_string(),
        "-S".to_string(),
        "-g".to_string(),
    ];
    if language == Language::Cxx {
        args.push("-x".to_string());
        args.push("c++".to_string());
        args.push("-std=gnu++20".to_string());
    }
    if let Some(db) = compdb {
        if let Some(command) = db.command_for_file(path) {
            args.extend(command.arguments.iter().cloned());
        }
    }
    args.extend(config.extra_compile_args.iter().cloned());
    args.push("-fno-discard-value-names".to_string());
    args.push("-o".to_string());
    args.push("-".to_string());
    args.push(path.to_string());

    log::debug!("compiling {path} with {} {}", clang_executable(), args.join(" "));
    let output = Command::new(clang_executable())
        .args(&args)
        .output()
        .map_err(|e| AnalysisError::Io {
            path: path.to_string(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(AnalysisError::CompileFailed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    let ir = String::from_utf8_lossy(&output.stdout).into_owned();
    if ir.is_empty() {
        return Err(AnalysisError::CompileFailed(
            "no LLVM IR produced by the compiler invocation".to_string(),
        ));
    }
    Ok(ir)
}

/// Load one input into a module, compiling first when it is not already
/// textual IR.
pub fn load_module_for_analysis(
    path: &str,
    config: &AnalysisConfig,
    compdb: Option<&CompilationDatabase>,
) -> Result<Module, AnalysisError> {
    let language = detect_from_extension(path);
    let ir_text = match language {
        Language::Unknown => {
            return Err(AnalysisError::UnsupportedInput(path.to_string()));
        }
        Language::LlvmIr => std::fs::read_to_string(path).map_err(|e| AnalysisError::Io {
            path: path.to_string(),
            source: e,
        })?,
        Language::C | Language::Cxx => compile_to_ir(path, language, config, compdb)?,
    };

    let mut module =
        stackscan_reader::parse_module(&ir_text).map_err(|e| AnalysisError::Parse {
            path: path.to_string(),
            source: e,
        })?;
    if module.source_filename.is_empty() {
        module.source_filename = path.to_string();
    }
    Ok(module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_detection() {
        assert_eq!(detect_from_extension("a.ll"), Language::LlvmIr);
        assert_eq!(detect_from_extension("a.c"), Language::C);
        assert_eq!(detect_from_extension("a.cpp"), Language::Cxx);
        assert_eq!(detect_from_extension("a.CC"), Language::Cxx);
        assert_eq!(detect_from_extension("a.rs"), Language::Unknown);
        assert_eq!(detect_from_extension("noext"), Language::Unknown);
    }
}
