//! `compile_commands.json` loading and per-file lookup.

use crate::filter::{normalize_path_for_match, path_has_suffix};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

#[derive(Clone, Debug)]
pub struct CompileCommand {
    pub directory: String,
    pub arguments: Vec<String>,
}

/// A loaded compilation database: normalized file path -> cleaned argument
/// list.
pub struct CompilationDatabase {
    commands: FxHashMap<String, CompileCommand>,
}

/// Shell-like tokenization with single/double quotes and backslash
/// escapes.
fn tokenize_command_line(command: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum State {
        Normal,
        SingleQuote,
        DoubleQuote,
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                '\'' => state = State::SingleQuote,
                '"' => state = State::DoubleQuote,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => current.push(c),
            },
            State::SingleQuote => match c {
                '\'' => state = State::Normal,
                _ => current.push(c),
            },
            State::DoubleQuote => match c {
                '"' => state = State::Normal,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Remove `-o`/`--output` and dependency-generation options.
fn strip_output_and_dependency_args(args: Vec<String>) -> Vec<String> {
    let mut filtered = Vec::with_capacity(args.len());
    let mut iter = args.into_iter().peekable();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-o" | "--output" => {
                iter.next();
                continue;
            }
            "-MF" | "-MT" | "-MQ" => {
                iter.next();
                continue;
            }
            "-M" | "-MM" | "-MD" | "-MMD" | "-MG" | "-MP" => continue,
            _ => {}
        }
        if arg.len() > 2 && arg.starts_with("-o") {
            continue;
        }
        if arg.len() > 3
            && (arg.starts_with("-MF") || arg.starts_with("-MT") || arg.starts_with("-MQ"))
        {
            continue;
        }
        filtered.push(arg);
    }
    filtered
}

/// Drop leading non-option tokens (the compiler executable and any
/// wrappers).
fn strip_leading_command_tokens(args: Vec<String>) -> Vec<String> {
    let start = args
        .iter()
        .position(|t| t.starts_with('-') || t.starts_with('@'))
        .unwrap_or(args.len());
    args.into_iter().skip(start).collect()
}

/// Remove the input file argument: the first non-option token whose
/// normalized path equals the entry's file key.
fn strip_input_file_arg(args: Vec<String>, directory: &str, file_key: &str) -> Vec<String> {
    if file_key.is_empty() {
        return args;
    }
    let mut filtered = Vec::with_capacity(args.len());
    let mut removed = false;
    for arg in args {
        if !removed && !arg.is_empty() && !arg.starts_with('-') {
            let full = if arg.starts_with('/') {
                arg.clone()
            } else {
                format!("{directory}/{arg}")
            };
            if normalize_path_for_match(&full) == file_key {
                removed = true;
                continue;
            }
        }
        filtered.push(arg);
    }
    filtered
}

fn extract_arguments(entry: &Json) -> Vec<String> {
    if let Some(array) = entry.get("arguments").and_then(Json::as_array) {
        return array
            .iter()
            .filter_map(Json::as_str)
            .map(|s| s.to_string())
            .collect();
    }
    if let Some(command) = entry.get("command").and_then(Json::as_str) {
        return tokenize_command_line(command);
    }
    Vec::new()
}

/// Progressively shorter `/`-boundary suffixes of a normalized path,
/// starting with the full path.
fn build_path_suffixes(path: &str) -> Vec<String> {
    let mut suffixes = vec![path.to_string()];
    let bytes = path.as_bytes();
    for i in 1..path.len() {
        if bytes[i] == b'/' && i + 1 < path.len() {
            suffixes.push(path[i..].to_string());
        }
    }
    suffixes
}

impl CompilationDatabase {
    /// Parse a compilation database from JSON text. The database directory
    /// anchors relative entry paths.
    pub fn from_json(text: &str, compdb_dir: &str) -> Result<Self, String> {
        let parsed: Json = serde_json::from_str(text)
            .map_err(|e| format!("failed to parse compile commands JSON: {e}"))?;
        let Some(entries) = parsed.as_array() else {
            return Err("compile commands JSON must be an array".to_string());
        };

        let mut commands = FxHashMap::default();
        for entry in entries {
            let Some(file) = entry.get("file").and_then(Json::as_str) else {
                continue;
            };
            let dir = entry
                .get("directory")
                .and_then(Json::as_str)
                .unwrap_or(compdb_dir);
            let dir = if dir.starts_with('/') {
                dir.to_string()
            } else {
                format!("{compdb_dir}/{dir}")
            };
            let directory_key = normalize_path_for_match(&dir);

            let full_file = if file.starts_with('/') {
                file.to_string()
            } else {
                format!("{directory_key}/{file}")
            };
            let file_key = normalize_path_for_match(&full_file);
            if file_key.is_empty() {
                continue;
            }

            let args = extract_arguments(entry);
            if args.is_empty() {
                continue;
            }
            let args = strip_leading_command_tokens(args);
            let args = strip_output_and_dependency_args(args);
            let args = strip_input_file_arg(args, &directory_key, &file_key);

            commands.entry(file_key).or_insert(CompileCommand {
                directory: directory_key,
                arguments: args,
            });
        }

        if commands.is_empty() {
            return Err("compile commands file contains no usable entries".to_string());
        }
        Ok(Self { commands })
    }

    pub fn load_from_file(path: &str) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("unable to read compile commands file: {path} ({e})"))?;
        let dir = match path.rfind('/') {
            Some(pos) if pos > 0 => path[..pos].to_string(),
            _ => std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|_| ".".to_string()),
        };
        Self::from_json(&text, &dir)
    }

    /// Look a file up by full normalized path, then by progressively
    /// shorter suffixes; a suffix must match exactly one entry.
    pub fn command_for_file(&self, file_path: &str) -> Option<&CompileCommand> {
        if file_path.is_empty() {
            return None;
        }
        let key = normalize_path_for_match(file_path);
        if let Some(command) = self.commands.get(&key) {
            return Some(command);
        }

        for suffix in build_path_suffixes(&key).into_iter().skip(1) {
            let mut matched: Option<&CompileCommand> = None;
            let mut count = 0;
            for (entry_key, command) in &self.commands {
                if path_has_suffix(entry_key, suffix.trim_start_matches('/')) {
                    count += 1;
                    if count == 1 {
                        matched = Some(command);
                    } else {
                        break;
                    }
                }
            }
            if count == 1 {
                return matched;
            }
            if count > 1 {
                break;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_quotes_and_escapes() {
        assert_eq!(
            tokenize_command_line(r#"cc -DX='a b' -DY="c d" e\ f.c"#),
            vec!["cc", "-DX=a b", "-DY=c d", "e f.c"]
        );
    }

    #[test]
    fn strips_output_and_dependency_args() {
        let args: Vec<String> = ["-c", "-o", "out.o", "-MD", "-MF", "dep.d", "-O2", "-ofoo"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            strip_output_and_dependency_args(args),
            vec!["-c", "-O2"]
        );
    }

    #[test]
    fn loads_and_looks_up() {
        let json = r#"[
          {
            "directory": "/build",
            "command": "clang -c -O2 -o a.o /src/lib/a.c",
            "file": "/src/lib/a.c"
          },
          {
            "directory": "/build",
            "arguments": ["clang", "-c", "-DB=1", "/src/lib/b.c"],
            "file": "/src/lib/b.c"
          }
        ]"#;
        let db = CompilationDatabase::from_json(json, "/build").unwrap();

        let a = db.command_for_file("/src/lib/a.c").unwrap();
        assert_eq!(a.arguments, vec!["-c", "-O2"]);
        assert_eq!(a.directory, "/build");

        let b = db.command_for_file("/src/lib/b.c").unwrap();
        assert_eq!(b.arguments, vec!["-c", "-DB=1"]);

        // Suffix lookup with a unique basename.
        let by_suffix = db.command_for_file("/elsewhere/lib/a.c");
        assert!(by_suffix.is_some());
        assert_eq!(by_suffix.unwrap().arguments, vec!["-c", "-O2"]);

        assert!(db.command_for_file("/src/lib/c.c").is_none());
    }

    #[test]
    fn rejects_non_array() {
        assert!(CompilationDatabase::from_json("{}", "/").is_err());
        assert!(CompilationDatabase::from_json("[]", "/").is_err());
    }
}
