//! Function filtering from file, directory, and function-name restrictions.

use crate::demangle;
use crate::result::AnalysisConfig;
use stackscan_ir::{FuncId, Module};

/// Normalize a path for matching: backslashes become forward slashes,
/// relative paths are anchored at the current directory, `.`/`..` segments
/// are folded lexically, duplicate and trailing slashes are dropped.
pub fn normalize_path_for_match(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let mut adjusted = input.replace('\\', "/");
    if !adjusted.starts_with('/') {
        if let Ok(cwd) = std::env::current_dir() {
            adjusted = format!("{}/{}", cwd.display(), adjusted);
        }
    }
    let mut parts: Vec<&str> = Vec::new();
    for segment in adjusted.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

fn basename_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Does `path` end with `suffix` on a `/` boundary?
pub fn path_has_suffix(path: &str, suffix: &str) -> bool {
    if suffix.is_empty() || path.len() < suffix.len() {
        return false;
    }
    if !path.ends_with(suffix) {
        return false;
    }
    if path.len() == suffix.len() {
        return true;
    }
    path.as_bytes()[path.len() - suffix.len() - 1] == b'/'
}

fn path_has_prefix(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || path.len() < prefix.len() {
        return false;
    }
    if !path.starts_with(prefix) {
        return false;
    }
    if path.len() == prefix.len() {
        return true;
    }
    path.as_bytes()[prefix.len()] == b'/'
}

fn should_include_path(path: &str, config: &AnalysisConfig) -> bool {
    if config.only_files.is_empty() && config.only_dirs.is_empty() {
        return true;
    }
    if path.is_empty() {
        return false;
    }

    let norm_path = normalize_path_for_match(path);

    for file in &config.only_files {
        let norm_file = normalize_path_for_match(file);
        if norm_path == norm_file || path_has_suffix(&norm_path, &norm_file) {
            return true;
        }
        let file_base = basename_of(&norm_file);
        if !file_base.is_empty() && basename_of(&norm_path) == file_base {
            return true;
        }
    }

    for dir in &config.only_dirs {
        let norm_dir = normalize_path_for_match(dir);
        if path_has_prefix(&norm_path, &norm_dir) || path_has_suffix(&norm_path, &norm_dir) {
            return true;
        }
        let needle = format!("/{}/", norm_dir.trim_start_matches('/'));
        if norm_path.contains(&needle) {
            return true;
        }
    }

    false
}

/// Does the function's symbol match one of the `only_functions` entries in
/// any of its four forms?
fn function_name_matches(name: &str, config: &AnalysisConfig) -> bool {
    if config.only_functions.is_empty() {
        return true;
    }

    let demangled = if demangle::is_mangled(name) || name.starts_with("_Z") {
        Some(demangle::demangle(name))
    } else {
        None
    };
    let demangled_base = demangled.as_deref().and_then(|d| {
        let pos = d.find('(')?;
        if pos > 0 {
            Some(d[..pos].to_string())
        } else {
            None
        }
    });
    let itanium_base = demangle::itanium_base_name(name);

    for pattern in &config.only_functions {
        if name == pattern {
            return true;
        }
        if demangled.as_deref() == Some(pattern.as_str()) {
            return true;
        }
        if demangled_base.as_deref() == Some(pattern.as_str()) {
            return true;
        }
        if itanium_base.as_deref() == Some(pattern.as_str()) {
            return true;
        }
        if demangle::is_mangled(pattern) {
            let demangled_pattern = demangle::demangle(pattern);
            if demangled.as_deref() == Some(demangled_pattern.as_str()) {
                return true;
            }
            if let Some(pos) = demangled_pattern.find('(') {
                if pos > 0
                    && demangled_base.as_deref() == Some(&demangled_pattern[..pos])
                {
                    return true;
                }
            }
        }
    }

    false
}

/// The `shouldAnalyze` predicate built from a module and a config.
pub struct FunctionFilter<'a> {
    config: &'a AnalysisConfig,
    module_source_path: String,
    has_path_filter: bool,
    has_func_filter: bool,
}

impl<'a> FunctionFilter<'a> {
    pub fn new(module: &Module, config: &'a AnalysisConfig) -> Self {
        Self {
            config,
            module_source_path: module.source_filename.clone(),
            has_path_filter: !config.only_files.is_empty() || !config.only_dirs.is_empty(),
            has_func_filter: !config.only_functions.is_empty(),
        }
    }

    pub fn should_analyze(&self, module: &Module, func: FuncId) -> bool {
        let function = &module.functions[func];
        if !self.has_path_filter && !self.has_func_filter {
            return true;
        }
        if self.has_func_filter && !function_name_matches(&function.name, self.config) {
            if self.config.dump_filter {
                log::debug!("[filter] func={} file=<name-filter> keep=no", function.name);
            }
            return false;
        }
        if !self.has_path_filter {
            return true;
        }

        let path = function
            .subprogram
            .and_then(|sp| module.metadata.scope_path(sp))
            .unwrap_or_default();
        let (used_path, decision) = if !path.is_empty() {
            let decision = should_include_path(&path, self.config);
            (path, decision)
        } else {
            let name = &function.name;
            if name.starts_with("__") || name.starts_with("llvm.") || name.starts_with("clang.") {
                (String::new(), false)
            } else if !self.module_source_path.is_empty() {
                let decision = should_include_path(&self.module_source_path, self.config);
                (self.module_source_path.clone(), decision)
            } else {
                (String::new(), false)
            }
        };

        if self.config.dump_filter {
            log::debug!(
                "[filter] func={} file={} keep={}",
                function.name,
                if used_path.is_empty() {
                    "<none>"
                } else {
                    used_path.as_str()
                },
                if decision { "yes" } else { "no" }
            );
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_files(files: &[&str], dirs: &[&str]) -> AnalysisConfig {
        AnalysisConfig {
            only_files: files.iter().map(|s| s.to_string()).collect(),
            only_dirs: dirs.iter().map(|s| s.to_string()).collect(),
            ..AnalysisConfig::default()
        }
    }

    #[test]
    fn normalization_folds_segments() {
        assert_eq!(normalize_path_for_match("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path_for_match("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path_for_match("\\a\\b"), "/a/b");
    }

    #[test]
    fn suffix_matching_respects_boundaries() {
        assert!(path_has_suffix("/src/lib/a.c", "a.c"));
        assert!(path_has_suffix("/src/lib/a.c", "lib/a.c"));
        assert!(!path_has_suffix("/src/liba.c", "a.c"));
        assert!(!path_has_suffix("/a.c", "long/a.c"));
    }

    #[test]
    fn file_filters() {
        let config = config_with_files(&["/src/a.c"], &[]);
        assert!(should_include_path("/src/a.c", &config));
        assert!(should_include_path("/other/src/a.c", &config));
        assert!(!should_include_path("/src/b.c", &config));
    }

    #[test]
    fn dir_filters() {
        let config = config_with_files(&[], &["/src/lib"]);
        assert!(should_include_path("/src/lib/a.c", &config));
        assert!(!should_include_path("/src/other/a.c", &config));
    }

    #[test]
    fn function_name_forms() {
        let config = AnalysisConfig {
            only_functions: vec!["foo".to_string()],
            ..AnalysisConfig::default()
        };
        assert!(function_name_matches("foo", &config));
        assert!(function_name_matches("_Z3fooi", &config));
        assert!(function_name_matches("_ZL3foov", &config));
        assert!(!function_name_matches("bar", &config));

        let config = AnalysisConfig {
            only_functions: vec!["_Z3fooi".to_string()],
            ..AnalysisConfig::default()
        };
        assert!(function_name_matches("_Z3fooi", &config));
    }
}
