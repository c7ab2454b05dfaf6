//! Symbol demangling helpers (Itanium ABI only).

use cpp_demangle::{DemangleOptions, Symbol};

/// Does the symbol demangle as an Itanium C++ name?
pub fn is_mangled(name: &str) -> bool {
    name.starts_with("_Z") && Symbol::new(name.as_bytes()).is_ok()
}

/// Demangle a symbol; non-mangled names come back unchanged.
pub fn demangle(name: &str) -> String {
    Symbol::new(name.as_bytes())
        .ok()
        .and_then(|sym| sym.demangle(&DemangleOptions::default()).ok())
        .unwrap_or_else(|| name.to_string())
}

/// Demangled name with the argument list stripped, when the symbol
/// demangles.
pub fn demangle_without_args(name: &str) -> Option<String> {
    let demangled = Symbol::new(name.as_bytes())
        .ok()
        .and_then(|sym| sym.demangle(&DemangleOptions::default()).ok())?;
    match demangled.find('(') {
        Some(pos) if pos > 0 => Some(demangled[..pos].to_string()),
        _ => Some(demangled),
    }
}

/// The inner identifier of a plain `_Z[L]<len><name>...` symbol.
pub fn itanium_base_name(symbol: &str) -> Option<String> {
    let rest = symbol.strip_prefix("_Z")?;
    let rest = rest.strip_prefix('L').unwrap_or(rest);
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let len: usize = rest[..digits_end].parse().ok()?;
    let name = &rest[digits_end..];
    if len == 0 || name.len() < len {
        return None;
    }
    Some(name[..len].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn itanium_base_names() {
        assert_eq!(itanium_base_name("_Z3foov"), Some("foo".to_string()));
        assert_eq!(itanium_base_name("_ZL6helperi"), Some("helper".to_string()));
        assert_eq!(itanium_base_name("main"), None);
        assert_eq!(itanium_base_name("_Zv"), None);
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(demangle("main"), "main");
        assert!(!is_mangled("main"));
    }

    #[test]
    fn mangled_names_demangle() {
        assert!(is_mangled("_Z3fooi"));
        let pretty = demangle("_Z3fooi");
        assert!(pretty.starts_with("foo("), "got {pretty}");
        assert_eq!(demangle_without_args("_Z3fooi"), Some("foo".to_string()));
    }
}
