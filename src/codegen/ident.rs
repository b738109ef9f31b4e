//! Python identifier mapping for generated modules.
//!
//! Tool and field names arrive as arbitrary strings; generated code
//! needs legal, deterministic Python identifiers. Collisions after
//! sanitizing are resolved by sorted order with numeric suffixes, so
//! regeneration from the same tool list always yields the same names.

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Module names the generator itself claims inside `tools/`.
const RESERVED_MODULES: &[&str] = &["_preamble"];

/// Sanitize a name into a legal Python identifier.
pub fn py_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len().max(1));
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    if PYTHON_KEYWORDS.contains(&out.as_str()) {
        out.push('_');
    }
    out
}

/// Sanitized identifier suitable as a module file name under `tools/`.
pub fn py_module_ident(name: &str) -> String {
    let ident = py_ident(name);
    if RESERVED_MODULES.contains(&ident.as_str()) {
        format!("{ident}_")
    } else {
        ident
    }
}

/// CamelCase class name built from name parts.
pub fn py_class_name(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        for word in py_ident(part).split('_').filter(|w| !w.is_empty()) {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        }
    }
    if out.is_empty() {
        out.push_str("Anon");
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Map original names to unique module identifiers.
///
/// Input order does not matter: names are processed sorted, and the
/// first claimant of an identifier keeps it while later ones get
/// `_2`, `_3`, … suffixes.
pub fn resolve_collisions(names: &[&str]) -> Vec<(String, String)> {
    let mut sorted: Vec<&str> = names.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut used = std::collections::HashSet::new();
    let mut resolved = Vec::with_capacity(sorted.len());
    for name in sorted {
        let base = py_module_ident(name);
        let mut candidate = base.clone();
        let mut suffix = 1usize;
        while !used.insert(candidate.clone()) {
            suffix += 1;
            candidate = format!("{base}_{suffix}");
        }
        resolved.push((name.to_string(), candidate));
    }
    resolved
}
