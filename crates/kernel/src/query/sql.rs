//! Small SQL text helpers shared by the compilers.

/// Whether a name can be spliced into SQL as a quoted identifier.
///
/// Every table, column and alias that reaches raw SQL fragments has passed
/// this check when the registry was built.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
}

/// `"name"`
pub fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

/// `"table"."column"`
pub fn qualified(table: &str, column: &str) -> String {
    format!("\"{table}\".\"{column}\"")
}

/// Escape SQL LIKE wildcard characters (`%`, `_`, `\`) in a value.
pub fn escape_like_wildcards(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Substring pattern for `ILIKE`.
pub fn contains_pattern(term: &str) -> String {
    format!("%{}%", escape_like_wildcards(term))
}
