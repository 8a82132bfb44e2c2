//! Template expressions: literal text mixed with `{path.to.field}` placeholders.
//!
//! Templates describe composed display labels such as `"{first_name} {last_name}"`
//! or `"{customer.name} ({code})"`. The same parsed form drives search
//! predicates, ORDER BY expressions and calendar titles.

use std::fmt;

use serde_json::Value;

/// A dot-separated placeholder path: `field` or `relation.other.field`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(String);

impl FieldPath {
    /// Build a path from its raw dotted form.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The trailing column name.
    pub fn column(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// The relation hops preceding the column (empty for a plain field).
    pub fn relations(&self) -> Vec<&str> {
        let mut segments: Vec<&str> = self.segments().collect();
        segments.pop();
        segments
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed template: `literals.len() == paths.len() + 1`, interleaved as
/// `literals[0] {paths[0]} literals[1] ... {paths[n-1]} literals[n]`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TemplateExpr {
    literals: Vec<String>,
    paths: Vec<FieldPath>,
}

impl TemplateExpr {
    /// Parse a template string. Never fails: anything that is not a well
    /// formed `{ident(.ident)*}` placeholder stays literal text.
    pub fn parse(template: &str) -> Self {
        let mut literals = Vec::new();
        let mut paths = Vec::new();
        let mut current = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            current.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match placeholder_len(after) {
                Some(len) => {
                    literals.push(std::mem::take(&mut current));
                    paths.push(FieldPath::new(&after[..len]));
                    rest = &after[len + 1..];
                }
                None => {
                    current.push('{');
                    rest = after;
                }
            }
        }

        current.push_str(rest);
        literals.push(current);

        Self { literals, paths }
    }

    pub fn literals(&self) -> &[String] {
        &self.literals
    }

    pub fn paths(&self) -> &[FieldPath] {
        &self.paths
    }

    /// True when the template contains no placeholders at all.
    pub fn is_plain(&self) -> bool {
        self.paths.is_empty()
    }

    /// Segments in source order; `None` paths mark pure literal runs.
    pub fn segments(&self) -> impl Iterator<Item = (&str, Option<&FieldPath>)> {
        self.literals
            .iter()
            .enumerate()
            .map(|(i, lit)| (lit.as_str(), self.paths.get(i)))
    }

    /// Substitute placeholders with values looked up in a JSON row.
    ///
    /// Nested paths walk embedded relation objects (`customer.name` reads
    /// `row["customer"]["name"]`). Missing or null values render empty.
    pub fn render(&self, row: &Value) -> String {
        let mut out = String::new();
        for (literal, path) in self.segments() {
            out.push_str(literal);
            if let Some(path) = path {
                let mut value = row;
                for segment in path.segments() {
                    value = value.get(segment).unwrap_or(&Value::Null);
                }
                match value {
                    Value::Null => {}
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
        }
        out
    }
}

/// Length of a valid placeholder body starting right after `{`, if the text
/// up to the next `}` is a dotted identifier path.
fn placeholder_len(s: &str) -> Option<usize> {
    let close = s.find('}')?;
    let inner = &s[..close];
    let valid = inner.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    valid.then_some(close)
}

impl fmt::Display for TemplateExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (literal, path) in self.segments() {
            f.write_str(literal)?;
            if let Some(path) = path {
                write!(f, "{{{path}}}")?;
            }
        }
        Ok(())
    }
}

impl From<String> for TemplateExpr {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<TemplateExpr> for String {
    fn from(expr: TemplateExpr) -> Self {
        expr.to_string()
    }
}
