//! Prompt templates referencing other column values as `${column-id}`.

use std::collections::BTreeMap;

use crate::types::ColumnId;

/// Marker substituted for a referenced column that has no value. Kept
/// distinct from the empty string so downstream prompt and RAG logic can
/// tell "absent" from "genuinely empty".
pub fn absent_marker(col: &str) -> String {
    format!("[no value for '{col}']")
}

/// Column ids referenced by a template, in first-occurrence order.
pub fn referenced_columns(template: &str) -> Vec<ColumnId> {
    let mut out: Vec<ColumnId> = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                if !name.is_empty() && !out.iter().any(|c| c == name) {
                    out.push(name.to_string());
                }
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Rendered template plus the referenced columns that had no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub missing: Vec<ColumnId>,
}

/// Substitute `${col}` references with values. A missing referenced column
/// never aborts rendering; it is replaced by the explicit absent marker so
/// generation degrades gracefully instead of failing.
pub fn render(template: &str, values: &BTreeMap<ColumnId, Option<String>>) -> Rendered {
    let mut text = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                match values.get(name).and_then(|v| v.as_deref()) {
                    Some(v) => text.push_str(v),
                    None => {
                        text.push_str(&absent_marker(name));
                        if !missing.iter().any(|c| c == name) {
                            missing.push(name.to_string());
                        }
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference: keep the literal tail.
                text.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    text.push_str(rest);
    Rendered { text, missing }
}
