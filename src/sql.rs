//! SQL text helpers.
//!
//! Identifiers and literals are the only user-influenced pieces of SQL text;
//! both are escaped here and nowhere else.

use serde_json::Value;

/// Quote an identifier: `my "col"` -> `"my ""col"""`
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a qualified name, skipping the schema when it is `public`
pub fn quote_qualified(schema: &str, name: &str) -> String {
    if schema.is_empty() || schema == "public" {
        quote_ident(name)
    } else {
        format!("{}.{}", quote_ident(schema), quote_ident(name))
    }
}

/// Quote a string literal. Backslashes switch to the `E''` form.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

/// Render a JSON value as a SQL literal
///
/// Arrays render as `ARRAY[...]`, objects as a quoted JSON text.
pub fn json_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(json_literal).collect();
            format!("ARRAY[{}]", parts.join(", "))
        }
        Value::Object(_) => quote_literal(&value.to_string()),
    }
}

/// Render a JSON value as a literal cast to the column's type
pub fn typed_literal(value: &Value, udt_name: &str) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Array(items) if udt_name.starts_with('_') => {
            if items.is_empty() {
                format!("'{{}}'::{}", cast_type(udt_name))
            } else {
                format!("{}::{}", json_literal(value), cast_type(udt_name))
            }
        }
        Value::Array(_) | Value::Object(_) if is_json_type(udt_name) => {
            format!("{}::{}", quote_literal(&value.to_string()), udt_name)
        }
        _ => json_literal(value),
    }
}

/// `_int4` -> `int4[]`; other udt names are already valid cast targets
pub fn cast_type(udt_name: &str) -> String {
    match udt_name.strip_prefix('_') {
        Some(inner) => format!("{inner}[]"),
        None => udt_name.to_string(),
    }
}

pub fn is_json_type(udt_name: &str) -> bool {
    matches!(udt_name, "json" | "jsonb")
}

pub fn is_geo_type(udt_name: &str) -> bool {
    matches!(udt_name, "geometry" | "geography")
}

pub fn is_numeric_type(udt_name: &str) -> bool {
    matches!(
        udt_name,
        "int2" | "int4" | "int8" | "float4" | "float8" | "numeric" | "money"
    )
}

pub fn is_text_type(udt_name: &str) -> bool {
    matches!(udt_name, "text" | "varchar" | "bpchar" | "citext" | "name")
}

/// Types without a default equality operator, which cannot appear in GROUP BY
/// as-is. Returns the cast that makes them groupable.
pub fn group_safe_cast(udt_name: &str) -> Option<&'static str> {
    match udt_name {
        "json" => Some("jsonb"),
        "xml" | "point" | "polygon" | "line" | "circle" | "path" => Some("text"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_are_escaped() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_qualified("public", "t"), "\"t\"");
        assert_eq!(quote_qualified("audit", "t"), "\"audit\".\"t\"");
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\b"), "E'a\\\\b'");
        assert_eq!(json_literal(&json!("x'; DROP TABLE t; --")), "'x''; DROP TABLE t; --'");
        assert_eq!(json_literal(&json!(null)), "NULL");
        assert_eq!(json_literal(&json!(3.5)), "3.5");
        assert_eq!(json_literal(&json!([1, "a"])), "ARRAY[1, 'a']");
    }

    #[test]
    fn typed_literals_cast_arrays_and_json() {
        assert_eq!(typed_literal(&json!([1, 2]), "_int4"), "ARRAY[1, 2]::int4[]");
        assert_eq!(typed_literal(&json!([]), "_text"), "'{}'::text[]");
        assert_eq!(
            typed_literal(&json!({"a": 1}), "jsonb"),
            "'{\"a\":1}'::jsonb"
        );
        assert_eq!(typed_literal(&json!("x"), "text"), "'x'");
    }
}
