//! orderBy parsing
//!
//! Accepted shapes: `"col"`, `"col desc"`, `{col: 1 | -1 | true | false}`,
//! `{key, asc, nulls, nullEmpty}` and arrays of any of these. Keys of a
//! multi-key `{col: dir}` map sort alphabetically; use an array to control
//! precedence.

use serde_json::{Map, Value};

use crate::error::{LiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub key: String,
    pub asc: bool,
    pub nulls: Option<NullsOrder>,
    /// Sort empty strings together with NULLs
    pub null_empty: bool,
}

impl OrderTerm {
    pub fn asc(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            asc: true,
            nulls: None,
            null_empty: false,
        }
    }

    pub fn desc(key: impl Into<String>) -> Self {
        Self {
            asc: false,
            ..Self::asc(key)
        }
    }

    /// Render against a resolved expression
    pub fn render(&self, expr: &str) -> String {
        let direction = if self.asc { "ASC" } else { "DESC" };
        let nulls = match self.nulls {
            Some(NullsOrder::First) => " NULLS FIRST",
            Some(NullsOrder::Last) => " NULLS LAST",
            None => "",
        };
        if self.null_empty {
            // Empties rank with NULLs: last unless NULLS FIRST was asked for
            let empties = if self.nulls == Some(NullsOrder::First) { "DESC" } else { "ASC" };
            format!(
                "({expr} IS NULL OR {expr}::text = '') {empties}, {expr} {direction}{nulls}"
            )
        } else {
            format!("{expr} {direction}{nulls}")
        }
    }
}

fn order_err(message: String) -> LiveError {
    LiveError::filter(format!("orderBy: {message}"))
}

pub fn parse_order_by(value: &Value) -> Result<Vec<OrderTerm>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => parse_string(s).map(|t| vec![t]),
        Value::Array(items) => {
            let mut terms = Vec::new();
            for item in items {
                terms.extend(parse_order_by(item)?);
            }
            Ok(terms)
        }
        Value::Object(map) if map.contains_key("key") => parse_object(map).map(|t| vec![t]),
        Value::Object(map) => map
            .iter()
            .map(|(key, dir)| {
                let asc = match dir {
                    Value::Bool(b) => *b,
                    Value::Number(n) if n.as_i64() == Some(1) => true,
                    Value::Number(n) if n.as_i64() == Some(-1) => false,
                    Value::String(s) if s.eq_ignore_ascii_case("asc") => true,
                    Value::String(s) if s.eq_ignore_ascii_case("desc") => false,
                    other => return Err(order_err(format!("invalid direction {other} for {key}"))),
                };
                Ok(OrderTerm {
                    asc,
                    ..OrderTerm::asc(key.clone())
                })
            })
            .collect(),
        other => Err(order_err(format!("invalid value {other}"))),
    }
}

fn parse_string(s: &str) -> Result<OrderTerm> {
    let mut parts = s.split_whitespace();
    let key = parts
        .next()
        .ok_or_else(|| order_err("empty key".to_string()))?;
    let term = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        None | Some("asc") => OrderTerm::asc(key),
        Some("desc") => OrderTerm::desc(key),
        Some(other) => return Err(order_err(format!("invalid direction {other} for {key}"))),
    };
    if parts.next().is_some() {
        return Err(order_err(format!("unexpected text after {key}")));
    }
    Ok(term)
}

fn parse_object(map: &Map<String, Value>) -> Result<OrderTerm> {
    const KEYS: &[&str] = &["key", "asc", "nulls", "nullEmpty"];
    if let Some(bad) = map.keys().find(|k| !KEYS.contains(&k.as_str())) {
        return Err(order_err(format!("unknown option {bad}")));
    }
    let key = map
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| order_err("key must be a string".to_string()))?;
    let asc = match map.get("asc") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => *b,
        Some(other) => return Err(order_err(format!("asc must be a boolean, got {other}"))),
    };
    let nulls = match map.get("nulls").and_then(Value::as_str) {
        None => None,
        Some("first") => Some(NullsOrder::First),
        Some("last") => Some(NullsOrder::Last),
        Some(other) => return Err(order_err(format!("nulls must be first or last, got {other}"))),
    };
    let null_empty = map.get("nullEmpty").and_then(Value::as_bool).unwrap_or(false);
    Ok(OrderTerm {
        key: key.to_string(),
        asc,
        nulls,
        null_empty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_forms() {
        assert_eq!(parse_order_by(&json!("name")).unwrap(), vec![OrderTerm::asc("name")]);
        assert_eq!(
            parse_order_by(&json!(["name desc", "id"])).unwrap(),
            vec![OrderTerm::desc("name"), OrderTerm::asc("id")]
        );
        assert!(parse_order_by(&json!("name sideways")).is_err());
    }

    #[test]
    fn object_forms() {
        assert_eq!(
            parse_order_by(&json!({"b": -1, "a": true})).unwrap(),
            vec![OrderTerm::asc("a"), OrderTerm::desc("b")]
        );
        let terms = parse_order_by(&json!([{"key": "name", "asc": false, "nulls": "last"}])).unwrap();
        assert_eq!(terms[0].nulls, Some(NullsOrder::Last));
        assert!(!terms[0].asc);
        assert!(parse_order_by(&json!({"key": "a", "dir": 1})).is_err());
    }

    #[test]
    fn render_with_null_empty() {
        let term = OrderTerm {
            null_empty: true,
            ..OrderTerm::desc("x")
        };
        assert_eq!(
            term.render("\"t\".\"x\""),
            "(\"t\".\"x\" IS NULL OR \"t\".\"x\"::text = '') ASC, \"t\".\"x\" DESC"
        );
    }
}
