//! Select AST
//!
//! Accepted shapes:
//! - `"*"` or absent: every allowed column
//! - `["a", "b"]`: listed columns
//! - `{a: 1, b: 1}` / `{a: 0}`: inclusion or exclusion map
//! - a map mixing `alias: "column"` renames, `alias: {$func: [args]}` calls,
//!   `table: select` nested joins and `alias: {$leftJoin: path, ...}` joins

use serde_json::{Map, Value};

use crate::error::{LiveError, Result};
use crate::filter::FilterNode;

/// Parsed select shape
#[derive(Debug, Clone, PartialEq)]
pub enum SelectNode {
    All,
    Include(Vec<SelectEntry>),
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectEntry {
    /// Every allowed column
    AllColumns,
    Column { name: String, alias: Option<String> },
    Function { alias: String, name: String, args: Vec<Value> },
    Join(JoinSelect),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
}

/// Nested select over a related table
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSelect {
    pub alias: String,
    pub kind: JoinKind,
    /// `None` joins `alias` as a table over the shortest path
    pub path: Option<Vec<String>>,
    pub select: SelectNode,
    pub filter: FilterNode,
    pub order_by: Option<Value>,
    pub limit: Option<u64>,
}

impl JoinSelect {
    pub fn target(&self) -> &str {
        self.path
            .as_ref()
            .and_then(|p| p.last())
            .map(String::as_str)
            .unwrap_or(&self.alias)
    }
}

impl SelectNode {
    pub fn parse(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(SelectNode::All),
            Value::String(s) if s == "*" || s.is_empty() => Ok(SelectNode::All),
            Value::String(s) => Ok(SelectNode::Include(vec![column(s)])),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) if s == "*" => Ok(SelectEntry::AllColumns),
                    Value::String(s) => Ok(column(s)),
                    other => Err(select_err(format!(
                        "select array items must be column names, got {other}"
                    ))),
                })
                .collect::<Result<Vec<_>>>()
                .map(SelectNode::Include),
            Value::Object(map) => parse_map(map),
            other => Err(select_err(format!("invalid select {other}"))),
        }
    }

    /// Joins in declaration order
    pub fn joins(&self) -> impl Iterator<Item = &JoinSelect> {
        let entries: &[SelectEntry] = match self {
            SelectNode::Include(entries) => entries,
            _ => &[],
        };
        entries.iter().filter_map(|e| match e {
            SelectEntry::Join(join) => Some(join),
            _ => None,
        })
    }
}

fn select_err(message: String) -> LiveError {
    LiveError::filter(format!("select: {message}"))
}

fn column(name: &str) -> SelectEntry {
    SelectEntry::Column {
        name: name.to_string(),
        alias: None,
    }
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_map(map: &Map<String, Value>) -> Result<SelectNode> {
    if map.is_empty() {
        return Ok(SelectNode::Include(Vec::new()));
    }

    let flags: Vec<Option<bool>> = map.values().map(flag).collect();
    if flags.iter().all(Option::is_some) {
        let included = flags.iter().filter(|f| **f == Some(true)).count();
        return if included == map.len() {
            Ok(SelectNode::Include(
                map.keys()
                    .map(|k| if k == "*" { SelectEntry::AllColumns } else { column(k) })
                    .collect(),
            ))
        } else if included == 0 {
            Ok(SelectNode::Exclude(map.keys().cloned().collect()))
        } else {
            Err(select_err("cannot mix included and excluded fields".to_string()))
        };
    }

    map.iter()
        .map(|(key, value)| parse_entry(key, value))
        .collect::<Result<Vec<_>>>()
        .map(SelectNode::Include)
}

fn parse_entry(key: &str, value: &Value) -> Result<SelectEntry> {
    match value {
        _ if flag(value) == Some(true) => Ok(if key == "*" {
            SelectEntry::AllColumns
        } else {
            column(key)
        }),
        _ if flag(value).is_some() => Err(select_err(format!(
            "cannot exclude {key} while selecting other expressions"
        ))),
        Value::String(s) if s == "*" => Ok(SelectEntry::Join(JoinSelect {
            alias: key.to_string(),
            kind: JoinKind::Left,
            path: None,
            select: SelectNode::All,
            filter: FilterNode::empty(),
            order_by: None,
            limit: None,
        })),
        Value::String(s) => Ok(SelectEntry::Column {
            name: s.clone(),
            alias: Some(key.to_string()),
        }),
        Value::Array(_) => Ok(SelectEntry::Join(JoinSelect {
            alias: key.to_string(),
            kind: JoinKind::Left,
            path: None,
            select: SelectNode::parse(value)?,
            filter: FilterNode::empty(),
            order_by: None,
            limit: None,
        })),
        Value::Object(inner) => {
            if inner.contains_key("$leftJoin") || inner.contains_key("$innerJoin") {
                return parse_join_options(key, inner).map(SelectEntry::Join);
            }
            let mut entries = inner.iter();
            if let (Some((name, args)), None) = (entries.next(), entries.next()) {
                if name.starts_with('$') {
                    let args = match args {
                        Value::Array(items) => items.clone(),
                        single => vec![single.clone()],
                    };
                    return Ok(SelectEntry::Function {
                        alias: key.to_string(),
                        name: name.clone(),
                        args,
                    });
                }
            }
            Ok(SelectEntry::Join(JoinSelect {
                alias: key.to_string(),
                kind: JoinKind::Left,
                path: None,
                select: SelectNode::parse(value)?,
                filter: FilterNode::empty(),
                order_by: None,
                limit: None,
            }))
        }
        other => Err(select_err(format!("invalid value for {key}: {other}"))),
    }
}

fn parse_join_options(alias: &str, options: &Map<String, Value>) -> Result<JoinSelect> {
    const KEYS: &[&str] = &["$leftJoin", "$innerJoin", "select", "filter", "orderBy", "limit"];
    if let Some(bad) = options.keys().find(|k| !KEYS.contains(&k.as_str())) {
        return Err(select_err(format!("unknown join option {bad} in {alias}")));
    }
    let (kind, target) = match (options.get("$leftJoin"), options.get("$innerJoin")) {
        (Some(t), None) => (JoinKind::Left, t),
        (None, Some(t)) => (JoinKind::Inner, t),
        _ => {
            return Err(select_err(format!(
                "{alias} must use exactly one of $leftJoin or $innerJoin"
            )))
        }
    };
    let path = match target {
        Value::String(table) => vec![table.clone()],
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|t| {
                t.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| select_err(format!("join path of {alias} must be table names")))
            })
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(select_err(format!("invalid join path for {alias}"))),
    };
    let limit = match options.get("limit") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| select_err(format!("limit of {alias} must be a non-negative integer")))?,
        ),
    };
    Ok(JoinSelect {
        alias: alias.to_string(),
        kind,
        path: Some(path),
        select: SelectNode::parse(options.get("select").unwrap_or(&Value::Null))?,
        filter: FilterNode::parse(options.get("filter").unwrap_or(&Value::Null))?,
        order_by: options.get("orderBy").cloned(),
        limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn star_and_arrays() {
        assert_eq!(SelectNode::parse(&json!("*")).unwrap(), SelectNode::All);
        assert_eq!(SelectNode::parse(&Value::Null).unwrap(), SelectNode::All);
        assert_eq!(
            SelectNode::parse(&json!(["id", "*"])).unwrap(),
            SelectNode::Include(vec![column("id"), SelectEntry::AllColumns])
        );
    }

    #[test]
    fn flag_maps() {
        assert_eq!(
            SelectNode::parse(&json!({"secret": 0})).unwrap(),
            SelectNode::Exclude(vec!["secret".into()])
        );
        assert!(SelectNode::parse(&json!({"a": 1, "b": 0})).is_err());
        assert!(SelectNode::parse(&json!({"a": 0, "n": {"$upper": ["a"]}})).is_err());
    }

    #[test]
    fn mixed_map_entries() {
        let node = SelectNode::parse(&json!({
            "id": 1,
            "label": "name",
            "loud": {"$upper": ["name"]},
            "posts": {"title": 1},
        }))
        .unwrap();
        let SelectNode::Include(entries) = node else {
            panic!("expected include");
        };
        assert!(entries.contains(&SelectEntry::Column {
            name: "name".into(),
            alias: Some("label".into())
        }));
        assert!(entries.contains(&SelectEntry::Function {
            alias: "loud".into(),
            name: "$upper".into(),
            args: vec![json!("name")],
        }));
        assert!(entries
            .iter()
            .any(|e| matches!(e, SelectEntry::Join(j) if j.target() == "posts")));
    }

    #[test]
    fn explicit_join_options() {
        let node = SelectNode::parse(&json!({
            "recent": {
                "$innerJoin": ["posts", "comments"],
                "select": ["body"],
                "filter": {"body": {"$ilike": "%x%"}},
                "orderBy": "id desc",
                "limit": 2
            }
        }))
        .unwrap();
        let join = node.joins().next().unwrap();
        assert_eq!(join.kind, JoinKind::Inner);
        assert_eq!(join.target(), "comments");
        assert_eq!(join.limit, Some(2));
        assert!(!join.filter.is_empty());

        assert!(SelectNode::parse(&json!({"x": {"$leftJoin": "a", "bogus": 1}})).is_err());
    }
}
