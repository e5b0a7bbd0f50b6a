//! Filter AST
//!
//! Parsing is a separate pass from SQL emission: a filter object either
//! parses into a [`FilterNode`] tree or is rejected with a
//! [`LiveError::FilterSyntax`] before any column is resolved.

use serde_json::{Map, Value};

use crate::error::{LiveError, Result};

/// Comparison operator from the closed operator table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    Like,
    ILike,
    NotLike,
    NotILike,
    IsNull,
    IsNotNull,
    Contains,
    ContainedBy,
    Overlaps,
    TextSearch,
    Geo(GeoOp),
}

/// PostGIS bounding-box operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoOp {
    OverlapsOrLeft,
    OverlapsOrRight,
    StrictlyLeft,
    StrictlyRight,
    SameAs,
    BoxContains,
    BoxContainedBy,
    OverlapsOrBelow,
    StrictlyBelow,
    StrictlyAbove,
    OverlapsOrAbove,
}

impl GeoOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            GeoOp::OverlapsOrLeft => "&<",
            GeoOp::OverlapsOrRight => "&>",
            GeoOp::StrictlyLeft => "<<",
            GeoOp::StrictlyRight => ">>",
            GeoOp::SameAs => "~=",
            GeoOp::BoxContains => "~",
            GeoOp::BoxContainedBy => "@",
            GeoOp::OverlapsOrBelow => "&<|",
            GeoOp::StrictlyBelow => "<<|",
            GeoOp::StrictlyAbove => "|>>",
            GeoOp::OverlapsOrAbove => "|&>",
        }
    }
}

impl FilterOp {
    /// Look up an operator key; `None` for anything outside the table
    pub fn parse(key: &str) -> Option<Self> {
        let op = match key {
            "=" | "$eq" => FilterOp::Eq,
            "<>" | "!=" | "$ne" => FilterOp::Ne,
            ">" | "$gt" => FilterOp::Gt,
            ">=" | "$gte" => FilterOp::Gte,
            "<" | "$lt" => FilterOp::Lt,
            "<=" | "$lte" => FilterOp::Lte,
            "$in" => FilterOp::In,
            "$nin" => FilterOp::NotIn,
            "$between" => FilterOp::Between,
            "$like" => FilterOp::Like,
            "$ilike" => FilterOp::ILike,
            "$nlike" => FilterOp::NotLike,
            "$nilike" => FilterOp::NotILike,
            "$isNull" => FilterOp::IsNull,
            "$isNotNull" => FilterOp::IsNotNull,
            "@>" | "$contains" => FilterOp::Contains,
            "<@" | "$containedBy" => FilterOp::ContainedBy,
            "&&" | "$overlaps" => FilterOp::Overlaps,
            "@@" | "$term" => FilterOp::TextSearch,
            "&<" => FilterOp::Geo(GeoOp::OverlapsOrLeft),
            "&>" => FilterOp::Geo(GeoOp::OverlapsOrRight),
            "<<" => FilterOp::Geo(GeoOp::StrictlyLeft),
            ">>" => FilterOp::Geo(GeoOp::StrictlyRight),
            "~=" => FilterOp::Geo(GeoOp::SameAs),
            "~" => FilterOp::Geo(GeoOp::BoxContains),
            "@" => FilterOp::Geo(GeoOp::BoxContainedBy),
            "&<|" => FilterOp::Geo(GeoOp::OverlapsOrBelow),
            "<<|" => FilterOp::Geo(GeoOp::StrictlyBelow),
            "|>>" => FilterOp::Geo(GeoOp::StrictlyAbove),
            "|&>" => FilterOp::Geo(GeoOp::OverlapsOrAbove),
            _ => return None,
        };
        Some(op)
    }

    fn looks_like_operator(key: &str) -> bool {
        key.starts_with('$') || key.chars().all(|c| "=<>!@&|~".contains(c))
    }
}

/// `column op value`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Column name, or a JSON path rooted at a column (`data.a.b`, `data->>a`)
    pub key: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Sub-query existence test against a related table
#[derive(Debug, Clone, PartialEq)]
pub struct ExistsFilter {
    pub negated: bool,
    /// Target table for `$exists`; explicit hop chain for `$existsJoined`
    pub route: ExistsRoute,
    pub filter: Box<FilterNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistsRoute {
    /// Shortest path to this table
    Shortest(String),
    /// Explicit chain of tables, the last one being the target
    Chain(Vec<String>),
}

impl ExistsRoute {
    pub fn target(&self) -> &str {
        match self {
            ExistsRoute::Shortest(table) => table,
            ExistsRoute::Chain(chain) => chain.last().map(String::as_str).unwrap_or_default(),
        }
    }
}

/// Parsed filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Condition(Condition),
    Exists(ExistsFilter),
}

impl FilterNode {
    /// The empty filter; compiles to no condition
    pub fn empty() -> Self {
        FilterNode::And(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FilterNode::And(children) | FilterNode::Or(children) if children.is_empty())
    }

    pub fn parse(value: &Value) -> Result<Self> {
        parse_node(value, false)
    }

    /// Combine with a server-authored filter
    pub fn and(self, other: FilterNode) -> FilterNode {
        match (self.is_empty(), other.is_empty()) {
            (true, _) => other,
            (_, true) => self,
            _ => FilterNode::And(vec![self, other]),
        }
    }

    /// Every table reached through `$exists` clauses, in encounter order
    pub fn exists_targets(&self) -> Vec<&ExistsRoute> {
        let mut out = Vec::new();
        self.collect_exists(&mut out);
        out
    }

    fn collect_exists<'a>(&'a self, out: &mut Vec<&'a ExistsRoute>) {
        match self {
            FilterNode::And(children) | FilterNode::Or(children) => {
                children.iter().for_each(|c| c.collect_exists(out))
            }
            FilterNode::Not(child) => child.collect_exists(out),
            FilterNode::Exists(exists) => out.push(&exists.route),
            FilterNode::Condition(_) => {}
        }
    }
}

fn parse_node(value: &Value, inside_exists: bool) -> Result<FilterNode> {
    let map = match value {
        Value::Object(map) => map,
        Value::Null => return Ok(FilterNode::empty()),
        other => {
            return Err(LiveError::filter(format!(
                "filter must be an object, got {other}"
            )))
        }
    };

    for group in ["$and", "$or", "$not"] {
        if map.contains_key(group) && map.len() > 1 {
            return Err(LiveError::filter(format!(
                "{group} must be the only key of its object"
            )));
        }
    }

    if let Some(children) = map.get("$and") {
        return Ok(FilterNode::And(parse_group("$and", children, inside_exists)?));
    }
    if let Some(children) = map.get("$or") {
        return Ok(FilterNode::Or(parse_group("$or", children, inside_exists)?));
    }
    if let Some(child) = map.get("$not") {
        return Ok(FilterNode::Not(Box::new(parse_node(child, inside_exists)?)));
    }

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut nodes = keys
        .into_iter()
        .map(|key| parse_entry(key, &map[key.as_str()], inside_exists))
        .collect::<Result<Vec<_>>>()?;

    if nodes.len() == 1 {
        Ok(nodes.remove(0))
    } else {
        Ok(FilterNode::And(nodes))
    }
}

fn parse_group(name: &str, value: &Value, inside_exists: bool) -> Result<Vec<FilterNode>> {
    let Value::Array(items) = value else {
        return Err(LiveError::filter(format!("{name} expects an array")));
    };
    items.iter().map(|item| parse_node(item, inside_exists)).collect()
}

fn parse_entry(key: &str, value: &Value, inside_exists: bool) -> Result<FilterNode> {
    let exists_kind = match key {
        "$exists" => Some((false, false)),
        "$notExists" => Some((true, false)),
        "$existsJoined" => Some((false, true)),
        "$notExistsJoined" => Some((true, true)),
        _ => None,
    };
    if let Some((negated, joined)) = exists_kind {
        if inside_exists {
            return Err(LiveError::filter(format!(
                "{key} cannot be nested inside another exists filter"
            )));
        }
        return parse_exists(key, value, negated, joined);
    }

    if key.starts_with('$') {
        return Err(LiveError::filter(format!("unknown filter operator {key}")));
    }

    match value {
        Value::Object(operand) if !operand.is_empty() => parse_operator(key, operand),
        _ => Ok(FilterNode::Condition(Condition {
            key: key.to_string(),
            op: FilterOp::Eq,
            value: value.clone(),
        })),
    }
}

fn parse_operator(key: &str, operand: &Map<String, Value>) -> Result<FilterNode> {
    let mut entries = operand.iter();
    let (Some((op_key, op_value)), None) = (entries.next(), entries.next()) else {
        return Err(LiveError::filter(format!(
            "filter on {key} must have exactly one operator, got {}",
            operand.len()
        )));
    };
    let Some(op) = FilterOp::parse(op_key) else {
        return Err(if FilterOp::looks_like_operator(op_key) {
            LiveError::filter(format!("unknown filter operator {op_key} on {key}"))
        } else {
            LiveError::filter(format!(
                "ambiguous object value for {key}; use $eq to compare with an object"
            ))
        });
    };
    validate_arity(key, op, op_value)?;
    Ok(FilterNode::Condition(Condition {
        key: key.to_string(),
        op,
        value: op_value.clone(),
    }))
}

fn validate_arity(key: &str, op: FilterOp, value: &Value) -> Result<()> {
    match op {
        FilterOp::In | FilterOp::NotIn if !value.is_array() => Err(LiveError::filter(format!(
            "$in/$nin on {key} expects an array"
        ))),
        FilterOp::Between => match value {
            Value::Array(items) if items.len() == 2 && items.iter().all(|v| !v.is_null()) => Ok(()),
            _ => Err(LiveError::filter(format!(
                "$between on {key} expects exactly 2 non-null elements"
            ))),
        },
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte
            if value.is_null() || value.is_array() || value.is_object() =>
        {
            Err(LiveError::filter(format!(
                "comparison on {key} expects a scalar value"
            )))
        }
        FilterOp::Like | FilterOp::ILike | FilterOp::NotLike | FilterOp::NotILike
            if !value.is_string() =>
        {
            Err(LiveError::filter(format!("pattern match on {key} expects a string")))
        }
        FilterOp::IsNull | FilterOp::IsNotNull if !value.is_boolean() && !value.is_null() => {
            Err(LiveError::filter(format!("$isNull on {key} expects a boolean")))
        }
        _ => Ok(()),
    }
}

fn parse_exists(key: &str, value: &Value, negated: bool, joined: bool) -> Result<FilterNode> {
    let Value::Object(map) = value else {
        return Err(LiveError::filter(format!("{key} expects an object")));
    };
    let mut entries = map.iter();
    let (Some((target, inner)), None) = (entries.next(), entries.next()) else {
        return Err(LiveError::filter(format!(
            "{key} expects exactly one table, got {}",
            map.len()
        )));
    };

    let route = if joined {
        let chain: Vec<String> = target.split('.').map(str::to_string).collect();
        if chain.iter().any(String::is_empty) {
            return Err(LiveError::filter(format!("invalid join path {target} in {key}")));
        }
        ExistsRoute::Chain(chain)
    } else {
        if target.contains('.') {
            return Err(LiveError::filter(format!(
                "{key} takes a table name; use $existsJoined for {target}"
            )));
        }
        ExistsRoute::Shortest(target.clone())
    };

    Ok(FilterNode::Exists(ExistsFilter {
        negated,
        route,
        filter: Box::new(parse_node(inner, true)?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_values_are_equality() {
        let node = FilterNode::parse(&json!({"name": "x"})).unwrap();
        assert_eq!(
            node,
            FilterNode::Condition(Condition {
                key: "name".into(),
                op: FilterOp::Eq,
                value: json!("x"),
            })
        );
    }

    #[test]
    fn multi_key_objects_sort_into_and() {
        let node = FilterNode::parse(&json!({"b": 2, "a": 1})).unwrap();
        let FilterNode::And(children) = node else {
            panic!("expected AND");
        };
        let keys: Vec<_> = children
            .iter()
            .map(|c| match c {
                FilterNode::Condition(c) => c.key.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn group_keys_must_be_alone() {
        let err = FilterNode::parse(&json!({"$or": [], "a": 1})).unwrap_err();
        assert!(err.to_string().contains("only key"));
        let err = FilterNode::parse(&json!({"$and": {"a": 1}})).unwrap_err();
        assert!(err.to_string().contains("expects an array"));
    }

    #[test]
    fn unknown_operators_are_rejected() {
        assert!(FilterNode::parse(&json!({"a": {"$foo": 1}})).is_err());
        assert!(FilterNode::parse(&json!({"$foo": 1})).is_err());
        assert!(FilterNode::parse(&json!({"a": {"$gt": 1, "$lt": 5}})).is_err());
        let err = FilterNode::parse(&json!({"a": {"k": 1}})).unwrap_err();
        assert!(err.to_string().contains("$eq"));
    }

    #[test]
    fn between_requires_two_elements() {
        assert!(FilterNode::parse(&json!({"a": {"$between": [1]}})).is_err());
        assert!(FilterNode::parse(&json!({"a": {"$between": [1, null]}})).is_err());
        assert!(FilterNode::parse(&json!({"a": {"$between": [1, 2]}})).is_ok());
    }

    #[test]
    fn nested_exists_is_rejected() {
        let err = FilterNode::parse(&json!({
            "$exists": {"posts": {"$exists": {"comments": {}}}}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn exists_joined_splits_chain() {
        let node = FilterNode::parse(&json!({"$notExistsJoined": {"posts.comments": {"id": 1}}}))
            .unwrap();
        let FilterNode::Exists(exists) = node else {
            panic!("expected exists");
        };
        assert!(exists.negated);
        assert_eq!(
            exists.route,
            ExistsRoute::Chain(vec!["posts".into(), "comments".into()])
        );
        assert_eq!(exists.route.target(), "comments");
    }

    #[test]
    fn exists_takes_a_single_table() {
        assert!(FilterNode::parse(&json!({"$exists": {"a": {}, "b": {}}})).is_err());
    }

    #[test]
    fn and_with_empty_is_identity() {
        let user = FilterNode::parse(&json!({"a": 1})).unwrap();
        assert_eq!(user.clone().and(FilterNode::empty()), user);
        assert_eq!(FilterNode::empty().and(user.clone()), user);
    }
}
