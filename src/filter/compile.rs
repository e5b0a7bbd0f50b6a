//! Filter SQL emission
//!
//! Every emitted condition qualifies its columns with the table name, so the
//! same string is valid inside a SELECT, inside an EXISTS sub-query and inside
//! the trigger function where the transition table is aliased to the table
//! name. That string doubles as the Trigger dedup key.

use livesql_types::TableCatalogEntry;
use serde_json::Value;

use super::ast::{Condition, ExistsFilter, ExistsRoute, FilterNode, FilterOp};
use crate::access::{FieldSet, TableAccess, Unrestricted};
use crate::error::{LiveError, Result};
use crate::join_graph::JoinStep;
use crate::schema::SchemaState;
use crate::sql::{
    is_geo_type, is_json_type, is_text_type, json_literal, quote_ident, quote_literal,
    quote_qualified, typed_literal,
};

static UNRESTRICTED: Unrestricted = Unrestricted;

/// Text search query builders accepted by `@@`
const TS_QUERY_FUNCTIONS: &[&str] = &[
    "to_tsquery",
    "plainto_tsquery",
    "websearch_to_tsquery",
    "phraseto_tsquery",
];

/// Geometry constructors accepted as the right-hand side of geo operators
const GEO_CONSTRUCTORS: &[(&str, usize, usize)] = &[
    ("ST_MakeEnvelope", 4, 5),
    ("ST_MakePoint", 2, 4),
    ("ST_Point", 2, 2),
];

/// Resolved left-hand side of a condition
#[derive(Debug, Clone)]
struct ColumnExpr {
    sql: String,
    udt: String,
    /// `->>` path: a text value extracted from JSON
    json_text: bool,
}

/// Compiles a [`FilterNode`] for one table under one access scope
pub struct FilterCompiler<'a> {
    schema: &'a SchemaState,
    table: &'a TableCatalogEntry,
    access: &'a dyn TableAccess,
    allowed: Option<&'a FieldSet>,
    qualifier: String,
}

impl<'a> FilterCompiler<'a> {
    /// Compiler restricted to the filter fields of `table`'s rule
    pub fn new(
        schema: &'a SchemaState,
        table: &'a TableCatalogEntry,
        access: &'a dyn TableAccess,
    ) -> Result<Self> {
        let allowed = access.rule_for(&table.name)?.map(|rule| &rule.filter_fields);
        Ok(Self {
            schema,
            table,
            access,
            allowed,
            qualifier: quote_ident(&table.name),
        })
    }

    /// Compiler over every column of every table
    pub fn unrestricted(schema: &'a SchemaState, table: &'a TableCatalogEntry) -> Self {
        Self {
            schema,
            table,
            access: &UNRESTRICTED,
            allowed: None,
            qualifier: quote_ident(&table.name),
        }
    }

    /// Qualify columns with something other than the table name
    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    /// `None` when the filter places no constraint
    pub fn compile(&self, node: &FilterNode) -> Result<Option<String>> {
        match node {
            FilterNode::And(children) => self.combine(children, "AND"),
            FilterNode::Or(children) => self.combine(children, "OR"),
            FilterNode::Not(child) => Ok(Some(match self.compile(child)? {
                Some(inner) => format!("NOT ({inner})"),
                None => "FALSE".to_string(),
            })),
            FilterNode::Condition(condition) => self.compile_condition(condition).map(Some),
            FilterNode::Exists(exists) => self.compile_exists(exists).map(Some),
        }
    }

    /// User filter AND-ed with the table's forced filter
    pub fn compile_with_forced(&self, user: &FilterNode) -> Result<Option<String>> {
        let user_sql = self.compile(user)?;
        let forced_sql = self.forced_condition(&self.table.name, &self.qualifier)?;
        Ok(and_all([user_sql, forced_sql]))
    }

    pub(crate) fn forced_condition(&self, table: &str, qualifier: &str) -> Result<Option<String>> {
        let Some(forced) = self
            .access
            .rule_for(table)?
            .and_then(|rule| rule.forced_filter.as_ref())
        else {
            return Ok(None);
        };
        let entry = self.schema.table(table)?;
        FilterCompiler::unrestricted(self.schema, entry)
            .with_qualifier(qualifier)
            .compile(forced)
    }

    fn combine(&self, children: &[FilterNode], op: &str) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(children.len());
        for child in children {
            match self.compile(child)? {
                Some(sql) => parts.push(sql),
                // An unconstrained operand makes the whole OR unconstrained
                None if op == "OR" => return Ok(None),
                None => {}
            }
        }
        Ok(match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(format!("({})", parts.join(&format!(" {op} ")))),
        })
    }

    // ========================================================================
    // COLUMN RESOLUTION
    // ========================================================================

    fn check_allowed(&self, column: &str) -> Result<()> {
        match self.allowed {
            Some(allowed) if !allowed.contains(column) => Err(LiveError::rule(format!(
                "filter on {}.{column} is not allowed",
                self.table.name
            ))),
            _ => Ok(()),
        }
    }

    fn resolve(&self, key: &str) -> Result<ColumnExpr> {
        if let Some(column) = self.table.column(key) {
            self.check_allowed(key)?;
            return Ok(ColumnExpr {
                sql: format!("{}.{}", self.qualifier, quote_ident(key)),
                udt: column.udt_name.clone(),
                json_text: false,
            });
        }

        // Longest column name that prefixes the key as `col.` or `col->`
        let root = self
            .table
            .columns
            .iter()
            .filter(|c| {
                key.strip_prefix(c.name.as_str())
                    .is_some_and(|rest| rest.starts_with('.') || rest.starts_with("->"))
            })
            .max_by_key(|c| c.name.len())
            .ok_or_else(|| {
                LiveError::filter(format!(
                    "column {key} does not exist in {}",
                    self.table.name
                ))
            })?;
        self.check_allowed(&root.name)?;
        if !is_json_type(&root.udt_name) {
            return Err(LiveError::filter(format!(
                "{key}: path access requires a json column, {} is {}",
                root.name, root.udt_name
            )));
        }

        let rest = &key[root.name.len()..];
        let mut sql = format!("{}.{}", self.qualifier, quote_ident(&root.name));
        let segments = json_path_segments(rest)
            .ok_or_else(|| LiveError::filter(format!("invalid json path {key}")))?;
        let mut json_text = false;
        for (arrow, segment) in segments {
            sql.push_str(arrow);
            match segment.parse::<u32>() {
                Ok(index) => sql.push_str(&index.to_string()),
                Err(_) => sql.push_str(&quote_literal(segment)),
            }
            json_text = arrow == "->>";
        }
        Ok(ColumnExpr {
            sql,
            udt: if json_text { "text".into() } else { "jsonb".into() },
            json_text,
        })
    }

    // ========================================================================
    // CONDITIONS
    // ========================================================================

    /// Left side (possibly cast) and literal for a comparison
    fn operand(&self, column: &ColumnExpr, key: &str, value: &Value) -> Result<(String, String)> {
        if column.json_text {
            return match value {
                Value::Number(_) => Ok((format!("({})::numeric", column.sql), json_literal(value))),
                Value::Bool(_) => Ok((format!("({})::boolean", column.sql), json_literal(value))),
                Value::String(_) => Ok((column.sql.clone(), json_literal(value))),
                _ => Err(LiveError::filter(format!(
                    "json path {key} compares with scalars only"
                ))),
            };
        }
        if is_json_type(&column.udt) {
            return Ok((
                format!("{}::jsonb", column.sql),
                format!("{}::jsonb", quote_literal(&value.to_string())),
            ));
        }
        match value {
            Value::Array(_) if column.udt.starts_with('_') => {
                Ok((column.sql.clone(), typed_literal(value, &column.udt)))
            }
            Value::Array(_) | Value::Object(_) => Err(LiveError::filter(format!(
                "{key} cannot be compared with {value}"
            ))),
            _ => Ok((column.sql.clone(), json_literal(value))),
        }
    }

    fn compile_condition(&self, condition: &Condition) -> Result<String> {
        let key = condition.key.as_str();
        let value = &condition.value;
        let column = self.resolve(key)?;

        let comparison = |sql_op: &str| -> Result<String> {
            let (lhs, rhs) = self.operand(&column, key, value)?;
            Ok(format!("{lhs} {sql_op} {rhs}"))
        };

        match condition.op {
            FilterOp::Eq if value.is_null() => Ok(format!("{} IS NULL", column.sql)),
            FilterOp::Ne if value.is_null() => Ok(format!("{} IS NOT NULL", column.sql)),
            FilterOp::Eq => comparison("="),
            FilterOp::Ne => comparison("<>"),
            FilterOp::Gt => comparison(">"),
            FilterOp::Gte => comparison(">="),
            FilterOp::Lt => comparison("<"),
            FilterOp::Lte => comparison("<="),
            FilterOp::In => self.compile_in(&column, key, value, false),
            FilterOp::NotIn => self.compile_in(&column, key, value, true),
            FilterOp::Between => {
                let Value::Array(bounds) = value else {
                    return Err(LiveError::filter(format!("$between on {key} expects an array")));
                };
                let (lhs, low) = self.operand(&column, key, &bounds[0])?;
                let (_, high) = self.operand(&column, key, &bounds[1])?;
                Ok(format!("{lhs} BETWEEN {low} AND {high}"))
            }
            FilterOp::Like => Ok(format!("{}::text LIKE {}", column.sql, json_literal(value))),
            FilterOp::ILike => Ok(format!("{}::text ILIKE {}", column.sql, json_literal(value))),
            FilterOp::NotLike => Ok(format!("{}::text NOT LIKE {}", column.sql, json_literal(value))),
            FilterOp::NotILike => {
                Ok(format!("{}::text NOT ILIKE {}", column.sql, json_literal(value)))
            }
            FilterOp::IsNull | FilterOp::IsNotNull => {
                let wants_null = value.as_bool().unwrap_or(true) == (condition.op == FilterOp::IsNull);
                Ok(format!(
                    "{} {}",
                    column.sql,
                    if wants_null { "IS NULL" } else { "IS NOT NULL" }
                ))
            }
            FilterOp::Contains | FilterOp::ContainedBy | FilterOp::Overlaps => {
                self.compile_containment(&column, key, condition.op, value)
            }
            FilterOp::TextSearch => {
                let lhs = ts_vector_expr(&column, key)?;
                Ok(format!("{lhs} @@ {}", ts_query(key, value)?))
            }
            FilterOp::Geo(geo) => {
                if !is_geo_type(&column.udt) {
                    return Err(LiveError::filter(format!(
                        "{} on {key} requires a geometry column",
                        geo.as_sql()
                    )));
                }
                Ok(format!("{} {} {}", column.sql, geo.as_sql(), geo_value(key, value)?))
            }
        }
    }

    fn compile_in(&self, column: &ColumnExpr, key: &str, value: &Value, negated: bool) -> Result<String> {
        let Value::Array(items) = value else {
            return Err(LiveError::filter(format!("$in/$nin on {key} expects an array")));
        };
        let has_null = items.iter().any(Value::is_null);
        let mut lhs = column.sql.clone();
        let mut literals = Vec::with_capacity(items.len());
        for item in items.iter().filter(|v| !v.is_null()) {
            let (expr, literal) = self.operand(column, key, item)?;
            lhs = expr;
            literals.push(literal);
        }

        let list = literals.join(", ");
        Ok(match (negated, literals.is_empty(), has_null) {
            (false, true, false) => "FALSE".to_string(),
            (true, true, false) => "TRUE".to_string(),
            (false, true, true) => format!("{} IS NULL", column.sql),
            (true, true, true) => format!("{} IS NOT NULL", column.sql),
            (false, false, false) => format!("{lhs} IN ({list})"),
            (true, false, false) => format!("{lhs} NOT IN ({list})"),
            (false, false, true) => format!("({lhs} IN ({list}) OR {} IS NULL)", column.sql),
            (true, false, true) => {
                format!("({lhs} NOT IN ({list}) AND {} IS NOT NULL)", column.sql)
            }
        })
    }

    fn compile_containment(&self, column: &ColumnExpr, key: &str, op: FilterOp, value: &Value) -> Result<String> {
        let sql_op = match op {
            FilterOp::Contains => "@>",
            FilterOp::ContainedBy => "<@",
            _ => "&&",
        };

        if column.udt.starts_with('_') {
            let items = match value {
                Value::Array(_) => value.clone(),
                scalar => Value::Array(vec![scalar.clone()]),
            };
            return Ok(format!(
                "{} {sql_op} {}",
                column.sql,
                typed_literal(&items, &column.udt)
            ));
        }

        if is_json_type(&column.udt) {
            if op == FilterOp::Overlaps {
                return Err(LiveError::filter(format!("&& is not defined for json column {key}")));
            }
            return Ok(format!(
                "{}::jsonb {sql_op} {}::jsonb",
                column.sql,
                quote_literal(&value.to_string())
            ));
        }

        if is_geo_type(&column.udt) {
            let geo_op = match op {
                FilterOp::Contains => "~",
                FilterOp::ContainedBy => "@",
                _ => "&&",
            };
            return Ok(format!("{} {geo_op} {}", column.sql, geo_value(key, value)?));
        }

        if op == FilterOp::Contains && (is_text_type(&column.udt) || column.udt == "tsvector") {
            let lhs = ts_vector_expr(column, key)?;
            return Ok(format!("{lhs} @@ {}", ts_query(key, value)?));
        }

        Err(LiveError::filter(format!(
            "{sql_op} is not supported for {key} of type {}",
            column.udt
        )))
    }

    // ========================================================================
    // EXISTS
    // ========================================================================

    fn compile_exists(&self, exists: &ExistsFilter) -> Result<String> {
        let joins = self.schema.joins();
        let target = exists.route.target();
        let explicit = match &exists.route {
            ExistsRoute::Chain(chain) => Some(chain.as_slice()),
            ExistsRoute::Shortest(_) => None,
        };
        let path = joins.route(&self.table.name, target, explicit)?;
        for (i, table) in path.iter().enumerate() {
            if path[..i].contains(table) {
                return Err(LiveError::join(format!(
                    "table {table} appears twice in join path {}",
                    path.join(".")
                )));
            }
        }
        let steps = joins.steps(&path)?;
        for table in &path[1..] {
            self.access.rule_for(table)?;
        }

        let Some((first, rest)) = steps.split_first() else {
            return Err(LiveError::join(format!("empty join path to {target}")));
        };

        let mut sql = String::from("SELECT 1 FROM ");
        sql.push_str(&self.qualified_table(&first.to)?);
        for step in rest {
            sql.push_str(&format!(
                " INNER JOIN {} ON {}",
                self.qualified_table(&step.to)?,
                on_clause(&quote_ident(&step.from), step)
            ));
        }

        let mut conditions = vec![on_clause(&self.qualifier, first)];
        for table in &path[1..path.len() - 1] {
            conditions.extend(self.forced_condition(table, &quote_ident(table))?);
        }
        let target_entry = self.schema.table(target)?;
        let inner = FilterCompiler::new(self.schema, target_entry, self.access)?;
        conditions.extend(inner.compile_with_forced(&exists.filter)?);

        Ok(format!(
            "{}EXISTS ({sql} WHERE {})",
            if exists.negated { "NOT " } else { "" },
            conditions.join(" AND ")
        ))
    }

    fn qualified_table(&self, name: &str) -> Result<String> {
        let entry = self.schema.table(name)?;
        Ok(quote_qualified(&entry.schema, &entry.name))
    }
}

/// `"from"."a" = "to"."b" AND ...` for one hop
pub fn on_clause(from_qualifier: &str, step: &JoinStep) -> String {
    step.on
        .iter()
        .map(|(left, right)| {
            format!(
                "{from_qualifier}.{} = {}.{}",
                quote_ident(left),
                quote_ident(&step.to),
                quote_ident(right)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// AND the present conditions together
pub fn and_all(conditions: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    let parts: Vec<String> = conditions.into_iter().flatten().collect();
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(parts.join(" AND ")),
    }
}

/// Split `.a.b` or `->a->>b` into (arrow, segment) pairs
fn json_path_segments(rest: &str) -> Option<Vec<(&'static str, &str)>> {
    if let Some(dotted) = rest.strip_prefix('.') {
        let parts: Vec<&str> = dotted.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        let last = parts.len() - 1;
        return Some(
            parts
                .into_iter()
                .enumerate()
                .map(|(i, p)| (if i == last { "->>" } else { "->" }, p))
                .collect(),
        );
    }

    let mut out = Vec::new();
    let mut remaining = rest;
    while !remaining.is_empty() {
        let (arrow, after) = if let Some(after) = remaining.strip_prefix("->>") {
            ("->>", after)
        } else if let Some(after) = remaining.strip_prefix("->") {
            ("->", after)
        } else {
            return None;
        };
        let end = after.find("->").unwrap_or(after.len());
        let segment = &after[..end];
        if segment.is_empty() {
            return None;
        }
        out.push((arrow, segment));
        remaining = &after[end..];
    }
    Some(out)
}

fn ts_vector_expr(column: &ColumnExpr, key: &str) -> Result<String> {
    if column.udt == "tsvector" {
        Ok(column.sql.clone())
    } else if is_text_type(&column.udt) || column.json_text {
        Ok(format!("to_tsvector({})", column.sql))
    } else {
        Err(LiveError::filter(format!(
            "text search on {key} requires a text or tsvector column"
        )))
    }
}

fn ts_query(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(format!("plainto_tsquery({})", quote_literal(text))),
        Value::Object(map) if map.len() == 1 => {
            let (func, args) = map.iter().next().ok_or_else(|| LiveError::filter("empty text query"))?;
            if !TS_QUERY_FUNCTIONS.contains(&func.as_str()) {
                return Err(LiveError::filter(format!(
                    "unknown text search function {func} on {key}"
                )));
            }
            let args = match args {
                Value::Array(items) if (1..=2).contains(&items.len()) => items,
                _ => {
                    return Err(LiveError::filter(format!(
                        "{func} expects [query] or [config, query]"
                    )))
                }
            };
            let rendered = args
                .iter()
                .map(|a| match a {
                    Value::String(s) => Ok(quote_literal(s)),
                    _ => Err(LiveError::filter(format!("{func} arguments must be strings"))),
                })
                .collect::<Result<Vec<_>>>()?;
            if rendered.len() == 2 {
                Ok(format!("{func}({}::regconfig, {})", rendered[0], rendered[1]))
            } else {
                Ok(format!("{func}({})", rendered[0]))
            }
        }
        _ => Err(LiveError::filter(format!(
            "text search on {key} expects a string or {{function: [args]}}"
        ))),
    }
}

fn geo_value(key: &str, value: &Value) -> Result<String> {
    let Value::Object(map) = value else {
        return Err(LiveError::filter(format!(
            "geometry operand for {key} must be {{constructor: [numbers]}}"
        )));
    };
    let mut entries = map.iter();
    let (Some((func, args)), None) = (entries.next(), entries.next()) else {
        return Err(LiveError::filter(format!("geometry operand for {key} takes one constructor")));
    };
    let Some((name, min, max)) = GEO_CONSTRUCTORS.iter().find(|(n, _, _)| *n == func.as_str()) else {
        return Err(LiveError::filter(format!("unknown geometry constructor {func}")));
    };
    let numbers = match args {
        Value::Array(items) if (*min..=*max).contains(&items.len()) => items
            .iter()
            .map(|a| a.as_f64().map(|_| a.to_string()))
            .collect::<Option<Vec<_>>>(),
        _ => None,
    }
    .ok_or_else(|| LiveError::filter(format!("{name} expects {min} to {max} numbers")))?;
    Ok(format!("{name}({})", numbers.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessRule, ResolvedRules};
    use crate::schema::Catalog;
    use livesql_types::{ColumnInfo, Command, FieldFilter, Rule};
    use serde_json::json;

    fn schema() -> SchemaState {
        SchemaState::new(Catalog::new(vec![
            livesql_types::TableCatalogEntry::new(
                "users",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("name", "text"),
                    ColumnInfo::new("tags", "_text"),
                    ColumnInfo::new("data", "jsonb"),
                    ColumnInfo::new("secret", "text"),
                    ColumnInfo::new("location", "geometry"),
                ],
            ),
            livesql_types::TableCatalogEntry::new(
                "posts",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("author_id", "int4").references("users", "id"),
                    ColumnInfo::new("title", "text"),
                ],
            ),
            livesql_types::TableCatalogEntry::new(
                "comments",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("post_id", "int4").references("posts", "id"),
                    ColumnInfo::new("body", "text"),
                ],
            ),
        ]))
    }

    fn compile(filter: Value) -> Result<Option<String>> {
        let schema = schema();
        let table = schema.table("users")?;
        FilterCompiler::unrestricted(&schema, table).compile(&FilterNode::parse(&filter)?)
    }

    fn sql(filter: Value) -> String {
        compile(filter).unwrap().unwrap()
    }

    #[test]
    fn equality_is_null_aware() {
        assert_eq!(sql(json!({"name": null})), "\"users\".\"name\" IS NULL");
        assert_eq!(sql(json!({"name": "a"})), "\"users\".\"name\" = 'a'");
        assert_eq!(sql(json!({"name": {"$ne": null}})), "\"users\".\"name\" IS NOT NULL");
    }

    #[test]
    fn keys_are_sorted_and_anded() {
        assert_eq!(
            sql(json!({"name": "a", "id": 1})),
            "(\"users\".\"id\" = 1 AND \"users\".\"name\" = 'a')"
        );
    }

    #[test]
    fn or_groups_parenthesize() {
        assert_eq!(
            sql(json!({"$or": [{"id": 1}, {"id": {"$gt": 5}}]})),
            "(\"users\".\"id\" = 1 OR \"users\".\"id\" > 5)"
        );
        assert_eq!(sql(json!({"$or": [{"id": 1}]})), "\"users\".\"id\" = 1");
        assert_eq!(compile(json!({"$or": [{}, {"id": 1}]})).unwrap(), None);
    }

    #[test]
    fn in_handles_empty_and_null() {
        assert_eq!(sql(json!({"id": {"$in": []}})), "FALSE");
        assert_eq!(sql(json!({"id": {"$nin": []}})), "TRUE");
        assert_eq!(
            sql(json!({"id": {"$in": [1, null]}})),
            "(\"users\".\"id\" IN (1) OR \"users\".\"id\" IS NULL)"
        );
    }

    #[test]
    fn between_and_like() {
        assert_eq!(
            sql(json!({"id": {"$between": [1, 10]}})),
            "\"users\".\"id\" BETWEEN 1 AND 10"
        );
        assert_eq!(
            sql(json!({"name": {"$ilike": "%bob%"}})),
            "\"users\".\"name\"::text ILIKE '%bob%'"
        );
    }

    #[test]
    fn containment_dispatches_by_type() {
        assert_eq!(
            sql(json!({"tags": {"@>": ["a"]}})),
            "\"users\".\"tags\" @> ARRAY['a']::text[]"
        );
        assert_eq!(
            sql(json!({"data": {"@>": {"k": 1}}})),
            "\"users\".\"data\"::jsonb @> '{\"k\":1}'::jsonb"
        );
        assert_eq!(
            sql(json!({"name": {"@>": "cat"}})),
            "to_tsvector(\"users\".\"name\") @@ plainto_tsquery('cat')"
        );
        assert!(compile(json!({"id": {"@>": [1]}})).is_err());
    }

    #[test]
    fn json_paths_cast_by_literal() {
        assert_eq!(
            sql(json!({"data.address.zip": 123})),
            "(\"users\".\"data\"->'address'->>'zip')::numeric = 123"
        );
        assert_eq!(
            sql(json!({"data->>active": true})),
            "(\"users\".\"data\"->>'active')::boolean = TRUE"
        );
        assert_eq!(
            sql(json!({"data.items.0": "x"})),
            "\"users\".\"data\"->'items'->>0 = 'x'"
        );
        assert!(compile(json!({"name.first": "x"})).is_err());
    }

    #[test]
    fn text_search_and_geo() {
        assert_eq!(
            sql(json!({"name": {"@@": {"websearch_to_tsquery": ["english", "cats"]}}})),
            "to_tsvector(\"users\".\"name\") @@ websearch_to_tsquery('english'::regconfig, 'cats')"
        );
        assert_eq!(
            sql(json!({"location": {"&&": {"ST_MakeEnvelope": [0, 0, 1, 1, 4326]}}})),
            "\"users\".\"location\" && ST_MakeEnvelope(0, 0, 1, 1, 4326)"
        );
        assert!(compile(json!({"location": {"&&": {"ST_Buffer": [1]}}})).is_err());
        assert!(compile(json!({"id": {"<<": {"ST_MakePoint": [1, 2]}}})).is_err());
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(
            sql(json!({"name": "x' OR '1'='1"})),
            "\"users\".\"name\" = 'x'' OR ''1''=''1'"
        );
    }

    #[test]
    fn unknown_columns_fail_hard() {
        let err = compile(json!({"nope": 1})).unwrap_err();
        assert!(matches!(err, LiveError::FilterSyntax(_)));
    }

    #[test]
    fn exists_uses_shortest_path() {
        assert_eq!(
            sql(json!({"$exists": {"comments": {"body": "hi"}}})),
            "EXISTS (SELECT 1 FROM \"posts\" INNER JOIN \"comments\" ON \"posts\".\"id\" = \"comments\".\"post_id\" \
             WHERE \"users\".\"id\" = \"posts\".\"author_id\" AND \"comments\".\"body\" = 'hi')"
        );
        assert_eq!(
            sql(json!({"$notExists": {"posts": {}}})),
            "NOT EXISTS (SELECT 1 FROM \"posts\" WHERE \"users\".\"id\" = \"posts\".\"author_id\")"
        );
    }

    #[test]
    fn exists_joined_validates_chain() {
        assert!(compile(json!({"$existsJoined": {"posts.comments": {}}})).is_ok());
        let err = compile(json!({"$existsJoined": {"comments": {}}})).unwrap_err();
        assert!(matches!(err, LiveError::JoinResolution(_)));
    }

    #[test]
    fn rule_restricts_columns_but_not_forced_filter() {
        let schema = schema();
        let mut rules = ResolvedRules::new();
        let rule = Rule {
            fields: FieldFilter::Only(vec!["id".into(), "name".into()]),
            forced_filter: Some(json!({"secret": "s"})),
            ..Rule::default()
        };
        rules.insert(AccessRule::validate(&schema, "users", Command::Select, &rule).unwrap());
        let table = schema.table("users").unwrap();
        let compiler = FilterCompiler::new(&schema, table, &rules).unwrap();

        let err = compiler
            .compile(&FilterNode::parse(&json!({"secret": "x"})).unwrap())
            .unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));

        let sql = compiler
            .compile_with_forced(&FilterNode::parse(&json!({"id": 1})).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(sql, "\"users\".\"id\" = 1 AND \"users\".\"secret\" = 's'");

        // posts is not published under these rules
        let err = compiler
            .compile(&FilterNode::parse(&json!({"$exists": {"posts": {}}})).unwrap())
            .unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));
    }
}
