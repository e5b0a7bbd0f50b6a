//! CompiledQuery and the builder that produces it.
//!
//! A CompiledQuery is built fresh per request from parsed ASTs and the
//! request's resolved rules, and is never cached across requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::TableAccess;
use crate::error::{LiveError, Result};
use crate::filter::{and_all, on_clause, FilterCompiler, FilterNode};
use crate::join_graph::{JoinGraph, JoinStep};
use crate::rules::clamp_limit;
use crate::schema::SchemaState;
use crate::select::{
    parse_order_by, JoinKind, JoinSelect, OrderClause, OrderTerm, SelectCompiler, SelectItem,
    SelectKind, SelectNode,
};
use crate::sql::{quote_ident, quote_qualified};

/// Read options accepted alongside a filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectParams {
    pub select: Value,
    pub order_by: Value,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Drop unknown or disallowed fields instead of rejecting the request
    pub fix_issues: bool,
}

impl SelectParams {
    pub fn select(select: Value) -> Self {
        Self {
            select,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_order_by(mut self, order_by: Value) -> Self {
        self.order_by = order_by;
        self
    }
}

/// Filter and select options parsed into ASTs
#[derive(Debug, Clone)]
pub struct ParsedFind {
    pub filter: FilterNode,
    pub select: SelectNode,
    pub order: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub fix_issues: bool,
}

impl ParsedFind {
    pub fn parse(filter: &Value, params: &SelectParams) -> Result<Self> {
        Ok(Self {
            filter: FilterNode::parse(filter)?,
            select: SelectNode::parse(&params.select)?,
            order: parse_order_by(&params.order_by)?,
            limit: params.limit,
            offset: params.offset,
            fix_issues: params.fix_issues,
        })
    }
}

/// How a nested query attaches to its parent
#[derive(Debug, Clone)]
pub struct JoinInfo {
    /// Hops from the parent table to this one
    pub steps: Vec<JoinStep>,
    pub left_join: bool,
    pub to_one: bool,
    /// (parent column, child-side expression) pairs of the first hop
    pub keys: Vec<(String, String)>,
}

/// One compiled statement, possibly with nested child queries
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub table: String,
    /// Output key in the parent's row for nested queries
    pub alias: String,
    /// FROM clause, including intermediate hops for nested queries
    pub from_sql: String,
    pub where_clause: Option<String>,
    pub items: Vec<SelectItem>,
    pub order_by: Vec<OrderClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub joins: Vec<CompiledQuery>,
    pub join: Option<JoinInfo>,
}

impl CompiledQuery {
    pub fn qualifier(&self) -> String {
        quote_ident(&self.table)
    }

    pub fn is_grouped(&self) -> bool {
        self.items.iter().any(SelectItem::is_aggregate)
    }

    /// Selected output items in declaration order, joined selections included
    pub fn output_items(&self) -> impl Iterator<Item = &SelectItem> {
        self.items.iter().filter(|i| i.selected)
    }

    pub fn child(&self, alias: &str) -> Option<&CompiledQuery> {
        self.joins.iter().find(|j| j.alias == alias)
    }

    /// Selected plain column names, at this level only
    pub fn selected_columns(&self) -> Vec<&str> {
        self.output_items()
            .filter(|i| i.kind == SelectKind::Column)
            .map(|i| i.alias.as_str())
            .collect()
    }
}

/// Builds CompiledQuery trees under one access scope
pub struct QueryBuilder<'a> {
    schema: &'a SchemaState,
    access: &'a dyn TableAccess,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(schema: &'a SchemaState, access: &'a dyn TableAccess) -> Self {
        Self { schema, access }
    }

    pub fn build(&self, table: &str, find: &ParsedFind) -> Result<CompiledQuery> {
        let entry = self.schema.table(table)?;
        self.build_level(
            table,
            table,
            quote_qualified(&entry.schema, &entry.name),
            Level {
                select: &find.select,
                filter: &find.filter,
                order: &find.order,
                limit: find.limit,
                offset: find.offset,
                fix_issues: find.fix_issues,
            },
            None,
        )
    }

    fn build_level(
        &self,
        table: &str,
        alias: &str,
        from_sql: String,
        level: Level<'_>,
        join: Option<JoinInfo>,
    ) -> Result<CompiledQuery> {
        let entry = self.schema.table(table)?;
        let rule = self.access.rule_for(table)?;

        let select = SelectCompiler::new(entry, rule, level.fix_issues);
        let compiled = select.compile(level.select)?;
        let grouped = compiled.has_aggregation();
        let order_by = select.resolve_order(&compiled.items, level.order, grouped)?;

        let filters = FilterCompiler::new(self.schema, entry, self.access)?;
        let mut where_clause = filters.compile_with_forced(level.filter)?;
        if let Some(info) = &join {
            // Forced filters of the tables hopped through
            for step in &info.steps[..info.steps.len() - 1] {
                let forced = filters.forced_condition(&step.to, &quote_ident(&step.to))?;
                where_clause = and_all([where_clause, forced]);
            }
        }

        let mut limit = clamp_limit(rule, level.limit)?;
        if join.as_ref().is_some_and(|j| j.to_one) {
            limit = Some(1);
        }

        let mut joins = Vec::with_capacity(compiled.joins.len());
        for join_select in &compiled.joins {
            joins.push(self.build_join(table, join_select, level.fix_issues)?);
        }

        if grouped && !joins.is_empty() {
            return Err(if joins.iter().any(CompiledQuery::is_grouped) {
                LiveError::filter(format!(
                    "select: an aggregation in {table} cannot coexist with a joined aggregation"
                ))
            } else {
                LiveError::filter(format!(
                    "select: joins cannot be combined with aggregations in {table}"
                ))
            });
        }

        Ok(CompiledQuery {
            table: table.to_string(),
            alias: alias.to_string(),
            from_sql,
            where_clause,
            items: compiled.items,
            order_by,
            limit,
            offset: if join.is_none() { level.offset } else { None },
            joins,
            join,
        })
    }

    fn build_join(&self, parent: &str, join: &JoinSelect, fix_issues: bool) -> Result<CompiledQuery> {
        let graph = self.schema.joins();
        let target = join.target();
        let path = graph.route(parent, target, join.path.as_deref())?;
        for (i, table) in path.iter().enumerate() {
            if path[..i].contains(table) {
                return Err(LiveError::join(format!(
                    "table {table} appears twice in join path {}",
                    path.join(".")
                )));
            }
        }
        for table in &path[1..] {
            self.access.rule_for(table)?;
        }
        let steps = graph.steps(&path)?;
        let (first, rest) = steps
            .split_first()
            .ok_or_else(|| LiveError::join(format!("empty join path to {target}")))?;

        let first_entry = self.schema.table(&first.to)?;
        let mut from_sql = quote_qualified(&first_entry.schema, &first_entry.name);
        for step in rest {
            let entry = self.schema.table(&step.to)?;
            from_sql.push_str(&format!(
                " INNER JOIN {} ON {}",
                quote_qualified(&entry.schema, &entry.name),
                on_clause(&quote_ident(&step.from), step)
            ));
        }
        let keys = first
            .on
            .iter()
            .map(|(parent_col, child_col)| {
                (
                    parent_col.clone(),
                    format!("{}.{}", quote_ident(&first.to), quote_ident(child_col)),
                )
            })
            .collect();

        let order = match &join.order_by {
            Some(value) => parse_order_by(value)?,
            None => Vec::new(),
        };
        let info = JoinInfo {
            to_one: JoinGraph::is_to_one(&steps),
            steps,
            left_join: join.kind == JoinKind::Left,
            keys,
        };
        self.build_level(
            target,
            &join.alias,
            from_sql,
            Level {
                select: &join.select,
                filter: &join.filter,
                order: &order,
                limit: join.limit,
                offset: None,
                fix_issues,
            },
            Some(info),
        )
    }
}

struct Level<'a> {
    select: &'a SelectNode,
    filter: &'a FilterNode,
    order: &'a [OrderTerm],
    limit: Option<u64>,
    offset: Option<u64>,
    fix_issues: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessRule, ResolvedRules, Unrestricted};
    use crate::schema::Catalog;
    use livesql_types::{ColumnInfo, Command, FieldFilter, MaxLimit, Rule, TableCatalogEntry};
    use serde_json::json;

    pub(crate) fn blog() -> SchemaState {
        SchemaState::new(Catalog::new(vec![
            TableCatalogEntry::new(
                "users",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("name", "text"),
                ],
            ),
            TableCatalogEntry::new(
                "profiles",
                vec![
                    ColumnInfo::new("user_id", "int4").primary_key().references("users", "id"),
                    ColumnInfo::new("bio", "text"),
                ],
            ),
            TableCatalogEntry::new(
                "posts",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("author_id", "int4").references("users", "id"),
                    ColumnInfo::new("title", "text"),
                ],
            ),
        ]))
    }

    fn build(filter: Value, params: SelectParams) -> Result<CompiledQuery> {
        let schema = blog();
        let find = ParsedFind::parse(&filter, &params)?;
        QueryBuilder::new(&schema, &Unrestricted).build("users", &find)
    }

    #[test]
    fn nested_join_carries_keys_and_cardinality() {
        let q = build(
            json!({}),
            SelectParams::select(json!({"name": 1, "posts": ["title"], "profiles": "*"})),
        )
        .unwrap();
        assert_eq!(q.joins.len(), 2);

        let posts = q.child("posts").unwrap();
        let info = posts.join.as_ref().unwrap();
        assert!(!info.to_one);
        assert_eq!(info.keys, vec![("id".to_string(), "\"posts\".\"author_id\"".to_string())]);

        let profiles = q.child("profiles").unwrap();
        assert!(profiles.join.as_ref().unwrap().to_one);
        assert_eq!(profiles.limit, Some(1));
    }

    #[test]
    fn grouped_parent_with_joins_is_rejected() {
        let err = build(
            json!({}),
            SelectParams::select(json!({"n": {"$countAll": []}, "posts": "*"})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("joins cannot be combined"));

        let err = build(
            json!({}),
            SelectParams::select(json!({
                "n": {"$countAll": []},
                "posts": {"c": {"$countAll": []}}
            })),
        )
        .unwrap_err();
        assert!(err.to_string().contains("joined aggregation"));
    }

    #[test]
    fn grouped_child_is_allowed() {
        let q = build(
            json!({}),
            SelectParams::select(json!({"name": 1, "posts": {"c": {"$countAll": []}}})),
        )
        .unwrap();
        assert!(q.child("posts").unwrap().is_grouped());
    }

    #[test]
    fn client_limits_are_clamped_per_table() {
        let schema = blog();
        let mut rules = ResolvedRules::new();
        let users = Rule {
            max_limit: MaxLimit::Limited(50),
            ..Rule::default()
        };
        rules.insert(AccessRule::validate(&schema, "users", Command::Select, &users).unwrap());

        let find = ParsedFind::parse(&json!({}), &SelectParams::default()).unwrap();
        let q = QueryBuilder::new(&schema, &rules).build("users", &find).unwrap();
        assert_eq!(q.limit, Some(50));

        let find = ParsedFind::parse(&json!({}), &SelectParams::default().with_limit(51)).unwrap();
        let err = QueryBuilder::new(&schema, &rules).build("users", &find).unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));

        // posts is not published
        let find = ParsedFind::parse(&json!({}), &SelectParams::select(json!({"posts": "*"}))).unwrap();
        assert!(QueryBuilder::new(&schema, &rules).build("users", &find).is_err());
    }

    #[test]
    fn selected_set_is_request_intersect_rule() {
        let schema = blog();
        let mut rules = ResolvedRules::new();
        let users = Rule::with_fields(FieldFilter::Only(vec!["id".into(), "name".into()]));
        rules.insert(AccessRule::validate(&schema, "users", Command::Select, &users).unwrap());
        let find = ParsedFind::parse(&json!({}), &SelectParams::select(json!(["name"]))).unwrap();
        let q = QueryBuilder::new(&schema, &rules).build("users", &find).unwrap();
        assert_eq!(q.selected_columns(), vec!["name"]);
    }
}
