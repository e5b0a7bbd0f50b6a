//! Select shape -> typed select items for one table.
//!
//! Nested joins are returned unresolved; the query builder recurses into
//! this compiler for each target table.

use livesql_types::TableCatalogEntry;
use serde_json::Value;

use super::ast::{JoinSelect, SelectEntry, SelectNode};
use super::functions::{self, ArgKind, FunctionClass, FunctionDef};
use super::order::OrderTerm;
use crate::access::{AccessRule, FieldSet};
use crate::error::{LiveError, Result};
use crate::sql::{group_safe_cast, json_literal, quote_ident, quote_literal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectKind {
    Column,
    Function,
    Aggregation,
    JoinedColumn,
    Computed,
}

#[derive(Debug, Clone)]
pub enum ArgExpr {
    Column(String),
    /// Already escaped literal
    Literal(String),
}

/// Expression of a select item, rendered against a table qualifier
#[derive(Debug, Clone)]
pub enum SelectExpr {
    Column(String),
    Call {
        def: &'static FunctionDef,
        args: Vec<ArgExpr>,
    },
    /// Filled by the assembler from the nested query
    Joined,
}

impl SelectExpr {
    pub fn render(&self, qualifier: &str) -> String {
        match self {
            SelectExpr::Column(name) => format!("{qualifier}.{}", quote_ident(name)),
            SelectExpr::Call { def, args } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|a| match a {
                        ArgExpr::Column(name) => format!("{qualifier}.{}", quote_ident(name)),
                        ArgExpr::Literal(sql) => sql.clone(),
                    })
                    .collect();
                def.render(&rendered)
            }
            SelectExpr::Joined => "NULL".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub kind: SelectKind,
    pub alias: String,
    pub expr: SelectExpr,
    /// Columns the expression reads, for group/order validation
    pub source_columns: Vec<String>,
    /// Unselected items are carried for ordering only
    pub selected: bool,
    /// Column type, for plain column items
    pub udt: Option<String>,
}

impl SelectItem {
    fn column(name: &str, alias: Option<&str>, udt: &str, selected: bool) -> Self {
        Self {
            kind: SelectKind::Column,
            alias: alias.unwrap_or(name).to_string(),
            expr: SelectExpr::Column(name.to_string()),
            source_columns: vec![name.to_string()],
            selected,
            udt: Some(udt.to_string()),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        self.kind == SelectKind::Aggregation
    }

    pub fn sql(&self, qualifier: &str) -> String {
        self.expr.render(qualifier)
    }

    /// Expression usable in GROUP BY: types without equality get cast
    pub fn grouped_sql(&self, qualifier: &str) -> String {
        let sql = self.sql(qualifier);
        match self.udt.as_deref().and_then(group_safe_cast) {
            Some(cast) => format!("{sql}::{cast}"),
            None => sql,
        }
    }
}

/// ORDER BY term bound to an expression
#[derive(Debug, Clone)]
pub struct OrderClause {
    pub term: OrderTerm,
    pub expr: SelectExpr,
}

impl OrderClause {
    pub fn render(&self, qualifier: &str) -> String {
        self.term.render(&self.expr.render(qualifier))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompiledSelect {
    pub items: Vec<SelectItem>,
    pub joins: Vec<JoinSelect>,
}

impl CompiledSelect {
    pub fn has_aggregation(&self) -> bool {
        self.items.iter().any(SelectItem::is_aggregate)
    }

    pub fn selected(&self) -> impl Iterator<Item = &SelectItem> {
        self.items
            .iter()
            .filter(|i| i.selected && i.kind != SelectKind::JoinedColumn)
    }

    pub fn selected_columns(&self) -> Vec<&str> {
        self.selected()
            .filter(|i| i.kind == SelectKind::Column)
            .map(|i| i.alias.as_str())
            .collect()
    }
}

pub struct SelectCompiler<'a> {
    table: &'a TableCatalogEntry,
    allowed: Option<&'a FieldSet>,
    order_allowed: Option<&'a FieldSet>,
    fix_issues: bool,
}

impl<'a> SelectCompiler<'a> {
    /// `rule = None` means every column is allowed
    pub fn new(table: &'a TableCatalogEntry, rule: Option<&'a AccessRule>, fix_issues: bool) -> Self {
        Self {
            table,
            allowed: rule.map(|r| &r.fields),
            order_allowed: rule.map(|r| &r.order_by_fields),
            fix_issues,
        }
    }

    fn allowed_columns(&self) -> Vec<&'a str> {
        let table = self.table;
        match self.allowed {
            Some(set) => set.iter().collect(),
            None => table.column_names().collect(),
        }
    }

    /// `Ok(false)` when an invalid column is dropped in fix-issues mode
    fn check_column(&self, name: &str) -> Result<bool> {
        let exists = self.table.column(name).is_some();
        let allowed = self.allowed.map_or(true, |set| set.contains(name));
        if exists && allowed {
            Ok(true)
        } else if self.fix_issues {
            Ok(false)
        } else {
            Err(LiveError::rule(format!(
                "field {name} does not exist or is not allowed in {}",
                self.table.name
            )))
        }
    }

    fn udt(&self, name: &str) -> &str {
        self.table
            .column(name)
            .map(|c| c.udt_name.as_str())
            .unwrap_or_default()
    }

    pub fn compile(&self, node: &SelectNode) -> Result<CompiledSelect> {
        let mut out = CompiledSelect::default();

        match node {
            SelectNode::All => {
                for name in self.allowed_columns() {
                    out.items.push(SelectItem::column(name, None, self.udt(name), true));
                }
            }
            SelectNode::Exclude(names) => {
                for name in names {
                    if self.table.column(name).is_none() && !self.fix_issues {
                        return Err(LiveError::rule(format!(
                            "field {name} does not exist in {}",
                            self.table.name
                        )));
                    }
                }
                for name in self.allowed_columns() {
                    if !names.iter().any(|n| n == name) {
                        out.items.push(SelectItem::column(name, None, self.udt(name), true));
                    }
                }
            }
            SelectNode::Include(entries) => {
                for entry in entries {
                    self.compile_entry(entry, &mut out)?;
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = out.items.iter().find(|i| !seen.insert(i.alias.as_str())) {
            return Err(LiveError::filter(format!(
                "select: duplicate alias {}",
                dup.alias
            )));
        }

        // Carry every other allowed column so ordering by non-selected
        // fields still resolves. Grouped selects carry nothing extra.
        if !out.has_aggregation() {
            for name in self.allowed_columns() {
                if !out.items.iter().any(|i| i.alias == name) {
                    out.items.push(SelectItem::column(name, None, self.udt(name), false));
                }
            }
        }

        Ok(out)
    }

    fn compile_entry(&self, entry: &SelectEntry, out: &mut CompiledSelect) -> Result<()> {
        match entry {
            SelectEntry::AllColumns => {
                for name in self.allowed_columns() {
                    if !out.items.iter().any(|i| i.alias == name) {
                        out.items.push(SelectItem::column(name, None, self.udt(name), true));
                    }
                }
            }
            SelectEntry::Column { name, alias } => {
                if self.check_column(name)? {
                    out.items.push(SelectItem::column(
                        name,
                        alias.as_deref(),
                        self.udt(name),
                        true,
                    ));
                }
            }
            SelectEntry::Function { alias, name, args } => {
                if let Some(item) = self.compile_function(alias, name, args)? {
                    out.items.push(item);
                }
            }
            SelectEntry::Join(join) => {
                out.items.push(SelectItem {
                    kind: SelectKind::JoinedColumn,
                    alias: join.alias.clone(),
                    expr: SelectExpr::Joined,
                    source_columns: Vec::new(),
                    selected: true,
                    udt: None,
                });
                out.joins.push(join.clone());
            }
        }
        Ok(())
    }

    fn compile_function(&self, alias: &str, name: &str, args: &[Value]) -> Result<Option<SelectItem>> {
        let def = functions::lookup(name)
            .ok_or_else(|| LiveError::filter(format!("select: unknown function {name}")))?;

        if def.template == functions::Template::RowHash {
            let columns = self.allowed_columns();
            return Ok(Some(SelectItem {
                kind: SelectKind::Computed,
                alias: alias.to_string(),
                expr: SelectExpr::Call {
                    def,
                    args: columns.iter().map(|c| ArgExpr::Column(c.to_string())).collect(),
                },
                source_columns: columns.iter().map(|c| c.to_string()).collect(),
                selected: true,
                udt: None,
            }));
        }

        if !def.accepts_count(args.len()) {
            return Err(LiveError::filter(format!(
                "select: wrong number of arguments for {name}: {}",
                args.len()
            )));
        }

        let mut rendered = Vec::with_capacity(args.len());
        let mut sources = Vec::new();
        for (index, arg) in args.iter().enumerate() {
            let kind = def.arg_kind(index).ok_or_else(|| {
                LiveError::filter(format!("select: too many arguments for {name}"))
            })?;
            if !functions::literal_fits(kind, arg) {
                return Err(LiveError::filter(format!(
                    "select: invalid argument {arg} for {name}"
                )));
            }
            let text = arg.as_str().unwrap_or_default();
            match kind {
                ArgKind::Column => {
                    if !self.check_column(text)? {
                        return Ok(None);
                    }
                    sources.push(text.to_string());
                    rendered.push(ArgExpr::Column(text.to_string()));
                }
                ArgKind::ColumnOrText => {
                    let is_column = self.table.column(text).is_some()
                        && self.allowed.map_or(true, |set| set.contains(text));
                    if is_column {
                        sources.push(text.to_string());
                        rendered.push(ArgExpr::Column(text.to_string()));
                    } else {
                        rendered.push(ArgExpr::Literal(quote_literal(text)));
                    }
                }
                ArgKind::Text | ArgKind::Keyword(_) => {
                    rendered.push(ArgExpr::Literal(quote_literal(text)))
                }
                ArgKind::Integer | ArgKind::Literal => {
                    rendered.push(ArgExpr::Literal(json_literal(arg)))
                }
            }
        }

        Ok(Some(SelectItem {
            kind: match def.class {
                FunctionClass::Aggregation => SelectKind::Aggregation,
                FunctionClass::Computed => SelectKind::Computed,
                FunctionClass::Scalar => SelectKind::Function,
            },
            alias: alias.to_string(),
            expr: SelectExpr::Call {
                def,
                args: rendered,
            },
            source_columns: sources,
            selected: true,
            udt: None,
        }))
    }

    /// Bind order terms to item aliases or orderable columns
    pub fn resolve_order(&self, items: &[SelectItem], terms: &[OrderTerm], grouped: bool) -> Result<Vec<OrderClause>> {
        terms
            .iter()
            .map(|term| {
                if let Some(item) = items.iter().find(|i| i.alias == term.key && i.selected) {
                    if item.kind == SelectKind::JoinedColumn {
                        return Err(LiveError::filter(format!(
                            "orderBy: cannot order by joined selection {}",
                            term.key
                        )));
                    }
                    return Ok(OrderClause {
                        term: term.clone(),
                        expr: item.expr.clone(),
                    });
                }
                if grouped {
                    return Err(LiveError::filter(format!(
                        "orderBy: {} must be a selected item in a grouped query",
                        term.key
                    )));
                }
                if self.table.column(&term.key).is_none() {
                    return Err(LiveError::filter(format!(
                        "orderBy: unknown key {}",
                        term.key
                    )));
                }
                if self.order_allowed.is_some_and(|set| !set.contains(&term.key)) {
                    return Err(LiveError::rule(format!(
                        "ordering by {}.{} is not allowed",
                        self.table.name, term.key
                    )));
                }
                Ok(OrderClause {
                    term: term.clone(),
                    expr: SelectExpr::Column(term.key.clone()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Catalog, SchemaState};
    use livesql_types::{ColumnInfo, Command, FieldFilter, Rule};
    use serde_json::json;

    fn schema() -> SchemaState {
        SchemaState::new(Catalog::new(vec![TableCatalogEntry::new(
            "users",
            vec![
                ColumnInfo::new("id", "int4").primary_key(),
                ColumnInfo::new("name", "text"),
                ColumnInfo::new("created", "timestamptz"),
                ColumnInfo::new("meta", "json"),
                ColumnInfo::new("secret", "text"),
            ],
        )]))
    }

    fn rule(schema: &SchemaState) -> AccessRule {
        let rule = Rule::with_fields(FieldFilter::Except(vec!["secret".into()]));
        AccessRule::validate(schema, "users", Command::Select, &rule).unwrap()
    }

    #[test]
    fn star_expands_to_allowed_columns() {
        let schema = schema();
        let rule = rule(&schema);
        let compiler = SelectCompiler::new(schema.table("users").unwrap(), Some(&rule), false);
        let out = compiler.compile(&SelectNode::All).unwrap();
        assert_eq!(out.selected_columns(), vec!["id", "name", "created", "meta"]);
    }

    #[test]
    fn disallowed_fields_fail_unless_fixing() {
        let schema = schema();
        let rule = rule(&schema);
        let table = schema.table("users").unwrap();
        let node = SelectNode::parse(&json!(["id", "secret", "ghost"])).unwrap();

        let err = SelectCompiler::new(table, Some(&rule), false).compile(&node).unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));

        let out = SelectCompiler::new(table, Some(&rule), true).compile(&node).unwrap();
        assert_eq!(out.selected_columns(), vec!["id"]);
    }

    #[test]
    fn unselected_columns_are_carried() {
        let schema = schema();
        let table = schema.table("users").unwrap();
        let out = SelectCompiler::new(table, None, false)
            .compile(&SelectNode::parse(&json!(["name"])).unwrap())
            .unwrap();
        assert_eq!(out.selected_columns(), vec!["name"]);
        assert!(out.items.iter().any(|i| i.alias == "id" && !i.selected));
    }

    #[test]
    fn functions_render_and_validate() {
        let schema = schema();
        let table = schema.table("users").unwrap();
        let compiler = SelectCompiler::new(table, None, false);
        let out = compiler
            .compile(&SelectNode::parse(&json!({
                "day": {"$date_trunc": ["day", "created"]},
                "n": {"$countAll": []}
            }))
            .unwrap())
            .unwrap();
        let day = out.items.iter().find(|i| i.alias == "day").unwrap();
        assert_eq!(day.sql("\"users\""), "date_trunc('day', \"users\".\"created\")");
        assert_eq!(day.source_columns, vec!["created"]);
        assert!(out.has_aggregation());
        assert_eq!(out.items.len(), 2);

        assert!(compiler
            .compile(&SelectNode::parse(&json!({"x": {"$date_trunc": ["fortnight", "created"]}})).unwrap())
            .is_err());
        assert!(compiler
            .compile(&SelectNode::parse(&json!({"x": {"$pg_sleep": [1]}})).unwrap())
            .is_err());
        assert!(compiler
            .compile(&SelectNode::parse(&json!({"x": {"$upper": ["name", "id"]}})).unwrap())
            .is_err());
    }

    #[test]
    fn json_columns_group_as_jsonb() {
        let schema = schema();
        let table = schema.table("users").unwrap();
        let out = SelectCompiler::new(table, None, false)
            .compile(&SelectNode::parse(&json!(["meta"])).unwrap())
            .unwrap();
        assert_eq!(out.items[0].grouped_sql("\"u\""), "\"u\".\"meta\"::jsonb");
    }

    #[test]
    fn order_keys_resolve_against_items_and_rule() {
        let schema = schema();
        let rule = rule(&schema);
        let table = schema.table("users").unwrap();
        let compiler = SelectCompiler::new(table, Some(&rule), false);
        let out = compiler
            .compile(&SelectNode::parse(&json!({"loud": {"$upper": ["name"]}})).unwrap())
            .unwrap();

        let clauses = compiler
            .resolve_order(&out.items, &[OrderTerm::desc("loud"), OrderTerm::asc("id")], false)
            .unwrap();
        assert_eq!(clauses[0].render("\"users\""), "upper(\"users\".\"name\"::text) DESC");
        assert_eq!(clauses[1].render("\"users\""), "\"users\".\"id\" ASC");

        let err = compiler
            .resolve_order(&out.items, &[OrderTerm::asc("secret")], false)
            .unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));
    }
}
