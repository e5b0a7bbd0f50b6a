//! Insert / update / delete / upsert statement compilation.
//!
//! Data keys are checked against the command Rule's fields, forced data is
//! merged over user data, and `returning` is limited to the Rule's
//! returning fields. Statements with `returning` yield one JSON row per
//! affected row in column `row`.

use livesql_types::TableCatalogEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::access::{AccessRule, TableAccess};
use crate::error::{LiveError, Result};
use crate::filter::{FilterCompiler, FilterNode};
use crate::schema::SchemaState;
use crate::select::{SelectEntry, SelectNode};
use crate::sql::{is_json_type, quote_ident, quote_literal, quote_qualified, typed_literal};

pub type Row = Map<String, Value>;

/// Options accepted by write calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteParams {
    /// Select shape of the rows to return; `None` returns the affected count only
    pub returning: Option<Value>,
    /// Drop unknown or disallowed data keys instead of rejecting the request
    pub fix_issues: bool,
}

impl WriteParams {
    pub fn returning(select: Value) -> Self {
        Self {
            returning: Some(select),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStatement {
    pub sql: String,
    pub returns_rows: bool,
}

/// JSON value as a literal of the column's type
pub fn value_literal(value: &Value, udt_name: &str) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        _ if is_json_type(udt_name) => {
            format!("{}::{udt_name}", quote_literal(&value.to_string()))
        }
        _ => typed_literal(value, udt_name),
    }
}

/// Compiles write statements for one table under one access scope
pub struct WriteCompiler<'a> {
    schema: &'a SchemaState,
    table: &'a TableCatalogEntry,
    access: &'a dyn TableAccess,
    rule: Option<&'a AccessRule>,
}

impl<'a> WriteCompiler<'a> {
    pub fn new(schema: &'a SchemaState, table: &str, access: &'a dyn TableAccess) -> Result<Self> {
        let entry = schema.table(table)?;
        if entry.is_view {
            return Err(LiveError::rule(format!("{table} is a view and cannot be written")));
        }
        Ok(Self {
            schema,
            table: entry,
            access,
            rule: access.rule_for(table)?,
        })
    }

    fn target(&self) -> String {
        quote_qualified(&self.table.schema, &self.table.name)
    }

    fn qualifier(&self) -> String {
        quote_ident(&self.table.name)
    }

    /// User data checked against `rule`'s fields, then forced data on top
    fn merge_data(&self, rule: Option<&AccessRule>, data: &Row, fix_issues: bool) -> Result<Row> {
        let mut out = Row::new();
        for (key, value) in data {
            let exists = self.table.column(key).is_some();
            let allowed = rule.map_or(true, |r| r.fields.contains(key));
            if exists && allowed {
                out.insert(key.clone(), value.clone());
            } else if !fix_issues {
                return Err(LiveError::rule(format!(
                    "field {key} does not exist or cannot be written in {}",
                    self.table.name
                )));
            }
        }
        if let Some(forced) = rule.and_then(|r| r.forced_data.as_ref()) {
            for (key, value) in forced {
                out.insert(key.clone(), value.clone());
            }
        }
        Ok(out)
    }

    fn literal(&self, column: &str, value: &Value) -> String {
        let udt = self
            .table
            .column(column)
            .map(|c| c.udt_name.as_str())
            .unwrap_or_default();
        value_literal(value, udt)
    }

    /// Merged rows plus their column union in catalog order
    fn rows(&self, rows: &[Row], fix_issues: bool) -> Result<(Vec<Row>, Vec<&'a str>)> {
        if rows.is_empty() {
            return Err(LiveError::filter("insert: no rows to insert"));
        }
        let merged = rows
            .iter()
            .map(|row| self.merge_data(self.rule, row, fix_issues))
            .collect::<Result<Vec<_>>>()?;
        let columns: Vec<&str> = self
            .table
            .column_names()
            .filter(|name| merged.iter().any(|row| row.contains_key(*name)))
            .collect();
        Ok((merged, columns))
    }

    fn values_clause(&self, rows: &[Row], columns: &[&str]) -> Result<String> {
        if columns.is_empty() {
            return if rows.len() == 1 {
                Ok("DEFAULT VALUES".to_string())
            } else {
                Err(LiveError::filter("insert: rows have no columns"))
            };
        }
        let tuples: Vec<String> = rows
            .iter()
            .map(|row| {
                let values: Vec<String> = columns
                    .iter()
                    .map(|c| match row.get(*c) {
                        Some(value) => self.literal(c, value),
                        None => "DEFAULT".to_string(),
                    })
                    .collect();
                format!("({})", values.join(", "))
            })
            .collect();
        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        Ok(format!("({}) VALUES {}", names.join(", "), tuples.join(", ")))
    }

    pub fn insert(&self, rows: &[Row], params: &WriteParams) -> Result<WriteStatement> {
        let (rows, columns) = self.rows(rows, params.fix_issues)?;
        let sql = format!(
            "INSERT INTO {} AS {} {}",
            self.target(),
            self.qualifier(),
            self.values_clause(&rows, &columns)?
        );
        self.finish(sql, params)
    }

    /// Insert, or update the non-key columns when the primary key exists
    ///
    /// `update_rule` is the Rule for the update half; `None` for trusted calls.
    pub fn upsert(
        &self,
        rows: &[Row],
        update_rule: Option<&AccessRule>,
        params: &WriteParams,
    ) -> Result<WriteStatement> {
        let pkey = self.table.primary_key();
        if pkey.is_empty() {
            return Err(LiveError::filter(format!(
                "upsert: {} has no primary key",
                self.table.name
            )));
        }
        let (rows, columns) = self.rows(rows, params.fix_issues)?;
        if let Some(missing) = pkey.iter().find(|k| !rows.iter().all(|r| r.contains_key(**k))) {
            return Err(LiveError::filter(format!(
                "upsert: every row needs primary key column {missing}"
            )));
        }
        let updates: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !pkey.contains(c))
            .collect();
        if let Some(rule) = update_rule {
            if let Some(bad) = updates.iter().find(|c| !rule.fields.contains(c)) {
                return Err(LiveError::rule(format!(
                    "field {bad} cannot be updated in {}",
                    self.table.name
                )));
            }
        }
        let conflict: Vec<String> = pkey.iter().map(|c| quote_ident(c)).collect();
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let set: Vec<String> = updates
                .iter()
                .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
                .collect();
            let mut action = format!("DO UPDATE SET {}", set.join(", "));
            if let Some(forced) = self.update_forced_filter(update_rule)? {
                action.push_str(&format!(" WHERE {forced}"));
            }
            action
        };
        let sql = format!(
            "INSERT INTO {} AS {} {} ON CONFLICT ({}) {action}",
            self.target(),
            self.qualifier(),
            self.values_clause(&rows, &columns)?,
            conflict.join(", ")
        );
        self.finish(sql, params)
    }

    fn update_forced_filter(&self, update_rule: Option<&AccessRule>) -> Result<Option<String>> {
        match update_rule.and_then(|r| r.forced_filter.as_ref()) {
            Some(node) => FilterCompiler::unrestricted(self.schema, self.table).compile(node),
            None => Ok(None),
        }
    }

    fn where_clause(&self, filter: &FilterNode, verb: &str) -> Result<Option<String>> {
        let condition =
            FilterCompiler::new(self.schema, self.table, self.access)?.compile_with_forced(filter)?;
        if condition.is_none() && self.rule.is_some_and(|r| !r.allow_unfiltered) {
            return Err(LiveError::rule(format!(
                "{verb} on {} requires a filter",
                self.table.name
            )));
        }
        Ok(condition)
    }

    pub fn update(&self, filter: &FilterNode, data: &Row, params: &WriteParams) -> Result<WriteStatement> {
        let data = self.merge_data(self.rule, data, params.fix_issues)?;
        if data.is_empty() {
            return Err(LiveError::filter("update: no data to set"));
        }
        let set: Vec<String> = self
            .table
            .column_names()
            .filter_map(|c| data.get(c).map(|v| format!("{} = {}", quote_ident(c), self.literal(c, v))))
            .collect();
        let mut sql = format!(
            "UPDATE {} AS {} SET {}",
            self.target(),
            self.qualifier(),
            set.join(", ")
        );
        if let Some(condition) = self.where_clause(filter, "update")? {
            sql.push_str(&format!(" WHERE {condition}"));
        }
        self.finish(sql, params)
    }

    pub fn delete(&self, filter: &FilterNode, params: &WriteParams) -> Result<WriteStatement> {
        let mut sql = format!("DELETE FROM {} AS {}", self.target(), self.qualifier());
        if let Some(condition) = self.where_clause(filter, "delete")? {
            sql.push_str(&format!(" WHERE {condition}"));
        }
        self.finish(sql, params)
    }

    fn returning_columns(&self, select: &Value) -> Result<Vec<(String, String)>> {
        let allowed = |name: &str| {
            self.table.column(name).is_some()
                && self.rule.map_or(true, |r| r.returning_fields.contains(name))
        };
        let all = || -> Vec<(String, String)> {
            self.table
                .column_names()
                .filter(|c| allowed(c))
                .map(|c| (c.to_string(), c.to_string()))
                .collect()
        };
        match SelectNode::parse(select)? {
            SelectNode::All => Ok(all()),
            SelectNode::Exclude(names) => Ok(all()
                .into_iter()
                .filter(|(c, _)| !names.contains(c))
                .collect()),
            SelectNode::Include(entries) => {
                let mut out = Vec::new();
                for entry in entries {
                    match entry {
                        SelectEntry::AllColumns => out.extend(all()),
                        SelectEntry::Column { name, alias } if allowed(&name) => {
                            let alias = alias.unwrap_or_else(|| name.clone());
                            out.push((name, alias));
                        }
                        SelectEntry::Column { name, .. } => {
                            return Err(LiveError::rule(format!(
                                "field {name} cannot be returned from {}",
                                self.table.name
                            )))
                        }
                        _ => {
                            return Err(LiveError::filter(
                                "returning: only columns can be returned",
                            ))
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    fn finish(&self, sql: String, params: &WriteParams) -> Result<WriteStatement> {
        let Some(select) = &params.returning else {
            return Ok(WriteStatement {
                sql,
                returns_rows: false,
            });
        };
        let columns = self.returning_columns(select)?;
        if columns.is_empty() {
            return Err(LiveError::rule(format!(
                "returning: no returnable fields in {}",
                self.table.name
            )));
        }
        let q = self.qualifier();
        let list: Vec<String> = columns
            .iter()
            .map(|(name, alias)| format!("{q}.{} AS {}", quote_ident(name), quote_ident(alias)))
            .collect();
        Ok(WriteStatement {
            sql: format!(
                "WITH \"__w\" AS ({sql} RETURNING {}) SELECT row_to_json(\"__w\") AS \"row\" FROM \"__w\"",
                list.join(", ")
            ),
            returns_rows: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{ResolvedRules, Unrestricted};
    use crate::schema::Catalog;
    use livesql_types::{ColumnInfo, Command, FieldFilter, Rule};
    use serde_json::json;

    fn schema() -> SchemaState {
        SchemaState::new(Catalog::new(vec![TableCatalogEntry::new(
            "items",
            vec![
                ColumnInfo::new("id", "int4").primary_key(),
                ColumnInfo::new("name", "text"),
                ColumnInfo::new("owner", "text"),
                ColumnInfo::new("meta", "jsonb"),
            ],
        )]))
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn rules(command: Command, rule: Rule) -> ResolvedRules {
        let mut rules = ResolvedRules::new();
        rules.insert(AccessRule::validate(&schema(), "items", command, &rule).unwrap());
        rules
    }

    #[test]
    fn insert_merges_forced_data_and_defaults_missing_columns() {
        let schema = schema();
        let access = rules(
            Command::Insert,
            Rule {
                fields: FieldFilter::Only(vec!["name".into(), "meta".into()]),
                forced_data: Some(row(json!({"owner": "u1"}))),
                ..Rule::default()
            },
        );
        let stmt = WriteCompiler::new(&schema, "items", &access)
            .unwrap()
            .insert(
                &[row(json!({"name": "a", "meta": {"k": 1}})), row(json!({"name": "b"}))],
                &WriteParams::default(),
            )
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"items\" AS \"items\" (\"name\", \"owner\", \"meta\") VALUES ('a', 'u1', '{\"k\":1}'::jsonb), ('b', 'u1', DEFAULT)"
        );
        assert!(!stmt.returns_rows);
    }

    #[test]
    fn insert_rejects_fields_outside_rule() {
        let schema = schema();
        let access = rules(Command::Insert, Rule::with_fields(FieldFilter::Only(vec!["name".into()])));
        let compiler = WriteCompiler::new(&schema, "items", &access).unwrap();
        let err = compiler
            .insert(&[row(json!({"owner": "x"}))], &WriteParams::default())
            .unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));

        let fixed = WriteParams {
            fix_issues: true,
            ..WriteParams::default()
        };
        let stmt = compiler
            .insert(&[row(json!({"owner": "x", "name": "n"}))], &fixed)
            .unwrap();
        assert!(stmt.sql.ends_with("(\"name\") VALUES ('n')"));
    }

    #[test]
    fn update_requires_filter_unless_allowed() {
        let schema = schema();
        let access = rules(Command::Update, Rule::default());
        let compiler = WriteCompiler::new(&schema, "items", &access).unwrap();
        let data = row(json!({"name": "z"}));
        assert!(compiler
            .update(&FilterNode::empty(), &data, &WriteParams::default())
            .is_err());

        let filter = FilterNode::parse(&json!({"id": 1})).unwrap();
        let stmt = compiler
            .update(&filter, &data, &WriteParams::returning(json!(["id", "name"])))
            .unwrap();
        assert_eq!(
            stmt.sql,
            "WITH \"__w\" AS (UPDATE \"items\" AS \"items\" SET \"name\" = 'z' WHERE \"items\".\"id\" = 1 RETURNING \"items\".\"id\" AS \"id\", \"items\".\"name\" AS \"name\") SELECT row_to_json(\"__w\") AS \"row\" FROM \"__w\""
        );

        let access = rules(
            Command::Update,
            Rule {
                allow_unfiltered: true,
                ..Rule::default()
            },
        );
        assert!(WriteCompiler::new(&schema, "items", &access)
            .unwrap()
            .update(&FilterNode::empty(), &data, &WriteParams::default())
            .is_ok());
    }

    #[test]
    fn delete_applies_forced_filter() {
        let schema = schema();
        let access = rules(
            Command::Delete,
            Rule {
                forced_filter: Some(json!({"owner": "u1"})),
                ..Rule::default()
            },
        );
        let stmt = WriteCompiler::new(&schema, "items", &access)
            .unwrap()
            .delete(&FilterNode::parse(&json!({"id": 2})).unwrap(), &WriteParams::default())
            .unwrap();
        assert_eq!(
            stmt.sql,
            "DELETE FROM \"items\" AS \"items\" WHERE \"items\".\"id\" = 2 AND \"items\".\"owner\" = 'u1'"
        );
    }

    #[test]
    fn upsert_updates_non_key_columns() {
        let schema = schema();
        let stmt = WriteCompiler::new(&schema, "items", &Unrestricted)
            .unwrap()
            .upsert(&[row(json!({"id": 1, "name": "a"}))], None, &WriteParams::default())
            .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"items\" AS \"items\" (\"id\", \"name\") VALUES (1, 'a') ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""
        );

        let err = WriteCompiler::new(&schema, "items", &Unrestricted)
            .unwrap()
            .upsert(&[row(json!({"name": "a"}))], None, &WriteParams::default())
            .unwrap_err();
        assert!(err.to_string().contains("primary key"));
    }
}
