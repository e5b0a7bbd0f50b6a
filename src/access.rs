//! Validated per-table access rules as seen by the compilers.
//!
//! A [`Rule`] arrives as authored by the policy collaborator. Before any
//! request uses it, it is validated against the catalog into an
//! [`AccessRule`]: field lists become concrete column sets and the forced
//! filter is parsed and compiled once. A Rule that fails here never serves
//! traffic.

use std::collections::HashMap;
use std::time::Duration;

use livesql_types::{Command, FieldFilter, MaxLimit, Rule, SyncRule, TableCatalogEntry};
use serde_json::{Map, Value};

use crate::error::{LiveError, Result};
use crate::filter::{FilterCompiler, FilterNode};
use crate::schema::SchemaState;

/// Concrete column list, in catalog order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSet {
    columns: Vec<String>,
}

impl FieldSet {
    pub fn all(table: &TableCatalogEntry) -> Self {
        Self {
            columns: table.column_names().map(str::to_string).collect(),
        }
    }

    /// Resolve an authored field filter; unknown column names are an error
    pub fn resolve(table: &TableCatalogEntry, filter: &FieldFilter) -> std::result::Result<Self, String> {
        let check = |names: &[String]| -> std::result::Result<(), String> {
            match names.iter().find(|n| table.column(n).is_none()) {
                Some(bad) => Err(format!("column {bad} does not exist in {}", table.name)),
                None => Ok(()),
            }
        };
        let columns = match filter {
            FieldFilter::All => table.column_names().map(str::to_string).collect(),
            FieldFilter::Only(names) => {
                check(names)?;
                table
                    .column_names()
                    .filter(|c| names.iter().any(|n| n == c))
                    .map(str::to_string)
                    .collect()
            }
            FieldFilter::Except(names) => {
                check(names)?;
                table
                    .column_names()
                    .filter(|c| !names.iter().any(|n| n == c))
                    .map(str::to_string)
                    .collect()
            }
        };
        Ok(Self { columns })
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A [`Rule`] checked against the catalog
#[derive(Debug, Clone)]
pub struct AccessRule {
    pub table: String,
    pub command: Command,
    pub fields: FieldSet,
    pub filter_fields: FieldSet,
    pub order_by_fields: FieldSet,
    pub returning_fields: FieldSet,
    pub forced_filter: Option<FilterNode>,
    pub forced_data: Option<Map<String, Value>>,
    pub max_limit: MaxLimit,
    pub allow_unfiltered: bool,
    pub throttle: Option<Duration>,
    pub sync: Option<SyncRule>,
}

impl AccessRule {
    /// Validate `rule` for (`table`, `command`); failures are [`LiveError::RuleConfig`]
    pub fn validate(schema: &SchemaState, table: &str, command: Command, rule: &Rule) -> Result<Self> {
        let config_err = |message: String| LiveError::RuleConfig {
            table: table.to_string(),
            message,
        };
        let entry = schema.table(table).map_err(|e| config_err(e.to_string()))?;

        let fields = FieldSet::resolve(entry, &rule.fields).map_err(config_err)?;
        let resolve_or_fields = |filter: &Option<FieldFilter>| match filter {
            Some(f) => FieldSet::resolve(entry, f).map_err(config_err),
            None => Ok(fields.clone()),
        };
        let filter_fields = resolve_or_fields(&rule.filter_fields)?;
        let order_by_fields = resolve_or_fields(&rule.order_by_fields)?;
        let returning_fields = resolve_or_fields(&rule.returning_fields)?;

        let forced_filter = match &rule.forced_filter {
            Some(raw) => {
                let node = FilterNode::parse(raw)
                    .map_err(|e| config_err(format!("forced filter: {e}")))?;
                FilterCompiler::unrestricted(schema, entry)
                    .compile(&node)
                    .map_err(|e| config_err(format!("forced filter: {e}")))?;
                Some(node)
            }
            None => None,
        };

        if let Some(data) = &rule.forced_data {
            if let Some(bad) = data.keys().find(|k| entry.column(k).is_none()) {
                return Err(config_err(format!("forced data column {bad} does not exist")));
            }
        }

        if let Some(sync) = &rule.sync {
            for field in sync.id_fields.iter().chain(std::iter::once(&sync.synced_field)) {
                if entry.column(field).is_none() {
                    return Err(config_err(format!("sync field {field} does not exist")));
                }
            }
            if sync.id_fields.is_empty() {
                return Err(config_err("sync id_fields cannot be empty".to_string()));
            }
        }

        if let MaxLimit::Limited(0) = rule.max_limit {
            return Err(config_err("max_limit must be positive".to_string()));
        }

        Ok(Self {
            table: table.to_string(),
            command,
            fields,
            filter_fields,
            order_by_fields,
            returning_fields,
            forced_filter,
            forced_data: rule.forced_data.clone(),
            max_limit: rule.max_limit,
            allow_unfiltered: rule.allow_unfiltered,
            throttle: rule.throttle_ms.map(Duration::from_millis),
            sync: rule.sync.clone(),
        })
    }
}

/// Permissions visible to the compilers for every table a request touches
pub trait TableAccess: Send + Sync {
    /// `Ok(None)` means unrestricted (trusted internal call)
    fn rule_for(&self, table: &str) -> Result<Option<&AccessRule>>;

    fn is_unrestricted(&self) -> bool {
        false
    }
}

/// Trusted access: every column of every table
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrestricted;

impl TableAccess for Unrestricted {
    fn rule_for(&self, _table: &str) -> Result<Option<&AccessRule>> {
        Ok(None)
    }

    fn is_unrestricted(&self) -> bool {
        true
    }
}

/// Rules resolved for one request, keyed by table
#[derive(Debug, Clone, Default)]
pub struct ResolvedRules {
    rules: HashMap<String, AccessRule>,
}

impl ResolvedRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rule: AccessRule) {
        self.rules.insert(rule.table.clone(), rule);
    }

    pub fn get(&self, table: &str) -> Option<&AccessRule> {
        self.rules.get(table)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.rules.contains_key(table)
    }
}

impl TableAccess for ResolvedRules {
    fn rule_for(&self, table: &str) -> Result<Option<&AccessRule>> {
        self.rules
            .get(table)
            .map(Some)
            .ok_or_else(|| LiveError::rule(format!("table {table} is not allowed")))
    }
}
