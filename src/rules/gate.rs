//! Rule Enforcement Gate
//!
//! Every request passes through here before compilation:
//! 1. parse the request into ASTs and collect every table it touches
//! 2. resolve and validate a Rule per table (the root under the request's
//!    command, joined and `$exists` tables under `select`)
//! 3. hand the resulting scope to the compilers, which intersect fields,
//!    merge forced filters and clamp limits
//!
//! A request rejected here never reaches the database.

use std::sync::Arc;

use livesql_types::{Command, MaxLimit, RequestContext};

use crate::access::{AccessRule, ResolvedRules, TableAccess};
use crate::error::{LiveError, Result};
use crate::filter::FilterNode;
use crate::query::ParsedFind;
use crate::schema::SchemaState;
use crate::select::SelectNode;

use super::resolver::RuleResolver;

/// Row cap applied when a Rule does not configure one
pub const DEFAULT_MAX_LIMIT: u64 = 1000;
/// Row count returned when the caller does not ask for a limit
pub const DEFAULT_LIMIT: u64 = 100;

/// Who is calling
#[derive(Debug, Clone)]
pub enum Access {
    /// Internal call: no Rule applies
    Trusted,
    Client(RequestContext),
}

impl Access {
    pub fn socket_id(&self) -> Option<&str> {
        match self {
            Access::Trusted => None,
            Access::Client(ctx) => ctx.socket_id.as_deref(),
        }
    }
}

/// Permissions for one request
#[derive(Debug, Clone)]
pub enum Scope {
    Unrestricted,
    Rules(ResolvedRules),
}

impl Scope {
    /// Rule of the root table, `None` for trusted calls
    pub fn root_rule(&self, table: &str) -> Result<Option<&AccessRule>> {
        self.rule_for(table)
    }
}

impl TableAccess for Scope {
    fn rule_for(&self, table: &str) -> Result<Option<&AccessRule>> {
        match self {
            Scope::Unrestricted => Ok(None),
            Scope::Rules(rules) => rules.rule_for(table),
        }
    }

    fn is_unrestricted(&self) -> bool {
        matches!(self, Scope::Unrestricted)
    }
}

/// Validate a requested limit against a Rule
///
/// Trusted calls are never capped. Otherwise an absent limit defaults to
/// `min(100, max)` and a limit over the max is rejected; `max_limit: null`
/// removes the cap only when the Rule says so explicitly.
pub fn clamp_limit(rule: Option<&AccessRule>, requested: Option<u64>) -> Result<Option<u64>> {
    let Some(rule) = rule else {
        return Ok(requested);
    };
    let max = match rule.max_limit {
        MaxLimit::Default => Some(DEFAULT_MAX_LIMIT),
        MaxLimit::Limited(n) => Some(n),
        MaxLimit::Unlimited => None,
    };
    match (requested, max) {
        (Some(limit), Some(max)) if limit > max => Err(LiveError::rule(format!(
            "limit {limit} exceeds the maximum of {max} for {}",
            rule.table
        ))),
        (Some(limit), _) => Ok(Some(limit)),
        (None, Some(max)) => Ok(Some(DEFAULT_LIMIT.min(max))),
        (None, None) => Ok(None),
    }
}

/// Tables other than `root` that a find touches: join hops and `$exists`
/// targets, at every nesting level
pub fn referenced_tables(schema: &SchemaState, root: &str, find: &ParsedFind) -> Result<Vec<String>> {
    let mut out = Vec::new();
    collect_filter_tables(schema, root, &find.filter, &mut out)?;
    collect_select_tables(schema, root, &find.select, &mut out)?;
    out.retain(|t| t != root);
    Ok(out)
}

pub fn filter_tables(schema: &SchemaState, root: &str, filter: &FilterNode) -> Result<Vec<String>> {
    let mut out = Vec::new();
    collect_filter_tables(schema, root, filter, &mut out)?;
    out.retain(|t| t != root);
    Ok(out)
}

fn push_path(out: &mut Vec<String>, path: &[String]) {
    for table in path.iter().skip(1) {
        if !out.contains(table) {
            out.push(table.clone());
        }
    }
}

fn collect_filter_tables(
    schema: &SchemaState,
    table: &str,
    filter: &FilterNode,
    out: &mut Vec<String>,
) -> Result<()> {
    for route in filter.exists_targets() {
        let explicit = match route {
            crate::filter::ExistsRoute::Chain(chain) => Some(chain.as_slice()),
            crate::filter::ExistsRoute::Shortest(_) => None,
        };
        let path = schema.joins().route(table, route.target(), explicit)?;
        push_path(out, &path);
    }
    Ok(())
}

fn collect_select_tables(
    schema: &SchemaState,
    table: &str,
    select: &SelectNode,
    out: &mut Vec<String>,
) -> Result<()> {
    for join in select.joins() {
        let target = join.target();
        let path = schema.joins().route(table, target, join.path.as_deref())?;
        push_path(out, &path);
        collect_filter_tables(schema, target, &join.filter, out)?;
        collect_select_tables(schema, target, &join.select, out)?;
    }
    Ok(())
}

/// Resolves the scope a request runs under
#[derive(Clone)]
pub struct RuleGate {
    resolver: Option<Arc<dyn RuleResolver>>,
}

impl RuleGate {
    pub fn new(resolver: Arc<dyn RuleResolver>) -> Self {
        Self {
            resolver: Some(resolver),
        }
    }

    /// Gate for trusted-only deployments: client calls are rejected
    pub fn trusted_only() -> Self {
        Self { resolver: None }
    }

    /// Resolve the root table under `command` and `related` under `select`
    pub async fn scope(
        &self,
        schema: &SchemaState,
        access: &Access,
        table: &str,
        command: Command,
        related: &[String],
    ) -> Result<Scope> {
        let ctx = match access {
            Access::Trusted => return Ok(Scope::Unrestricted),
            Access::Client(ctx) => ctx,
        };
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| LiveError::rule("client access is not configured"))?;

        let mut rules = ResolvedRules::new();
        for other in related {
            let rule = resolver
                .resolve_rule(other, Command::Select, ctx)
                .await?
                .ok_or_else(|| LiveError::rule(format!("select on {other} is not allowed")))?;
            rules.insert(AccessRule::validate(schema, other, Command::Select, &rule)?);
        }
        let rule = resolver
            .resolve_rule(table, command, ctx)
            .await?
            .ok_or_else(|| LiveError::rule(format!("{command} on {table} is not allowed")))?;
        rules.insert(AccessRule::validate(schema, table, command, &rule)?);
        Ok(Scope::Rules(rules))
    }

    pub async fn scope_for_find(
        &self,
        schema: &SchemaState,
        access: &Access,
        table: &str,
        command: Command,
        find: &ParsedFind,
    ) -> Result<Scope> {
        if let Access::Trusted = access {
            return Ok(Scope::Unrestricted);
        }
        let related = referenced_tables(schema, table, find)?;
        self.scope(schema, access, table, command, &related).await
    }

    pub async fn scope_for_filter(
        &self,
        schema: &SchemaState,
        access: &Access,
        table: &str,
        command: Command,
        filter: &FilterNode,
    ) -> Result<Scope> {
        if let Access::Trusted = access {
            return Ok(Scope::Unrestricted);
        }
        let related = filter_tables(schema, table, filter)?;
        self.scope(schema, access, table, command, &related).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SelectParams;
    use crate::rules::StaticRuleResolver;
    use crate::schema::Catalog;
    use livesql_types::{ColumnInfo, Rule, TableCatalogEntry};
    use serde_json::json;

    fn schema() -> SchemaState {
        SchemaState::new(Catalog::new(vec![
            TableCatalogEntry::new("users", vec![ColumnInfo::new("id", "int4").primary_key()]),
            TableCatalogEntry::new(
                "posts",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("author_id", "int4").references("users", "id"),
                ],
            ),
            TableCatalogEntry::new(
                "comments",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("post_id", "int4").references("posts", "id"),
                ],
            ),
        ]))
    }

    fn access_rule(max_limit: MaxLimit) -> AccessRule {
        let rule = Rule {
            max_limit,
            ..Rule::default()
        };
        AccessRule::validate(&schema(), "users", Command::Select, &rule).unwrap()
    }

    #[test]
    fn limit_defaults_and_caps() {
        assert_eq!(clamp_limit(None, None).unwrap(), None);
        assert_eq!(clamp_limit(None, Some(5000)).unwrap(), Some(5000));

        let rule = access_rule(MaxLimit::Default);
        assert_eq!(clamp_limit(Some(&rule), None).unwrap(), Some(100));
        assert!(clamp_limit(Some(&rule), Some(1001)).is_err());

        let rule = access_rule(MaxLimit::Limited(20));
        assert_eq!(clamp_limit(Some(&rule), None).unwrap(), Some(20));
        assert_eq!(clamp_limit(Some(&rule), Some(20)).unwrap(), Some(20));

        let rule = access_rule(MaxLimit::Unlimited);
        assert_eq!(clamp_limit(Some(&rule), None).unwrap(), None);
        assert_eq!(clamp_limit(Some(&rule), Some(1_000_000)).unwrap(), Some(1_000_000));
    }

    #[test]
    fn referenced_tables_cover_hops_and_exists() {
        let find = ParsedFind::parse(
            &json!({"$exists": {"comments": {}}}),
            &SelectParams::select(json!({"id": 1, "posts": {"id": 1}})),
        )
        .unwrap();
        let tables = referenced_tables(&schema(), "users", &find).unwrap();
        assert_eq!(tables, vec!["posts".to_string(), "comments".to_string()]);
    }

    #[tokio::test]
    async fn unpublished_related_table_is_rejected() {
        let schema = schema();
        let resolver = StaticRuleResolver::new(
            &schema,
            vec![("users".to_string(), Command::Select, Rule::default())],
        )
        .unwrap();
        let gate = RuleGate::new(Arc::new(resolver));
        let access = Access::Client(RequestContext::default());

        let find = ParsedFind::parse(&json!({"$exists": {"posts": {}}}), &SelectParams::default())
            .unwrap();
        let err = gate
            .scope_for_find(&schema, &access, "users", Command::Select, &find)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));

        let find = ParsedFind::parse(&json!({}), &SelectParams::default()).unwrap();
        let scope = gate
            .scope_for_find(&schema, &access, "users", Command::Select, &find)
            .await
            .unwrap();
        assert!(scope.rule_for("users").unwrap().is_some());

        let trusted = gate
            .scope_for_find(&schema, &Access::Trusted, "posts", Command::Delete, &find)
            .await
            .unwrap();
        assert!(trusted.is_unrestricted());
    }
}
