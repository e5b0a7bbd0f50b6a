//! Rule resolution seam.
//!
//! The policy collaborator decides, per request, which Rule applies to a
//! (table, command). The compilers never see a raw Rule: the gate validates
//! it into an [`AccessRule`](crate::access::AccessRule) first.

use std::collections::HashMap;

use async_trait::async_trait;
use livesql_types::{Command, RequestContext, Rule};
use serde_json::Value;
use tracing::debug;

use crate::access::AccessRule;
use crate::error::{LiveError, Result};
use crate::schema::SchemaState;

/// External policy collaborator
#[async_trait]
pub trait RuleResolver: Send + Sync {
    /// `Ok(None)` rejects the request: the table/command is not published
    async fn resolve_rule(
        &self,
        table: &str,
        command: Command,
        ctx: &RequestContext,
    ) -> Result<Option<Rule>>;
}

/// Fixed rule set, identical for every caller
///
/// Every rule is validated against the catalog at construction, so a broken
/// rule fails at startup instead of on first use.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleResolver {
    rules: HashMap<(String, Command), Rule>,
}

impl StaticRuleResolver {
    pub fn new(
        schema: &SchemaState,
        rules: impl IntoIterator<Item = (String, Command, Rule)>,
    ) -> Result<Self> {
        let mut out = HashMap::new();
        for (table, command, rule) in rules {
            AccessRule::validate(schema, &table, command, &rule)?;
            debug!(table = %table, command = %command, "Rule validated");
            out.insert((table, command), rule);
        }
        Ok(Self { rules: out })
    }

    /// `{table: {command: Rule}}`
    pub fn from_json(schema: &SchemaState, value: &Value) -> Result<Self> {
        let tables = value
            .as_object()
            .ok_or_else(|| LiveError::Internal(anyhow::anyhow!("rules must be a JSON object")))?;
        let mut rules = Vec::new();
        for (table, commands) in tables {
            let commands: HashMap<Command, Rule> = serde_json::from_value(commands.clone())
                .map_err(|e| LiveError::RuleConfig {
                    table: table.clone(),
                    message: e.to_string(),
                })?;
            rules.extend(
                commands
                    .into_iter()
                    .map(|(command, rule)| (table.clone(), command, rule)),
            );
        }
        Self::new(schema, rules)
    }

    pub fn get(&self, table: &str, command: Command) -> Option<&Rule> {
        self.rules.get(&(table.to_string(), command))
    }
}

#[async_trait]
impl RuleResolver for StaticRuleResolver {
    async fn resolve_rule(
        &self,
        table: &str,
        command: Command,
        _ctx: &RequestContext,
    ) -> Result<Option<Rule>> {
        Ok(self.get(table, command).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Catalog;
    use livesql_types::{ColumnInfo, TableCatalogEntry};
    use serde_json::json;

    fn schema() -> SchemaState {
        SchemaState::new(Catalog::new(vec![TableCatalogEntry::new(
            "items",
            vec![
                ColumnInfo::new("id", "int4").primary_key(),
                ColumnInfo::new("owner", "text"),
            ],
        )]))
    }

    #[tokio::test]
    async fn resolves_published_commands_only() {
        let resolver = StaticRuleResolver::from_json(
            &schema(),
            &json!({"items": {"select": {"fields": "*"}, "update": {"fields": ["owner"]}}}),
        )
        .unwrap();
        let ctx = RequestContext::default();
        assert!(resolver
            .resolve_rule("items", Command::Select, &ctx)
            .await
            .unwrap()
            .is_some());
        assert!(resolver
            .resolve_rule("items", Command::Delete, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalid_rules_fail_at_construction() {
        let err = StaticRuleResolver::from_json(
            &schema(),
            &json!({"items": {"select": {"forced_filter": {"nope": 1}}}}),
        )
        .unwrap_err();
        assert!(matches!(err, LiveError::RuleConfig { .. }));
    }
}
