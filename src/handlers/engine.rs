//! Read capability shared by views and tables.

use std::sync::Arc;

use livesql_types::Command;
use serde_json::Value;
use tracing::debug;

use super::executor::SqlExecutor;
use crate::error::{LiveError, Result};
use crate::live::{HubHandle, LiveSubscription, SubscribeRequest};
use crate::query::{count_sql, fetch_sql, CompiledQuery, ParsedFind, QueryBuilder, SelectParams};
use crate::rules::{Access, RuleGate};
use crate::schema::SchemaState;

/// Compiles and runs reads against one table or view
///
/// Every call resolves its Rule through the gate before any SQL is built,
/// so a rejected request never reaches the executor.
#[derive(Clone)]
pub struct QueryEngine {
    pub(crate) table: String,
    pub(crate) schema: Arc<SchemaState>,
    pub(crate) gate: RuleGate,
    pub(crate) executor: Arc<dyn SqlExecutor>,
    pub(crate) hub: Option<HubHandle>,
}

impl QueryEngine {
    pub(crate) fn new(
        table: impl Into<String>,
        schema: Arc<SchemaState>,
        gate: RuleGate,
        executor: Arc<dyn SqlExecutor>,
        hub: Option<HubHandle>,
    ) -> Self {
        Self {
            table: table.into(),
            schema,
            gate,
            executor,
            hub,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Resolve the Select rule and compile, without running anything
    pub async fn compile_find(
        &self,
        access: &Access,
        filter: &Value,
        params: &SelectParams,
    ) -> Result<CompiledQuery> {
        let find = ParsedFind::parse(filter, params)?;
        let scope = self
            .gate
            .scope_for_find(&self.schema, access, &self.table, Command::Select, &find)
            .await?;
        QueryBuilder::new(&self.schema, &scope).build(&self.table, &find)
    }

    pub async fn find(&self, access: &Access, filter: &Value, params: &SelectParams) -> Result<Vec<Value>> {
        let query = self.compile_find(access, filter, params).await?;
        let rows = self.executor.fetch_rows(&fetch_sql(&query)).await?;
        debug!(table = %self.table, rows = rows.len(), "find");
        Ok(rows)
    }

    pub async fn find_one(
        &self,
        access: &Access,
        filter: &Value,
        params: &SelectParams,
    ) -> Result<Option<Value>> {
        let params = params.clone().with_limit(1);
        Ok(self.find(access, filter, &params).await?.into_iter().next())
    }

    pub async fn count(&self, access: &Access, filter: &Value) -> Result<u64> {
        let query = self
            .compile_find(access, filter, &SelectParams::default())
            .await?;
        let sql = format!(
            "SELECT to_json(\"__c\".\"count\") AS \"row\" FROM ({}) \"__c\"",
            count_sql(&query)
        );
        let rows = self.executor.fetch_rows(&sql).await?;
        Ok(rows.first().and_then(Value::as_u64).unwrap_or(0))
    }

    fn hub(&self) -> Result<&HubHandle> {
        self.hub
            .as_ref()
            .ok_or_else(|| LiveError::Capability("live queries are not enabled".to_string()))
    }

    /// Keep the result of `find` live
    pub async fn subscribe(
        &self,
        access: &Access,
        filter: &Value,
        params: &SelectParams,
    ) -> Result<LiveSubscription> {
        let request = SubscribeRequest::new(&self.table, access.clone(), filter.clone(), params.clone());
        self.hub()?.subscribe(request).await
    }

    /// Like `subscribe`, pushing the first row or null
    pub async fn subscribe_one(
        &self,
        access: &Access,
        filter: &Value,
        params: &SelectParams,
    ) -> Result<LiveSubscription> {
        let request = SubscribeRequest::new(&self.table, access.clone(), filter.clone(), params.clone())
            .single();
        self.hub()?.subscribe(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::RecordingExecutor;
    use crate::rules::StaticRuleResolver;
    use crate::schema::Catalog;
    use livesql_types::{ColumnInfo, FieldFilter, RequestContext, Rule, TableCatalogEntry};
    use serde_json::json;

    fn engine(executor: RecordingExecutor) -> QueryEngine {
        let schema = Arc::new(SchemaState::new(Catalog::new(vec![TableCatalogEntry::new(
            "items",
            vec![
                ColumnInfo::new("id", "int4").primary_key(),
                ColumnInfo::new("name", "text"),
                ColumnInfo::new("secret", "text"),
            ],
        )])));
        let resolver = StaticRuleResolver::new(
            &schema,
            vec![(
                "items".to_string(),
                Command::Select,
                Rule::with_fields(FieldFilter::Only(vec!["id".into(), "name".into()])),
            )],
        )
        .unwrap();
        QueryEngine::new(
            "items",
            schema,
            RuleGate::new(Arc::new(resolver)),
            Arc::new(executor),
            None,
        )
    }

    fn client() -> Access {
        Access::Client(RequestContext::default())
    }

    #[tokio::test]
    async fn disallowed_select_runs_no_sql() {
        let executor = RecordingExecutor::new();
        let engine = engine(executor.clone());
        let err = engine
            .find(&client(), &json!({}), &SelectParams::select(json!(["secret"])))
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::RuleViolation(_)));
        assert!(executor.statements().is_empty());
    }

    #[tokio::test]
    async fn find_one_limits_to_one_row() {
        let executor = RecordingExecutor::new();
        executor.push_rows(vec![json!({"id": 1, "name": "a"})]);
        let engine = engine(executor.clone());
        let row = engine
            .find_one(&client(), &json!({"id": 1}), &SelectParams::default())
            .await
            .unwrap();
        assert_eq!(row, Some(json!({"id": 1, "name": "a"})));
        assert!(executor.statements()[0].contains("LIMIT 1"));
    }

    #[tokio::test]
    async fn count_reads_one_number() {
        let executor = RecordingExecutor::new();
        executor.push_rows(vec![json!(42)]);
        let engine = engine(executor.clone());
        assert_eq!(engine.count(&client(), &json!({"name": "a"})).await.unwrap(), 42);
        let sql = &executor.statements()[0];
        assert!(sql.contains("count(*)"));
        assert!(!sql.contains("LIMIT"));
    }

    #[tokio::test]
    async fn subscribe_without_hub_is_a_capability_error() {
        let engine = engine(RecordingExecutor::new());
        let err = engine
            .subscribe(&client(), &json!({}), &SelectParams::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LiveError::Capability(_)));
    }
}
