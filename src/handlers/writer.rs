//! Write handle for tables.
//!
//! Adds insert, update, upsert and delete on top of the read surface. Each
//! write resolves the Rule for its own command; filters that reach into other
//! tables resolve those tables under `select`.

use std::ops::Deref;
use std::sync::Arc;

use livesql_types::Command;
use serde_json::Value;
use tracing::{debug, warn};

use super::engine::QueryEngine;
use super::executor::SqlExecutor;
use crate::error::Result;
use crate::filter::FilterNode;
use crate::query::{Row, WriteCompiler, WriteParams, WriteStatement};
use crate::rules::{Access, Scope};

/// Result of a write: affected rows, or the `returning` rows
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Count(u64),
    Rows(Vec<Value>),
}

impl WriteOutcome {
    /// Affected row count in either form
    pub fn count(&self) -> u64 {
        match self {
            WriteOutcome::Count(n) => *n,
            WriteOutcome::Rows(rows) => rows.len() as u64,
        }
    }
}

async fn run(executor: &dyn SqlExecutor, statement: &WriteStatement) -> Result<WriteOutcome> {
    if statement.returns_rows {
        Ok(WriteOutcome::Rows(executor.fetch_rows(&statement.sql).await?))
    } else {
        Ok(WriteOutcome::Count(executor.execute(&statement.sql).await?))
    }
}

#[derive(Clone)]
pub struct TableWriter {
    engine: QueryEngine,
}

impl Deref for TableWriter {
    type Target = QueryEngine;

    fn deref(&self) -> &QueryEngine {
        &self.engine
    }
}

impl TableWriter {
    pub(crate) fn new(engine: QueryEngine) -> Self {
        Self { engine }
    }

    async fn filter_scope(&self, access: &Access, command: Command, filter: &FilterNode) -> Result<Scope> {
        self.gate
            .scope_for_filter(&self.schema, access, &self.table, command, filter)
            .await
    }

    pub async fn insert(&self, access: &Access, rows: &[Row], params: &WriteParams) -> Result<WriteOutcome> {
        let scope = self
            .gate
            .scope(&self.schema, access, &self.table, Command::Insert, &[])
            .await?;
        let statement = WriteCompiler::new(&self.schema, &self.table, &scope)?.insert(rows, params)?;
        debug!(table = %self.table, rows = rows.len(), "insert");
        run(self.executor.as_ref(), &statement).await
    }

    /// Insert, updating rows whose primary key already exists
    ///
    /// Clients need both the insert and the update Rule.
    pub async fn upsert(&self, access: &Access, rows: &[Row], params: &WriteParams) -> Result<WriteOutcome> {
        let insert = self
            .gate
            .scope(&self.schema, access, &self.table, Command::Insert, &[])
            .await?;
        let update = self
            .gate
            .scope(&self.schema, access, &self.table, Command::Update, &[])
            .await?;
        let update_rule = update.root_rule(&self.table)?;
        let statement =
            WriteCompiler::new(&self.schema, &self.table, &insert)?.upsert(rows, update_rule, params)?;
        run(self.executor.as_ref(), &statement).await
    }

    pub async fn update(
        &self,
        access: &Access,
        filter: &Value,
        data: &Row,
        params: &WriteParams,
    ) -> Result<WriteOutcome> {
        let filter = FilterNode::parse(filter)?;
        let scope = self.filter_scope(access, Command::Update, &filter).await?;
        let statement =
            WriteCompiler::new(&self.schema, &self.table, &scope)?.update(&filter, data, params)?;
        run(self.executor.as_ref(), &statement).await
    }

    /// Apply several (filter, data) updates atomically
    ///
    /// Everything is compiled before the transaction starts; inside an open
    /// transaction the statements join it instead.
    pub async fn update_batch(
        &self,
        access: &Access,
        updates: &[(Value, Row)],
        params: &WriteParams,
    ) -> Result<Vec<WriteOutcome>> {
        let mut statements = Vec::with_capacity(updates.len());
        for (filter, data) in updates {
            let filter = FilterNode::parse(filter)?;
            let scope = self.filter_scope(access, Command::Update, &filter).await?;
            statements.push(
                WriteCompiler::new(&self.schema, &self.table, &scope)?.update(&filter, data, params)?,
            );
        }

        let Some(tx) = self.executor.begin().await? else {
            let mut out = Vec::with_capacity(statements.len());
            for statement in &statements {
                out.push(run(self.executor.as_ref(), statement).await?);
            }
            return Ok(out);
        };

        let executor: Arc<dyn SqlExecutor> = tx.clone().as_executor();
        let mut out = Vec::with_capacity(statements.len());
        for statement in &statements {
            match run(executor.as_ref(), statement).await {
                Ok(outcome) => out.push(outcome),
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Rollback after failed batch update failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        debug!(table = %self.table, statements = statements.len(), "update_batch committed");
        Ok(out)
    }

    pub async fn delete(&self, access: &Access, filter: &Value, params: &WriteParams) -> Result<WriteOutcome> {
        let filter = FilterNode::parse(filter)?;
        let scope = self.filter_scope(access, Command::Delete, &filter).await?;
        let statement = WriteCompiler::new(&self.schema, &self.table, &scope)?.delete(&filter, params)?;
        run(self.executor.as_ref(), &statement).await
    }
}
