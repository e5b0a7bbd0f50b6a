//! Entry point handing out table and view handles.
//!
//! [`TxHandle`] exposes the same surface as [`DbHandle`], bound to one open
//! transaction, so callers compile and run writes the same way in both.

use std::ops::Deref;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use super::engine::QueryEngine;
use super::executor::{SqlExecutor, TxExecutor};
use super::reader::ViewReader;
use super::writer::TableWriter;
use crate::error::{LiveError, Result};
use crate::live::HubHandle;
use crate::rules::RuleGate;
use crate::schema::SchemaCache;

#[derive(Clone)]
pub struct DbHandle {
    schema: Arc<SchemaCache>,
    gate: RuleGate,
    executor: Arc<dyn SqlExecutor>,
    hub: Option<HubHandle>,
}

impl DbHandle {
    pub fn new(schema: Arc<SchemaCache>, gate: RuleGate, executor: Arc<dyn SqlExecutor>) -> Self {
        Self {
            schema,
            gate,
            executor,
            hub: None,
        }
    }

    /// Enable `subscribe` on handles from this point on
    pub fn with_hub(mut self, hub: HubHandle) -> Self {
        self.hub = Some(hub);
        self
    }

    fn engine(&self, name: &str) -> QueryEngine {
        QueryEngine::new(
            name,
            self.schema.current(),
            self.gate.clone(),
            self.executor.clone(),
            self.hub.clone(),
        )
    }

    /// Read/write handle; views are rejected
    pub fn table(&self, name: &str) -> Result<TableWriter> {
        let engine = self.engine(name);
        if engine.schema.table(name)?.is_view {
            return Err(LiveError::rule(format!("{name} is a view and cannot be written")));
        }
        Ok(TableWriter::new(engine))
    }

    /// Read-only handle for a view or table
    pub fn view(&self, name: &str) -> Result<ViewReader> {
        let engine = self.engine(name);
        engine.schema.table(name)?;
        Ok(ViewReader::new(engine))
    }

    pub fn table_names(&self) -> Vec<String> {
        self.schema
            .current()
            .catalog()
            .tables()
            .map(|t| t.name.clone())
            .collect()
    }

    pub async fn begin(&self) -> Result<TxHandle> {
        let tx = self
            .executor
            .begin()
            .await?
            .ok_or_else(|| LiveError::Internal(anyhow::anyhow!("nested transactions are not supported")))?;
        let db = DbHandle {
            schema: self.schema.clone(),
            gate: self.gate.clone(),
            executor: tx.clone().as_executor(),
            hub: None,
        };
        Ok(TxHandle { db, tx })
    }

    /// Run `f` in a transaction, committing on `Ok` and rolling back on `Err`
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t TxHandle) -> BoxFuture<'t, Result<T>>,
    {
        let tx = self.begin().await?;
        match f(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

/// Handle bound to one open transaction
pub struct TxHandle {
    db: DbHandle,
    tx: Arc<dyn TxExecutor>,
}

impl TxHandle {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await
    }
}

impl Deref for TxHandle {
    type Target = DbHandle;

    fn deref(&self) -> &DbHandle {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::RecordingExecutor;
    use crate::query::WriteParams;
    use crate::rules::Access;
    use crate::schema::Catalog;
    use futures::FutureExt;
    use livesql_types::{ColumnInfo, TableCatalogEntry};
    use serde_json::json;

    fn db(executor: RecordingExecutor) -> DbHandle {
        let catalog = Catalog::new(vec![
            TableCatalogEntry::new(
                "items",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("name", "text"),
                ],
            ),
            TableCatalogEntry::view("item_names", vec![ColumnInfo::new("name", "text")], vec!["items".into()]),
        ]);
        DbHandle::new(
            Arc::new(SchemaCache::new(catalog)),
            RuleGate::trusted_only(),
            Arc::new(executor),
        )
    }

    #[test]
    fn views_only_open_read_only() {
        let db = db(RecordingExecutor::new());
        assert!(db.table("item_names").is_err());
        assert!(db.view("item_names").is_ok());
        assert!(db.table("items").is_ok());
        assert!(matches!(db.view("nope").err(), Some(LiveError::NotFound(_))));
    }

    #[tokio::test]
    async fn transaction_commits_on_ok_and_rolls_back_on_err() {
        let executor = RecordingExecutor::new();
        let db = db(executor.clone());

        db.transaction(|tx| {
            async move {
                let data = json!({"name": "a"}).as_object().cloned().unwrap_or_default();
                tx.table("items")?
                    .update(&Access::Trusted, &json!({"id": 1}), &data, &WriteParams::default())
                    .await?;
                Ok::<_, LiveError>(())
            }
            .boxed()
        })
        .await
        .unwrap();

        let failed: Result<()> = db
            .transaction(|tx| {
                async move {
                    tx.table("item_names")?;
                    Ok::<_, LiveError>(())
                }
                .boxed()
            })
            .await;
        assert!(failed.is_err());

        let log = executor.statements();
        assert_eq!(log[0], "BEGIN");
        assert!(log[1].starts_with("UPDATE"));
        assert_eq!(log[2..], ["COMMIT", "BEGIN", "ROLLBACK"]);
    }
}
