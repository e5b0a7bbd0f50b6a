//! SQL execution seam.
//!
//! Compiled statements reach the database only through [`SqlExecutor`]. Row
//! returning statements are wrapped by the assembler so each row arrives as
//! one JSON value in column `row`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LiveError, Result};

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a statement whose rows carry one JSON column named `row`
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Value>>;

    /// Run a statement, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Start a transaction; `None` when already inside one
    async fn begin(&self) -> Result<Option<Arc<dyn TxExecutor>>>;
}

/// Executor bound to one open transaction
#[async_trait]
pub trait TxExecutor: SqlExecutor {
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    fn as_executor(self: Arc<Self>) -> Arc<dyn SqlExecutor>;
}

// ============================================================================
// POSTGRES
// ============================================================================

#[cfg(feature = "database")]
pub use pg::{PgExecutor, PgTxExecutor};

#[cfg(feature = "database")]
mod pg {
    use super::*;
    use sqlx::postgres::PgRow;
    use sqlx::{PgPool, Postgres, Row, Transaction};
    use tokio::sync::Mutex as AsyncMutex;

    fn json_rows(rows: Vec<PgRow>) -> Result<Vec<Value>> {
        rows.iter()
            .map(|row| row.try_get::<Value, _>("row").map_err(LiveError::from))
            .collect()
    }

    /// Pool-backed executor; every statement runs on its own connection
    #[derive(Clone)]
    pub struct PgExecutor {
        pool: PgPool,
    }

    impl PgExecutor {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }
    }

    #[async_trait]
    impl SqlExecutor for PgExecutor {
        async fn fetch_rows(&self, sql: &str) -> Result<Vec<Value>> {
            let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
            json_rows(rows)
        }

        async fn execute(&self, sql: &str) -> Result<u64> {
            let result = sqlx::query(sql).execute(&self.pool).await?;
            Ok(result.rows_affected())
        }

        async fn begin(&self) -> Result<Option<Arc<dyn TxExecutor>>> {
            let tx = self.pool.begin().await?;
            Ok(Some(Arc::new(PgTxExecutor {
                tx: AsyncMutex::new(Some(tx)),
            })))
        }
    }

    /// Executor over one open transaction
    ///
    /// Statements run serially. After commit or rollback every call fails.
    pub struct PgTxExecutor {
        tx: AsyncMutex<Option<Transaction<'static, Postgres>>>,
    }

    fn finished() -> LiveError {
        LiveError::Internal(anyhow::anyhow!("transaction already finished"))
    }

    #[async_trait]
    impl SqlExecutor for PgTxExecutor {
        async fn fetch_rows(&self, sql: &str) -> Result<Vec<Value>> {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(finished)?;
            let rows = sqlx::query(sql).fetch_all(&mut **tx).await?;
            json_rows(rows)
        }

        async fn execute(&self, sql: &str) -> Result<u64> {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(finished)?;
            let result = sqlx::query(sql).execute(&mut **tx).await?;
            Ok(result.rows_affected())
        }

        async fn begin(&self) -> Result<Option<Arc<dyn TxExecutor>>> {
            Ok(None)
        }
    }

    #[async_trait]
    impl TxExecutor for PgTxExecutor {
        async fn commit(&self) -> Result<()> {
            let tx = self.tx.lock().await.take().ok_or_else(finished)?;
            tx.commit().await?;
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            let tx = self.tx.lock().await.take().ok_or_else(finished)?;
            tx.rollback().await?;
            Ok(())
        }

        fn as_executor(self: Arc<Self>) -> Arc<dyn SqlExecutor> {
            self
        }
    }
}

// ============================================================================
// RECORDING
// ============================================================================

/// Executor that records statements and replays canned rows
///
/// Used to compile requests without a database and to assert which
/// statements a call issues.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    log: Arc<Mutex<Vec<String>>>,
    rows: Arc<Mutex<Vec<Vec<Value>>>>,
    in_transaction: bool,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the rows returned by the next `fetch_rows`
    pub fn push_rows(&self, rows: Vec<Value>) {
        if let Ok(mut queue) = self.rows.lock() {
            queue.push(rows);
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&self, sql: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push(sql.to_string());
        }
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Value>> {
        self.record(sql);
        let mut queue = self
            .rows
            .lock()
            .map_err(|_| LiveError::Internal(anyhow::anyhow!("recording executor poisoned")))?;
        Ok(if queue.is_empty() {
            Vec::new()
        } else {
            queue.remove(0)
        })
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.record(sql);
        Ok(1)
    }

    async fn begin(&self) -> Result<Option<Arc<dyn TxExecutor>>> {
        if self.in_transaction {
            return Ok(None);
        }
        self.record("BEGIN");
        Ok(Some(Arc::new(RecordingExecutor {
            in_transaction: true,
            ..self.clone()
        })))
    }
}

#[async_trait]
impl TxExecutor for RecordingExecutor {
    async fn commit(&self) -> Result<()> {
        self.record("COMMIT");
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.record("ROLLBACK");
        Ok(())
    }

    fn as_executor(self: Arc<Self>) -> Arc<dyn SqlExecutor> {
        self
    }
}
