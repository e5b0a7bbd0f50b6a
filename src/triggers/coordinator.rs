//! Postgres-backed trigger coordination shared by every process.
//!
//! ## Concurrency
//!
//! The exclusive lock on `live_meta.app_triggers` is the only cross-process
//! mutual exclusion point. It is held for the registration insert plus the
//! table trigger install, and for the pruning pass of each heartbeat.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sql::{self, INIT_LOCK_KEY};
use super::{HeartbeatReport, TriggerKey, TriggerProvisioner};
use crate::config::TriggerConfig;
use crate::error::{LiveError, Result};

pub struct TriggerCoordinator {
    pool: PgPool,
    config: TriggerConfig,
    app_id: Uuid,
    /// Pairs this process registered and still holds
    registered: Mutex<HashSet<TriggerKey>>,
    /// Pairs ensured since the last prune; never released by it
    fresh: Mutex<HashSet<TriggerKey>>,
}

impl TriggerCoordinator {
    /// Check capability, create the coordination schema and register this app
    pub async fn connect(pool: PgPool, config: TriggerConfig) -> Result<Self> {
        Self::check_capability(&pool, config.watch_schema).await?;

        let coordinator = Self {
            pool,
            config,
            app_id: Uuid::new_v4(),
            registered: Mutex::new(HashSet::new()),
            fresh: Mutex::new(HashSet::new()),
        };
        coordinator.init_schema().await?;
        coordinator.register_app().await?;
        info!(
            app_id = %coordinator.app_id,
            app_name = %coordinator.config.app_name,
            "Trigger coordinator registered"
        );
        Ok(coordinator)
    }

    pub fn app_id(&self) -> Uuid {
        self.app_id
    }

    /// Refuse upfront when the role cannot install triggers or notify
    pub async fn check_capability(pool: &PgPool, watch_schema: bool) -> Result<()> {
        let row = sqlx::query(sql::CAPABILITY_SQL).fetch_one(pool).await?;
        let is_super: bool = row.try_get("is_super")?;
        let can_notify: bool = row.try_get("can_notify")?;
        let can_create: bool = row.try_get("can_create")?;

        if !is_super && !(can_notify && can_create) {
            return Err(LiveError::Capability(
                "role needs superuser, or EXECUTE on pg_notify and CREATE on the database".into(),
            ));
        }
        if watch_schema && !is_super {
            return Err(LiveError::Capability(
                "watching schema changes installs an event trigger and requires superuser".into(),
            ));
        }
        Ok(())
    }

    async fn init_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(INIT_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        sqlx::raw_sql(&sql::init_sql(&self.config.notify_channel))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn register_app(&self) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO live_meta.apps (id, app_name, last_check, check_frequency_ms, watching_schema)
            VALUES ($1, $2, now(), $3, $4)
            ON CONFLICT (id) DO UPDATE SET last_check = now()
            "#,
        )
        .bind(self.app_id)
        .bind(&self.config.app_name)
        .bind(self.config.check_interval.as_millis() as i32)
        .bind(self.config.watch_schema)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn is_registered(&self, key: &TriggerKey) -> bool {
        self.registered
            .lock()
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }

    async fn lock_triggers(tx: &mut Transaction<'static, Postgres>) -> Result<()> {
        sqlx::query("LOCK TABLE live_meta.app_triggers IN EXCLUSIVE MODE")
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn try_register(&self, key: &TriggerKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::lock_triggers(&mut tx).await?;

        sqlx::query(
            r#"
            INSERT INTO live_meta.app_triggers (app_id, table_schema, table_name, condition, condition_hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(self.app_id)
        .bind(&key.schema)
        .bind(&key.table)
        .bind(&key.condition)
        .bind(key.hash())
        .execute(&mut *tx)
        .await?;

        let installed: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*)::BIGINT FROM pg_trigger t
            JOIN pg_class c ON c.oid = t.tgrelid
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
              AND t.tgname IN ('livesql_insert', 'livesql_update', 'livesql_delete')
            "#,
        )
        .bind(&key.schema)
        .bind(&key.table)
        .fetch_one(&mut *tx)
        .await?;

        if installed < sql::TABLE_TRIGGERS.len() as i64 {
            for stmt in sql::drop_table_triggers_sql(&key.schema, &key.table)
                .into_iter()
                .chain(sql::create_table_triggers_sql(&key.schema, &key.table))
            {
                sqlx::query(&stmt).execute(&mut *tx).await?;
            }
            info!(schema = %key.schema, table = %key.table, "Installed change triggers");
        }

        tx.commit().await?;
        Ok(())
    }

    async fn prune(&self, active: &[TriggerKey]) -> Result<HeartbeatReport> {
        let mut report = HeartbeatReport::default();
        let mut tx = self.pool.begin().await?;

        let alive = sqlx::query("UPDATE live_meta.apps SET last_check = now() WHERE id = $1")
            .bind(self.app_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if alive == 0 {
            // Another process presumed us dead; come back with a fresh row
            warn!(app_id = %self.app_id, "App row was pruned, re-registering");
            sqlx::query(
                "INSERT INTO live_meta.apps (id, app_name, last_check, check_frequency_ms, watching_schema) VALUES ($1, $2, now(), $3, $4)",
            )
            .bind(self.app_id)
            .bind(&self.config.app_name)
            .bind(self.config.check_interval.as_millis() as i32)
            .bind(self.config.watch_schema)
            .execute(&mut *tx)
            .await?;
            if let Ok(mut set) = self.registered.lock() {
                set.clear();
            }
        }

        Self::lock_triggers(&mut tx).await?;

        // Read under the lock: an ensure that already inserted is in here
        let fresh: Vec<TriggerKey> = self
            .fresh
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let mut protected: Vec<TriggerKey> = active.to_vec();
        protected.extend(fresh.iter().filter(|k| !active.contains(k)).cloned());

        report.pruned_apps = sqlx::query(
            r#"
            DELETE FROM live_meta.apps
            WHERE id <> $1
              AND last_check < now() - (check_frequency_ms::BIGINT * $2) * INTERVAL '1 millisecond'
            "#,
        )
        .bind(self.app_id)
        .bind(self.config.stale_multiplier as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let hashes: Vec<String> = protected.iter().map(TriggerKey::hash).collect();
        let schemas: Vec<String> = protected.iter().map(|k| k.schema.clone()).collect();
        let tables: Vec<String> = protected.iter().map(|k| k.table.clone()).collect();
        report.released_triggers = sqlx::query(
            r#"
            DELETE FROM live_meta.app_triggers t
            WHERE t.app_id = $1
              AND (t.table_schema, t.table_name, t.condition_hash) NOT IN (
                  SELECT * FROM unnest($2::TEXT[], $3::TEXT[], $4::TEXT[])
              )
            "#,
        )
        .bind(self.app_id)
        .bind(&schemas)
        .bind(&tables)
        .bind(&hashes)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // Table triggers nobody references any more
        let installed = sqlx::query(sql::INSTALLED_TRIGGERS_SQL)
            .fetch_all(&mut *tx)
            .await?;
        let referenced: HashSet<(String, String)> = sqlx::query(
            "SELECT DISTINCT table_schema, table_name FROM live_meta.app_triggers",
        )
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| -> Result<_> { Ok((row.try_get("table_schema")?, row.try_get("table_name")?)) })
        .collect::<Result<_>>()?;
        for row in installed {
            let schema: String = row.try_get("table_schema")?;
            let table: String = row.try_get("table_name")?;
            if referenced.contains(&(schema.clone(), table.clone())) {
                continue;
            }
            for stmt in sql::drop_table_triggers_sql(&schema, &table) {
                sqlx::query(&stmt).execute(&mut *tx).await?;
            }
            report.dropped_tables.push(format!("{schema}.{table}"));
        }

        report.schema_watch = self.sync_event_trigger(&mut tx).await?;
        tx.commit().await?;

        if let Ok(mut set) = self.fresh.lock() {
            for key in &fresh {
                set.remove(key);
            }
        }
        if let Ok(mut set) = self.registered.lock() {
            set.retain(|key| protected.contains(key));
        }
        if alive == 0 {
            for key in &protected {
                self.ensure(key).await?;
            }
        }
        Ok(report)
    }

    /// Event trigger exists exactly while some live app watches the schema
    async fn sync_event_trigger(&self, tx: &mut Transaction<'static, Postgres>) -> Result<bool> {
        let wanted: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM live_meta.apps WHERE watching_schema)",
        )
        .fetch_one(&mut **tx)
        .await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pg_event_trigger WHERE evtname = $1)",
        )
        .bind(sql::EVENT_TRIGGER)
        .fetch_one(&mut **tx)
        .await?;

        if wanted && !exists {
            if !self.config.watch_schema {
                // Only a superuser app installs it; it will on its own heartbeat
                return Ok(false);
            }
            sqlx::query(&sql::create_event_trigger_sql())
                .execute(&mut **tx)
                .await?;
            info!("Installed schema watch event trigger");
        } else if !wanted && exists {
            sqlx::query(&sql::drop_event_trigger_sql())
                .execute(&mut **tx)
                .await?;
            info!("Removed schema watch event trigger");
        }
        Ok(wanted)
    }

    /// Drop this app's row; its pairs go with it
    pub async fn deregister(&self) -> Result<()> {
        sqlx::query("DELETE FROM live_meta.apps WHERE id = $1")
            .bind(self.app_id)
            .execute(&self.pool)
            .await?;
        info!(app_id = %self.app_id, "Trigger coordinator deregistered");
        Ok(())
    }
}

#[async_trait]
impl TriggerProvisioner for TriggerCoordinator {
    async fn ensure(&self, key: &TriggerKey) -> Result<()> {
        if let Ok(mut set) = self.fresh.lock() {
            set.insert(key.clone());
        }
        if self.is_registered(key) {
            return Ok(());
        }
        match self.try_register(key).await {
            Ok(()) => {}
            Err(e) if e.is_retryable_registration_race() => {
                debug!(table = %key.table, error = %e, "Trigger registration raced, retrying once");
                self.try_register(key).await?;
            }
            Err(e) => return Err(e),
        }
        if let Ok(mut set) = self.registered.lock() {
            set.insert(key.clone());
        }
        debug!(table = %key.table, hash = %key.hash(), "Trigger registered");
        Ok(())
    }

    async fn heartbeat(&self, active: &[TriggerKey]) -> Result<HeartbeatReport> {
        let report = self.prune(active).await?;
        if report.pruned_apps > 0 || report.released_triggers > 0 || !report.dropped_tables.is_empty() {
            info!(
                pruned_apps = report.pruned_apps,
                released = report.released_triggers,
                dropped = ?report.dropped_tables,
                "Trigger housekeeping"
            );
        }
        Ok(report)
    }
}
