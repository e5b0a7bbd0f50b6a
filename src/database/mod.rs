//! Database connection management and catalog introspection
//!
//! Pool creation follows [`DatabaseConfig`]; [`PgCatalogProvider`] reads
//! tables, views, columns, keys and privileges from the system catalogs so
//! the schema cache can be (re)loaded from a live database.

use std::collections::HashMap;

use async_trait::async_trait;
use livesql_types::{
    ColumnInfo, ColumnPrivileges, ColumnReference, TableCatalogEntry, TablePrivileges,
};
use sqlx::Row;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, info, warn};

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::schema::{Catalog, CatalogProvider};

/// Database connection manager
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    /// Create a new database manager with the given configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        info!(
            "Connecting to database: {}",
            mask_database_url(&config.database_url)
        );

        let mut pool_options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout);

        if let Some(idle_timeout) = config.idle_timeout {
            pool_options = pool_options.idle_timeout(idle_timeout);
        }

        if let Some(max_lifetime) = config.max_lifetime {
            pool_options = pool_options.max_lifetime(max_lifetime);
        }

        let pool = pool_options
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                warn!("Failed to connect to database: {}", e);
                e
            })?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    pub async fn with_default_config() -> Result<Self, sqlx::Error> {
        Self::new(&DatabaseConfig::default()).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Catalog provider over this pool for the given schemas
    pub fn catalog_provider(&self, schemas: Vec<String>) -> PgCatalogProvider {
        PgCatalogProvider::new(self.pool.clone(), schemas)
    }

    /// Test database connectivity
    pub async fn test_connection(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
    }

    pub async fn close(self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

/// Mask sensitive information in database URL for logging
pub fn mask_database_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let mut masked = parsed.clone();
        if parsed.password().is_some() {
            let _ = masked.set_password(Some("***"));
        }
        masked.to_string()
    } else if url.chars().count() > 20 {
        let head: String = url.chars().take(10).collect();
        let tail: String = url.chars().skip(url.chars().count() - 10).collect();
        format!("{head}***{tail}")
    } else {
        "***".to_string()
    }
}

// ============================================================================
// CATALOG INTROSPECTION
// ============================================================================

const RELATIONS_SQL: &str = r#"
SELECT c.relname::text AS name,
       n.nspname::text AS schema,
       c.oid::int8 AS oid,
       c.relkind IN ('v', 'm') AS is_view,
       has_table_privilege(c.oid, 'SELECT') AS can_select,
       has_table_privilege(c.oid, 'INSERT') AS can_insert,
       has_table_privilege(c.oid, 'UPDATE') AS can_update,
       has_table_privilege(c.oid, 'DELETE') AS can_delete
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = ANY($1) AND c.relkind IN ('r', 'p', 'v', 'm')
ORDER BY c.relname
"#;

const COLUMNS_SQL: &str = r#"
SELECT c.table_name::text AS table_name,
       c.column_name::text AS column_name,
       c.udt_name::text AS udt_name,
       c.is_nullable = 'YES' AS is_nullable,
       c.column_default IS NOT NULL AS has_default,
       has_column_privilege(format('%I.%I', c.table_schema, c.table_name), c.column_name, 'SELECT') AS can_select,
       has_column_privilege(format('%I.%I', c.table_schema, c.table_name), c.column_name, 'INSERT') AS can_insert,
       has_column_privilege(format('%I.%I', c.table_schema, c.table_name), c.column_name, 'UPDATE') AS can_update
FROM information_schema.columns c
WHERE c.table_schema = ANY($1)
ORDER BY c.table_name, c.ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
SELECT tc.table_name::text AS table_name, kcu.column_name::text AS column_name
FROM information_schema.table_constraints tc
JOIN information_schema.key_column_usage kcu
  ON kcu.constraint_schema = tc.constraint_schema
 AND kcu.constraint_name = tc.constraint_name
WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = ANY($1)
"#;

const FOREIGN_KEYS_SQL: &str = r#"
SELECT cl.relname::text AS table_name,
       att.attname::text AS column_name,
       fcl.relname::text AS ref_table,
       fatt.attname::text AS ref_column
FROM pg_constraint con
JOIN pg_class cl ON cl.oid = con.conrelid
JOIN pg_namespace n ON n.oid = cl.relnamespace
JOIN pg_class fcl ON fcl.oid = con.confrelid
CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(col, fcol)
JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.col
JOIN pg_attribute fatt ON fatt.attrelid = con.confrelid AND fatt.attnum = k.fcol
WHERE con.contype = 'f' AND n.nspname = ANY($1)
"#;

const VIEW_PARENTS_SQL: &str = r#"
SELECT DISTINCT view_name::text AS view_name, table_name::text AS table_name
FROM information_schema.view_table_usage
WHERE view_schema = ANY($1)
ORDER BY view_name, table_name
"#;

/// Base tables (or views) each view reads from
pub async fn load_view_parents(pool: &PgPool, schemas: &[String]) -> Result<HashMap<String, Vec<String>>> {
    let rows = sqlx::query(VIEW_PARENTS_SQL)
        .bind(schemas)
        .fetch_all(pool)
        .await?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let view: String = row.try_get("view_name")?;
        let table: String = row.try_get("table_name")?;
        out.entry(view).or_default().push(table);
    }
    Ok(out)
}

/// Reads the catalog from a live database
#[derive(Clone)]
pub struct PgCatalogProvider {
    pool: PgPool,
    schemas: Vec<String>,
}

impl PgCatalogProvider {
    pub fn new(pool: PgPool, schemas: Vec<String>) -> Self {
        Self { pool, schemas }
    }
}

#[async_trait]
impl CatalogProvider for PgCatalogProvider {
    async fn load(&self) -> Result<Catalog> {
        let mut columns: HashMap<String, Vec<ColumnInfo>> = HashMap::new();
        for row in sqlx::query(COLUMNS_SQL)
            .bind(&self.schemas)
            .fetch_all(&self.pool)
            .await?
        {
            let table: String = row.try_get("table_name")?;
            let mut column = ColumnInfo::new(
                row.try_get::<String, _>("column_name")?,
                row.try_get::<String, _>("udt_name")?,
            );
            column.is_nullable = row.try_get("is_nullable")?;
            column.has_default = row.try_get("has_default")?;
            column.privileges = ColumnPrivileges {
                select: row.try_get("can_select")?,
                insert: row.try_get("can_insert")?,
                update: row.try_get("can_update")?,
            };
            columns.entry(table).or_default().push(column);
        }

        for row in sqlx::query(PRIMARY_KEYS_SQL)
            .bind(&self.schemas)
            .fetch_all(&self.pool)
            .await?
        {
            let table: String = row.try_get("table_name")?;
            let name: String = row.try_get("column_name")?;
            if let Some(column) = columns
                .get_mut(&table)
                .and_then(|cols| cols.iter_mut().find(|c| c.name == name))
            {
                column.is_pkey = true;
            }
        }

        for row in sqlx::query(FOREIGN_KEYS_SQL)
            .bind(&self.schemas)
            .fetch_all(&self.pool)
            .await?
        {
            let table: String = row.try_get("table_name")?;
            let name: String = row.try_get("column_name")?;
            if let Some(column) = columns
                .get_mut(&table)
                .and_then(|cols| cols.iter_mut().find(|c| c.name == name))
            {
                column.references.push(ColumnReference {
                    table: row.try_get("ref_table")?,
                    column: row.try_get("ref_column")?,
                });
            }
        }

        let mut parents = load_view_parents(&self.pool, &self.schemas).await?;
        let mut tables = Vec::new();
        for row in sqlx::query(RELATIONS_SQL)
            .bind(&self.schemas)
            .fetch_all(&self.pool)
            .await?
        {
            let name: String = row.try_get("name")?;
            let oid: i64 = row.try_get("oid")?;
            let is_view: bool = row.try_get("is_view")?;
            tables.push(TableCatalogEntry {
                schema: row.try_get("schema")?,
                oid: oid as u32,
                columns: columns.remove(&name).unwrap_or_default(),
                privileges: TablePrivileges {
                    select: row.try_get("can_select")?,
                    insert: !is_view && row.try_get::<bool, _>("can_insert")?,
                    update: !is_view && row.try_get::<bool, _>("can_update")?,
                    delete: !is_view && row.try_get::<bool, _>("can_delete")?,
                },
                is_view,
                parent_tables: parents.remove(&name).unwrap_or_default(),
                name,
            });
        }
        debug!(tables = tables.len(), "Catalog introspected");
        Ok(Catalog::new(tables))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_password() {
        assert_eq!(
            mask_database_url("postgresql://app:hunter2@db:5432/live"),
            "postgresql://app:***@db:5432/live"
        );
        assert_eq!(
            mask_database_url("postgresql://db:5432/live"),
            "postgresql://db:5432/live"
        );
        assert_eq!(mask_database_url("short"), "***");
    }

    #[test]
    fn masks_unparseable_text_on_char_boundaries() {
        let text = format!("{}{}", "é".repeat(11), "ß".repeat(11));
        assert_eq!(
            mask_database_url(&text),
            format!("{}***{}", "é".repeat(10), "ß".repeat(10))
        );
    }

    #[tokio::test]
    #[ignore = "requires a PostgreSQL database"]
    async fn introspects_a_live_catalog() {
        let url = std::env::var("TEST_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .expect("TEST_DATABASE_URL or DATABASE_URL must be set");
        let manager = DatabaseManager::new(&DatabaseConfig {
            database_url: url,
            ..DatabaseConfig::default()
        })
        .await
        .unwrap();
        manager.test_connection().await.unwrap();
        let catalog = manager
            .catalog_provider(vec!["public".to_string()])
            .load()
            .await
            .unwrap();
        for table in catalog.tables() {
            assert_eq!(table.schema, "public");
        }
        manager.close().await;
    }
}
