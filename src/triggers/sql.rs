//! Coordination schema, shared trigger function and event trigger DDL.

use crate::sql::{quote_ident, quote_literal, quote_qualified};

pub const META_SCHEMA: &str = "live_meta";
pub const EVENT_TRIGGER: &str = "livesql_schema_watch";

/// Names of the three statement-level triggers installed per table
pub const TABLE_TRIGGERS: [(&str, &str, &str); 3] = [
    ("livesql_insert", "INSERT", "REFERENCING NEW TABLE AS new_table"),
    (
        "livesql_update",
        "UPDATE",
        "REFERENCING OLD TABLE AS old_table NEW TABLE AS new_table",
    ),
    ("livesql_delete", "DELETE", "REFERENCING OLD TABLE AS old_table"),
];

/// DDL tags that invalidate the catalog
const WATCHED_TAGS: &[&str] = &[
    "CREATE TABLE",
    "ALTER TABLE",
    "DROP TABLE",
    "CREATE VIEW",
    "ALTER VIEW",
    "DROP VIEW",
    "COMMENT",
];

/// Key for `pg_advisory_xact_lock` around schema initialisation
pub const INIT_LOCK_KEY: i64 = 0x6c69_7665_7371_6c;

/// Condition hashes per NOTIFY payload
///
/// Postgres rejects payloads over 8000 bytes, and a rejected `pg_notify`
/// aborts the statement that fired the trigger. 100 hashes of 32 hex digits
/// plus two maximum-length identifiers stay well below that.
pub const NOTIFY_CHUNK: usize = 100;

/// Coordination tables plus the shared trigger functions
pub fn init_sql(channel: &str) -> String {
    let channel = quote_literal(channel);
    let chunk = NOTIFY_CHUNK;
    format!(
        r#"
CREATE SCHEMA IF NOT EXISTS live_meta;

CREATE TABLE IF NOT EXISTS live_meta.apps (
    id UUID PRIMARY KEY,
    app_name TEXT NOT NULL,
    last_check TIMESTAMPTZ NOT NULL DEFAULT now(),
    check_frequency_ms INTEGER NOT NULL,
    watching_schema BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE IF NOT EXISTS live_meta.app_triggers (
    app_id UUID NOT NULL REFERENCES live_meta.apps(id) ON DELETE CASCADE,
    table_schema TEXT NOT NULL,
    table_name TEXT NOT NULL,
    condition TEXT NOT NULL,
    condition_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (app_id, table_schema, table_name, condition_hash)
);

CREATE OR REPLACE FUNCTION live_meta.notify_change() RETURNS trigger
LANGUAGE plpgsql AS $fn$
DECLARE
    rec RECORD;
    hit BOOLEAN;
    source TEXT;
    matched TEXT[] := ARRAY[]::TEXT[];
BEGIN
    source := CASE TG_OP
        WHEN 'INSERT' THEN 'new_table'
        WHEN 'DELETE' THEN 'old_table'
        ELSE '(SELECT * FROM old_table UNION ALL SELECT * FROM new_table)'
    END;
    FOR rec IN
        SELECT DISTINCT t.condition, t.condition_hash
        FROM live_meta.app_triggers t
        WHERE t.table_schema = TG_TABLE_SCHEMA AND t.table_name = TG_TABLE_NAME
    LOOP
        EXECUTE format('SELECT EXISTS (SELECT 1 FROM %s AS %I WHERE %s)', source, TG_TABLE_NAME, rec.condition)
            INTO hit;
        IF hit THEN
            matched := array_append(matched, rec.condition_hash);
        END IF;
    END LOOP;
    FOR i IN 1..cardinality(matched) BY {chunk} LOOP
        PERFORM pg_notify({channel}, json_build_object(
            'kind', 'data',
            'table', TG_TABLE_NAME,
            'schema', TG_TABLE_SCHEMA,
            'op', TG_OP,
            'conditions', matched[i:i + {chunk} - 1]
        )::text);
    END LOOP;
    RETURN NULL;
END;
$fn$;

CREATE OR REPLACE FUNCTION live_meta.notify_schema_change() RETURNS event_trigger
LANGUAGE plpgsql AS $fn$
BEGIN
    PERFORM pg_notify({channel}, json_build_object('kind', 'schema', 'command', tg_tag)::text);
END;
$fn$;
"#
    )
}

/// Create the change triggers of one table
pub fn create_table_triggers_sql(schema: &str, table: &str) -> Vec<String> {
    let target = quote_qualified(schema, table);
    TABLE_TRIGGERS
        .iter()
        .map(|(name, event, referencing)| {
            format!(
                "CREATE TRIGGER {} AFTER {event} ON {target} {referencing} FOR EACH STATEMENT EXECUTE FUNCTION live_meta.notify_change()",
                quote_ident(name)
            )
        })
        .collect()
}

pub fn drop_table_triggers_sql(schema: &str, table: &str) -> Vec<String> {
    let target = quote_qualified(schema, table);
    TABLE_TRIGGERS
        .iter()
        .map(|(name, _, _)| format!("DROP TRIGGER IF EXISTS {} ON {target}", quote_ident(name)))
        .collect()
}

/// Tables carrying our triggers: (schema, table, trigger count)
pub const INSTALLED_TRIGGERS_SQL: &str = r#"
SELECT n.nspname AS table_schema, c.relname AS table_name, count(*)::BIGINT AS installed
FROM pg_trigger t
JOIN pg_class c ON c.oid = t.tgrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE NOT t.tgisinternal AND t.tgname IN ('livesql_insert', 'livesql_update', 'livesql_delete')
GROUP BY n.nspname, c.relname
"#;

pub fn create_event_trigger_sql() -> String {
    let tags: Vec<String> = WATCHED_TAGS.iter().map(|t| quote_literal(t)).collect();
    format!(
        "CREATE EVENT TRIGGER {} ON ddl_command_end WHEN TAG IN ({}) EXECUTE FUNCTION live_meta.notify_schema_change()",
        quote_ident(EVENT_TRIGGER),
        tags.join(", ")
    )
}

pub fn drop_event_trigger_sql() -> String {
    format!("DROP EVENT TRIGGER IF EXISTS {}", quote_ident(EVENT_TRIGGER))
}

/// Role may install triggers and send notifications
pub const CAPABILITY_SQL: &str = r#"
SELECT r.rolsuper AS is_super,
       has_function_privilege('pg_notify(text, text)', 'EXECUTE') AS can_notify,
       has_database_privilege(current_database(), 'CREATE') AS can_create
FROM pg_roles r
WHERE r.rolname = current_user
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_triggers_reference_transition_tables() {
        let sql = create_table_triggers_sql("public", "items");
        assert_eq!(sql.len(), 3);
        assert_eq!(
            sql[1],
            "CREATE TRIGGER \"livesql_update\" AFTER UPDATE ON \"items\" REFERENCING OLD TABLE AS old_table NEW TABLE AS new_table FOR EACH STATEMENT EXECUTE FUNCTION live_meta.notify_change()"
        );
        assert_eq!(
            drop_table_triggers_sql("app", "items")[2],
            "DROP TRIGGER IF EXISTS \"livesql_delete\" ON \"app\".\"items\""
        );
    }

    #[test]
    fn init_embeds_channel_literal() {
        let sql = init_sql("my'chan");
        assert!(sql.contains("pg_notify('my''chan', json_build_object("));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS live_meta.app_triggers"));
    }

    #[test]
    fn matched_conditions_notify_in_bounded_chunks() {
        let sql = init_sql("livesql_notify");
        assert!(sql.contains("FOR i IN 1..cardinality(matched) BY 100 LOOP"));
        assert!(sql.contains("'conditions', matched[i:i + 100 - 1]"));

        // Widest payload: a full chunk with 63-byte schema and table names
        let hashes: Vec<String> = (0..NOTIFY_CHUNK)
            .map(|i| crate::triggers::condition_hash(&i.to_string()))
            .collect();
        let payload = serde_json::json!({
            "kind": "data",
            "table": "t".repeat(63),
            "schema": "s".repeat(63),
            "op": "DELETE",
            "conditions": hashes,
        })
        .to_string();
        assert!(payload.len() < 8000, "{}", payload.len());
    }

    #[test]
    fn event_trigger_watches_ddl() {
        let sql = create_event_trigger_sql();
        assert!(sql.starts_with("CREATE EVENT TRIGGER \"livesql_schema_watch\" ON ddl_command_end"));
        assert!(sql.contains("'DROP VIEW'"));
    }
}
