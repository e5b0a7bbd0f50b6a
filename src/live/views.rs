//! View subscriptions resolve to change triggers on their base tables.
//!
//! A view's condition is narrowed per base table with an EXISTS against the
//! view, matching the base table's primary key by column name. When the
//! view does not expose every key column the base trigger is unconditional.
//!
//! The narrowed condition is evaluated after the statement, so a DELETE
//! that removes a row from a filtered view is not reported through that
//! base table.

use crate::error::Result;
use crate::schema::SchemaState;
use crate::sql::{quote_ident, quote_qualified};
use crate::triggers::TriggerKey;
use livesql_types::TableCatalogEntry;

/// Trigger keys for `table` under `condition`, resolving views to base tables
pub fn trigger_keys(schema: &SchemaState, table: &str, condition: Option<String>) -> Result<Vec<TriggerKey>> {
    let entry = schema.table(table)?;
    if !entry.is_view {
        return Ok(vec![TriggerKey::new(&entry.schema, &entry.name, condition)]);
    }
    let mut keys = Vec::with_capacity(entry.parent_tables.len());
    for parent in &entry.parent_tables {
        let base = schema.table(parent)?;
        if base.is_view {
            // Views over views: follow down to the tables
            for key in trigger_keys(schema, parent, None)? {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            continue;
        }
        let narrowed = condition.as_deref().and_then(|c| narrow(entry, base, c));
        let key = TriggerKey::new(&base.schema, &base.name, narrowed);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    Ok(keys)
}

/// `EXISTS (view rows matching condition and the changed base row)`
pub fn narrow(view: &TableCatalogEntry, base: &TableCatalogEntry, condition: &str) -> Option<String> {
    let pkey = base.primary_key();
    if pkey.is_empty() || pkey.iter().any(|k| view.column(k).is_none()) {
        return None;
    }
    let view_q = quote_ident(&view.name);
    let base_q = quote_ident(&base.name);
    let matches: Vec<String> = pkey
        .iter()
        .map(|k| format!("{view_q}.{0} = {base_q}.{0}", quote_ident(k)))
        .collect();
    Some(format!(
        "EXISTS (SELECT 1 FROM {} WHERE {condition} AND {})",
        quote_qualified(&view.schema, &view.name),
        matches.join(" AND ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Catalog;
    use livesql_types::ColumnInfo;

    fn schema() -> SchemaState {
        SchemaState::new(Catalog::new(vec![
            TableCatalogEntry::new(
                "orders",
                vec![
                    ColumnInfo::new("id", "int4").primary_key(),
                    ColumnInfo::new("status", "text"),
                ],
            ),
            TableCatalogEntry::new(
                "audit",
                vec![ColumnInfo::new("seq", "int8").primary_key()],
            ),
            TableCatalogEntry::view(
                "open_orders",
                vec![ColumnInfo::new("id", "int4"), ColumnInfo::new("status", "text")],
                vec!["orders".into(), "audit".into()],
            ),
        ]))
    }

    #[test]
    fn tables_pass_through() {
        let keys = trigger_keys(&schema(), "orders", Some("\"orders\".\"id\" = 1".into())).unwrap();
        assert_eq!(keys, vec![TriggerKey::new("public", "orders", Some("\"orders\".\"id\" = 1".into()))]);
    }

    #[test]
    fn views_narrow_by_primary_key_or_fall_back() {
        let keys = trigger_keys(
            &schema(),
            "open_orders",
            Some("\"open_orders\".\"status\" = 'open'".into()),
        )
        .unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(
            keys[0].condition,
            "EXISTS (SELECT 1 FROM \"open_orders\" WHERE \"open_orders\".\"status\" = 'open' AND \"open_orders\".\"id\" = \"orders\".\"id\")"
        );
        assert_eq!(keys[1].table, "audit");
        assert_eq!(keys[1].condition, "TRUE");
    }
}
