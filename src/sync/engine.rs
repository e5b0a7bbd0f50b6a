//! Sync channels and sessions.
//!
//! A [`SyncChannel`] reads server rows in ascending watermark batches and
//! applies client batches idempotently. A [`SyncSession`] drives one channel
//! over the message protocol, using a live subscription on the newest
//! watermark as its change feed.

use std::cmp::Ordering;
use std::sync::Arc;

use livesql_types::{
    ClientSyncMessage, Command, ServerSyncMessage, SubscriptionMessage, SyncBounds, SyncInfo,
    SyncRule, TableCatalogEntry,
};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{compare_synced, max_synced, plan_sync, Cursor, SyncStep};
use crate::access::FieldSet;
use crate::error::{LiveError, Result};
use crate::handlers::{QueryEngine, SqlExecutor};
use crate::live::{HubHandle, LiveSubscription, SubscribeRequest, SubscriptionKey};
use crate::query::{fetch_sql, value_literal, CompiledQuery, ParsedFind, QueryBuilder, Row, SelectParams};
use crate::rules::Access;
use crate::sql::{quote_ident, quote_qualified};

/// One replication channel over a table
pub struct SyncChannel {
    engine: QueryEngine,
    access: Access,
    filter: Value,
    rule: SyncRule,
    /// Columns a client may write; `None` for trusted callers
    fields: Option<FieldSet>,
    info: SyncInfo,
    /// Client batches apply one at a time
    push_lock: Mutex<()>,
}

impl SyncChannel {
    /// Resolve the sync Rule and open a channel
    ///
    /// `fallback` supplies the sync settings for trusted callers, which have
    /// no Rule to read them from.
    pub async fn open(
        engine: QueryEngine,
        access: Access,
        filter: Value,
        fallback: Option<SyncRule>,
        default_batch: usize,
    ) -> Result<Self> {
        let scope = engine
            .gate
            .scope(&engine.schema, &access, &engine.table, Command::Sync, &[])
            .await?;
        let resolved = scope.root_rule(&engine.table)?;
        let fields = resolved.map(|r| r.fields.clone());
        let rule = resolved
            .and_then(|r| r.sync.clone())
            .or(fallback)
            .ok_or_else(|| LiveError::rule(format!("sync is not configured for {}", engine.table)))?;

        let table = engine.schema.table(&engine.table)?;
        for field in rule.id_fields.iter().chain(std::iter::once(&rule.synced_field)) {
            if table.column(field).is_none() {
                return Err(LiveError::RuleConfig {
                    table: engine.table.clone(),
                    message: format!("sync field {field} does not exist"),
                });
            }
        }
        if rule.id_fields.is_empty() {
            return Err(LiveError::RuleConfig {
                table: engine.table.clone(),
                message: "sync needs at least one id field".to_string(),
            });
        }

        let feed = feed_request(&engine.table, &access, &filter, &rule);
        let info = SyncInfo {
            channel: SubscriptionKey::of(&feed)?.channel_name(),
            id_fields: rule.id_fields.clone(),
            synced_field: rule.synced_field.clone(),
            batch_size: rule.batch_size.unwrap_or(default_batch).max(1),
            allow_delete: rule.allow_delete,
        };
        info!(table = %engine.table, channel = %info.channel, "Sync channel opened");
        Ok(Self {
            engine,
            access,
            filter,
            rule,
            fields,
            info,
            push_lock: Mutex::new(()),
        })
    }

    pub fn info(&self) -> &SyncInfo {
        &self.info
    }

    fn synced(&self) -> &str {
        &self.rule.synced_field
    }

    /// Compile a read of the channel rows from `cursor`, in watermark order
    async fn compile(&self, from_synced: Option<&Value>, params: SelectParams) -> Result<CompiledQuery> {
        let filter = match from_synced {
            Some(from) if !from.is_null() => json!({
                "$and": [self.filter.clone(), {self.synced(): {"$gte": from}}]
            }),
            _ => self.filter.clone(),
        };
        let find = ParsedFind::parse(&filter, &params)?;
        let scope = self
            .engine
            .gate
            .scope_for_find(&self.engine.schema, &self.access, &self.engine.table, Command::Sync, &find)
            .await?;
        QueryBuilder::new(&self.engine.schema, &scope).build(&self.engine.table, &find)
    }

    fn order(&self) -> Value {
        let mut order = vec![json!({"key": self.synced(), "asc": true})];
        order.extend(self.rule.id_fields.iter().map(|f| json!({"key": f, "asc": true})));
        Value::Array(order)
    }

    /// `(first, last, count)` of the server rows
    pub async fn bounds(&self) -> Result<SyncBounds> {
        let query = self.compile(None, SelectParams::default()).await?;
        let column = format!("{}.{}", query.qualifier(), quote_ident(self.synced()));
        let mut sql = format!(
            "SELECT json_build_object('first', min({column}), 'last', max({column}), 'count', count(*)) AS \"row\" FROM {}",
            query.from_sql
        );
        if let Some(condition) = &query.where_clause {
            sql.push_str(&format!(" WHERE {condition}"));
        }
        let row = self
            .engine
            .executor
            .fetch_rows(&sql)
            .await?
            .into_iter()
            .next()
            .unwrap_or(Value::Null);
        Ok(SyncBounds {
            first: row.get("first").cloned().filter(|v| !v.is_null()),
            last: row.get("last").cloned().filter(|v| !v.is_null()),
            count: row.get("count").and_then(Value::as_u64).unwrap_or(0),
        })
    }

    /// Next batch of server rows at or after `cursor`
    pub async fn pull_batch(&self, cursor: &Cursor) -> Result<Vec<Map<String, Value>>> {
        let params = SelectParams {
            order_by: self.order(),
            limit: Some(self.info.batch_size as u64),
            offset: (cursor.offset > 0).then_some(cursor.offset),
            ..SelectParams::default()
        };
        let query = self.compile(cursor.from_synced.as_ref(), params).await?;
        let rows = self.engine.executor.fetch_rows(&fetch_sql(&query)).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    /// Apply a client batch in one transaction; returns the rows changed
    ///
    /// Re-applying the same batch changes nothing: a row is updated only
    /// when the incoming watermark is newer, and inserted only when its id
    /// is absent.
    pub async fn apply_client_rows(&self, rows: &[Row], deleted: &[Row]) -> Result<u64> {
        let _guard = self.push_lock.lock().await;
        let table = self.engine.schema.table(&self.engine.table)?;

        let mut statements = Vec::with_capacity(rows.len() * 2 + deleted.len());
        for row in rows {
            statements.extend(self.upsert_sql(table, row)?);
        }
        if !deleted.is_empty() {
            if self.rule.allow_delete {
                for row in deleted {
                    statements.push(format!(
                        "DELETE FROM {} AS {} WHERE {}",
                        quote_qualified(&table.schema, &table.name),
                        quote_ident(&table.name),
                        self.id_match(table, row, &quote_ident(&table.name))?
                    ));
                }
            } else {
                warn!(
                    table = %table.name,
                    count = deleted.len(),
                    "Ignoring client deletes, sync does not allow delete"
                );
            }
        }
        if statements.is_empty() {
            return Ok(0);
        }

        let executor = &self.engine.executor;
        let Some(tx) = executor.begin().await? else {
            let mut changed = 0;
            for sql in &statements {
                changed += executor.execute(sql).await?;
            }
            return Ok(changed);
        };
        let tx_exec: Arc<dyn SqlExecutor> = tx.clone().as_executor();
        let mut changed = 0;
        for sql in &statements {
            match tx_exec.execute(sql).await {
                Ok(n) => changed += n,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "Rollback after failed sync batch failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit().await?;
        debug!(table = %table.name, rows = rows.len(), changed, "Client sync batch applied");
        Ok(changed)
    }

    /// Row data checked against the table and the sync Rule's fields
    fn row_data(&self, table: &TableCatalogEntry, row: &Row) -> Result<Row> {
        let mut out = Row::new();
        for (key, value) in row {
            if table.column(key).is_none() || self.fields.as_ref().is_some_and(|f| !f.contains(key)) {
                return Err(LiveError::rule(format!(
                    "field {key} cannot be synced in {}",
                    table.name
                )));
            }
            out.insert(key.clone(), value.clone());
        }
        for field in self.rule.id_fields.iter().chain(std::iter::once(&self.rule.synced_field)) {
            if !out.contains_key(field) {
                return Err(LiveError::filter(format!("sync row is missing {field}")));
            }
        }
        Ok(out)
    }

    fn literal(table: &TableCatalogEntry, column: &str, value: &Value) -> String {
        let udt = table
            .column(column)
            .map(|c| c.udt_name.as_str())
            .unwrap_or_default();
        value_literal(value, udt)
    }

    fn id_match(&self, table: &TableCatalogEntry, row: &Row, qualifier: &str) -> Result<String> {
        let parts = self
            .rule
            .id_fields
            .iter()
            .map(|field| {
                let value = row
                    .get(field)
                    .ok_or_else(|| LiveError::filter(format!("sync row is missing {field}")))?;
                Ok(format!(
                    "{qualifier}.{} = {}",
                    quote_ident(field),
                    Self::literal(table, field, value)
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join(" AND "))
    }

    /// `UPDATE` when newer, then `INSERT` when absent
    fn upsert_sql(&self, table: &TableCatalogEntry, row: &Row) -> Result<[String; 2]> {
        let data = self.row_data(table, row)?;
        let target = quote_qualified(&table.schema, &table.name);
        let q = quote_ident(&table.name);
        let synced = quote_ident(self.synced());
        let synced_value = Self::literal(table, self.synced(), &data[self.synced()]);

        let columns: Vec<&str> = table
            .column_names()
            .filter(|c| data.contains_key(*c))
            .collect();
        let set: Vec<String> = columns
            .iter()
            .filter(|c| !self.rule.id_fields.iter().any(|id| id == *c))
            .map(|c| format!("{} = {}", quote_ident(c), Self::literal(table, c, &data[*c])))
            .collect();
        let update = format!(
            "UPDATE {target} AS {q} SET {} WHERE {} AND ({q}.{synced} IS NULL OR {q}.{synced} < {synced_value})",
            set.join(", "),
            self.id_match(table, &data, &q)?
        );

        let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let values: Vec<String> = columns
            .iter()
            .map(|c| Self::literal(table, c, &data[*c]))
            .collect();
        let insert = format!(
            "INSERT INTO {target} ({}) SELECT {} WHERE NOT EXISTS (SELECT 1 FROM {target} AS \"__x\" WHERE {})",
            names.join(", "),
            values.join(", "),
            self.id_match(table, &data, "\"__x\"")?
        );
        Ok([update, insert])
    }
}

fn feed_request(table: &str, access: &Access, filter: &Value, rule: &SyncRule) -> SubscribeRequest {
    let params = SelectParams {
        select: json!([rule.synced_field]),
        order_by: json!([{"key": rule.synced_field, "asc": false}]),
        limit: Some(1),
        ..SelectParams::default()
    };
    SubscribeRequest::new(table, access.clone(), filter.clone(), params)
        .with_command(Command::Sync)
        .single()
}

// ============================================================================
// SESSION
// ============================================================================

/// Client side of a running sync session
pub struct SyncSession {
    info: SyncInfo,
    inbound: mpsc::UnboundedSender<ClientSyncMessage>,
    outbound: mpsc::UnboundedReceiver<ServerSyncMessage>,
    task: JoinHandle<()>,
}

impl SyncSession {
    /// Start driving `channel`; with a hub, server changes are pushed live
    pub async fn start(channel: SyncChannel, hub: Option<&HubHandle>) -> Result<Self> {
        let feed = match hub {
            Some(hub) => Some(
                hub.subscribe(feed_request(
                    &channel.engine.table,
                    &channel.access,
                    &channel.filter,
                    &channel.rule,
                ))
                .await?,
            ),
            None => None,
        };
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let info = channel.info.clone();
        let driver = SessionDriver {
            channel,
            out: outbound_tx,
            client_last: None,
            pull: None,
        };
        let task = tokio::spawn(driver.run(inbound_rx, feed));
        Ok(Self {
            info,
            inbound,
            outbound,
            task,
        })
    }

    pub fn info(&self) -> &SyncInfo {
        &self.info
    }

    pub fn send(&self, message: ClientSyncMessage) -> Result<()> {
        self.inbound
            .send(message)
            .map_err(|_| LiveError::Internal(anyhow::anyhow!("sync session {} is closed", self.info.channel)))
    }

    /// `None` once the session ended, e.g. after its socket disconnected
    pub async fn recv(&mut self) -> Option<ServerSyncMessage> {
        self.outbound.recv().await
    }

    pub fn close(self) {
        self.task.abort();
    }
}

struct SessionDriver {
    channel: SyncChannel,
    out: mpsc::UnboundedSender<ServerSyncMessage>,
    /// Highest watermark the client is known to hold
    client_last: Option<Value>,
    /// Pull in progress
    pull: Option<Cursor>,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<ClientSyncMessage>,
        mut feed: Option<LiveSubscription>,
    ) {
        self.send(ServerSyncMessage::GetBounds);
        loop {
            let result = tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.on_client(message).await,
                    None => break,
                },
                pushed = next_feed(&mut feed) => match pushed {
                    Some(SubscriptionMessage::Data { data }) => self.on_server_change(data).await,
                    Some(SubscriptionMessage::Err { err }) => {
                        warn!(channel = %self.channel.info.channel, error = %err.message, "Sync change feed failed");
                        Ok(())
                    }
                    // Unsubscribed by a socket disconnect or a hub shutdown
                    None => {
                        feed = None;
                        debug!(channel = %self.channel.info.channel, "Sync change feed closed");
                        break;
                    }
                },
                _ = self.out.closed() => {
                    debug!(channel = %self.channel.info.channel, "Sync client went away");
                    break;
                }
            };
            if let Err(e) = result {
                warn!(channel = %self.channel.info.channel, error = %e, "Sync step failed");
                self.send(ServerSyncMessage::Error { err: e.to_client() });
            }
            if self.out.is_closed() {
                break;
            }
        }
        if let Some(feed) = feed {
            feed.unsubscribe();
        }
        debug!(channel = %self.channel.info.channel, "Sync session ended");
    }

    fn send(&self, message: ServerSyncMessage) {
        if self.out.send(message).is_err() {
            debug!(channel = %self.channel.info.channel, "Sync output dropped, client is gone");
        }
    }

    fn request_rows(&self, cursor: &Cursor) {
        self.send(ServerSyncMessage::RequestRows {
            from_synced: cursor.from_synced.clone(),
            offset: cursor.offset,
            limit: self.channel.info.batch_size,
        });
    }

    async fn on_client(&mut self, message: ClientSyncMessage) -> Result<()> {
        match message {
            ClientSyncMessage::Bounds { bounds } => {
                let server = self.channel.bounds().await?;
                self.client_last = bounds.last.clone();
                for step in plan_sync(&server, &bounds) {
                    match step {
                        SyncStep::Push { from_synced } => self.push_from(from_synced).await?,
                        SyncStep::Pull { from_synced } => {
                            let cursor = Cursor::from(from_synced);
                            self.request_rows(&cursor);
                            self.pull = Some(cursor);
                        }
                    }
                }
                Ok(())
            }
            ClientSyncMessage::Rows { rows, deleted } => {
                let changed = self.channel.apply_client_rows(&rows, &deleted).await?;
                let synced = self.channel.synced().to_string();
                self.client_last = max_synced(self.client_last.take(), &rows, &synced);
                if let Some(cursor) = self.pull.take() {
                    if rows.len() >= self.channel.info.batch_size {
                        let next = cursor.advance(&rows, &synced);
                        self.request_rows(&next);
                        self.pull = Some(next);
                    } else if changed > 0 {
                        // Confirm convergence once the pull wrote something
                        self.send(ServerSyncMessage::GetBounds);
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_server_change(&mut self, data: Value) -> Result<()> {
        let newest = data.get(self.channel.synced()).cloned();
        if compare_synced(newest.as_ref(), self.client_last.as_ref()) == Ordering::Greater {
            self.push_from(self.client_last.clone()).await?;
        }
        Ok(())
    }

    /// Send every server row at or after `from_synced`, batch by batch
    async fn push_from(&mut self, from_synced: Option<Value>) -> Result<()> {
        let synced = self.channel.synced().to_string();
        let mut cursor = Cursor::from(from_synced);
        loop {
            let rows = self.channel.pull_batch(&cursor).await?;
            let full = rows.len() >= self.channel.info.batch_size;
            self.client_last = max_synced(self.client_last.take(), &rows, &synced);
            cursor = cursor.advance(&rows, &synced);
            if !rows.is_empty() {
                self.send(ServerSyncMessage::Rows {
                    rows: rows.into_iter().map(Value::Object).collect(),
                });
            }
            if !full {
                return Ok(());
            }
        }
    }
}

async fn next_feed(feed: &mut Option<LiveSubscription>) -> Option<SubscriptionMessage> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveSettings;
    use crate::handlers::{DbHandle, RecordingExecutor};
    use crate::live::HubDeps;
    use crate::rules::{RuleGate, StaticRuleResolver};
    use crate::schema::{Catalog, SchemaCache};
    use crate::triggers::InMemoryProvisioner;
    use livesql_types::{ColumnInfo, RequestContext, Rule};
    use std::time::Duration;
    use tokio::sync::watch;

    fn catalog() -> Catalog {
        Catalog::new(vec![TableCatalogEntry::new(
            "notes",
            vec![
                ColumnInfo::new("id", "uuid").primary_key(),
                ColumnInfo::new("body", "text"),
                ColumnInfo::new("synced", "int8"),
            ],
        )])
    }

    fn sync_rule(allow_delete: bool) -> SyncRule {
        SyncRule {
            id_fields: vec!["id".into()],
            synced_field: "synced".into(),
            allow_delete,
            batch_size: Some(2),
            throttle_ms: None,
        }
    }

    fn schema_and_gate(allow_delete: bool) -> (Arc<SchemaCache>, RuleGate) {
        let schema = Arc::new(SchemaCache::new(catalog()));
        let resolver = StaticRuleResolver::new(
            &schema.current(),
            vec![(
                "notes".to_string(),
                Command::Sync,
                Rule {
                    sync: Some(sync_rule(allow_delete)),
                    ..Rule::default()
                },
            )],
        )
        .unwrap();
        (schema, RuleGate::new(Arc::new(resolver)))
    }

    async fn channel(executor: RecordingExecutor, allow_delete: bool) -> SyncChannel {
        let (schema, gate) = schema_and_gate(allow_delete);
        let db = DbHandle::new(schema, gate, Arc::new(executor));
        let engine = (*db.table("notes").unwrap()).clone();
        SyncChannel::open(
            engine,
            Access::Client(RequestContext::for_socket("s1", None)),
            json!({}),
            None,
            50,
        )
        .await
        .unwrap()
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn client_rows_upsert_by_watermark_in_one_transaction() {
        let executor = RecordingExecutor::new();
        let channel = channel(executor.clone(), false).await;
        assert_eq!(channel.info().batch_size, 2);
        assert!(channel.info().channel.starts_with("livesql.notes.sync."));

        channel
            .apply_client_rows(
                &[row(json!({"id": "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11", "body": "x", "synced": 7}))],
                &[row(json!({"id": "b0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11"}))],
            )
            .await
            .unwrap();
        let log = executor.statements();
        assert_eq!(log.len(), 4, "{log:?}");
        assert_eq!(log[0], "BEGIN");
        assert_eq!(
            log[1],
            "UPDATE \"notes\" AS \"notes\" SET \"body\" = 'x', \"synced\" = 7 WHERE \"notes\".\"id\" = 'a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11' AND (\"notes\".\"synced\" IS NULL OR \"notes\".\"synced\" < 7)"
        );
        assert!(log[2].starts_with("INSERT INTO \"notes\" (\"id\", \"body\", \"synced\") SELECT"));
        assert!(log[2].contains("WHERE NOT EXISTS"));
        // The delete was ignored
        assert_eq!(log[3], "COMMIT");
    }

    #[tokio::test]
    async fn deletes_apply_only_when_allowed() {
        let executor = RecordingExecutor::new();
        let channel = channel(executor.clone(), true).await;
        channel
            .apply_client_rows(&[], &[row(json!({"id": "b0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11"}))])
            .await
            .unwrap();
        assert!(executor.statements()[1].starts_with("DELETE FROM \"notes\""));
    }

    #[tokio::test]
    async fn rows_without_watermark_are_rejected() {
        let executor = RecordingExecutor::new();
        let channel = channel(executor.clone(), false).await;
        let err = channel
            .apply_client_rows(&[row(json!({"id": "a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11"}))], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LiveError::FilterSyntax(_)));
        assert!(executor.statements().is_empty());
    }

    #[tokio::test]
    async fn session_pushes_missing_server_rows() {
        let executor = RecordingExecutor::new();
        let channel = channel(executor.clone(), false).await;
        let mut session = SyncSession::start(channel, None).await.unwrap();
        assert_eq!(session.recv().await, Some(ServerSyncMessage::GetBounds));

        executor.push_rows(vec![json!({"first": 1, "last": 2, "count": 2})]);
        executor.push_rows(vec![
            json!({"id": "a", "body": "x", "synced": 1}),
            json!({"id": "b", "body": "y", "synced": 2}),
        ]);
        executor.push_rows(vec![]);
        session
            .send(ClientSyncMessage::Bounds {
                bounds: SyncBounds::default(),
            })
            .unwrap();
        match session.recv().await {
            Some(ServerSyncMessage::Rows { rows }) => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
        let log = executor.statements();
        assert!(log[0].contains("json_build_object"));
        assert!(log[1].contains("LIMIT 2"));
        assert!(log[2].contains("OFFSET 1"));
        session.close();
    }

    #[tokio::test]
    async fn socket_disconnect_ends_its_session() {
        let executor = RecordingExecutor::new();
        let (schema, gate) = schema_and_gate(false);
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let hub = HubHandle::spawn(
            HubDeps {
                schema,
                gate,
                executor: Arc::new(executor.clone()),
                provisioner: Arc::new(InMemoryProvisioner::new()),
                catalog: None,
                settings: LiveSettings::default(),
            },
            shutdown_rx,
        );

        let channel = channel(executor, false).await;
        let mut session = SyncSession::start(channel, Some(&hub)).await.unwrap();
        assert_eq!(session.recv().await, Some(ServerSyncMessage::GetBounds));
        assert_eq!(hub.stats().await.unwrap().subscriptions, 1);

        hub.disconnect("s1");
        let ended = tokio::time::timeout(Duration::from_secs(5), session.recv())
            .await
            .unwrap();
        assert_eq!(ended, None);
        assert!(session
            .send(ClientSyncMessage::Bounds {
                bounds: SyncBounds::default(),
            })
            .is_err());
        assert_eq!(hub.stats().await.unwrap().subscriptions, 0);
    }

    #[tokio::test]
    async fn driver_stops_once_the_client_drops_its_output() {
        let channel = channel(RecordingExecutor::new(), false).await;
        let (_inbound, inbound_rx) = mpsc::unbounded_channel();
        let (out, outbound) = mpsc::unbounded_channel();
        drop(outbound);
        let driver = SessionDriver {
            channel,
            out,
            client_last: None,
            pull: None,
        };
        tokio::time::timeout(Duration::from_secs(5), driver.run(inbound_rx, None))
            .await
            .unwrap();
    }
}
