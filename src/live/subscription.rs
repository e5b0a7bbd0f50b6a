//! Subscription requests, identity and per-subscription state.

use std::time::Duration;

use livesql_types::{Command, SubscriptionMessage};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use super::throttle::Throttle;
use super::views;
use crate::access::TableAccess;
use crate::error::{LiveError, Result};
use crate::query::{fetch_sql, ParsedFind, QueryBuilder, SelectParams};
use crate::rules::{referenced_tables, Access, RuleGate};
use crate::schema::SchemaState;
use crate::triggers::TriggerKey;

/// What a client asks to keep live
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub table: String,
    pub access: Access,
    /// `Subscribe`, or `Sync` for the change feed of a sync channel
    pub command: Command,
    pub filter: Value,
    pub params: SelectParams,
    /// Push a single row (or null) instead of an array
    pub single: bool,
}

impl SubscribeRequest {
    pub fn new(table: impl Into<String>, access: Access, filter: Value, params: SelectParams) -> Self {
        Self {
            table: table.into(),
            access,
            command: Command::Subscribe,
            filter,
            params,
            single: false,
        }
    }

    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = command;
        self
    }
}

/// Identical keys share one subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub socket_id: Option<String>,
    pub table: String,
    pub command: Command,
    /// Canonical JSON (object keys sorted)
    pub filter: String,
    pub params: String,
    pub single: bool,
}

impl SubscriptionKey {
    pub fn of(request: &SubscribeRequest) -> Result<Self> {
        Ok(Self {
            socket_id: request.access.socket_id().map(str::to_string),
            table: request.table.clone(),
            command: request.command,
            filter: serde_json::to_string(&request.filter)?,
            params: serde_json::to_string(&request.params)?,
            single: request.single,
        })
    }

    /// Channel name announced to the client
    pub fn channel_name(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.socket_id.as_deref().unwrap_or_default(),
            &self.table,
            self.command.as_str(),
            &self.filter,
            &self.params,
            if self.single { "1" } else { "0" },
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        format!(
            "livesql.{}.{}.{}",
            self.table,
            self.command,
            hex::encode(&digest[..8])
        )
    }
}

/// What the dispatcher runs and which triggers feed it
#[derive(Debug, Clone)]
pub struct CompiledSubscription {
    pub sql: String,
    pub triggers: Vec<TriggerKey>,
    pub throttle: Duration,
    pub single: bool,
}

/// Resolve rules and compile a subscription against one schema snapshot
pub async fn compile_subscription(
    schema: &SchemaState,
    gate: &RuleGate,
    request: &SubscribeRequest,
    default_throttle: Duration,
) -> Result<CompiledSubscription> {
    let mut find = ParsedFind::parse(&request.filter, &request.params)?;
    if request.single {
        find.limit = Some(1);
    }
    let scope = gate
        .scope_for_find(schema, &request.access, &request.table, request.command, &find)
        .await?;
    let query = QueryBuilder::new(schema, &scope).build(&request.table, &find)?;

    let rule = scope.rule_for(&request.table)?;
    if request.command == Command::Sync && rule.is_some_and(|r| r.sync.is_none()) {
        return Err(LiveError::rule(format!(
            "sync is not configured for {}",
            request.table
        )));
    }
    let throttle = rule
        .and_then(|r| {
            r.throttle.or_else(|| {
                r.sync
                    .as_ref()
                    .and_then(|s| s.throttle_ms)
                    .map(Duration::from_millis)
            })
        })
        .unwrap_or(default_throttle);

    let mut triggers = views::trigger_keys(schema, &request.table, query.where_clause.clone())?;
    for other in referenced_tables(schema, &request.table, &find)? {
        for key in views::trigger_keys(schema, &other, None)? {
            if !triggers.contains(&key) {
                triggers.push(key);
            }
        }
    }

    Ok(CompiledSubscription {
        sql: fetch_sql(&query),
        triggers,
        throttle,
        single: request.single,
    })
}

pub(crate) struct Listener {
    pub id: u64,
    pub sender: mpsc::UnboundedSender<SubscriptionMessage>,
}

/// One live subscription, owned by the hub actor
pub(crate) struct Subscription {
    pub channel: String,
    pub key: SubscriptionKey,
    pub request: SubscribeRequest,
    pub compiled: CompiledSubscription,
    pub listeners: Vec<Listener>,
    pub throttle: Throttle,
    /// Last pushed message, replayed to listeners that attach later
    pub last: Option<SubscriptionMessage>,
}

impl Subscription {
    pub fn new(
        channel: String,
        key: SubscriptionKey,
        request: SubscribeRequest,
        compiled: CompiledSubscription,
    ) -> Self {
        let throttle = Throttle::new(compiled.throttle);
        Self {
            channel,
            key,
            request,
            compiled,
            listeners: Vec::new(),
            throttle,
            last: None,
        }
    }

    pub fn message_for(&self, rows: Vec<Value>) -> SubscriptionMessage {
        let data = if self.compiled.single {
            rows.into_iter().next().unwrap_or(Value::Null)
        } else {
            Value::Array(rows)
        };
        SubscriptionMessage::Data { data }
    }

    /// Push to every listener, dropping the ones that went away
    pub fn push(&mut self, message: SubscriptionMessage) {
        let before = self.listeners.len();
        self.listeners
            .retain(|listener| listener.sender.send(message.clone()).is_ok());
        if self.listeners.len() < before {
            debug!(channel = %self.channel, dropped = before - self.listeners.len(), "Dropped closed listeners");
        }
        self.last = Some(message);
    }

    pub fn matches(&self, schema: &str, table: &str, hashes: &[String]) -> bool {
        self.compiled
            .triggers
            .iter()
            .any(|key| key.matches(schema, table, hashes))
    }
}
