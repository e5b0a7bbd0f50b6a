//! Subscription Registry & Dispatcher
//!
//! A single actor owns every Subscription. Subscribe requests are compiled
//! and their triggers provisioned by the caller's task; only the finished
//! registration enters the actor. NOTIFY deliveries, disconnects, dispatch
//! completions and throttle timers all arrive as messages, so the
//! subscription table is never mutated from two places at once.
//!
//! Dispatch always re-runs the compiled query and pushes the complete result.
//! A result that arrives after its subscription was removed is discarded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use livesql_types::{ClientError, SubscriptionMessage};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::subscription::{
    compile_subscription, CompiledSubscription, Listener, SubscribeRequest, Subscription,
    SubscriptionKey,
};
use super::throttle::ThrottleDecision;
use crate::config::LiveSettings;
use crate::error::{LiveError, Result};
use crate::handlers::SqlExecutor;
use crate::rules::RuleGate;
use crate::schema::{CatalogProvider, SchemaCache};
use crate::triggers::{ChangeNotification, TriggerKey, TriggerProvisioner};

/// Collaborators the hub works with
#[derive(Clone)]
pub struct HubDeps {
    pub schema: Arc<SchemaCache>,
    pub gate: RuleGate,
    pub executor: Arc<dyn SqlExecutor>,
    pub provisioner: Arc<dyn TriggerProvisioner>,
    /// Reload source for schema change notifications
    pub catalog: Option<Arc<dyn CatalogProvider>>,
    pub settings: LiveSettings,
}

/// Counts reported by [`HubHandle::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub subscriptions: usize,
    pub listeners: usize,
}

enum HubMessage {
    Register {
        key: SubscriptionKey,
        request: SubscribeRequest,
        compiled: CompiledSubscription,
        sender: mpsc::UnboundedSender<SubscriptionMessage>,
        reply: oneshot::Sender<(String, u64)>,
    },
    Unsubscribe {
        channel: String,
        listener: u64,
    },
    Disconnect {
        socket_id: String,
    },
    Change(ChangeNotification),
    Resync,
    DispatchDone {
        channel: String,
        result: std::result::Result<Vec<Value>, ClientError>,
    },
    TimerElapsed {
        channel: String,
    },
    Recompiled {
        updates: Vec<(String, std::result::Result<CompiledSubscription, ClientError>)>,
    },
    ActiveTriggers {
        reply: oneshot::Sender<Vec<TriggerKey>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cheap, cloneable entry point into the hub actor
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubMessage>,
    deps: Arc<HubDeps>,
}

impl HubHandle {
    /// Spawn the actor; it stops when `shutdown_rx` flips to `true`
    pub fn spawn(deps: HubDeps, shutdown_rx: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let deps = Arc::new(deps);
        let actor = HubActor {
            deps: deps.clone(),
            tx: tx.clone(),
            subscriptions: HashMap::new(),
            by_key: HashMap::new(),
            next_listener: 1,
            reloading: false,
            reload_again: false,
        };
        tokio::spawn(actor.run(rx, shutdown_rx));
        Self { tx, deps }
    }

    fn send(&self, message: HubMessage) {
        if self.tx.send(message).is_err() {
            debug!("Hub is stopped, message dropped");
        }
    }

    fn stopped() -> LiveError {
        LiveError::Internal(anyhow::anyhow!("subscription hub is stopped"))
    }

    /// Compile, provision triggers and register a subscription
    ///
    /// An identical request from the same client attaches one more listener to
    /// the existing subscription, which replays its last result.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<LiveSubscription> {
        let schema = self.deps.schema.current();
        let compiled = compile_subscription(
            &schema,
            &self.deps.gate,
            &request,
            self.deps.settings.default_throttle,
        )
        .await?;
        for key in &compiled.triggers {
            self.deps.provisioner.ensure(key).await?;
        }

        let key = SubscriptionKey::of(&request)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(HubMessage::Register {
                key,
                request,
                compiled,
                sender,
                reply,
            })
            .map_err(|_| Self::stopped())?;
        let (channel, listener) = reply_rx.await.map_err(|_| Self::stopped())?;
        Ok(LiveSubscription {
            channel,
            listener,
            receiver,
            hub: self.clone(),
        })
    }

    pub fn unsubscribe(&self, channel: &str, listener: u64) {
        self.send(HubMessage::Unsubscribe {
            channel: channel.to_string(),
            listener,
        });
    }

    /// Drop every subscription of a socket
    pub fn disconnect(&self, socket_id: &str) {
        self.send(HubMessage::Disconnect {
            socket_id: socket_id.to_string(),
        });
    }

    pub fn notify(&self, change: ChangeNotification) {
        self.send(HubMessage::Change(change));
    }

    /// Re-run every subscription, e.g. after notifications may have been lost
    pub fn resync(&self) {
        self.send(HubMessage::Resync);
    }

    /// Triggers referenced by at least one live subscription
    pub async fn active_triggers(&self) -> Result<Vec<TriggerKey>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMessage::ActiveTriggers { reply })
            .map_err(|_| Self::stopped())?;
        rx.await.map_err(|_| Self::stopped())
    }

    pub async fn stats(&self) -> Result<HubStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubMessage::Stats { reply })
            .map_err(|_| Self::stopped())?;
        rx.await.map_err(|_| Self::stopped())
    }
}

/// Client side of one subscription listener
pub struct LiveSubscription {
    channel: String,
    listener: u64,
    receiver: mpsc::UnboundedReceiver<SubscriptionMessage>,
    hub: HubHandle,
}

impl LiveSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next `{data}` / `{err}` push; `None` once the subscription is gone
    pub async fn recv(&mut self) -> Option<SubscriptionMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SubscriptionMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        self.hub.unsubscribe(&self.channel, self.listener);
    }
}

// ============================================================================
// ACTOR
// ============================================================================

struct HubActor {
    deps: Arc<HubDeps>,
    tx: mpsc::UnboundedSender<HubMessage>,
    subscriptions: HashMap<String, Subscription>,
    by_key: HashMap<SubscriptionKey, String>,
    next_listener: u64,
    reloading: bool,
    reload_again: bool,
}

impl HubActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<HubMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Subscription hub started");
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!(subscriptions = self.subscriptions.len(), "Subscription hub stopped");
    }

    fn handle(&mut self, message: HubMessage) {
        match message {
            HubMessage::Register {
                key,
                request,
                compiled,
                sender,
                reply,
            } => {
                let registered = self.register(key, request, compiled, sender);
                let _ = reply.send(registered);
            }
            HubMessage::Unsubscribe { channel, listener } => {
                if let Some(sub) = self.subscriptions.get_mut(&channel) {
                    sub.listeners.retain(|l| l.id != listener);
                    if sub.listeners.is_empty() {
                        self.remove(&channel);
                    }
                }
            }
            HubMessage::Disconnect { socket_id } => {
                let channels: Vec<String> = self
                    .subscriptions
                    .values()
                    .filter(|s| s.key.socket_id.as_deref() == Some(socket_id.as_str()))
                    .map(|s| s.channel.clone())
                    .collect();
                for channel in &channels {
                    self.remove(channel);
                }
                debug!(socket_id = %socket_id, removed = channels.len(), "Socket disconnected");
            }
            HubMessage::Change(ChangeNotification::Data {
                table,
                schema,
                conditions,
                ..
            }) => {
                let channels: Vec<String> = self
                    .subscriptions
                    .values()
                    .filter(|s| s.matches(&schema, &table, &conditions))
                    .map(|s| s.channel.clone())
                    .collect();
                for channel in channels {
                    self.trigger(&channel);
                }
            }
            HubMessage::Change(ChangeNotification::Schema { command }) => {
                info!(command = %command, "Schema change notified");
                self.reload_schema();
            }
            HubMessage::Resync => {
                let channels: Vec<String> = self.subscriptions.keys().cloned().collect();
                for channel in channels {
                    self.trigger(&channel);
                }
            }
            HubMessage::DispatchDone { channel, result } => self.dispatch_done(&channel, result),
            HubMessage::TimerElapsed { channel } => {
                if let Some(sub) = self.subscriptions.get_mut(&channel) {
                    if sub.throttle.on_timer(Instant::now()) {
                        self.dispatch(&channel);
                    }
                }
            }
            HubMessage::Recompiled { updates } => self.recompiled(updates),
            HubMessage::ActiveTriggers { reply } => {
                let mut keys: Vec<TriggerKey> = self
                    .subscriptions
                    .values()
                    .flat_map(|s| s.compiled.triggers.iter().cloned())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect();
                keys.sort();
                let _ = reply.send(keys);
            }
            HubMessage::Stats { reply } => {
                let _ = reply.send(HubStats {
                    subscriptions: self.subscriptions.len(),
                    listeners: self.subscriptions.values().map(|s| s.listeners.len()).sum(),
                });
            }
        }
    }

    fn register(
        &mut self,
        key: SubscriptionKey,
        request: SubscribeRequest,
        compiled: CompiledSubscription,
        sender: mpsc::UnboundedSender<SubscriptionMessage>,
    ) -> (String, u64) {
        let listener = self.next_listener;
        self.next_listener += 1;

        if let Some(channel) = self.by_key.get(&key).cloned() {
            if let Some(sub) = self.subscriptions.get_mut(&channel) {
                if let Some(last) = &sub.last {
                    let _ = sender.send(last.clone());
                }
                sub.listeners.push(Listener { id: listener, sender });
                debug!(channel = %channel, "Listener attached to existing subscription");
                return (channel, listener);
            }
        }

        let channel = key.channel_name();
        let mut sub = Subscription::new(channel.clone(), key.clone(), request, compiled);
        sub.listeners.push(Listener { id: listener, sender });
        // The initial fetch counts as the first dispatch of the window
        sub.throttle.start(Instant::now());
        self.subscriptions.insert(channel.clone(), sub);
        self.by_key.insert(key, channel.clone());
        self.spawn_fetch(&channel);
        debug!(channel = %channel, "Subscription registered");
        (channel, listener)
    }

    fn remove(&mut self, channel: &str) {
        if let Some(sub) = self.subscriptions.remove(channel) {
            self.by_key.remove(&sub.key);
        }
    }

    fn trigger(&mut self, channel: &str) {
        let Some(sub) = self.subscriptions.get_mut(channel) else {
            return;
        };
        match sub.throttle.on_trigger(Instant::now()) {
            ThrottleDecision::RunNow => self.spawn_fetch(channel),
            ThrottleDecision::Wait(deadline) => self.arm_timer(channel, deadline),
            ThrottleDecision::Coalesced => {}
        }
    }

    /// Start a dispatch the throttle already accounted for
    fn dispatch(&mut self, channel: &str) {
        self.spawn_fetch(channel);
    }

    fn spawn_fetch(&self, channel: &str) {
        let Some(sub) = self.subscriptions.get(channel) else {
            return;
        };
        let sql = sub.compiled.sql.clone();
        let executor = self.deps.executor.clone();
        let tx = self.tx.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let result = executor.fetch_rows(&sql).await.map_err(|e| e.to_client());
            let _ = tx.send(HubMessage::DispatchDone { channel, result });
        });
    }

    fn arm_timer(&self, channel: &str, deadline: Instant) {
        let tx = self.tx.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(HubMessage::TimerElapsed { channel });
        });
    }

    fn dispatch_done(&mut self, channel: &str, result: std::result::Result<Vec<Value>, ClientError>) {
        let Some(sub) = self.subscriptions.get_mut(channel) else {
            debug!(channel = %channel, "Discarding result of removed subscription");
            return;
        };
        let message = match result {
            Ok(rows) => sub.message_for(rows),
            Err(err) => {
                warn!(channel = %channel, error = %err.message, "Subscription dispatch failed");
                SubscriptionMessage::Err { err }
            }
        };
        sub.push(message);
        if sub.listeners.is_empty() {
            self.remove(channel);
            return;
        }
        match sub.throttle.on_done(Instant::now()) {
            Some(ThrottleDecision::RunNow) => self.dispatch(channel),
            Some(ThrottleDecision::Wait(deadline)) => self.arm_timer(channel, deadline),
            Some(ThrottleDecision::Coalesced) | None => {}
        }
    }

    fn reload_schema(&mut self) {
        let Some(provider) = self.deps.catalog.clone() else {
            debug!("No catalog provider, ignoring schema change");
            return;
        };
        if self.reloading {
            self.reload_again = true;
            return;
        }
        self.reloading = true;

        let requests: Vec<(String, SubscribeRequest)> = self
            .subscriptions
            .values()
            .map(|s| (s.channel.clone(), s.request.clone()))
            .collect();
        let deps = self.deps.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let updates = match deps.schema.reload(provider.as_ref()).await {
                Ok(schema) => {
                    let mut updates = Vec::with_capacity(requests.len());
                    for (channel, request) in requests {
                        let compiled = async {
                            let compiled = compile_subscription(
                                &schema,
                                &deps.gate,
                                &request,
                                deps.settings.default_throttle,
                            )
                            .await?;
                            for key in &compiled.triggers {
                                deps.provisioner.ensure(key).await?;
                            }
                            Ok::<_, LiveError>(compiled)
                        }
                        .await
                        .map_err(|e| e.to_client());
                        updates.push((channel, compiled));
                    }
                    updates
                }
                Err(e) => {
                    warn!(error = %e, "Schema reload failed");
                    Vec::new()
                }
            };
            let _ = tx.send(HubMessage::Recompiled { updates });
        });
    }

    fn recompiled(
        &mut self,
        updates: Vec<(String, std::result::Result<CompiledSubscription, ClientError>)>,
    ) {
        self.reloading = false;
        for (channel, compiled) in updates {
            let Some(sub) = self.subscriptions.get_mut(&channel) else {
                continue;
            };
            match compiled {
                Ok(compiled) => {
                    sub.compiled = compiled;
                    self.trigger(&channel);
                }
                Err(err) => {
                    warn!(channel = %channel, error = %err.message, "Subscription no longer compiles");
                    sub.push(SubscriptionMessage::Err { err });
                }
            }
        }
        if std::mem::take(&mut self.reload_again) {
            self.reload_schema();
        }
    }
}
