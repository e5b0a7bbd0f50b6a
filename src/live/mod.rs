//! Live queries: subscription registry, throttled dispatch and the
//! background tasks that keep change detection alive.
//!
//! [`LiveService`] owns the lifecycle. `start` spawns the hub actor and the
//! heartbeat worker; `destroy` signals shutdown and waits for both.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod hub;
mod subscription;
mod throttle;
pub mod views;

pub use hub::{HubDeps, HubHandle, HubStats, LiveSubscription};
pub use subscription::{compile_subscription, CompiledSubscription, SubscribeRequest, SubscriptionKey};
pub use throttle::{Throttle, ThrottleDecision};

use crate::triggers::TriggerProvisioner;

#[cfg(feature = "database")]
use crate::config::LiveConfig;
#[cfg(feature = "database")]
use crate::triggers::{run_listener, TriggerCoordinator};

/// Running hub plus its background tasks
pub struct LiveService {
    hub: HubHandle,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    #[cfg(feature = "database")]
    coordinator: Option<Arc<TriggerCoordinator>>,
}

impl LiveService {
    /// Start the hub and a heartbeat every `heartbeat` against `deps.provisioner`
    pub fn start(deps: HubDeps, heartbeat: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let provisioner = deps.provisioner.clone();
        let hub = HubHandle::spawn(deps, shutdown_rx.clone());
        let worker = tokio::spawn(run_heartbeat(hub.clone(), provisioner, heartbeat, shutdown_rx));
        Self {
            hub,
            shutdown_tx,
            tasks: vec![worker],
            #[cfg(feature = "database")]
            coordinator: None,
        }
    }

    /// Start against Postgres: coordinator, hub, heartbeat and LISTEN loop
    ///
    /// `deps.provisioner` is replaced by the coordinator.
    #[cfg(feature = "database")]
    pub async fn start_postgres(
        pool: sqlx::PgPool,
        config: &LiveConfig,
        mut deps: HubDeps,
    ) -> crate::error::Result<Self> {
        let coordinator =
            Arc::new(TriggerCoordinator::connect(pool.clone(), config.triggers.clone()).await?);
        deps.provisioner = coordinator.clone();
        deps.settings = config.live.clone();

        let mut service = Self::start(deps, config.triggers.check_interval);
        let listener = tokio::spawn(run_listener(
            pool,
            config.triggers.notify_channel.clone(),
            service.hub.clone(),
            service.shutdown_tx.subscribe(),
        ));
        service.tasks.push(listener);
        service.coordinator = Some(coordinator);
        Ok(service)
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Stop every task; with a coordinator, this app's rows are released
    pub async fn destroy(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Live task ended abnormally");
            }
        }
        #[cfg(feature = "database")]
        if let Some(coordinator) = self.coordinator {
            if let Err(e) = coordinator.deregister().await {
                warn!(error = %e, "Failed to deregister trigger coordinator");
            }
        }
        info!("Live service destroyed");
    }
}

/// Heartbeat the provisioner with the hub's active triggers until shutdown
pub async fn run_heartbeat(
    hub: HubHandle,
    provisioner: Arc<dyn TriggerProvisioner>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(interval_ms = interval.as_millis() as u64, "Heartbeat worker started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => break,
        }
        if *shutdown_rx.borrow() {
            break;
        }

        let active = match hub.active_triggers().await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "Heartbeat could not read active triggers");
                break;
            }
        };
        match provisioner.heartbeat(&active).await {
            Ok(report) => debug!(
                active = active.len(),
                released = report.released_triggers,
                pruned_apps = report.pruned_apps,
                "Heartbeat"
            ),
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }

    debug!("Heartbeat worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveSettings;
    use crate::handlers::RecordingExecutor;
    use crate::query::SelectParams;
    use crate::rules::{Access, RuleGate};
    use crate::schema::{Catalog, SchemaCache};
    use crate::triggers::{InMemoryProvisioner, TriggerKey};
    use livesql_types::{ColumnInfo, TableCatalogEntry};
    use serde_json::json;

    fn deps(provisioner: Arc<InMemoryProvisioner>) -> HubDeps {
        HubDeps {
            schema: Arc::new(SchemaCache::new(Catalog::new(vec![TableCatalogEntry::new(
                "items",
                vec![ColumnInfo::new("id", "int4").primary_key()],
            )]))),
            gate: RuleGate::trusted_only(),
            executor: Arc::new(RecordingExecutor::new()),
            provisioner,
            catalog: None,
            settings: LiveSettings::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_releases_triggers_of_removed_subscriptions() {
        let provisioner = Arc::new(InMemoryProvisioner::new());
        let service = LiveService::start(deps(provisioner.clone()), Duration::from_secs(10));

        let sub = service
            .hub()
            .subscribe(SubscribeRequest::new(
                "items",
                Access::Trusted,
                json!({"id": 7}),
                SelectParams::default(),
            ))
            .await
            .unwrap();
        // A stale pair left by an earlier subscription
        provisioner
            .ensure(&TriggerKey::new("public", "items", None))
            .await
            .unwrap();
        assert_eq!(provisioner.registered().len(), 2);

        // Both were ensured since the last heartbeat
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(provisioner.registered().len(), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(provisioner.registered().len(), 1);

        sub.unsubscribe();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(provisioner.registered().is_empty());

        service.destroy().await;
    }
}
