//! Trigger Provisioning Coordinator
//!
//! A Trigger here is a (table, condition) pair some live client needs
//! change detection for. Processes sharing one database register their pairs
//! in `live_meta.app_triggers`; one statement-level DB trigger per table
//! evaluates every registered condition against the transition tables and
//! NOTIFYs the hashes of the conditions that matched.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;

mod notification;
pub mod sql;

#[cfg(feature = "database")]
mod coordinator;
#[cfg(feature = "database")]
mod listener;

pub use notification::ChangeNotification;

#[cfg(feature = "database")]
pub use coordinator::TriggerCoordinator;
#[cfg(feature = "database")]
pub use listener::run_listener;

/// Condition used when every change to a table matters
pub const UNCONDITIONAL: &str = "TRUE";

/// Hex digest identifying a condition in NOTIFY payloads
pub fn condition_hash(condition: &str) -> String {
    let digest = Sha256::digest(condition.as_bytes());
    hex::encode(&digest[..16])
}

/// One (table, condition) pair requiring change detection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub schema: String,
    pub table: String,
    /// Compiled filter qualified by the table name, or `TRUE`
    pub condition: String,
}

impl TriggerKey {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, condition: Option<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            condition: condition.unwrap_or_else(|| UNCONDITIONAL.to_string()),
        }
    }

    pub fn hash(&self) -> String {
        condition_hash(&self.condition)
    }

    /// A notification for (`schema`, `table`) listing `hashes` concerns this key
    pub fn matches(&self, schema: &str, table: &str, hashes: &[String]) -> bool {
        self.table == table && self.schema == schema && hashes.iter().any(|h| *h == self.hash())
    }
}

/// Outcome of one housekeeping pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pruned_apps: u64,
    pub released_triggers: u64,
    pub dropped_tables: Vec<String>,
    pub schema_watch: bool,
}

/// Makes sure the database reports changes for registered pairs
#[async_trait]
pub trait TriggerProvisioner: Send + Sync {
    /// Register `key` for this process, installing table triggers if needed
    async fn ensure(&self, key: &TriggerKey) -> Result<()>;

    /// Keep this process alive and release pairs outside `active`
    ///
    /// Pairs ensured since the previous heartbeat are kept regardless: their
    /// subscriptions may not have reached the `active` snapshot yet.
    async fn heartbeat(&self, active: &[TriggerKey]) -> Result<HeartbeatReport>;
}

/// Provisioner for processes without a shared database, and for tests
#[derive(Debug, Default)]
pub struct InMemoryProvisioner {
    registered: Mutex<HashSet<TriggerKey>>,
    /// Ensured since the last heartbeat
    fresh: Mutex<HashSet<TriggerKey>>,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<TriggerKey> {
        let mut keys: Vec<TriggerKey> = self
            .registered
            .lock()
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl TriggerProvisioner for InMemoryProvisioner {
    async fn ensure(&self, key: &TriggerKey) -> Result<()> {
        if let Ok(mut fresh) = self.fresh.lock() {
            fresh.insert(key.clone());
        }
        if let Ok(mut set) = self.registered.lock() {
            set.insert(key.clone());
        }
        Ok(())
    }

    async fn heartbeat(&self, active: &[TriggerKey]) -> Result<HeartbeatReport> {
        let mut report = HeartbeatReport::default();
        let fresh = self
            .fresh
            .lock()
            .map(|mut fresh| std::mem::take(&mut *fresh))
            .unwrap_or_default();
        if let Ok(mut set) = self.registered.lock() {
            let before = set.len();
            set.retain(|key| active.contains(key) || fresh.contains(key));
            report.released_triggers = (before - set.len()) as u64;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_short() {
        let a = condition_hash("\"items\".\"id\" = 1");
        assert_eq!(a, condition_hash("\"items\".\"id\" = 1"));
        assert_eq!(a.len(), 32);
        assert_ne!(a, condition_hash(UNCONDITIONAL));
    }

    #[test]
    fn key_matches_notification() {
        let key = TriggerKey::new("public", "items", None);
        assert_eq!(key.condition, "TRUE");
        assert!(key.matches("public", "items", &[key.hash()]));
        assert!(!key.matches("public", "other", &[key.hash()]));
        assert!(!key.matches("public", "items", &["deadbeef".to_string()]));
    }

    #[tokio::test]
    async fn in_memory_heartbeat_releases_inactive() {
        let provisioner = InMemoryProvisioner::new();
        let a = TriggerKey::new("public", "a", None);
        let b = TriggerKey::new("public", "b", Some("\"b\".\"x\" = 1".into()));
        provisioner.ensure(&a).await.unwrap();
        provisioner.ensure(&b).await.unwrap();
        provisioner.heartbeat(&[a.clone(), b.clone()]).await.unwrap();

        let report = provisioner.heartbeat(&[a.clone()]).await.unwrap();
        assert_eq!(report.released_triggers, 1);
        assert_eq!(provisioner.registered(), vec![a]);
    }

    #[tokio::test]
    async fn pair_ensured_after_the_snapshot_survives_one_heartbeat() {
        let provisioner = InMemoryProvisioner::new();
        let key = TriggerKey::new("public", "items", Some("\"items\".\"id\" = 1".into()));

        // The heartbeat snapshot was taken before this subscription registered
        let snapshot: Vec<TriggerKey> = Vec::new();
        provisioner.ensure(&key).await.unwrap();
        let report = provisioner.heartbeat(&snapshot).await.unwrap();
        assert_eq!(report.released_triggers, 0);
        assert_eq!(provisioner.registered(), vec![key.clone()]);

        // Re-ensuring an already registered pair protects it again
        provisioner.ensure(&key).await.unwrap();
        assert_eq!(provisioner.heartbeat(&[]).await.unwrap().released_triggers, 0);

        assert_eq!(provisioner.heartbeat(&[]).await.unwrap().released_triggers, 1);
        assert!(provisioner.registered().is_empty());
    }
}
