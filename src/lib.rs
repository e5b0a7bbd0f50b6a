//! livesql - rule-gated query compiler and realtime change notifications
//!
//! Clients describe what they want as declarative filter/select/join objects.
//! This crate compiles them into SQL under a per-request access Rule and can
//! keep the result live by reacting to database change notifications.
//!
//! ## Call Chain
//! Request -> RuleGate (resolve + validate) -> Filter/Select compilers ->
//! Query Assembler -> SqlExecutor
//!
//! Live: subscribe -> Trigger provisioning -> Hub actor <- LISTEN loop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use livesql::handlers::{DbHandle, RecordingExecutor};
//! use livesql::rules::{Access, RuleGate};
//! use livesql::schema::{Catalog, SchemaCache};
//! use livesql::query::SelectParams;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo(catalog: Catalog) -> livesql::error::Result<()> {
//! let db = DbHandle::new(
//!     Arc::new(SchemaCache::new(catalog)),
//!     RuleGate::trusted_only(),
//!     Arc::new(RecordingExecutor::new()),
//! );
//! let rows = db
//!     .table("orders")?
//!     .find(&Access::Trusted, &json!({"status": "open"}), &SelectParams::default())
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

// Core error handling and configuration
pub mod config;
pub mod error;

// Catalog, identifiers and joins
pub mod join_graph;
pub mod schema;
pub mod sql;

// Compilers
pub mod access;
pub mod filter;
pub mod query;
pub mod select;

// Rule enforcement
pub mod rules;

// Request surface
pub mod handlers;

// Change notification engine
pub mod live;
pub mod sync;
pub mod triggers;

// Database integration (when enabled)
#[cfg(feature = "database")]
pub mod database;

pub use config::LiveConfig;
pub use error::{LiveError, Result};
pub use handlers::{DbHandle, TableWriter, TxHandle, ViewReader};
pub use live::{LiveService, LiveSubscription};
pub use rules::{Access, RuleGate};
pub use schema::{Catalog, SchemaCache};

#[cfg(feature = "database")]
pub use database::{DatabaseManager, PgCatalogProvider};
