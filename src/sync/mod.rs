//! Sync Engine
//!
//! Batched, watermark-keyed bidirectional replication on top of the live
//! subscription machinery.

mod engine;
pub mod protocol;

pub use engine::{SyncChannel, SyncSession};
pub use protocol::{compare_synced, plan_sync, Cursor, SyncStep};
