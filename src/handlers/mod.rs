//! Table and view handles: the request surface over the compilers.

mod db;
mod engine;
mod executor;
mod reader;
mod writer;

pub use db::{DbHandle, TxHandle};
pub use engine::QueryEngine;
pub use executor::{RecordingExecutor, SqlExecutor, TxExecutor};
pub use reader::ViewReader;
pub use writer::{TableWriter, WriteOutcome};

#[cfg(feature = "database")]
pub use executor::{PgExecutor, PgTxExecutor};
