//! Filter Compiler
//!
//! Declarative filter object -> boolean SQL, validated against the columns a
//! request may reference.

mod ast;
mod compile;

pub use ast::{Condition, ExistsFilter, ExistsRoute, FilterNode, FilterOp, GeoOp};
pub use compile::{and_all, on_clause, FilterCompiler};

/// Condition text for a compiled filter; `TRUE` when unconstrained
pub fn condition_or_true(condition: Option<String>) -> String {
    condition.unwrap_or_else(|| "TRUE".to_string())
}
