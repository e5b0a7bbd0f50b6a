//! Select/Aggregation Compiler

mod ast;
mod compile;
pub mod functions;
mod order;

pub use ast::{JoinKind, JoinSelect, SelectEntry, SelectNode};
pub use compile::{
    ArgExpr, CompiledSelect, OrderClause, SelectCompiler, SelectExpr, SelectItem, SelectKind,
};
pub use order::{parse_order_by, NullsOrder, OrderTerm};
