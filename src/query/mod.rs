//! Query Assembler: compiled query trees and their SQL

mod assemble;
mod compiled;
mod write;

pub use assemble::{count_sql, fetch_sql, select_sql};
pub use compiled::{CompiledQuery, JoinInfo, ParsedFind, QueryBuilder, SelectParams};
pub use write::{value_literal, Row, WriteCompiler, WriteParams, WriteStatement};
