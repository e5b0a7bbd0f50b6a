//! Per-request permission resolution

mod gate;
mod resolver;

pub use gate::{
    clamp_limit, filter_tables, referenced_tables, Access, RuleGate, Scope, DEFAULT_LIMIT,
    DEFAULT_MAX_LIMIT,
};
pub use resolver::{RuleResolver, StaticRuleResolver};
