//! Read-only handle for views (and tables opened for reading).

use std::ops::Deref;

use super::engine::QueryEngine;

/// Read surface only: find, count and subscriptions
#[derive(Clone)]
pub struct ViewReader {
    engine: QueryEngine,
}

impl ViewReader {
    pub(crate) fn new(engine: QueryEngine) -> Self {
        Self { engine }
    }
}

impl Deref for ViewReader {
    type Target = QueryEngine;

    fn deref(&self) -> &QueryEngine {
        &self.engine
    }
}
