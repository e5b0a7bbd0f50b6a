//! Schema catalog and its derived join graph.
//!
//! The catalog is supplied by an external introspection collaborator and is
//! read-only to the compilers. A reload replaces the whole [`SchemaState`],
//! which drops every memoized join path with it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use livesql_types::{Cardinality, JoinEdge, TableCatalogEntry};
use tracing::info;

use crate::error::{LiveError, Result};
use crate::join_graph::JoinGraph;

/// Table catalog keyed by table name
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, TableCatalogEntry>,
    declared_joins: Vec<JoinEdge>,
}

impl Catalog {
    pub fn new(tables: impl IntoIterator<Item = TableCatalogEntry>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            declared_joins: Vec::new(),
        }
    }

    /// Declared joins take precedence over ones inferred from foreign keys
    pub fn with_joins(mut self, joins: Vec<JoinEdge>) -> Self {
        self.declared_joins = joins;
        self
    }

    pub fn table(&self, name: &str) -> Result<&TableCatalogEntry> {
        self.tables
            .get(name)
            .ok_or_else(|| LiveError::NotFound(format!("table or view {name} does not exist")))
    }

    pub fn get(&self, name: &str) -> Option<&TableCatalogEntry> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableCatalogEntry> {
        self.tables.values()
    }

    /// Declared joins followed by one edge per foreign key column
    ///
    /// Composite foreign keys are not grouped; declare them explicitly.
    pub fn join_edges(&self) -> Vec<JoinEdge> {
        let mut edges = self.declared_joins.clone();
        for table in self.tables.values() {
            for column in &table.columns {
                for reference in &column.references {
                    if !self.tables.contains_key(&reference.table) {
                        continue;
                    }
                    let pk = table.primary_key();
                    let one_to_one = pk.len() == 1 && pk[0] == column.name;
                    edges.push(JoinEdge {
                        left: table.name.clone(),
                        right: reference.table.clone(),
                        on: vec![(column.name.clone(), reference.column.clone())],
                        left_to_right: Cardinality::One,
                        right_to_left: if one_to_one {
                            Cardinality::One
                        } else {
                            Cardinality::Many
                        },
                    });
                }
            }
        }
        edges
    }
}

/// Catalog plus the join graph derived from it
#[derive(Debug, Clone, Default)]
pub struct SchemaState {
    catalog: Catalog,
    joins: JoinGraph,
}

impl SchemaState {
    pub fn new(catalog: Catalog) -> Self {
        let joins = JoinGraph::build(catalog.join_edges());
        Self { catalog, joins }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn joins(&self) -> &JoinGraph {
        &self.joins
    }

    pub fn table(&self, name: &str) -> Result<&TableCatalogEntry> {
        self.catalog.table(name)
    }
}

/// External schema introspection collaborator
#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn load(&self) -> Result<Catalog>;
}

/// Fixed catalog, for embedding and tests
pub struct StaticCatalog(pub Catalog);

#[async_trait]
impl CatalogProvider for StaticCatalog {
    async fn load(&self) -> Result<Catalog> {
        Ok(self.0.clone())
    }
}

/// Shared, swappable schema state
#[derive(Debug, Default)]
pub struct SchemaCache {
    state: RwLock<Arc<SchemaState>>,
}

impl SchemaCache {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            state: RwLock::new(Arc::new(SchemaState::new(catalog))),
        }
    }

    /// Snapshot of the current state; unaffected by later reloads
    pub fn current(&self) -> Arc<SchemaState> {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, catalog: Catalog) -> Arc<SchemaState> {
        let next = Arc::new(SchemaState::new(catalog));
        match self.state.write() {
            Ok(mut guard) => *guard = next.clone(),
            Err(poisoned) => *poisoned.into_inner() = next.clone(),
        }
        next
    }

    /// Reload from the provider, invalidating join-path memoization
    pub async fn reload(&self, provider: &dyn CatalogProvider) -> Result<Arc<SchemaState>> {
        let catalog = provider.load().await?;
        let tables = catalog.tables().count();
        let state = self.replace(catalog);
        info!(tables, "Schema catalog reloaded");
        Ok(state)
    }
}
