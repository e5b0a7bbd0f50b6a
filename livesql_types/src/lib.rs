//! livesql Types - Level 1 Foundation Types
//!
//! Pure data structures shared by the query compiler, the rule gate, the
//! trigger coordinator and the live/sync layers.
//!
//! ## Architecture Level: LEVEL 1 (Foundation)
//!
//! All other crates in the workspace depend on this crate; this crate depends
//! on nothing in the workspace.
//!
//! ## Contents
//!
//! - Table catalog entries and declared/inferred join edges
//! - Per-table, per-command access Rules
//! - Request identity context
//! - Wire messages pushed to subscribers and sync peers
//!
//! ## Rules
//!
//! 1. **NO BUSINESS LOGIC** - only data structures, constructors and accessors
//! 2. **NO WORKSPACE DEPENDENCIES**
//! 3. **SERIALIZABLE** - every type supports serde

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// CATALOG
// ============================================================================

/// Foreign key target of a column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnReference {
    pub table: String,
    pub column: String,
}

/// Column-level privileges held by the connected role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPrivileges {
    pub select: bool,
    pub insert: bool,
    pub update: bool,
}

impl Default for ColumnPrivileges {
    fn default() -> Self {
        Self {
            select: true,
            insert: true,
            update: true,
        }
    }
}

/// Table-level privileges held by the connected role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePrivileges {
    pub select: bool,
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl Default for TablePrivileges {
    fn default() -> Self {
        Self {
            select: true,
            insert: true,
            update: true,
            delete: true,
        }
    }
}

/// One column of a table or view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Postgres udt name: `int4`, `text`, `jsonb`, `_text` (array), `geometry`, ...
    pub udt_name: String,
    #[serde(default)]
    pub is_pkey: bool,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
    #[serde(default)]
    pub has_default: bool,
    #[serde(default)]
    pub references: Vec<ColumnReference>,
    #[serde(default)]
    pub privileges: ColumnPrivileges,
}

fn default_true() -> bool {
    true
}

impl ColumnInfo {
    /// Create a nullable column without references
    pub fn new(name: impl Into<String>, udt_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            udt_name: udt_name.into(),
            is_pkey: false,
            is_nullable: true,
            has_default: false,
            references: Vec::new(),
            privileges: ColumnPrivileges::default(),
        }
    }

    /// Mark as primary key (implies NOT NULL)
    pub fn primary_key(mut self) -> Self {
        self.is_pkey = true;
        self.is_nullable = false;
        self
    }

    /// Add a foreign key reference
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references.push(ColumnReference {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// Array columns carry a leading underscore in their udt name
    pub fn is_array(&self) -> bool {
        self.udt_name.starts_with('_')
    }
}

/// One table or view as seen by the compilers (read-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCatalogEntry {
    pub name: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default)]
    pub oid: u32,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub privileges: TablePrivileges,
    #[serde(default)]
    pub is_view: bool,
    /// Base tables a view reads from (empty for tables)
    #[serde(default)]
    pub parent_tables: Vec<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl TableCatalogEntry {
    /// Create a table in the `public` schema
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            schema: default_schema(),
            oid: 0,
            columns,
            privileges: TablePrivileges::default(),
            is_view: false,
            parent_tables: Vec::new(),
        }
    }

    /// Create a view reading from the given base tables
    pub fn view(
        name: impl Into<String>,
        columns: Vec<ColumnInfo>,
        parent_tables: Vec<String>,
    ) -> Self {
        Self {
            is_view: true,
            parent_tables,
            privileges: TablePrivileges {
                select: true,
                insert: false,
                update: false,
                delete: false,
            },
            ..Self::new(name, columns)
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_pkey)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// How many rows on the far side of a join match one row on the near side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    Many,
}

/// Declared or inferred relationship between two tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEdge {
    pub left: String,
    pub right: String,
    /// (left column, right column) pairs
    pub on: Vec<(String, String)>,
    /// Right rows per left row
    pub left_to_right: Cardinality,
    /// Left rows per right row
    pub right_to_left: Cardinality,
}

// ============================================================================
// RULES
// ============================================================================

/// Command a Rule is resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Select,
    Insert,
    Update,
    Delete,
    Subscribe,
    Sync,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Select => "select",
            Command::Insert => "insert",
            Command::Update => "update",
            Command::Delete => "delete",
            Command::Subscribe => "subscribe",
            Command::Sync => "sync",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field allow-list as authored: `"*"`, `["a", "b"]` or `{a: true, b: false}`
///
/// A map of only `true` values lists the allowed fields; a map of only `false`
/// values lists excluded fields. Mixed maps are rejected when deserializing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum FieldFilter {
    #[default]
    All,
    Only(Vec<String>),
    Except(Vec<String>),
}

impl TryFrom<Value> for FieldFilter {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) if s == "*" => Ok(FieldFilter::All),
            Value::String(s) if s.is_empty() => Ok(FieldFilter::Only(Vec::new())),
            Value::String(s) => Ok(FieldFilter::Only(vec![s])),
            Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    other => Err(format!("field list entries must be strings, got {other}")),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(FieldFilter::Only),
            Value::Object(map) => {
                let mut included = Vec::new();
                let mut excluded = Vec::new();
                for (key, flag) in map {
                    match flag {
                        Value::Bool(true) => included.push(key),
                        Value::Number(n) if n.as_i64() == Some(1) => included.push(key),
                        Value::Bool(false) => excluded.push(key),
                        Value::Number(n) if n.as_i64() == Some(0) => excluded.push(key),
                        other => return Err(format!("invalid flag for field {key}: {other}")),
                    }
                }
                match (included.is_empty(), excluded.is_empty()) {
                    (_, true) => Ok(FieldFilter::Only(included)),
                    (true, false) => Ok(FieldFilter::Except(excluded)),
                    (false, false) => {
                        Err("field map cannot mix included and excluded fields".to_string())
                    }
                }
            }
            other => Err(format!("invalid field filter: {other}")),
        }
    }
}

impl From<FieldFilter> for Value {
    fn from(filter: FieldFilter) -> Self {
        match filter {
            FieldFilter::All => Value::String("*".to_string()),
            FieldFilter::Only(fields) => {
                Value::Array(fields.into_iter().map(Value::String).collect())
            }
            FieldFilter::Except(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|f| (f, Value::Bool(false)))
                    .collect(),
            ),
        }
    }
}

/// Row cap policy for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxLimit {
    /// Not configured: the system-wide maximum applies
    #[default]
    Default,
    Limited(u64),
    /// Explicitly configured as `null`: no cap
    Unlimited,
}

impl MaxLimit {
    pub fn is_default(&self) -> bool {
        matches!(self, MaxLimit::Default)
    }
}

impl Serialize for MaxLimit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MaxLimit::Default => serializer.serialize_none(),
            MaxLimit::Limited(n) => serializer.serialize_u64(*n),
            MaxLimit::Unlimited => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for MaxLimit {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Only reached when the key is present; an absent key uses `Default`.
        let value = Option::<u64>::deserialize(deserializer)?;
        Ok(match value {
            Some(n) => MaxLimit::Limited(n),
            None => MaxLimit::Unlimited,
        })
    }
}

/// Replication settings for the sync command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRule {
    pub id_fields: Vec<String>,
    pub synced_field: String,
    #[serde(default)]
    pub allow_delete: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub throttle_ms: Option<u64>,
}

/// Fully resolved access policy for one (table, command)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Select fields for reads, data fields for insert/update
    #[serde(default)]
    pub fields: FieldFilter,
    /// Columns usable in filters (defaults to `fields`)
    #[serde(default)]
    pub filter_fields: Option<FieldFilter>,
    /// Columns usable in orderBy (defaults to `fields`)
    #[serde(default)]
    pub order_by_fields: Option<FieldFilter>,
    /// Columns usable in `returning` (defaults to `fields`)
    #[serde(default)]
    pub returning_fields: Option<FieldFilter>,
    /// Server-authored filter AND-ed with every request
    #[serde(default)]
    pub forced_filter: Option<Value>,
    /// Server-authored values overriding request data
    #[serde(default)]
    pub forced_data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "MaxLimit::is_default")]
    pub max_limit: MaxLimit,
    /// Permits update/delete without a filter
    #[serde(default)]
    pub allow_unfiltered: bool,
    #[serde(default)]
    pub throttle_ms: Option<u64>,
    #[serde(default)]
    pub sync: Option<SyncRule>,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            fields: FieldFilter::All,
            filter_fields: None,
            order_by_fields: None,
            returning_fields: None,
            forced_filter: None,
            forced_data: None,
            max_limit: MaxLimit::Default,
            allow_unfiltered: false,
            throttle_ms: None,
            sync: None,
        }
    }
}

impl Rule {
    /// Rule allowing every field with the given select list
    pub fn with_fields(fields: FieldFilter) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// User resolved by the external session collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: String,
    pub sid: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub claims: Value,
}

/// Per-request identity, used to key socket state and feed Rule resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub socket_id: Option<String>,
    pub user: Option<SessionUser>,
}

impl RequestContext {
    pub fn for_socket(socket_id: impl Into<String>, user: Option<SessionUser>) -> Self {
        Self {
            socket_id: Some(socket_id.into()),
            user,
        }
    }
}

// ============================================================================
// WIRE MESSAGES
// ============================================================================

/// Error payload surfaced to clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Payload pushed on a subscription channel: `{data}` or `{err}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubscriptionMessage {
    Data { data: Value },
    Err { err: ClientError },
}

/// `(first, last, count)` of a peer's row set ordered by the synced field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncBounds {
    pub first: Option<Value>,
    pub last: Option<Value>,
    pub count: u64,
}

/// Sync parameters announced to the client when a channel opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub channel: String,
    pub id_fields: Vec<String>,
    pub synced_field: String,
    pub batch_size: usize,
    pub allow_delete: bool,
}

/// Messages the server sends on a sync channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerSyncMessage {
    /// Ask the client for its bounds
    GetBounds,
    /// Ask the client for rows with synced value >= `from_synced`
    RequestRows {
        from_synced: Option<Value>,
        offset: u64,
        limit: usize,
    },
    /// Server rows the client is missing
    Rows { rows: Vec<Value> },
    Error { err: ClientError },
}

/// Messages a client sends on a sync channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientSyncMessage {
    Bounds {
        bounds: SyncBounds,
    },
    Rows {
        rows: Vec<Map<String, Value>>,
        #[serde(default)]
        deleted: Vec<Map<String, Value>>,
    },
}
