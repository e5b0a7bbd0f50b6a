//! Error handling for livesql
//!
//! Every failure a request can hit maps onto one [`LiveError`] variant. The
//! variant decides propagation: rule, filter and join errors are rejected
//! before any SQL runs; database errors carry enriched Postgres diagnostics.

use livesql_types::ClientError;
use thiserror::Error;

pub type Result<T, E = LiveError> = std::result::Result<T, E>;

/// Main error type
#[derive(Error, Debug)]
pub enum LiveError {
    #[error("rule violation: {0}")]
    RuleViolation(String),

    #[error("invalid rule for table {table}: {message}")]
    RuleConfig { table: String, message: String },

    #[error("filter syntax error: {0}")]
    FilterSyntax(String),

    #[error("join resolution error: {0}")]
    JoinResolution(String),

    #[error("capability error: {0}")]
    Capability(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {}", .0.message)]
    Database(DbErrorInfo),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Propagation class of a [`LiveError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RuleViolation,
    RuleConfig,
    FilterSyntax,
    JoinResolution,
    Capability,
    NotFound,
    Database,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RuleViolation => "RuleViolation",
            ErrorKind::RuleConfig => "RuleConfig",
            ErrorKind::FilterSyntax => "FilterSyntaxError",
            ErrorKind::JoinResolution => "JoinResolutionError",
            ErrorKind::Capability => "CapabilityError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Database => "DatabaseError",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// Postgres error diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbErrorInfo {
    pub message: String,
    pub code: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl DbErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn code_name(&self) -> Option<&'static str> {
        self.code.as_deref().and_then(pg_error_name)
    }
}

impl LiveError {
    pub fn rule(message: impl Into<String>) -> Self {
        LiveError::RuleViolation(message.into())
    }

    pub fn filter(message: impl Into<String>) -> Self {
        LiveError::FilterSyntax(message.into())
    }

    pub fn join(message: impl Into<String>) -> Self {
        LiveError::JoinResolution(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LiveError::RuleViolation(_) => ErrorKind::RuleViolation,
            LiveError::RuleConfig { .. } => ErrorKind::RuleConfig,
            LiveError::FilterSyntax(_) => ErrorKind::FilterSyntax,
            LiveError::JoinResolution(_) => ErrorKind::JoinResolution,
            LiveError::Capability(_) => ErrorKind::Capability,
            LiveError::NotFound(_) => ErrorKind::NotFound,
            LiveError::Database(_) => ErrorKind::Database,
            LiveError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Unique violation, serialization failure or deadlock: a concurrent
    /// trigger registration got there first and the insert may be retried once.
    pub fn is_retryable_registration_race(&self) -> bool {
        match self {
            LiveError::Database(info) => matches!(
                info.code.as_deref(),
                Some("23505") | Some("40001") | Some("40P01")
            ),
            _ => false,
        }
    }

    /// Wire payload for `{err}` pushes and rejected one-shot calls
    pub fn to_client(&self) -> ClientError {
        let mut out = ClientError {
            message: self.to_string(),
            kind: Some(self.kind().as_str().to_string()),
            ..Default::default()
        };
        if let LiveError::Database(info) = self {
            out.message = info.message.clone();
            out.code = info.code.clone();
            out.code_name = info.code_name().map(str::to_string);
            out.table = info.table.clone();
            out.column = info.column.clone();
            out.constraint = info.constraint.clone();
            out.detail = info.detail.clone();
            out.hint = info.hint.clone();
        }
        if let LiveError::RuleConfig { table, .. } = self {
            out.table = Some(table.clone());
        }
        out
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for LiveError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::postgres::PgDatabaseError;

        match &err {
            sqlx::Error::Database(db) => {
                let mut info = DbErrorInfo::new(db.message());
                info.code = db.code().map(|c| c.to_string());
                info.constraint = db.constraint().map(str::to_string);
                info.table = db.table().map(str::to_string);
                if let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() {
                    info.column = pg.column().map(str::to_string);
                    info.detail = pg.detail().map(str::to_string);
                    info.hint = pg.hint().map(str::to_string);
                }
                LiveError::Database(info)
            }
            sqlx::Error::RowNotFound => LiveError::NotFound("row not found".to_string()),
            _ => LiveError::Database(DbErrorInfo::new(err.to_string())),
        }
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(err: serde_json::Error) -> Self {
        LiveError::Internal(anyhow::anyhow!(err))
    }
}

/// Human-readable name for a Postgres SQLSTATE code
pub fn pg_error_name(code: &str) -> Option<&'static str> {
    let name = match code {
        "23000" => "integrity_constraint_violation",
        "23502" => "not_null_violation",
        "23503" => "foreign_key_violation",
        "23505" => "unique_violation",
        "23514" => "check_violation",
        "23P01" => "exclusion_violation",
        "22001" => "string_data_right_truncation",
        "22003" => "numeric_value_out_of_range",
        "22007" => "invalid_datetime_format",
        "22008" => "datetime_field_overflow",
        "22012" => "division_by_zero",
        "22P02" => "invalid_text_representation",
        "22023" => "invalid_parameter_value",
        "25P02" => "in_failed_sql_transaction",
        "28000" => "invalid_authorization_specification",
        "28P01" => "invalid_password",
        "40001" => "serialization_failure",
        "40P01" => "deadlock_detected",
        "42501" => "insufficient_privilege",
        "42601" => "syntax_error",
        "42703" => "undefined_column",
        "42704" => "undefined_object",
        "42710" => "duplicate_object",
        "42804" => "datatype_mismatch",
        "42883" => "undefined_function",
        "42P01" => "undefined_table",
        "42P07" => "duplicate_table",
        "53300" => "too_many_connections",
        "55P03" => "lock_not_available",
        "57014" => "query_canceled",
        "57P01" => "admin_shutdown",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_rule_violation() {
        let e = LiveError::rule("field secret is not allowed");
        assert_eq!(e.to_string(), "rule violation: field secret is not allowed");
        assert_eq!(e.kind(), ErrorKind::RuleViolation);
    }

    #[test]
    fn pg_codes_translate() {
        assert_eq!(pg_error_name("23505"), Some("unique_violation"));
        assert_eq!(pg_error_name("42P01"), Some("undefined_table"));
        assert_eq!(pg_error_name("99999"), None);
    }

    #[test]
    fn database_error_to_client_carries_diagnostics() {
        let mut info = DbErrorInfo::new("null value in column \"name\"").with_code("23502");
        info.table = Some("users".into());
        info.column = Some("name".into());
        let client = LiveError::Database(info).to_client();
        assert_eq!(client.code.as_deref(), Some("23502"));
        assert_eq!(client.code_name.as_deref(), Some("not_null_violation"));
        assert_eq!(client.column.as_deref(), Some("name"));
        assert_eq!(client.kind.as_deref(), Some("DatabaseError"));
    }

    #[test]
    fn registration_race_detection() {
        let race = LiveError::Database(DbErrorInfo::new("dup").with_code("23505"));
        assert!(race.is_retryable_registration_race());
        let other = LiveError::Database(DbErrorInfo::new("bad").with_code("42601"));
        assert!(!other.is_retryable_registration_race());
        assert!(!LiveError::filter("x").is_retryable_registration_race());
    }
}
