//! Sync planning over `(first, last, count)` bounds.
//!
//! Both peers describe their row set by the lowest and highest watermark
//! and the row count. Equal bounds mean nothing to do; otherwise the peer
//! with the newer `last` sends everything from the other peer's `last` on.
//! Equal `last` with differing bounds means rows are missing below the
//! watermark, and both sides send everything.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use livesql_types::SyncBounds;
use serde_json::{Map, Value};

/// Order two watermark values; null and absent sort first
///
/// Numbers compare numerically, RFC 3339 timestamps chronologically and
/// other strings lexicographically.
pub fn compare_synced(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => match (timestamp(x), timestamp(y)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x.cmp(y),
        },
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

fn timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// One transfer direction the session has to run
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStep {
    /// Request client rows with watermark >= `from_synced`
    Pull { from_synced: Option<Value> },
    /// Send server rows with watermark >= `from_synced`
    Push { from_synced: Option<Value> },
}

pub fn plan_sync(server: &SyncBounds, client: &SyncBounds) -> Vec<SyncStep> {
    if server.count == 0 && client.count == 0 {
        return Vec::new();
    }
    if client.count == 0 {
        return vec![SyncStep::Push { from_synced: None }];
    }
    if server.count == 0 {
        return vec![SyncStep::Pull { from_synced: None }];
    }
    match compare_synced(server.last.as_ref(), client.last.as_ref()) {
        Ordering::Less => vec![SyncStep::Pull {
            from_synced: server.last.clone(),
        }],
        Ordering::Greater => vec![SyncStep::Push {
            from_synced: client.last.clone(),
        }],
        Ordering::Equal => {
            let same_first =
                compare_synced(server.first.as_ref(), client.first.as_ref()) == Ordering::Equal;
            if same_first && server.count == client.count {
                Vec::new()
            } else {
                vec![
                    SyncStep::Pull { from_synced: None },
                    SyncStep::Push { from_synced: None },
                ]
            }
        }
    }
}

/// Position in an ascending watermark scan
///
/// `offset` counts rows already seen at exactly `from_synced`, so ties on
/// the watermark never repeat or skip rows between batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cursor {
    pub from_synced: Option<Value>,
    pub offset: u64,
}

impl Cursor {
    pub fn from(from_synced: Option<Value>) -> Self {
        Self {
            from_synced,
            offset: 0,
        }
    }

    /// Cursor after a batch read from this cursor
    pub fn advance(&self, rows: &[Map<String, Value>], synced_field: &str) -> Self {
        let Some(last) = rows.last().and_then(|r| r.get(synced_field)) else {
            return self.clone();
        };
        let at_last = rows
            .iter()
            .rev()
            .take_while(|r| r.get(synced_field) == Some(last))
            .count() as u64;
        if self.from_synced.as_ref() == Some(last) {
            Self {
                from_synced: Some(last.clone()),
                offset: self.offset + at_last,
            }
        } else {
            Self {
                from_synced: Some(last.clone()),
                offset: at_last,
            }
        }
    }
}

/// Highest watermark among `rows`, or `current` when none is higher
pub fn max_synced(current: Option<Value>, rows: &[Map<String, Value>], synced_field: &str) -> Option<Value> {
    rows.iter()
        .filter_map(|r| r.get(synced_field))
        .fold(current, |best, v| {
            if compare_synced(Some(v), best.as_ref()) == Ordering::Greater {
                Some(v.clone())
            } else {
                best
            }
        })
}
