//! NOTIFY payloads sent by the coordination triggers

use serde::{Deserialize, Serialize};

use crate::error::{LiveError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeNotification {
    /// Rows changed in a table; `conditions` are the hashes that matched
    Data {
        table: String,
        schema: String,
        op: String,
        #[serde(default)]
        conditions: Vec<String>,
    },
    /// DDL ran somewhere in the database
    Schema { command: String },
}

impl ChangeNotification {
    pub fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| {
            LiveError::Internal(anyhow::anyhow!("invalid change notification {payload}: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_and_schema_payloads() {
        let data = ChangeNotification::parse(
            r#"{"kind":"data","table":"items","schema":"public","op":"UPDATE","conditions":["ab"]}"#,
        )
        .unwrap();
        assert_eq!(
            data,
            ChangeNotification::Data {
                table: "items".into(),
                schema: "public".into(),
                op: "UPDATE".into(),
                conditions: vec!["ab".into()],
            }
        );

        let schema =
            ChangeNotification::parse(r#"{"kind":"schema","command":"ALTER TABLE"}"#).unwrap();
        assert!(matches!(schema, ChangeNotification::Schema { .. }));

        assert!(ChangeNotification::parse("not json").is_err());
    }
}
