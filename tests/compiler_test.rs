//! Request compilation through the public handles
//!
//! Runs client and trusted requests against a fixed catalog and a recording
//! executor, so no database is needed.
//!
//! Run with: cargo test --test compiler_test

use std::sync::Arc;

use livesql::handlers::{DbHandle, RecordingExecutor};
use livesql::filter::{FilterCompiler, FilterNode};
use livesql::live::{SubscribeRequest, SubscriptionKey};
use livesql::query::{SelectParams, WriteParams};
use livesql::rules::{Access, RuleGate, StaticRuleResolver};
use livesql::schema::{Catalog, SchemaCache, SchemaState};
use livesql::sql::quote_literal;
use livesql::LiveError;
use livesql_types::{ColumnInfo, RequestContext, TableCatalogEntry};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn catalog() -> Catalog {
    Catalog::new(vec![
        TableCatalogEntry::new(
            "owners",
            vec![
                ColumnInfo::new("id", "int4").primary_key(),
                ColumnInfo::new("name", "text"),
            ],
        ),
        TableCatalogEntry::new(
            "notes",
            vec![
                ColumnInfo::new("id", "int4").primary_key(),
                ColumnInfo::new("owner_id", "int4").references("owners", "id"),
                ColumnInfo::new("title", "text"),
                ColumnInfo::new("body", "text"),
                ColumnInfo::new("secret", "text"),
            ],
        ),
    ])
}

fn rules() -> Value {
    json!({
        "notes": {
            "select": {
                "fields": ["id", "owner_id", "title", "body"],
                "forced_filter": {"owner_id": 7},
                "max_limit": 50
            },
            "insert": {
                "fields": ["title", "body"],
                "forced_data": {"owner_id": 7}
            },
            "update": {
                "fields": ["title"],
                "filter_fields": ["id", "title"],
                "forced_filter": {"owner_id": 7}
            },
            "subscribe": {
                "fields": ["id", "title"]
            }
        },
        "owners": {
            "select": {"fields": ["id", "name"]}
        }
    })
}

fn setup() -> (DbHandle, RecordingExecutor) {
    let cache = Arc::new(SchemaCache::new(catalog()));
    let resolver = StaticRuleResolver::from_json(&cache.current(), &rules()).unwrap();
    let executor = RecordingExecutor::new();
    let db = DbHandle::new(cache, RuleGate::new(Arc::new(resolver)), Arc::new(executor.clone()));
    (db, executor)
}

fn client() -> Access {
    Access::Client(RequestContext::for_socket("s1", None))
}

fn row(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

// ============================================================================
// READS
// ============================================================================

#[tokio::test]
async fn client_find_is_scoped_by_forced_filter() {
    let (db, executor) = setup();
    db.view("notes")
        .unwrap()
        .find(&client(), &json!({"title": "x"}), &SelectParams::select(json!(["id", "title"])))
        .await
        .unwrap();

    let statements = executor.statements();
    assert_eq!(statements.len(), 1);
    let sql = &statements[0];
    assert!(sql.contains("\"notes\".\"owner_id\" = 7"), "{sql}");
    assert!(sql.contains("\"notes\".\"title\" = 'x'"), "{sql}");
    assert!(sql.contains("LIMIT 50"), "{sql}");
    assert!(!sql.contains("secret"));
}

#[tokio::test]
async fn trusted_find_ignores_rules() {
    let (db, executor) = setup();
    db.view("notes")
        .unwrap()
        .find(&Access::Trusted, &json!({}), &SelectParams::select(json!(["secret"])))
        .await
        .unwrap();

    let sql = &executor.statements()[0];
    assert!(sql.contains("\"notes\".\"secret\""));
    assert!(!sql.contains("owner_id\" = 7"));
}

#[tokio::test]
async fn rejected_requests_issue_no_statements() {
    let (db, executor) = setup();
    let notes = db.view("notes").unwrap();

    let cases = [
        (json!({"secret": "x"}), SelectParams::default()),
        (json!({"nope": 1}), SelectParams::default()),
        (json!({}), SelectParams::select(json!(["secret"]))),
        (json!({}), SelectParams::default().with_limit(51)),
        (json!({"$bogus": 1}), SelectParams::default()),
    ];
    for (filter, params) in cases {
        assert!(notes.find(&client(), &filter, &params).await.is_err(), "{filter}");
    }

    let err = db
        .view("owners")
        .unwrap()
        .count(&client(), &json!({"$exists": {"notes": {"secret": "x"}}}))
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::RuleViolation(_)));

    assert!(executor.statements().is_empty());
}

#[tokio::test]
async fn joins_need_the_joined_table_published() {
    let (db, executor) = setup();
    db.view("owners")
        .unwrap()
        .find(
            &client(),
            &json!({}),
            &SelectParams::select(json!({"name": 1, "notes": {"select": ["title"]}})),
        )
        .await
        .unwrap();
    let sql = &executor.statements()[0];
    assert!(sql.contains("\"owner_id\" = 7"), "{sql}");
}

// ============================================================================
// WRITES
// ============================================================================

#[tokio::test]
async fn insert_overrides_client_data_with_forced_data() {
    let (db, executor) = setup();
    db.table("notes")
        .unwrap()
        .insert(&client(), &[row(json!({"title": "t"}))], &WriteParams::default())
        .await
        .unwrap();
    let sql = &executor.statements()[0];
    assert!(sql.starts_with("INSERT INTO \"notes\""), "{sql}");
    assert!(sql.contains("7"), "{sql}");

    let err = db
        .table("notes")
        .unwrap()
        .insert(&client(), &[row(json!({"secret": "s"}))], &WriteParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::RuleViolation(_)));
    assert_eq!(executor.statements().len(), 1);
}

#[tokio::test]
async fn update_without_rule_for_command_is_rejected() {
    let (db, executor) = setup();
    let owners = db.table("owners").unwrap();
    let err = owners
        .update(&client(), &json!({"id": 1}), &row(json!({"name": "n"})), &WriteParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::RuleViolation(_)));
    assert!(executor.statements().is_empty());
}

#[tokio::test]
async fn update_keeps_forced_filter() {
    let (db, executor) = setup();
    db.table("notes")
        .unwrap()
        .update(&client(), &json!({"id": 3}), &row(json!({"title": "n"})), &WriteParams::default())
        .await
        .unwrap();
    let sql = &executor.statements()[0];
    assert!(sql.starts_with("UPDATE \"notes\""), "{sql}");
    assert!(sql.contains("\"notes\".\"owner_id\" = 7"), "{sql}");
    assert!(sql.contains("\"notes\".\"id\" = 3"), "{sql}");
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn string_literals_are_always_quoted(value in ".*") {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (db, executor) = setup();
        rt.block_on(async {
            db.view("notes")
                .unwrap()
                .find(&Access::Trusted, &json!({"title": value.clone()}), &SelectParams::default())
                .await
                .unwrap();
        });
        let sql = executor.statements().remove(0);
        let expected = format!("\"notes\".\"title\" = {}", quote_literal(&value));
        prop_assert!(sql.contains(&expected), "{}", sql);
    }

    #[test]
    fn subscription_key_ignores_construction_order(
        fields in proptest::sample::subsequence(vec!["id", "title", "body", "owner_id"], 1..=4),
        seed in any::<u64>(),
    ) {
        let mut shuffled = fields.clone();
        let len = shuffled.len();
        if len > 1 {
            shuffled.rotate_left((seed as usize) % len);
        }
        let build = |order: &[&str]| {
            let mut select = Map::new();
            let mut filter = Map::new();
            for field in order {
                select.insert(field.to_string(), json!(1));
                filter.insert(field.to_string(), json!({"$ne": field}));
            }
            SubscribeRequest::new(
                "notes",
                client(),
                Value::Object(filter),
                SelectParams::select(Value::Object(select)),
            )
        };
        let a = SubscriptionKey::of(&build(&fields)).unwrap();
        let b = SubscriptionKey::of(&build(&shuffled)).unwrap();
        prop_assert_eq!(a.channel_name(), b.channel_name());
        prop_assert_eq!(a, b);
    }

    #[test]
    fn filter_condition_ignores_key_order(
        id in any::<i32>(),
        owner in any::<i32>(),
        title in "[a-z' ]{0,12}",
        body in proptest::option::of("[a-z]{0,8}"),
        seed in any::<u64>(),
    ) {
        let entries = vec![
            ("id", json!(id)),
            ("owner_id", json!({"$gte": owner})),
            ("title", json!({"$like": title})),
            ("body", json!(body)),
        ];
        let mut shuffled = entries.clone();
        shuffled.rotate_left((seed as usize) % entries.len());
        if seed % 2 == 1 {
            shuffled.reverse();
        }

        let schema = SchemaState::new(catalog());
        let notes = schema.table("notes").unwrap();
        let compile = |pairs: &[(&str, Value)]| {
            let mut filter = Map::new();
            for (key, value) in pairs {
                filter.insert(key.to_string(), value.clone());
            }
            let node = FilterNode::parse(&Value::Object(filter)).unwrap();
            FilterCompiler::unrestricted(&schema, notes).compile(&node).unwrap()
        };
        let a = compile(&entries);
        let b = compile(&shuffled);
        prop_assert!(a.is_some());
        prop_assert_eq!(a, b);
    }
}
