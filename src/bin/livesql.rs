//! livesql operator CLI
//!
//! Usage:
//!   cargo run --features cli --bin livesql -- compile \
//!     --catalog catalog.json --table orders \
//!     --filter '{"status": "open"}' --select '{"id": 1, "customers": "*"}'
//!
//!   # Compile as a client under a rule file, and show the triggers it needs
//!   cargo run --features cli --bin livesql -- compile \
//!     --catalog catalog.json --rules rules.json --table orders --subscribe
//!
//!   # Print resolved join paths
//!   cargo run --features cli --bin livesql -- paths --catalog catalog.json
//!
//!   # Dump the catalog of a live database, then check trigger capability
//!   cargo run --features cli --bin livesql -- introspect > catalog.json
//!   cargo run --features cli --bin livesql -- check-capability --watch-schema

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;

use livesql::config::LiveConfig;
use livesql::database::DatabaseManager;
use livesql::handlers::{DbHandle, RecordingExecutor};
use livesql::live::{compile_subscription, SubscribeRequest};
use livesql::query::{count_sql, fetch_sql, SelectParams};
use livesql::rules::{Access, RuleGate, StaticRuleResolver};
use livesql::schema::{Catalog, CatalogProvider, SchemaCache};
use livesql::triggers::TriggerCoordinator;
use livesql_types::{JoinEdge, RequestContext, TableCatalogEntry};

#[derive(Parser, Debug)]
#[command(name = "livesql")]
#[command(about = "Compile livesql requests and inspect trigger provisioning")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a find request and print its SQL
    Compile {
        /// Catalog JSON: an array of tables, or {tables, joins}
        #[arg(long)]
        catalog: PathBuf,
        /// Rules JSON ({table: {command: Rule}}); without it the request is trusted
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        table: String,
        #[arg(long, default_value = "{}")]
        filter: String,
        #[arg(long)]
        select: Option<String>,
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
        /// Print the count statement instead
        #[arg(long)]
        count: bool,
        /// Compile as a subscription and list its trigger conditions
        #[arg(long)]
        subscribe: bool,
    },
    /// Print the shortest join path between every related pair
    Paths {
        #[arg(long)]
        catalog: PathBuf,
    },
    /// Dump the catalog of DATABASE_URL as JSON
    Introspect {
        #[arg(long, default_value = "public")]
        schema: Vec<String>,
    },
    /// Check that DATABASE_URL's role may provision triggers
    CheckCapability {
        #[arg(long, env = "LIVESQL_WATCH_SCHEMA")]
        watch_schema: bool,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    Tables(Vec<TableCatalogEntry>),
    Full {
        tables: Vec<TableCatalogEntry>,
        #[serde(default)]
        joins: Vec<JoinEdge>,
    },
}

fn load_catalog(path: &Path) -> anyhow::Result<Catalog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog {}", path.display()))?;
    let file: CatalogFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing catalog {}", path.display()))?;
    Ok(match file {
        CatalogFile::Tables(tables) => Catalog::new(tables),
        CatalogFile::Full { tables, joins } => Catalog::new(tables).with_joins(joins),
    })
}

fn parse_json(label: &str, text: Option<&str>) -> anyhow::Result<Value> {
    match text {
        Some(text) => serde_json::from_str(text).with_context(|| format!("parsing --{label}")),
        None => Ok(Value::Null),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Compile {
            catalog,
            rules,
            table,
            filter,
            select,
            order_by,
            limit,
            count,
            subscribe,
        } => {
            let schema = Arc::new(SchemaCache::new(load_catalog(&catalog)?));
            let (gate, access) = match rules {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading rules {}", path.display()))?;
                    let resolver =
                        StaticRuleResolver::from_json(&schema.current(), &serde_json::from_str(&text)?)?;
                    (
                        RuleGate::new(Arc::new(resolver)),
                        Access::Client(RequestContext::for_socket("cli", None)),
                    )
                }
                None => (RuleGate::trusted_only(), Access::Trusted),
            };
            let filter = parse_json("filter", Some(&filter))?;
            let params = SelectParams {
                select: parse_json("select", select.as_deref())?,
                order_by: parse_json("order-by", order_by.as_deref())?,
                limit,
                ..SelectParams::default()
            };

            if subscribe {
                let request = SubscribeRequest::new(&table, access, filter, params);
                let compiled = compile_subscription(
                    &schema.current(),
                    &gate,
                    &request,
                    LiveConfig::default().live.default_throttle,
                )
                .await?;
                println!("{}", compiled.sql);
                println!();
                println!("-- throttle: {}ms", compiled.throttle.as_millis());
                for key in &compiled.triggers {
                    println!("-- trigger {}.{} [{}]: {}", key.schema, key.table, key.hash(), key.condition);
                }
                return Ok(());
            }

            let db = DbHandle::new(schema, gate, Arc::new(RecordingExecutor::new()));
            let query = db.view(&table)?.compile_find(&access, &filter, &params).await?;
            if count {
                println!("{}", count_sql(&query));
            } else {
                println!("{}", fetch_sql(&query));
            }
        }
        Commands::Paths { catalog } => {
            let schema = SchemaCache::new(load_catalog(&catalog)?).current();
            let joins = schema.joins();
            let mut tables: Vec<&str> = joins.tables().collect();
            tables.sort_unstable();
            for from in &tables {
                for to in &tables {
                    if from == to {
                        continue;
                    }
                    if let Ok(path) = joins.path(from, to) {
                        println!("{from} -> {to}: {} ({} hops)", path.join(" -> "), path.len() - 1);
                    }
                }
            }
        }
        Commands::Introspect { schema } => {
            let config = LiveConfig::from_env();
            let manager = DatabaseManager::new(&config.database).await?;
            let catalog = manager.catalog_provider(schema).load().await?;
            let tables: Vec<&TableCatalogEntry> = catalog.tables().collect();
            println!("{}", serde_json::to_string_pretty(&tables)?);
            manager.close().await;
        }
        Commands::CheckCapability { watch_schema } => {
            let config = LiveConfig::from_env();
            let manager = DatabaseManager::new(&config.database).await?;
            match TriggerCoordinator::check_capability(manager.pool(), watch_schema).await {
                Ok(()) => println!("OK: trigger provisioning is available"),
                Err(e) => {
                    eprintln!("FAILED: {e}");
                    manager.close().await;
                    std::process::exit(2);
                }
            }
            manager.close().await;
        }
    }

    Ok(())
}
