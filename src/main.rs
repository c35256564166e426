use anyhow::{Context, Result};
use clap::Parser;
use shardproxy::{
    EngineConfig, FunctionDef, JsonFileClusterSource, PgConnector, ProxyEngine,
    QueryResult, Value,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardproxy")]
#[command(about = "Run one proxied function call against the partitions of a PostgreSQL cluster")]
struct Cli {
    /// JSON file listing the clusters and their partitions
    #[arg(long)]
    clusters: PathBuf,

    /// Function signature, e.g. "get_user(username text)"
    #[arg(long)]
    signature: String,

    /// Routing directive, e.g. "CLUSTER 'userdb'; RUN ON hash(username);"
    #[arg(long)]
    body: String,

    /// Treat the function as set-returning and print every merged row
    #[arg(long)]
    set: bool,

    /// Engine settings (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Call arguments; `NULL` passes a SQL NULL
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shardproxy=info,warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_json(&raw)?
        }
        None => EngineConfig::default(),
    };

    let func = FunctionDef::from_signature(&cli.signature, cli.body.as_str())?.returns_set(cli.set);
    let args: Vec<Value> = cli
        .args
        .iter()
        .map(|raw| {
            if raw.eq_ignore_ascii_case("null") {
                Value::Null
            } else {
                Value::Text(raw.clone())
            }
        })
        .collect();

    let source = Arc::new(JsonFileClusterSource::new(&cli.clusters));
    let engine = ProxyEngine::new(config, source, Arc::new(PgConnector::new()))?;

    let mut rows = engine.call_set(&func, args).await?;
    let result = if func.returns_set {
        rows.into_query_result()
    } else {
        // single-valued: first merged row under the partitions' own headers
        let columns = rows.columns().to_vec();
        QueryResult::new(columns, rows.next_row().into_iter().collect())
    };
    result.print();

    Ok(())
}
