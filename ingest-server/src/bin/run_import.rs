use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use ingest_server::config::IngestConfig;
use ingest_server::context::IngestContext;
use ingest_server::ingest::source::{FilterClause, SourceFilters};
use ingest_server::ingest::store::{MemoryStore, PgStore, ProductionStore};
use ingest_server::ingest::{IngestError, run_migrations};

#[derive(Parser, Debug)]
#[command(
    name = "run_import",
    about = "Run one well production import against the configured source"
)]
struct Args {
    /// Source filter as `field:op:value` (ops: eq, ne, gt, ge, lt, le, contains). Repeatable.
    #[arg(long = "filter")]
    filters: Vec<FilterClause>,

    /// Load into an in-memory store instead of the database.
    #[arg(long)]
    dry_run: bool,

    /// Only check the source and print its health.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();
    let config = IngestConfig::from_env();

    let store: Arc<dyn ProductionStore> = if args.dry_run || args.check {
        Arc::new(MemoryStore::new())
    } else {
        let database_url = std::env::var("DATABASE_URL")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.batch.max_concurrent_batches as u32 + 1)
            .connect(&database_url)
            .await?;
        run_migrations(&pool).await?;
        Arc::new(PgStore::new(pool))
    };

    let context = IngestContext::build(config, store)?;

    if args.check {
        let health = context.fetch_client().health().await;
        println!("{}", serde_json::to_string_pretty(&health)?);
        if health.status != "healthy" {
            std::process::exit(1);
        }
        return Ok(());
    }

    let filters = SourceFilters {
        clauses: args.filters,
    };
    if !filters.is_empty() {
        log::info!("source filter: {}", filters.to_odata().unwrap_or_default());
    }

    let job_id = match context.orchestrator().start_job() {
        Ok(job_id) => job_id,
        Err(IngestError::JobConflict { running }) => {
            writeln!(
                io::stderr(),
                "error: import {} is already running",
                running.as_deref().unwrap_or("<unknown>")
            )?;
            std::process::exit(2);
        }
        Err(err) => return Err(err.into()),
    };

    let summary = context.orchestrator().run_job(&job_id, filters).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if args.dry_run {
        log::info!(
            "dry run: {} record(s) held in memory",
            context.store().count().await?
        );
    }

    Ok(())
}
