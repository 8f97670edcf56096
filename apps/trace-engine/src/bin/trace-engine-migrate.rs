use anyhow::{Context, Result};
use clap::Parser;
use trace_engine_service::db::TraceDb;

/// Applies the trace engine schema to a Postgres database.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let db = TraceDb::connect(args.database_url.as_str())
        .await
        .context("connect for migration")?;
    db.migrate().await?;
    Ok(())
}
