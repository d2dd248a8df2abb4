use std::sync::Arc;

use clap::Parser;
use remembr_core::RemembrConfig;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use remembr_engine::subsystems::{reembed, sweep};
use remembr_engine::MemoryEngine;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "remembr.toml", env = "REMEMBR_CONFIG")]
    config: String,

    /// Check database and pgvector, then exit.
    #[arg(long)]
    health: bool,

    /// Apply the bundled schema (idempotent), then exit.
    #[arg(long)]
    init_schema: bool,
}

fn init_logging(config: &RemembrConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.service.log_level.as_str()));

    if config.service.log_format == "json" {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience; production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match RemembrConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    let pool = match remembr_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match remembr_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }

        match remembr_core::db::check_pgvector(&pool).await {
            Ok(v) => println!("✅ pgvector version: {}", v),
            Err(e) => {
                println!("❌ pgvector check failed: {}", e);
                std::process::exit(1);
            }
        }

        println!("✅ remembr DB health check passed");
        return Ok(());
    }

    if args.init_schema {
        remembr_core::db::apply_schema(&pool).await?;
        println!("✅ Schema applied");
        let indexed = ensure_vector_indexes(&pool, &config).await?;
        println!("✅ {} vector index(es) ready", indexed);
        return Ok(());
    }

    // Models declared after the schema was applied still get their index.
    ensure_vector_indexes(&pool, &config).await?;

    let engine = Arc::new(MemoryEngine::from_config(&config, pool)?);
    let health = engine.health().await?;
    tracing::info!(
        store = %health.store,
        window_backend = %health.window_backend,
        embedding_model = %health.embedding_model,
        dimensions = health.dimensions,
        "Memory engine ready"
    );

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let backfill = tokio::spawn(reembed::run_backfill_worker(
        engine.episodic_store(),
        engine.embedder(),
        config.embedding.clone(),
        tx.subscribe(),
    ));

    let sweeper = tokio::spawn(sweep::run_window_sweeper(
        engine.short_term_window(),
        config.short_term.sweep_interval_seconds,
        tx.subscribe(),
    ));

    let mut shutdown = tx.subscribe();
    let _ = shutdown.recv().await;

    let _ = tokio::join!(backfill, sweeper);
    engine.shutdown().await;

    Ok(())
}

async fn ensure_vector_indexes(pool: &PgPool, config: &RemembrConfig) -> anyhow::Result<usize> {
    let mut indexed = 0;
    for (model, dimensions) in config.embedding.declared_models() {
        if remembr_core::db::ensure_vector_index(pool, &model, dimensions).await? {
            indexed += 1;
        }
    }
    Ok(indexed)
}
