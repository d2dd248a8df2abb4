use std::time::Duration;

use crate::config::DatabaseConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Bundled episodic store schema (idempotent DDL).
pub const SCHEMA_SQL: &str = include_str!("../schema.sql");

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.url)
        .await
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}

pub async fn check_pgvector(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) =
        sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'vector'")
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    tracing::info!("Episodic store schema applied");
    Ok(())
}

/// Name of the per-model HNSW index. Identifiers are capped at 63 bytes.
pub fn vector_index_name(model: &str, dimensions: usize) -> String {
    let slug: String = model
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(36)
        .collect();
    format!("ix_embeddings_hnsw_{}_{}", slug, dimensions)
}

/// `model` as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Expression the HNSW index is built on. Queries must order by exactly
/// this expression (against a `vector(N)` operand) for the planner to use it.
pub fn vector_expression(column: &str, dimensions: usize) -> String {
    format!("({}::vector({}))", column, dimensions)
}

/// pgvector cannot build HNSW indexes on `vector` columns wider than this.
pub const HNSW_MAX_DIMENSIONS: usize = 2000;

/// Create the approximate-nearest-neighbour index for one model.
///
/// The `vector` column is unsized so several models can coexist; each model
/// gets a partial HNSW index over a fixed-dimension cast of its rows.
/// Returns false when the model is too wide to index; search still works
/// through an exact scan.
pub async fn ensure_vector_index(pool: &PgPool, model: &str, dimensions: usize) -> Result<bool, sqlx::Error> {
    if dimensions == 0 || dimensions > HNSW_MAX_DIMENSIONS {
        tracing::warn!(model, dimensions, "Model too wide for an HNSW index; searches will scan");
        return Ok(false);
    }
    let name = vector_index_name(model, dimensions);
    let sql = format!(
        "CREATE INDEX IF NOT EXISTS {} ON embeddings USING hnsw ({} vector_cosine_ops) WHERE model = {}",
        name,
        vector_expression("vector", dimensions),
        quote_literal(model)
    );
    sqlx::raw_sql(&sql).execute(pool).await?;
    tracing::info!(index = %name, model, dimensions, "Vector index ready");
    Ok(true)
}
