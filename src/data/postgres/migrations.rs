//! Migration runner
//!
//! Versioned migrations apply in ascending order with bookkeeping in
//! `schema_migrations`. TimescaleDB setup runs afterwards as a best-effort
//! pass: when the extension is unavailable the layer keeps working with
//! plain, uncompressed tables.

use sqlx::PgPool;

use super::schema::{MIGRATIONS, timescale_statements};
use crate::data::error::DataError;
use crate::utils::time::now_ms;

/// Apply all pending migrations, then attempt Timescale setup.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DataError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at BIGINT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let current: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DataError::migration_failed(migration.version, migration.name, e))?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES ($1, $2, $3)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    setup_timescale(pool).await;
    Ok(())
}

/// Best-effort Timescale setup. The first failing statement stops the pass;
/// a missing extension is logged once, everything else keeps working.
async fn setup_timescale(pool: &PgPool) {
    for stmt in timescale_statements() {
        if let Err(e) = sqlx::query(&stmt).execute(pool).await {
            tracing::warn!(
                error = %e,
                "TimescaleDB unavailable, continuing with plain tables \
                 (hypertables, compression and approximate stats disabled)"
            );
            return;
        }
    }
    tracing::info!("TimescaleDB hypertables and compression policies configured");
}

/// Whether the Timescale extension is installed. Checked once by the stats
/// queries that depend on it.
pub async fn timescale_available(pool: &PgPool) -> bool {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')",
    )
    .fetch_one(pool)
    .await
    .unwrap_or(false)
}
