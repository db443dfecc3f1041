//! PostgreSQL storage service
//!
//! Owns the connection pool and schema lifecycle. Repositories borrow the
//! pool; the service is created once at startup and shared.

pub mod migrations;
pub mod repositories;
pub mod schema;

pub use sqlx::PgPool;

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use crate::core::config::DatabaseConfig;
use crate::data::error::DataError;

const POOL_MAX_CONNECTIONS: u32 = 16;
const POOL_MIN_CONNECTIONS: u32 = 2;
const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 30;
const POOL_IDLE_TIMEOUT_SECS: u64 = 600;
const POOL_MAX_LIFETIME_SECS: u64 = 1800;
const STATEMENT_TIMEOUT_SECS: u64 = 60;

pub struct PostgresService {
    pool: PgPool,
}

impl PostgresService {
    /// Connect, create the target database if it does not exist yet, and run
    /// migrations.
    pub async fn init(config: &DatabaseConfig) -> Result<Self, DataError> {
        ensure_database(config).await?;

        let options = connect_options(config, &config.name)?;
        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .min_connections(POOL_MIN_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS))
            .idle_timeout(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS))
            .max_lifetime(Duration::from_secs(POOL_MAX_LIFETIME_SECS))
            .connect_with(options)
            .await?;

        migrations::run_migrations(&pool).await?;

        tracing::debug!(
            host = %config.host,
            port = config.port,
            database = %config.name,
            "PostgresService initialized"
        );
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("PostgreSQL pool closed");
    }
}

/// Create the target database via the maintenance database when missing.
/// `CREATE DATABASE` cannot run inside a transaction, hence the dedicated
/// single connection.
async fn ensure_database(config: &DatabaseConfig) -> Result<(), DataError> {
    use sqlx::ConnectOptions;

    let admin_options = connect_options(config, &config.admin_name)?;
    let mut conn = match admin_options.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            // the target may still exist and be reachable; let init() decide
            tracing::warn!(
                admin_db = %config.admin_name,
                error = %e,
                "Cannot reach maintenance database, skipping create-if-missing"
            );
            return Ok(());
        }
    };

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&config.name)
            .fetch_one(&mut conn)
            .await?;

    if !exists {
        tracing::info!(database = %config.name, "Creating database");
        // identifiers cannot be bound; quote defensively
        let quoted = config.name.replace('"', "\"\"");
        sqlx::query(&format!("CREATE DATABASE \"{quoted}\""))
            .execute(&mut conn)
            .await?;
    }
    Ok(())
}

fn connect_options(config: &DatabaseConfig, database: &str) -> Result<PgConnectOptions, DataError> {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(database)
        .options([("statement_timeout", format!("{STATEMENT_TIMEOUT_SECS}s"))]);

    if !config.password.is_empty() {
        options = options.password(&config.password);
    }
    if config.ssl {
        options = options.ssl_mode(PgSslMode::Require);
        if let Some(ca) = &config.ssl_ca {
            options = options.ssl_mode(PgSslMode::VerifyFull).ssl_root_cert(ca);
        }
    } else {
        options = options.ssl_mode(PgSslMode::Prefer);
    }
    Ok(options)
}
