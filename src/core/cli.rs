//! Command-line surface
//!
//! Every option is mirrored by a `MANTLE_*` environment variable; the CLI
//! takes precedence (clap resolves flag-over-env).

use std::path::PathBuf;

use clap::Parser;

use super::constants::{DEFAULT_ADMIN_DB, DEFAULT_BROKER_URL, DEFAULT_DB_PORT};

#[derive(Parser, Debug)]
#[command(name = "mantle")]
#[command(version, about = "Sparkplug-B historian, alarm engine and live query service")]
pub struct Cli {
    /// MQTT broker URL (mqtt://host:port or mqtts://host:port)
    #[arg(long, env = "MANTLE_BROKER_URL", default_value = DEFAULT_BROKER_URL)]
    pub broker_url: String,

    /// MQTT username
    #[arg(long, env = "MANTLE_USERNAME")]
    pub username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MANTLE_PASSWORD")]
    pub password: Option<String>,

    /// MQTT client identifier (default: mantle-<random>)
    #[arg(long, env = "MANTLE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// CA bundle for mqtts broker connections (PEM)
    #[arg(long, env = "MANTLE_SSL_CA")]
    pub ssl_ca: Option<PathBuf>,

    /// Client certificate for mutual-TLS broker connections (PEM)
    #[arg(long, env = "MANTLE_SSL_CLIENT_CERT", requires = "ssl_client_key")]
    pub ssl_client_cert: Option<PathBuf>,

    /// Client private key for mutual-TLS broker connections (PEM)
    #[arg(long, env = "MANTLE_SSL_CLIENT_KEY", requires = "ssl_client_cert")]
    pub ssl_client_key: Option<PathBuf>,

    /// PostgreSQL host
    #[arg(long, env = "MANTLE_DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// PostgreSQL port
    #[arg(long, env = "MANTLE_DB_PORT", default_value_t = DEFAULT_DB_PORT)]
    pub db_port: u16,

    /// PostgreSQL user
    #[arg(long, env = "MANTLE_DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// PostgreSQL password
    #[arg(long, env = "MANTLE_DB_PASSWORD", default_value = "")]
    pub db_password: String,

    /// Target database name
    #[arg(long, env = "MANTLE_DB_NAME", default_value = "mantle")]
    pub db_name: String,

    /// Connect to PostgreSQL over TLS
    #[arg(long, env = "MANTLE_DB_SSL")]
    pub db_ssl: bool,

    /// CA bundle for database TLS (PEM); implies full verification
    #[arg(long, env = "MANTLE_DB_SSL_CA")]
    pub db_ssl_ca: Option<PathBuf>,

    /// Maintenance database used to create the target database
    #[arg(long, env = "MANTLE_DB_ADMIN_NAME", default_value = DEFAULT_ADMIN_DB)]
    pub db_admin_name: String,

    /// Redis URL enabling the hot-value cache (redis://host:port/db)
    #[arg(long, env = "MANTLE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// MQTT 5 shared-subscription group
    #[arg(long, env = "MANTLE_SHARED_GROUP")]
    pub shared_group: Option<String>,

    /// Log filter (e.g. info, mantle=debug)
    #[arg(long, env = "MANTLE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["mantle"]);
        assert_eq!(cli.broker_url, DEFAULT_BROKER_URL);
        assert_eq!(cli.db_port, 5432);
        assert_eq!(cli.db_admin_name, "postgres");
        assert!(!cli.migrate);
        assert!(cli.redis_url.is_none());
    }

    #[test]
    fn client_cert_requires_its_key() {
        let result = Cli::try_parse_from(["mantle", "--ssl-client-cert", "client.pem"]);
        assert!(result.is_err());

        let cli = Cli::parse_from([
            "mantle",
            "--ssl-client-cert",
            "client.pem",
            "--ssl-client-key",
            "client.key",
        ]);
        assert!(cli.ssl_client_cert.is_some());
        assert!(cli.ssl_client_key.is_some());
    }

    #[test]
    fn flags_override() {
        let cli = Cli::parse_from([
            "mantle",
            "--broker-url",
            "mqtts://broker:8883",
            "--shared-group",
            "historians",
            "--migrate",
        ]);
        assert_eq!(cli.broker_url, "mqtts://broker:8883");
        assert_eq!(cli.shared_group.as_deref(), Some("historians"));
        assert!(cli.migrate);
    }
}
