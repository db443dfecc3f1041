//! Runtime configuration
//!
//! Merged from CLI arguments (which already carry the `MANTLE_*` environment
//! fallbacks via clap) plus the environment-only knobs, then validated.

use std::path::PathBuf;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::domain::alarms::WebhookConfig;
use crate::utils::validate::{validate_ca_file, validate_host, validate_key_file, validate_port};

use super::cli::Cli;
use super::constants::{
    APP_NAME_LOWER, DEFAULT_MQTT_PORT, DEFAULT_MQTTS_PORT, DEFAULT_SPACE_SHORT_ID,
    ENV_ALARM_WEBHOOK_SECRET, ENV_ALARM_WEBHOOK_URL, ENV_HISTORIAN, ENV_SPACE_SHORT_ID,
};

/// MQTT connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub shared_group: Option<String>,
}

/// PostgreSQL settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub admin_name: String,
    pub ssl: bool,
    pub ssl_ca: Option<PathBuf>,
}

/// Final merged application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    pub redis_url: Option<String>,
    pub historian: bool,
    pub webhook: Option<WebhookConfig>,
    pub log_level: Option<String>,
    pub migrate: bool,
}

/// `mqtt://host[:port]` / `mqtts://host[:port]` / bare `host[:port]`.
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool)> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("mqtts://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ssl://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("mqtt://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        (false, rest)
    } else if url.contains("://") {
        anyhow::bail!("unsupported broker URL scheme in '{}'", url);
    } else {
        (false, url)
    };

    let default_port = if tls { DEFAULT_MQTTS_PORT } else { DEFAULT_MQTT_PORT };
    let rest = rest.trim_end_matches('/');
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid broker port in '{url}'"))?;
            Ok((host.to_string(), port, tls))
        }
        None => Ok((rest.to_string(), default_port, tls)),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl AppConfig {
    pub fn load(cli: &Cli) -> Result<Self> {
        let (host, port, tls) = parse_broker_url(&cli.broker_url)?;

        let mqtt = MqttConfig {
            host,
            port,
            tls,
            ca_file: cli.ssl_ca.clone(),
            client_cert: cli.ssl_client_cert.clone(),
            client_key: cli.ssl_client_key.clone(),
            username: cli.username.clone(),
            password: cli.password.clone(),
            client_id: cli
                .client_id
                .clone()
                .unwrap_or_else(|| format!("{}-{}", APP_NAME_LOWER, Uuid::new_v4().simple())),
            shared_group: cli.shared_group.clone(),
        };

        let database = DatabaseConfig {
            host: cli.db_host.clone(),
            port: cli.db_port,
            user: cli.db_user.clone(),
            password: cli.db_password.clone(),
            name: cli.db_name.clone(),
            admin_name: cli.db_admin_name.clone(),
            ssl: cli.db_ssl,
            ssl_ca: cli.db_ssl_ca.clone(),
        };

        let webhook = std::env::var(ENV_ALARM_WEBHOOK_URL)
            .ok()
            .filter(|url| !url.is_empty())
            .map(|url| WebhookConfig {
                url,
                secret: std::env::var(ENV_ALARM_WEBHOOK_SECRET).ok(),
                space_short_id: std::env::var(ENV_SPACE_SHORT_ID)
                    .unwrap_or_else(|_| DEFAULT_SPACE_SHORT_ID.to_string()),
            });

        let config = Self {
            mqtt,
            database,
            redis_url: cli.redis_url.clone(),
            historian: env_bool(ENV_HISTORIAN, true),
            webhook,
            log_level: cli.log_level.clone(),
            migrate: cli.migrate,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_host(&self.mqtt.host).context("broker host")?;
        validate_port(self.mqtt.port).context("broker port")?;
        validate_host(&self.database.host).context("database host")?;
        validate_port(self.database.port).context("database port")?;

        if self.database.name.is_empty() {
            anyhow::bail!("database name must not be empty");
        }
        if self.mqtt.tls {
            let ca = self
                .mqtt
                .ca_file
                .as_ref()
                .context("mqtts broker requires --ssl-ca")?;
            validate_ca_file(ca).context("broker CA")?;
        }
        match (&self.mqtt.client_cert, &self.mqtt.client_key) {
            (Some(cert), Some(key)) => {
                if !self.mqtt.tls {
                    anyhow::bail!("client certificate requires an mqtts broker URL");
                }
                validate_ca_file(cert).context("broker client certificate")?;
                validate_key_file(key).context("broker client key")?;
            }
            (None, None) => {}
            _ => anyhow::bail!("--ssl-client-cert and --ssl-client-key must be given together"),
        }
        if let Some(ca) = &self.database.ssl_ca {
            validate_ca_file(ca).context("database CA")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_forms() {
        assert_eq!(
            parse_broker_url("mqtt://broker:1884").unwrap(),
            ("broker".into(), 1884, false)
        );
        assert_eq!(
            parse_broker_url("mqtts://broker").unwrap(),
            ("broker".into(), 8883, true)
        );
        assert_eq!(
            parse_broker_url("broker.plant:1883").unwrap(),
            ("broker.plant".into(), 1883, false)
        );
        assert_eq!(
            parse_broker_url("localhost").unwrap(),
            ("localhost".into(), 1883, false)
        );
        assert_eq!(
            parse_broker_url("ssl://broker/").unwrap(),
            ("broker".into(), 8883, true)
        );
    }

    #[test]
    fn broker_url_rejects_foreign_schemes_and_bad_ports() {
        assert!(parse_broker_url("http://broker").is_err());
        assert!(parse_broker_url("mqtt://broker:notaport").is_err());
    }

    #[test]
    fn env_bool_parsing() {
        // unset falls back to the default
        assert!(env_bool("MANTLE_TEST_UNSET_FLAG", true));
        assert!(!env_bool("MANTLE_TEST_UNSET_FLAG", false));
    }
}
