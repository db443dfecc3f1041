// =============================================================================
// Application identity
// =============================================================================

/// Application name in lowercase (paths, identifiers, client-id prefix).
pub const APP_NAME_LOWER: &str = "mantle";

// =============================================================================
// Environment variables
// =============================================================================

/// Log filter (the `--log-level` option takes precedence).
pub const ENV_LOG: &str = "MANTLE_LOG";

/// Historian toggle, default true. Environment-only.
pub const ENV_HISTORIAN: &str = "MANTLE_HISTORIAN";

/// Alarm webhook endpoint. Environment-only.
pub const ENV_ALARM_WEBHOOK_URL: &str = "MANTLE_ALARM_WEBHOOK_URL";

/// Optional alarm webhook shared secret. Environment-only.
pub const ENV_ALARM_WEBHOOK_SECRET: &str = "MANTLE_ALARM_WEBHOOK_SECRET";

/// Space identifier carried in webhook bodies. Environment-only.
pub const ENV_SPACE_SHORT_ID: &str = "MANTLE_SPACE_SHORT_ID";

// =============================================================================
// Defaults
// =============================================================================

pub const DEFAULT_BROKER_URL: &str = "mqtt://localhost:1883";

pub const DEFAULT_MQTT_PORT: u16 = 1883;

pub const DEFAULT_MQTTS_PORT: u16 = 8883;

pub const DEFAULT_DB_PORT: u16 = 5432;

/// Maintenance database used to create the target database when missing.
pub const DEFAULT_ADMIN_DB: &str = "postgres";

pub const DEFAULT_SPACE_SHORT_ID: &str = "mantle";

/// Grace period for background tasks during shutdown.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 10;
