//! Schema DDL
//!
//! Plain-Postgres DDL lives in the versioned migrations below; the
//! TimescaleDB statements (hypertables, chunk intervals, compression) are a
//! separate best-effort pass in `migrations::setup_timescale` because the
//! extension is an optional capability.
//!
//! Column naming: `group`/`user` are reserved words, so the identity columns
//! are `group_id`, `node_id`, `device_id`, `metric`.

/// One versioned migration.
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Migrations apply in ascending version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "history_tables",
        sql: r#"
CREATE TABLE IF NOT EXISTS history (
    group_id     TEXT NOT NULL,
    node_id      TEXT NOT NULL,
    device_id    TEXT NOT NULL DEFAULT '',
    metric       TEXT NOT NULL,
    ts           BIGINT NOT NULL,
    int_value    BIGINT,
    float_value  DOUBLE PRECISION,
    string_value TEXT,
    bool_value   BOOLEAN,
    UNIQUE (group_id, node_id, device_id, metric, ts)
);

CREATE INDEX IF NOT EXISTS history_identity_ts_idx
    ON history (group_id, node_id, device_id, metric, ts DESC);

CREATE TABLE IF NOT EXISTS history_properties (
    group_id     TEXT NOT NULL,
    node_id      TEXT NOT NULL,
    device_id    TEXT NOT NULL DEFAULT '',
    metric       TEXT NOT NULL,
    property_id  TEXT NOT NULL,
    ts           BIGINT NOT NULL,
    int_value    BIGINT,
    float_value  DOUBLE PRECISION,
    string_value TEXT,
    bool_value   BOOLEAN,
    UNIQUE (group_id, node_id, device_id, metric, property_id, ts)
);

CREATE INDEX IF NOT EXISTS history_properties_identity_ts_idx
    ON history_properties (group_id, node_id, device_id, metric, ts DESC);
"#,
    },
    Migration {
        version: 2,
        name: "metric_properties",
        sql: r#"
CREATE TABLE IF NOT EXISTS metric_properties (
    group_id   TEXT NOT NULL,
    node_id    TEXT NOT NULL,
    device_id  TEXT NOT NULL DEFAULT '',
    metric     TEXT NOT NULL,
    properties JSONB NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (group_id, node_id, device_id, metric)
);
"#,
    },
    Migration {
        version: 3,
        name: "hidden_items",
        sql: r#"
CREATE TABLE IF NOT EXISTS hidden_items (
    group_id  TEXT NOT NULL,
    node_id   TEXT NOT NULL,
    device_id TEXT NOT NULL DEFAULT '',
    metric    TEXT NOT NULL DEFAULT '',
    hidden_at BIGINT NOT NULL,
    PRIMARY KEY (group_id, node_id, device_id, metric)
);
"#,
    },
    Migration {
        version: 4,
        name: "alarm_tables",
        sql: r#"
CREATE TABLE IF NOT EXISTS alarm_rules (
    id         BIGSERIAL PRIMARY KEY,
    group_id   TEXT NOT NULL,
    node_id    TEXT NOT NULL,
    device_id  TEXT NOT NULL DEFAULT '',
    metric     TEXT NOT NULL,
    name       TEXT NOT NULL,
    rule_type  TEXT NOT NULL,
    threshold  DOUBLE PRECISION,
    delay_sec  BIGINT NOT NULL DEFAULT 0,
    enabled    BOOLEAN NOT NULL DEFAULT TRUE,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS alarm_rules_identity_idx
    ON alarm_rules (group_id, node_id, device_id, metric);

CREATE TABLE IF NOT EXISTS alarm_state (
    rule_id          BIGINT PRIMARY KEY REFERENCES alarm_rules(id) ON DELETE CASCADE,
    state            TEXT NOT NULL DEFAULT 'normal',
    condition_met_at BIGINT,
    activated_at     BIGINT,
    last_notified_at BIGINT,
    last_value       TEXT,
    updated_at       BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS alarm_history (
    id         BIGSERIAL PRIMARY KEY,
    rule_id    BIGINT NOT NULL REFERENCES alarm_rules(id) ON DELETE CASCADE,
    from_state TEXT NOT NULL,
    to_state   TEXT NOT NULL,
    value      TEXT,
    ts         BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS alarm_history_rule_ts_idx
    ON alarm_history (rule_id, ts DESC);
"#,
    },
];

/// Per-day chunking on the millisecond time column.
pub const CHUNK_INTERVAL_MS: i64 = 86_400_000;

/// `history` chunks compress after one hour.
pub const HISTORY_COMPRESS_AFTER_MS: i64 = 3_600_000;

/// `history_properties` chunks compress after 24 hours.
pub const HISTORY_PROPERTIES_COMPRESS_AFTER_MS: i64 = 86_400_000;

/// TimescaleDB statements, applied in order after the plain migrations.
/// The hypertable conversion MUST precede the chunk-interval/compression
/// statements for the same table.
pub fn timescale_statements() -> Vec<String> {
    let mut stmts = vec![
        "CREATE EXTENSION IF NOT EXISTS timescaledb".to_string(),
        // integer time dimension needs a now() equivalent for policies
        "CREATE OR REPLACE FUNCTION unix_now_ms() RETURNS BIGINT \
         LANGUAGE SQL STABLE AS $$ SELECT (extract(epoch FROM now()) * 1000)::BIGINT $$"
            .to_string(),
    ];
    for table in ["history", "history_properties"] {
        stmts.push(format!(
            "SELECT create_hypertable('{table}', 'ts', \
             chunk_time_interval => {CHUNK_INTERVAL_MS}, \
             migrate_data => TRUE, if_not_exists => TRUE)"
        ));
        stmts.push(format!(
            "SELECT set_integer_now_func('{table}', 'unix_now_ms', replace_if_exists => TRUE)"
        ));
        stmts.push(format!(
            "ALTER TABLE {table} SET (timescaledb.compress, \
             timescaledb.compress_segmentby = 'group_id, node_id, device_id, metric', \
             timescaledb.compress_orderby = 'ts DESC')"
        ));
    }
    stmts.push(format!(
        "SELECT add_compression_policy('history', BIGINT '{HISTORY_COMPRESS_AFTER_MS}', \
         if_not_exists => TRUE)"
    ));
    stmts.push(format!(
        "SELECT add_compression_policy('history_properties', \
         BIGINT '{HISTORY_PROPERTIES_COMPRESS_AFTER_MS}', if_not_exists => TRUE)"
    ));
    stmts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_ascending() {
        let mut last = 0;
        for m in MIGRATIONS {
            assert!(m.version > last, "version {} out of order", m.version);
            last = m.version;
        }
    }

    #[test]
    fn hypertable_precedes_compression_per_table() {
        let stmts = timescale_statements();
        for table in ["history", "history_properties"] {
            let hypertable = stmts
                .iter()
                .position(|s| s.contains("create_hypertable") && s.contains(table))
                .unwrap();
            let compression = stmts
                .iter()
                .position(|s| s.contains("add_compression_policy") && s.contains(&format!("'{table}'")))
                .unwrap();
            assert!(hypertable < compression, "{table}");
        }
    }

    #[test]
    fn compression_windows_match_policy() {
        let stmts = timescale_statements().join("\n");
        assert!(stmts.contains("BIGINT '3600000'"));
        assert!(stmts.contains("BIGINT '86400000'"));
    }
}
