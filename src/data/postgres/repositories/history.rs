//! History repository
//!
//! Append-only sample rows routed into typed columns, the windowed
//! downsample query with left-edge fill, and scope deletion for the delete
//! cascade.

use sqlx::{PgPool, QueryBuilder};

use crate::data::error::DataError;
use crate::model::identity::{IdentityScope, MetricIdentity};
use crate::model::value::{MetricValue, route_by_variant, route_value};

/// Default sample count for the auto interval.
const DEFAULT_SAMPLES: i64 = 100;

/// One point in a history series. Values are stringified on the way out;
/// the transport layer treats them uniformly.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HistoryPoint {
    pub ts: i64,
    pub value: String,
}

/// The series for one requested identity, in request order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricSeries {
    #[serde(flatten)]
    pub identity: MetricIdentity,
    pub points: Vec<HistoryPoint>,
}

/// Parameters of a windowed history query.
#[derive(Debug, Clone)]
pub struct WindowQuery {
    /// Window start, ms inclusive.
    pub start: i64,
    /// Window end, ms inclusive.
    pub end: i64,
    /// Explicit bucket width in seconds; overrides `samples`.
    pub interval_secs: Option<i64>,
    /// Target sample count for the auto interval (default 100).
    pub samples: Option<i64>,
    /// Return raw samples instead of bucketed averages.
    pub raw: bool,
}

/// Bucket width in milliseconds. The minimum interval is one second:
/// non-positive `samples` or `interval` must not produce a zero-width
/// bucket.
pub fn bucket_ms(query: &WindowQuery) -> i64 {
    let secs = match query.interval_secs {
        Some(interval) => interval.max(1),
        None => {
            let samples = query.samples.unwrap_or(DEFAULT_SAMPLES).max(1);
            ((query.end - query.start) / (1000 * samples)).max(1)
        }
    };
    secs * 1000
}

#[derive(sqlx::FromRow)]
struct RawRow {
    ts: i64,
    int_value: Option<i64>,
    float_value: Option<f64>,
    string_value: Option<String>,
    bool_value: Option<bool>,
}

impl RawRow {
    /// Stringified value, matching the pub/sub wire form.
    fn display_value(&self) -> String {
        if let Some(v) = self.float_value {
            v.to_string()
        } else if let Some(v) = self.int_value {
            v.to_string()
        } else if let Some(v) = self.bool_value {
            v.to_string()
        } else if let Some(v) = &self.string_value {
            v.clone()
        } else {
            String::new()
        }
    }
}

#[derive(sqlx::FromRow)]
struct BucketRow {
    bucket_ts: i64,
    avg_value: Option<f64>,
}

#[derive(Clone)]
pub struct HistoryRepo {
    pool: PgPool,
}

impl HistoryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one sample, routing the value into its typed column. Null
    /// values route nowhere and are skipped. Duplicate `(identity, ts)` rows
    /// are silently ignored.
    pub async fn record_sample(
        &self,
        identity: &MetricIdentity,
        ts: i64,
        value: &MetricValue,
        metric_type: &str,
    ) -> Result<(), DataError> {
        let routed = route_value(value, metric_type);
        if routed.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(
            "INSERT INTO history \
             (group_id, node_id, device_id, metric, ts, int_value, float_value, string_value, bool_value) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (group_id, node_id, device_id, metric, ts) DO NOTHING",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(ts)
        .bind(routed.int_value)
        .bind(routed.float_value)
        .bind(routed.string_value)
        .bind(routed.bool_value)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::trace!(identity = %identity.key(), ts, "Duplicate sample ignored");
        }
        Ok(())
    }

    /// Append one property-history row, routed by the value's own variant.
    pub async fn record_property(
        &self,
        identity: &MetricIdentity,
        ts: i64,
        property_id: &str,
        value: &MetricValue,
    ) -> Result<(), DataError> {
        let routed = route_by_variant(value);
        if routed.is_empty() {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO history_properties \
             (group_id, node_id, device_id, metric, property_id, ts, \
              int_value, float_value, string_value, bool_value) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (group_id, node_id, device_id, metric, property_id, ts) DO NOTHING",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(property_id)
        .bind(ts)
        .bind(routed.int_value)
        .bind(routed.float_value)
        .bind(routed.string_value)
        .bind(routed.bool_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Windowed history for a list of identities. One series per requested
    /// identity, request order preserved. Points never fall outside
    /// `[start, end]` except the synthesised left-edge point, which sits
    /// exactly at `start`.
    pub async fn query_window(
        &self,
        identities: &[MetricIdentity],
        query: &WindowQuery,
    ) -> Result<Vec<MetricSeries>, DataError> {
        let bucket = bucket_ms(query);
        let mut result = Vec::with_capacity(identities.len());
        for identity in identities {
            let mut points = if query.raw {
                self.raw_points(identity, query).await?
            } else {
                self.bucketed_points(identity, query, bucket).await?
            };

            // Left-edge fill: the most recent sample strictly before the
            // window defines the value at the window start, unless a point
            // already sits there.
            if points.first().map(|p| p.ts) != Some(query.start) {
                if let Some(edge) = self.latest_before(identity, query.start).await? {
                    points.insert(
                        0,
                        HistoryPoint {
                            ts: query.start,
                            value: edge,
                        },
                    );
                }
            }

            result.push(MetricSeries {
                identity: identity.clone(),
                points,
            });
        }
        Ok(result)
    }

    async fn bucketed_points(
        &self,
        identity: &MetricIdentity,
        query: &WindowQuery,
        bucket: i64,
    ) -> Result<Vec<HistoryPoint>, DataError> {
        let rows: Vec<BucketRow> = sqlx::query_as(
            "SELECT ((ts / $6) * $6) AS bucket_ts, \
                    AVG(COALESCE(float_value, int_value::float8, bool_value::int::float8)) AS avg_value \
             FROM history \
             WHERE group_id = $1 AND node_id = $2 AND device_id = $3 AND metric = $4 \
               AND ts >= $5 AND ts <= $7 \
             GROUP BY 1 ORDER BY 1",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(query.start)
        .bind(bucket)
        .bind(query.end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                // buckets holding only string samples average to NULL
                row.avg_value.map(|v| HistoryPoint {
                    // epoch-anchored buckets can start before the window;
                    // the first bucket clamps to the window start
                    ts: row.bucket_ts.max(query.start),
                    value: v.to_string(),
                })
            })
            .collect())
    }

    async fn raw_points(
        &self,
        identity: &MetricIdentity,
        query: &WindowQuery,
    ) -> Result<Vec<HistoryPoint>, DataError> {
        let rows: Vec<RawRow> = sqlx::query_as(
            "SELECT ts, int_value, float_value, string_value, bool_value \
             FROM history \
             WHERE group_id = $1 AND node_id = $2 AND device_id = $3 AND metric = $4 \
               AND ts >= $5 AND ts <= $6 \
             ORDER BY ts",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(query.start)
        .bind(query.end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HistoryPoint {
                ts: row.ts,
                value: row.display_value(),
            })
            .collect())
    }

    /// The single most recent sample strictly before `ts`, stringified.
    async fn latest_before(
        &self,
        identity: &MetricIdentity,
        ts: i64,
    ) -> Result<Option<String>, DataError> {
        let row: Option<RawRow> = sqlx::query_as(
            "SELECT ts, int_value, float_value, string_value, bool_value \
             FROM history \
             WHERE group_id = $1 AND node_id = $2 AND device_id = $3 AND metric = $4 \
               AND ts < $5 \
             ORDER BY ts DESC LIMIT 1",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.display_value()))
    }

    pub async fn delete_history(&self, scope: &IdentityScope) -> Result<u64, DataError> {
        self.delete_scope("history", scope).await
    }

    pub async fn delete_history_properties(&self, scope: &IdentityScope) -> Result<u64, DataError> {
        self.delete_scope("history_properties", scope).await
    }

    async fn delete_scope(&self, table: &str, scope: &IdentityScope) -> Result<u64, DataError> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {table} WHERE group_id = "));
        qb.push_bind(&scope.group);
        qb.push(" AND node_id = ");
        qb.push_bind(&scope.node);
        if let Some(device) = &scope.device {
            qb.push(" AND device_id = ");
            qb.push_bind(device);
        }
        if let Some(metric) = &scope.metric {
            qb.push(" AND metric = ");
            qb.push_bind(metric);
        }
        let result = qb.build().execute(&self.pool).await?;
        tracing::debug!(table, rows = result.rows_affected(), "Deleted scope");
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(start: i64, end: i64, samples: Option<i64>, interval: Option<i64>) -> WindowQuery {
        WindowQuery {
            start,
            end,
            interval_secs: interval,
            samples,
            raw: false,
        }
    }

    #[test]
    fn auto_interval_defaults_to_100_samples() {
        // 1000 s window / 100 samples = 10 s buckets
        let q = window(0, 1_000_000, None, None);
        assert_eq!(bucket_ms(&q), 10_000);
    }

    #[test]
    fn auto_interval_floors_at_one_second() {
        // tiny window
        let q = window(0, 500, None, None);
        assert_eq!(bucket_ms(&q), 1000);
        // samples=0 must not produce a zero-width bucket; it clamps to 1
        let q = window(0, 1_000_000, Some(0), None);
        assert_eq!(bucket_ms(&q), 1_000_000);
        let q = window(0, 1_000, Some(0), None);
        assert_eq!(bucket_ms(&q), 1000);
        // negative samples clamp the same way
        let q = window(0, 1_000, Some(-5), None);
        assert_eq!(bucket_ms(&q), 1000);
    }

    #[test]
    fn explicit_interval_wins_and_clamps() {
        let q = window(0, 1_000_000, Some(7), Some(30));
        assert_eq!(bucket_ms(&q), 30_000);
        let q = window(0, 1_000_000, None, Some(0));
        assert_eq!(bucket_ms(&q), 1000);
    }

    #[test]
    fn raw_row_display_prefers_numeric_columns() {
        let row = RawRow {
            ts: 0,
            int_value: None,
            float_value: Some(72.5),
            string_value: None,
            bool_value: None,
        };
        assert_eq!(row.display_value(), "72.5");

        let row = RawRow {
            ts: 0,
            int_value: Some(10),
            float_value: None,
            string_value: None,
            bool_value: None,
        };
        assert_eq!(row.display_value(), "10");

        let row = RawRow {
            ts: 0,
            int_value: None,
            float_value: None,
            string_value: Some("running".into()),
            bool_value: None,
        };
        assert_eq!(row.display_value(), "running");

        let row = RawRow {
            ts: 0,
            int_value: None,
            float_value: None,
            string_value: None,
            bool_value: Some(true),
        };
        assert_eq!(row.display_value(), "true");
    }
}
