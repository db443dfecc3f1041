//! Usage and storage statistics
//!
//! Row counts use the time-series engine's approximation when available;
//! exact counts over billions of history rows are a sequential scan. The
//! monthly breakdown folds Timescale chunk metadata (chunk range start ×
//! per-relation tuple estimate); without the extension it is empty rather
//! than wrong.

use chrono::{DateTime, Datelike};
use sqlx::PgPool;

use crate::data::error::DataError;
use crate::data::postgres::migrations::timescale_available;

/// Tables reported by `storage_stats`.
const TABLES: &[&str] = &[
    "history",
    "history_properties",
    "metric_properties",
    "hidden_items",
    "alarm_rules",
    "alarm_state",
    "alarm_history",
];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MonthUsage {
    pub year: i32,
    pub month: u32,
    pub rows: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageStats {
    /// Approximate total history rows.
    pub approx_total: i64,
    /// Per-month estimates, most recent first.
    pub per_month: Vec<MonthUsage>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TableStats {
    pub name: String,
    pub bytes: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    pub tables: Vec<TableStats>,
    /// Uncompressed-to-compressed ratio for `history`, when compression is
    /// active.
    pub compression_ratio: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    range_start: i64,
    rows: f64,
}

/// Fold chunk metadata into per-month usage, most recent month first.
pub fn fold_chunks_by_month(chunks: &[(i64, f64)]) -> Vec<MonthUsage> {
    let mut by_month: Vec<MonthUsage> = Vec::new();
    for &(range_start, rows) in chunks {
        let Some(dt) = DateTime::from_timestamp_millis(range_start) else {
            continue;
        };
        let (year, month) = (dt.year(), dt.month());
        match by_month.iter_mut().find(|m| m.year == year && m.month == month) {
            Some(entry) => entry.rows += rows as i64,
            None => by_month.push(MonthUsage {
                year,
                month,
                rows: rows as i64,
            }),
        }
    }
    by_month.sort_by(|a, b| (b.year, b.month).cmp(&(a.year, a.month)));
    by_month
}

#[derive(Clone)]
pub struct StatsRepo {
    pool: PgPool,
}

impl StatsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn usage(&self) -> Result<UsageStats, DataError> {
        let timescale = timescale_available(&self.pool).await;

        let approx_total = if timescale {
            match sqlx::query_scalar::<_, i64>("SELECT approximate_row_count('history')")
                .fetch_one(&self.pool)
                .await
            {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(error = %e, "approximate_row_count failed, using reltuples");
                    self.reltuples_estimate().await?
                }
            }
        } else {
            self.reltuples_estimate().await?
        };

        let per_month = if timescale {
            let chunks: Vec<ChunkRow> = sqlx::query_as(
                "SELECT c.range_start_integer AS range_start, \
                        COALESCE(pgc.reltuples, 0)::float8 AS rows \
                 FROM timescaledb_information.chunks c \
                 JOIN pg_class pgc ON pgc.relname = c.chunk_name \
                 WHERE c.hypertable_name = 'history'",
            )
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();
            fold_chunks_by_month(
                &chunks
                    .iter()
                    .map(|c| (c.range_start, c.rows))
                    .collect::<Vec<_>>(),
            )
        } else {
            Vec::new()
        };

        Ok(UsageStats {
            approx_total,
            per_month,
        })
    }

    async fn reltuples_estimate(&self) -> Result<i64, DataError> {
        let estimate: Option<f64> = sqlx::query_scalar(
            "SELECT reltuples::float8 FROM pg_class WHERE relname = 'history'",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(estimate.map(|v| v.max(0.0) as i64).unwrap_or(0))
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, DataError> {
        let timescale = timescale_available(&self.pool).await;
        let mut tables = Vec::with_capacity(TABLES.len());

        for table in TABLES {
            let bytes = if timescale {
                // hypertable_size covers chunks; falls through for plain tables
                match sqlx::query_scalar::<_, Option<i64>>(&format!(
                    "SELECT hypertable_size('{table}')"
                ))
                .fetch_one(&self.pool)
                .await
                {
                    Ok(Some(size)) => size,
                    _ => self.relation_size(table).await?,
                }
            } else {
                self.relation_size(table).await?
            };
            tables.push(TableStats {
                name: table.to_string(),
                bytes,
            });
        }

        let compression_ratio = if timescale {
            self.compression_ratio().await
        } else {
            None
        };

        Ok(StorageStats {
            tables,
            compression_ratio,
        })
    }

    async fn relation_size(&self, table: &str) -> Result<i64, DataError> {
        let size: i64 = sqlx::query_scalar("SELECT pg_total_relation_size($1::regclass)")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(size)
    }

    async fn compression_ratio(&self) -> Option<f64> {
        let row: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT SUM(before_compression_total_bytes)::BIGINT, \
                    SUM(after_compression_total_bytes)::BIGINT \
             FROM hypertable_compression_stats('history')",
        )
        .fetch_optional(&self.pool)
        .await
        .ok()?;

        match row {
            Some((Some(before), Some(after))) if before > 0 && after > 0 => {
                Some(before as f64 / after as f64)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_fold_by_calendar_month() {
        // 2024-01-15 and 2024-01-20 fold together; 2024-02-01 is separate
        let jan_15 = 1_705_276_800_000;
        let jan_20 = 1_705_708_800_000;
        let feb_01 = 1_706_745_600_000;
        let usage = fold_chunks_by_month(&[(jan_15, 100.0), (feb_01, 50.0), (jan_20, 25.0)]);

        assert_eq!(
            usage,
            vec![
                MonthUsage {
                    year: 2024,
                    month: 2,
                    rows: 50
                },
                MonthUsage {
                    year: 2024,
                    month: 1,
                    rows: 125
                },
            ]
        );
    }

    #[test]
    fn months_sort_descending_across_years() {
        let dec_2023 = 1_701_820_800_000;
        let jan_2024 = 1_705_276_800_000;
        let usage = fold_chunks_by_month(&[(dec_2023, 1.0), (jan_2024, 2.0)]);
        assert_eq!((usage[0].year, usage[0].month), (2024, 1));
        assert_eq!((usage[1].year, usage[1].month), (2023, 12));
    }

    #[test]
    fn empty_chunks_fold_to_empty() {
        assert!(fold_chunks_by_month(&[]).is_empty());
    }
}
