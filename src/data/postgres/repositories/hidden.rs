//! Hidden-item rows
//!
//! `(group, node, device, metric, hidden_at)` where an empty device/metric
//! means "hide all descendants". The in-memory cascade lives in
//! `domain::hidden`; this repository is the durable side.

use sqlx::{PgPool, QueryBuilder};

use crate::data::error::DataError;
use crate::model::identity::IdentityScope;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, serde::Serialize)]
pub struct HiddenItem {
    #[sqlx(rename = "group_id")]
    #[serde(rename = "group")]
    pub group: String,
    #[sqlx(rename = "node_id")]
    #[serde(rename = "node")]
    pub node: String,
    #[sqlx(rename = "device_id")]
    #[serde(rename = "device")]
    pub device: String,
    pub metric: String,
    pub hidden_at: i64,
}

#[derive(Clone)]
pub struct HiddenRepo {
    pool: PgPool,
}

impl HiddenRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, item: &HiddenItem) -> Result<(), DataError> {
        sqlx::query(
            "INSERT INTO hidden_items (group_id, node_id, device_id, metric, hidden_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (group_id, node_id, device_id, metric) DO NOTHING",
        )
        .bind(&item.group)
        .bind(&item.node)
        .bind(&item.device)
        .bind(&item.metric)
        .bind(item.hidden_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove one exact hidden-item row. Returns whether a row existed.
    pub async fn remove(
        &self,
        group: &str,
        node: &str,
        device: &str,
        metric: &str,
    ) -> Result<bool, DataError> {
        let result = sqlx::query(
            "DELETE FROM hidden_items \
             WHERE group_id = $1 AND node_id = $2 AND device_id = $3 AND metric = $4",
        )
        .bind(group)
        .bind(node)
        .bind(device)
        .bind(metric)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove every hidden item under a scope (delete cascade step d).
    pub async fn remove_scope(&self, scope: &IdentityScope) -> Result<u64, DataError> {
        let mut qb = QueryBuilder::new("DELETE FROM hidden_items WHERE group_id = ");
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
        Ok(result.rows_affected())
    }

    pub async fn list(&self) -> Result<Vec<HiddenItem>, DataError> {
        let items = sqlx::query_as(
            "SELECT group_id, node_id, device_id, metric, hidden_at \
             FROM hidden_items ORDER BY group_id, node_id, device_id, metric",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }
}
