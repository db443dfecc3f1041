//! Per-metric property store
//!
//! One JSONB document per identity, shape `{name: {value, type, updatedAt}}`.
//! Upserts shallow-merge: incoming keys overwrite, absent keys are preserved.
//! Each upsert also appends property-history audit rows at the frame
//! timestamp.

use serde_json::{Value, json};
use sqlx::{PgPool, QueryBuilder};

use crate::data::error::DataError;
use crate::model::identity::{IdentityScope, MetricIdentity};
use crate::model::topology::MetricProperty;

use super::history::HistoryRepo;

/// Build the stored document for a set of property entries.
pub fn property_document(entries: &[MetricProperty], updated_at: i64) -> Value {
    let mut doc = serde_json::Map::new();
    for entry in entries {
        doc.insert(
            entry.name.clone(),
            json!({
                "value": entry.value,
                "type": entry.property_type,
                "updatedAt": updated_at,
            }),
        );
    }
    Value::Object(doc)
}

#[derive(Clone)]
pub struct PropertyRepo {
    pool: PgPool,
    history: HistoryRepo,
}

impl PropertyRepo {
    pub fn new(pool: PgPool, history: HistoryRepo) -> Self {
        Self { pool, history }
    }

    /// Shallow-merge `entries` into the identity's property document and
    /// append one audit row per entry.
    pub async fn upsert(
        &self,
        identity: &MetricIdentity,
        entries: &[MetricProperty],
        ts: i64,
    ) -> Result<(), DataError> {
        if entries.is_empty() {
            return Ok(());
        }

        let doc = property_document(entries, ts);
        sqlx::query(
            "INSERT INTO metric_properties (group_id, node_id, device_id, metric, properties) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (group_id, node_id, device_id, metric) \
             DO UPDATE SET properties = metric_properties.properties || EXCLUDED.properties",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(&doc)
        .execute(&self.pool)
        .await?;

        for entry in entries {
            self.history
                .record_property(identity, ts, &entry.name, &entry.value)
                .await?;
        }
        Ok(())
    }

    pub async fn delete_scope(&self, scope: &IdentityScope) -> Result<u64, DataError> {
        let mut qb = QueryBuilder::new("DELETE FROM metric_properties WHERE group_id = ");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::MetricValue;

    fn entry(name: &str, value: MetricValue, ty: &str) -> MetricProperty {
        MetricProperty {
            name: name.to_string(),
            value,
            property_type: ty.to_string(),
        }
    }

    /// Document-level model of the JSONB `||` operator.
    fn shallow_merge(mut base: Value, overlay: Value) -> Value {
        if let (Value::Object(base_map), Value::Object(overlay_map)) = (&mut base, overlay) {
            for (k, v) in overlay_map {
                base_map.insert(k, v);
            }
        }
        base
    }

    #[test]
    fn document_shape() {
        let doc = property_document(
            &[entry("engUnit", MetricValue::Str("degF".into()), "String")],
            1_700_000_000_000,
        );
        assert_eq!(doc["engUnit"]["value"], json!("degF"));
        assert_eq!(doc["engUnit"]["type"], json!("String"));
        assert_eq!(doc["engUnit"]["updatedAt"], json!(1_700_000_000_000_i64));
    }

    #[test]
    fn merge_preserves_absent_keys_and_overwrites_present() {
        let a = property_document(&[entry("a", MetricValue::Int(1), "Int32")], 1);
        let b = property_document(&[entry("b", MetricValue::Int(2), "Int32")], 2);
        let merged = shallow_merge(a, b);
        assert_eq!(merged["a"]["value"], json!(1));
        assert_eq!(merged["b"]["value"], json!(2));

        let c = property_document(&[entry("a", MetricValue::Int(3), "Int32")], 3);
        let merged = shallow_merge(merged, c);
        assert_eq!(merged["a"]["value"], json!(3));
        assert_eq!(merged["b"]["value"], json!(2));
    }

    #[test]
    fn merge_is_idempotent() {
        let doc = property_document(&[entry("a", MetricValue::Int(1), "Int32")], 1);
        let once = shallow_merge(doc.clone(), doc.clone());
        assert_eq!(once, doc);
    }
}
