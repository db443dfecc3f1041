//! Broadcast event payloads
//!
//! Flattened records published on the pub/sub fabric. Metric values are
//! always stringified on this surface, regardless of the storage routing.

use serde::{Deserialize, Serialize};

use crate::data::cache::CacheEntry;
use crate::data::topics::TopicMessage;
use crate::model::identity::MetricIdentity;
use crate::model::value::MetricValue;
use crate::data::postgres::repositories::AlarmStateKind;

/// Topic carrying live metric updates.
pub const TOPIC_METRIC_UPDATE: &str = "metricUpdate";

/// Topic carrying alarm state transitions.
pub const TOPIC_ALARM_STATE_CHANGE: &str = "alarmStateChange";

/// A flattened metric update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricUpdate {
    pub group: String,
    pub node: String,
    pub device: String,
    pub metric: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub value: String,
    pub timestamp: i64,
}

impl MetricUpdate {
    pub fn new(
        identity: &MetricIdentity,
        metric_type: &str,
        value: &MetricValue,
        timestamp: i64,
    ) -> Self {
        Self {
            group: identity.group.clone(),
            node: identity.node.clone(),
            device: identity.device.clone(),
            metric: identity.metric.clone(),
            metric_type: metric_type.to_string(),
            value: value.to_display_string(),
            timestamp,
        }
    }

    pub fn from_cache(identity: &MetricIdentity, entry: &CacheEntry) -> Self {
        Self::new(identity, &entry.metric_type, &entry.value, entry.timestamp)
    }
}

impl TopicMessage for MetricUpdate {
    fn size_bytes(&self) -> usize {
        self.group.len()
            + self.node.len()
            + self.device.len()
            + self.metric.len()
            + self.metric_type.len()
            + self.value.len()
            + 32
    }
}

/// One alarm state transition. Field names serialize camelCase; the webhook
/// body spreads this record verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmTransition {
    #[serde(rename = "ruleId")]
    pub rule_id: i64,
    #[serde(rename = "ruleName")]
    pub rule_name: String,
    pub group: String,
    pub node: String,
    pub device: String,
    pub metric: String,
    #[serde(rename = "fromState")]
    pub from_state: AlarmStateKind,
    #[serde(rename = "toState")]
    pub to_state: AlarmStateKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub timestamp: i64,
}

impl TopicMessage for AlarmTransition {
    fn size_bytes(&self) -> usize {
        self.rule_name.len()
            + self.group.len()
            + self.node.len()
            + self.device.len()
            + self.metric.len()
            + self.value.as_ref().map(String::len).unwrap_or(0)
            + 64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_update_stringifies_values() {
        let identity = MetricIdentity::new("G1", "N1", "", "Temp");
        let update = MetricUpdate::new(&identity, "Float", &MetricValue::Float(72.5), 1);
        assert_eq!(update.value, "72.5");
        assert_eq!(update.device, "");

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "Float");
        assert_eq!(json["value"], "72.5");
    }

    #[test]
    fn size_estimates_scale_with_content() {
        let identity = MetricIdentity::new("G1", "N1", "D1", "Temp");
        let small = MetricUpdate::new(&identity, "Float", &MetricValue::Int(1), 1);
        let big = MetricUpdate::new(
            &identity,
            "String",
            &MetricValue::Str("x".repeat(1000)),
            1,
        );
        assert!(big.size_bytes() > small.size_bytes() + 900);
    }
}
