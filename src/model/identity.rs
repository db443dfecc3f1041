//! Telemetry identity
//!
//! Every telemetry point is keyed by `(group, node, device, metric)`, with an
//! empty device for node-level metrics. The same 4-tuple is the join key used
//! by storage, the hot cache, alarms, hidden items and property rows.

use serde::{Deserialize, Serialize};

/// The 4-tuple identity of a telemetry point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricIdentity {
    pub group: String,
    pub node: String,
    #[serde(default)]
    pub device: String,
    pub metric: String,
}

impl MetricIdentity {
    pub fn new(
        group: impl Into<String>,
        node: impl Into<String>,
        device: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            node: node.into(),
            device: device.into(),
            metric: metric.into(),
        }
    }

    /// Node-level metric (empty device).
    pub fn node_metric(
        group: impl Into<String>,
        node: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self::new(group, node, "", metric)
    }

    pub fn is_device_metric(&self) -> bool {
        !self.device.is_empty()
    }

    /// Pipe-joined key used by the alarm rule cache.
    pub fn key(&self) -> String {
        format!("{}|{}|{}|{}", self.group, self.node, self.device, self.metric)
    }

    /// Canonical JSON key used by the hot-value cache. Field order is fixed
    /// so the key round-trips byte-identically.
    pub fn cache_key(&self) -> String {
        format!(
            r#"{{"group":{},"node":{},"device":{},"metric":{}}}"#,
            serde_json::Value::String(self.group.clone()),
            serde_json::Value::String(self.node.clone()),
            serde_json::Value::String(self.device.clone()),
            serde_json::Value::String(self.metric.clone()),
        )
    }
}

/// A prefix of the identity space: a whole node, a whole device, or a single
/// metric. Used by the delete cascade and hidden-item matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityScope {
    pub group: String,
    pub node: String,
    pub device: Option<String>,
    pub metric: Option<String>,
}

impl IdentityScope {
    pub fn node(group: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            node: node.into(),
            device: None,
            metric: None,
        }
    }

    pub fn device(
        group: impl Into<String>,
        node: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            node: node.into(),
            device: Some(device.into()),
            metric: None,
        }
    }

    pub fn metric(identity: &MetricIdentity) -> Self {
        Self {
            group: identity.group.clone(),
            node: identity.node.clone(),
            device: Some(identity.device.clone()),
            metric: Some(identity.metric.clone()),
        }
    }

    /// Whether the given identity falls under this scope.
    pub fn matches(&self, identity: &MetricIdentity) -> bool {
        if identity.group != self.group || identity.node != self.node {
            return false;
        }
        if let Some(device) = &self.device {
            if identity.device != *device {
                return false;
            }
        }
        if let Some(metric) = &self.metric {
            if identity.metric != *metric {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_pipe_joined() {
        let id = MetricIdentity::new("G1", "N1", "D1", "Temp");
        assert_eq!(id.key(), "G1|N1|D1|Temp");

        let id = MetricIdentity::node_metric("G1", "N1", "Temp");
        assert_eq!(id.key(), "G1|N1||Temp");
        assert!(!id.is_device_metric());
    }

    #[test]
    fn cache_key_round_trips_through_serde() {
        let id = MetricIdentity::new("G1", "N1", "D1", "Temp");
        let parsed: MetricIdentity = serde_json::from_str(&id.cache_key()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn cache_key_escapes_special_characters() {
        let id = MetricIdentity::new("G\"1", "N1", "", "Temp/1");
        let parsed: MetricIdentity = serde_json::from_str(&id.cache_key()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn node_scope_matches_descendants() {
        let scope = IdentityScope::node("G1", "N1");
        assert!(scope.matches(&MetricIdentity::new("G1", "N1", "", "M1")));
        assert!(scope.matches(&MetricIdentity::new("G1", "N1", "D1", "M2")));
        assert!(!scope.matches(&MetricIdentity::new("G1", "N2", "D1", "M2")));
    }

    #[test]
    fn device_scope_excludes_node_metrics() {
        let scope = IdentityScope::device("G1", "N1", "D1");
        assert!(scope.matches(&MetricIdentity::new("G1", "N1", "D1", "M1")));
        assert!(!scope.matches(&MetricIdentity::new("G1", "N1", "", "M1")));
        assert!(!scope.matches(&MetricIdentity::new("G1", "N1", "D2", "M1")));
    }

    #[test]
    fn metric_scope_matches_exactly_one() {
        let id = MetricIdentity::new("G1", "N1", "D1", "M1");
        let scope = IdentityScope::metric(&id);
        assert!(scope.matches(&id));
        assert!(!scope.matches(&MetricIdentity::new("G1", "N1", "D1", "M2")));
    }
}
