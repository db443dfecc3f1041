//! In-memory topology model
//!
//! The observed hierarchy is an owned tree of identity-keyed maps:
//! `Host → groups → nodes → {metrics, devices → metrics}`. There are no back
//! pointers. The tree is exclusively mutated by the ingress task and the
//! delete mutations; readers obtain whole-tree snapshots (the tree is small,
//! it mirrors live plant topology, not history).

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::identity::MetricIdentity;
use super::value::MetricValue;

/// A single named property attached to a metric (description, units, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricProperty {
    pub name: String,
    pub value: MetricValue,
    #[serde(rename = "type")]
    pub property_type: String,
}

/// One metric under a node or device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricNode {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub value: MetricValue,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_rate: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<MetricProperty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub metrics: BTreeMap<String, MetricNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metrics: BTreeMap<String, MetricNode>,
    pub devices: BTreeMap<String, Device>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub nodes: BTreeMap<String, Node>,
}

/// The full observed hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub groups: BTreeMap<String, Group>,
}

impl Host {
    /// Insert or replace a metric at its identity path, creating intermediate
    /// group/node/device entries as needed.
    pub fn upsert_metric(&mut self, identity: &MetricIdentity, metric: MetricNode) {
        let node = self
            .groups
            .entry(identity.group.clone())
            .or_default()
            .nodes
            .entry(identity.node.clone())
            .or_default();

        let metrics = if identity.device.is_empty() {
            &mut node.metrics
        } else {
            &mut node.devices.entry(identity.device.clone()).or_default().metrics
        };
        metrics.insert(identity.metric.clone(), metric);
    }

    /// Fold another host's metrics into this tree, the incoming side
    /// winning on conflict. Used to warm the topology from the hot cache.
    pub fn merge(&mut self, other: Host) {
        for (group_name, group) in other.groups {
            for (node_name, node) in group.nodes {
                for (metric_name, metric) in node.metrics {
                    let identity = MetricIdentity::node_metric(
                        group_name.as_str(),
                        node_name.as_str(),
                        metric_name,
                    );
                    self.upsert_metric(&identity, metric);
                }
                for (device_name, device) in node.devices {
                    for (metric_name, metric) in device.metrics {
                        let identity = MetricIdentity::new(
                            group_name.as_str(),
                            node_name.as_str(),
                            device_name.as_str(),
                            metric_name,
                        );
                        self.upsert_metric(&identity, metric);
                    }
                }
            }
        }
    }

    /// Remove a node and everything under it. Empty groups are pruned.
    pub fn remove_node(&mut self, group: &str, node: &str) -> bool {
        let Some(g) = self.groups.get_mut(group) else {
            return false;
        };
        let removed = g.nodes.remove(node).is_some();
        if g.nodes.is_empty() {
            self.groups.remove(group);
        }
        removed
    }

    /// Remove a device and its metrics.
    pub fn remove_device(&mut self, group: &str, node: &str, device: &str) -> bool {
        self.groups
            .get_mut(group)
            .and_then(|g| g.nodes.get_mut(node))
            .map(|n| n.devices.remove(device).is_some())
            .unwrap_or(false)
    }

    /// Remove a single metric.
    pub fn remove_metric(&mut self, identity: &MetricIdentity) -> bool {
        let Some(node) = self
            .groups
            .get_mut(&identity.group)
            .and_then(|g| g.nodes.get_mut(&identity.node))
        else {
            return false;
        };
        if identity.device.is_empty() {
            node.metrics.remove(&identity.metric).is_some()
        } else {
            node.devices
                .get_mut(&identity.device)
                .map(|d| d.metrics.remove(&identity.metric).is_some())
                .unwrap_or(false)
        }
    }
}

/// One member of a template definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMember {
    pub name: String,
    #[serde(rename = "type")]
    pub member_type: String,
}

/// A template definition observed on a BIRTH frame. Purely descriptive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub members: Vec<TemplateMember>,
}

/// Shared topology handle: single writer (ingress + mutations), snapshot
/// readers.
#[derive(Default)]
pub struct TopologyService {
    host: RwLock<Host>,
    templates: RwLock<BTreeMap<String, TemplateDefinition>>,
}

impl TopologyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_metric(&self, identity: &MetricIdentity, metric: MetricNode) {
        self.host.write().upsert_metric(identity, metric);
    }

    /// Warm the tree from a rebuilt projection (hot-cache startup).
    pub fn merge(&self, other: Host) {
        self.host.write().merge(other);
    }

    /// Consistent point-in-time copy of the tree. Readers never observe a
    /// partially updated node.
    pub fn snapshot(&self) -> Host {
        self.host.read().clone()
    }

    pub fn remove_node(&self, group: &str, node: &str) -> bool {
        self.host.write().remove_node(group, node)
    }

    pub fn remove_device(&self, group: &str, node: &str, device: &str) -> bool {
        self.host.write().remove_device(group, node, device)
    }

    pub fn remove_metric(&self, identity: &MetricIdentity) -> bool {
        self.host.write().remove_metric(identity)
    }

    pub fn register_template(&self, def: TemplateDefinition) {
        self.templates.write().insert(def.name.clone(), def);
    }

    pub fn templates(&self) -> Vec<TemplateDefinition> {
        self.templates.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str, value: f64) -> MetricNode {
        MetricNode {
            name: name.to_string(),
            metric_type: "Float".to_string(),
            value: MetricValue::Float(value),
            timestamp: 1_700_000_000_000,
            scan_rate: None,
            properties: Vec::new(),
            template: None,
        }
    }

    #[test]
    fn upsert_creates_intermediate_levels() {
        let mut host = Host::default();
        host.upsert_metric(
            &MetricIdentity::new("G1", "N1", "D1", "Temp"),
            metric("Temp", 72.5),
        );

        let d = &host.groups["G1"].nodes["N1"].devices["D1"];
        assert_eq!(d.metrics["Temp"].value, MetricValue::Float(72.5));
    }

    #[test]
    fn node_level_metrics_skip_the_device_map() {
        let mut host = Host::default();
        host.upsert_metric(
            &MetricIdentity::node_metric("G1", "N1", "Temp"),
            metric("Temp", 1.0),
        );
        let n = &host.groups["G1"].nodes["N1"];
        assert!(n.metrics.contains_key("Temp"));
        assert!(n.devices.is_empty());
    }

    #[test]
    fn upsert_replaces_existing_metric() {
        let mut host = Host::default();
        let id = MetricIdentity::node_metric("G1", "N1", "Temp");
        host.upsert_metric(&id, metric("Temp", 1.0));
        host.upsert_metric(&id, metric("Temp", 2.0));
        assert_eq!(
            host.groups["G1"].nodes["N1"].metrics["Temp"].value,
            MetricValue::Float(2.0)
        );
    }

    #[test]
    fn remove_node_prunes_empty_group() {
        let mut host = Host::default();
        host.upsert_metric(
            &MetricIdentity::node_metric("G1", "N1", "Temp"),
            metric("Temp", 1.0),
        );
        assert!(host.remove_node("G1", "N1"));
        assert!(host.groups.is_empty());
        assert!(!host.remove_node("G1", "N1"));
    }

    #[test]
    fn remove_device_and_metric() {
        let mut host = Host::default();
        let dev_metric = MetricIdentity::new("G1", "N1", "D1", "Temp");
        let node_metric_id = MetricIdentity::node_metric("G1", "N1", "Status");
        host.upsert_metric(&dev_metric, metric("Temp", 1.0));
        host.upsert_metric(&node_metric_id, metric("Status", 0.0));

        assert!(host.remove_metric(&node_metric_id));
        assert!(!host.groups["G1"].nodes["N1"].metrics.contains_key("Status"));

        assert!(host.remove_device("G1", "N1", "D1"));
        assert!(host.groups["G1"].nodes["N1"].devices.is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let service = TopologyService::new();
        let id = MetricIdentity::node_metric("G1", "N1", "Temp");
        service.upsert_metric(&id, metric("Temp", 1.0));

        let snap = service.snapshot();
        service.upsert_metric(&id, metric("Temp", 2.0));

        assert_eq!(
            snap.groups["G1"].nodes["N1"].metrics["Temp"].value,
            MetricValue::Float(1.0)
        );
    }

    #[test]
    fn merge_folds_both_levels_and_overwrites() {
        let mut base = Host::default();
        base.upsert_metric(&MetricIdentity::node_metric("G1", "N1", "Temp"), metric("Temp", 1.0));

        let mut incoming = Host::default();
        incoming.upsert_metric(
            &MetricIdentity::node_metric("G1", "N1", "Temp"),
            metric("Temp", 2.0),
        );
        incoming.upsert_metric(
            &MetricIdentity::new("G2", "N2", "D1", "RPM"),
            metric("RPM", 900.0),
        );

        base.merge(incoming);
        assert_eq!(
            base.groups["G1"].nodes["N1"].metrics["Temp"].value,
            MetricValue::Float(2.0)
        );
        assert_eq!(
            base.groups["G2"].nodes["N2"].devices["D1"].metrics["RPM"].value,
            MetricValue::Float(900.0)
        );
    }

    #[test]
    fn template_registry_replaces_by_name() {
        let service = TopologyService::new();
        service.register_template(TemplateDefinition {
            name: "Motor".into(),
            version: None,
            members: vec![],
        });
        service.register_template(TemplateDefinition {
            name: "Motor".into(),
            version: Some("2".into()),
            members: vec![TemplateMember {
                name: "RPM".into(),
                member_type: "Float".into(),
            }],
        });
        let templates = service.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].version.as_deref(), Some("2"));
    }
}
