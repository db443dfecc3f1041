//! Hidden-item filter
//!
//! Declarative hiding at node, device or metric granularity. The table rows
//! are precomputed into a key set with three key forms (`node:g/n`,
//! `device:g/n/d`, `g/n/d/m`) so visibility is an O(1) lookup during one
//! pass over a topology snapshot. Hides cascade: a hidden node eliminates
//! its devices and metrics, a hidden device its metrics. Groups left with no
//! nodes are pruned from the projection.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::data::error::DataError;
use crate::data::postgres::repositories::{HiddenItem, HiddenRepo};
use crate::model::identity::{IdentityScope, MetricIdentity};
use crate::model::topology::Host;
use crate::utils::time::now_ms;

fn node_key(group: &str, node: &str) -> String {
    format!("node:{group}/{node}")
}

fn device_key(group: &str, node: &str, device: &str) -> String {
    format!("device:{group}/{node}/{device}")
}

fn metric_key(group: &str, node: &str, device: &str, metric: &str) -> String {
    format!("{group}/{node}/{device}/{metric}")
}

fn item_key(item: &HiddenItem) -> String {
    if item.device.is_empty() && item.metric.is_empty() {
        node_key(&item.group, &item.node)
    } else if item.metric.is_empty() {
        device_key(&item.group, &item.node, &item.device)
    } else {
        metric_key(&item.group, &item.node, &item.device, &item.metric)
    }
}

/// Apply the hidden-key set to a topology snapshot.
pub fn filter_host(mut host: Host, keys: &HashSet<String>) -> Host {
    host.groups.retain(|group_name, group| {
        group.nodes.retain(|node_name, node| {
            if keys.contains(&node_key(group_name, node_name)) {
                return false;
            }
            node.metrics.retain(|metric_name, _| {
                !keys.contains(&metric_key(group_name, node_name, "", metric_name))
            });
            node.devices.retain(|device_name, device| {
                if keys.contains(&device_key(group_name, node_name, device_name)) {
                    return false;
                }
                device.metrics.retain(|metric_name, _| {
                    !keys.contains(&metric_key(group_name, node_name, device_name, metric_name))
                });
                true
            });
            true
        });
        !group.nodes.is_empty()
    });
    host
}

/// Hidden-item service: durable rows plus the precomputed key set.
pub struct HiddenItems {
    repo: HiddenRepo,
    keys: RwLock<HashSet<String>>,
    items: RwLock<Vec<HiddenItem>>,
}

impl HiddenItems {
    /// Load the table into the key set.
    pub async fn load(repo: HiddenRepo) -> Result<Self, DataError> {
        let items = repo.list().await?;
        let keys = items.iter().map(item_key).collect();
        tracing::debug!(count = items.len(), "Hidden items loaded");
        Ok(Self {
            repo,
            keys: RwLock::new(keys),
            items: RwLock::new(items),
        })
    }

    pub fn list(&self) -> Vec<HiddenItem> {
        self.items.read().clone()
    }

    /// Visibility projection. `include_hidden` skips the filter entirely.
    pub fn apply(&self, host: Host, include_hidden: bool) -> Host {
        if include_hidden {
            return host;
        }
        filter_host(host, &self.keys.read())
    }

    pub async fn hide_node(&self, group: &str, node: &str) -> Result<(), DataError> {
        self.hide(HiddenItem {
            group: group.to_string(),
            node: node.to_string(),
            device: String::new(),
            metric: String::new(),
            hidden_at: now_ms(),
        })
        .await
    }

    pub async fn hide_device(
        &self,
        group: &str,
        node: &str,
        device: &str,
    ) -> Result<(), DataError> {
        self.hide(HiddenItem {
            group: group.to_string(),
            node: node.to_string(),
            device: device.to_string(),
            metric: String::new(),
            hidden_at: now_ms(),
        })
        .await
    }

    pub async fn hide_metric(&self, identity: &MetricIdentity) -> Result<(), DataError> {
        self.hide(HiddenItem {
            group: identity.group.clone(),
            node: identity.node.clone(),
            device: identity.device.clone(),
            metric: identity.metric.clone(),
            hidden_at: now_ms(),
        })
        .await
    }

    async fn hide(&self, item: HiddenItem) -> Result<(), DataError> {
        self.repo.insert(&item).await?;
        self.keys.write().insert(item_key(&item));
        let mut items = self.items.write();
        if !items.iter().any(|existing| {
            existing.group == item.group
                && existing.node == item.node
                && existing.device == item.device
                && existing.metric == item.metric
        }) {
            items.push(item);
        }
        Ok(())
    }

    pub async fn unhide_node(&self, group: &str, node: &str) -> Result<bool, DataError> {
        self.unhide(group, node, "", "").await
    }

    pub async fn unhide_device(
        &self,
        group: &str,
        node: &str,
        device: &str,
    ) -> Result<bool, DataError> {
        self.unhide(group, node, device, "").await
    }

    pub async fn unhide_metric(&self, identity: &MetricIdentity) -> Result<bool, DataError> {
        self.unhide(
            &identity.group,
            &identity.node,
            &identity.device,
            &identity.metric,
        )
        .await
    }

    async fn unhide(
        &self,
        group: &str,
        node: &str,
        device: &str,
        metric: &str,
    ) -> Result<bool, DataError> {
        let removed = self.repo.remove(group, node, device, metric).await?;
        if removed {
            let probe = HiddenItem {
                group: group.to_string(),
                node: node.to_string(),
                device: device.to_string(),
                metric: metric.to_string(),
                hidden_at: 0,
            };
            self.keys.write().remove(&item_key(&probe));
            self.items.write().retain(|item| {
                !(item.group == group
                    && item.node == node
                    && item.device == device
                    && item.metric == metric)
            });
        }
        Ok(removed)
    }

    /// Drop every hidden item under a scope (delete cascade step d).
    pub async fn remove_scope(&self, scope: &IdentityScope) -> Result<u64, DataError> {
        let removed = self.repo.remove_scope(scope).await?;
        if removed > 0 {
            let mut items = self.items.write();
            let mut keys = self.keys.write();
            items.retain(|item| {
                let in_scope = item.group == scope.group
                    && item.node == scope.node
                    && scope.device.as_deref().map_or(true, |d| item.device == d)
                    && scope.metric.as_deref().map_or(true, |m| item.metric == m);
                if in_scope {
                    keys.remove(&item_key(item));
                }
                !in_scope
            });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::topology::{MetricNode, TopologyService};
    use crate::model::value::MetricValue;

    fn sample_host() -> Host {
        let service = TopologyService::new();
        let metric = |name: &str| MetricNode {
            name: name.to_string(),
            metric_type: "Float".into(),
            value: MetricValue::Float(1.0),
            timestamp: 0,
            scan_rate: None,
            properties: Vec::new(),
            template: None,
        };
        service.upsert_metric(&MetricIdentity::node_metric("G1", "N1", "M1"), metric("M1"));
        service.upsert_metric(&MetricIdentity::new("G1", "N1", "D1", "M2"), metric("M2"));
        service.upsert_metric(&MetricIdentity::new("G1", "N1", "D2", "M3"), metric("M3"));
        service.upsert_metric(&MetricIdentity::node_metric("G1", "N2", "M4"), metric("M4"));
        service.upsert_metric(&MetricIdentity::node_metric("G2", "N3", "M5"), metric("M5"));
        service.snapshot()
    }

    #[test]
    fn hiding_a_node_eliminates_all_descendants() {
        let mut keys = HashSet::new();
        keys.insert(node_key("G1", "N1"));
        let filtered = filter_host(sample_host(), &keys);

        assert!(!filtered.groups["G1"].nodes.contains_key("N1"));
        assert!(filtered.groups["G1"].nodes.contains_key("N2"));
        assert!(filtered.groups.contains_key("G2"));
    }

    #[test]
    fn hiding_a_device_keeps_the_node() {
        let mut keys = HashSet::new();
        keys.insert(device_key("G1", "N1", "D1"));
        let filtered = filter_host(sample_host(), &keys);

        let node = &filtered.groups["G1"].nodes["N1"];
        assert!(!node.devices.contains_key("D1"));
        assert!(node.devices.contains_key("D2"));
        assert!(node.metrics.contains_key("M1"));
    }

    #[test]
    fn hiding_metrics_at_both_levels() {
        let mut keys = HashSet::new();
        keys.insert(metric_key("G1", "N1", "", "M1"));
        keys.insert(metric_key("G1", "N1", "D1", "M2"));
        let filtered = filter_host(sample_host(), &keys);

        let node = &filtered.groups["G1"].nodes["N1"];
        assert!(!node.metrics.contains_key("M1"));
        assert!(node.devices["D1"].metrics.is_empty());
        assert!(node.devices["D2"].metrics.contains_key("M3"));
    }

    #[test]
    fn groups_with_no_remaining_nodes_are_pruned() {
        let mut keys = HashSet::new();
        keys.insert(node_key("G2", "N3"));
        let filtered = filter_host(sample_host(), &keys);
        assert!(!filtered.groups.contains_key("G2"));
    }

    #[test]
    fn empty_key_set_is_identity() {
        let host = sample_host();
        let filtered = filter_host(host.clone(), &HashSet::new());
        assert_eq!(filtered, host);
    }

    #[test]
    fn item_key_selects_the_right_form() {
        let item = |device: &str, metric: &str| HiddenItem {
            group: "G".into(),
            node: "N".into(),
            device: device.into(),
            metric: metric.into(),
            hidden_at: 0,
        };
        assert_eq!(item_key(&item("", "")), "node:G/N");
        assert_eq!(item_key(&item("D", "")), "device:G/N/D");
        assert_eq!(item_key(&item("D", "M")), "G/N/D/M");
        assert_eq!(item_key(&item("", "M")), "G/N//M");
    }
}
