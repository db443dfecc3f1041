//! Delete cascade
//!
//! Coordinated deletion of a node, device or metric across the in-memory
//! topology, the hot cache, the history tables, the hidden items and the
//! property rows, in that order. A failure in the history step aborts with
//! an error; earlier side effects are intentionally not rolled back (a stale
//! cache entry repopulates on the next BIRTH).

use std::sync::Arc;

use thiserror::Error;

use crate::data::cache::{CacheError, HotValueCache};
use crate::data::error::DataError;
use crate::data::postgres::repositories::{HistoryRepo, PropertyRepo};
use crate::domain::hidden::HiddenItems;
use crate::model::identity::{IdentityScope, MetricIdentity};
use crate::model::topology::TopologyService;

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("history delete failed: {0}")]
    History(#[from] DataError),
}

pub struct DeleteCascade {
    topology: Arc<TopologyService>,
    cache: Option<Arc<HotValueCache>>,
    history: HistoryRepo,
    hidden: Arc<HiddenItems>,
    properties: PropertyRepo,
}

impl DeleteCascade {
    pub fn new(
        topology: Arc<TopologyService>,
        cache: Option<Arc<HotValueCache>>,
        history: HistoryRepo,
        hidden: Arc<HiddenItems>,
        properties: PropertyRepo,
    ) -> Self {
        Self {
            topology,
            cache,
            history,
            hidden,
            properties,
        }
    }

    pub async fn delete_node(&self, group: &str, node: &str) -> Result<(), DeleteError> {
        self.topology.remove_node(group, node);
        self.run(IdentityScope::node(group, node)).await
    }

    pub async fn delete_device(
        &self,
        group: &str,
        node: &str,
        device: &str,
    ) -> Result<(), DeleteError> {
        self.topology.remove_device(group, node, device);
        self.run(IdentityScope::device(group, node, device)).await
    }

    pub async fn delete_metric(&self, identity: &MetricIdentity) -> Result<(), DeleteError> {
        self.topology.remove_metric(identity);
        self.run(IdentityScope::metric(identity)).await
    }

    /// Steps (b)..(e); the caller has already mutated the topology (a).
    async fn run(&self, scope: IdentityScope) -> Result<(), DeleteError> {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete_scope(&scope).await {
                log_cache_error(&e);
            }
        }

        // history_properties before history; an error here aborts the cascade
        let props = self.history.delete_history_properties(&scope).await?;
        let rows = self.history.delete_history(&scope).await?;

        if let Err(e) = self.hidden.remove_scope(&scope).await {
            tracing::warn!(error = %e, "Hidden-item cleanup failed");
        }
        if let Err(e) = self.properties.delete_scope(&scope).await {
            tracing::warn!(error = %e, "Metric-property cleanup failed");
        }

        tracing::info!(
            group = %scope.group,
            node = %scope.node,
            device = scope.device.as_deref().unwrap_or("*"),
            metric = scope.metric.as_deref().unwrap_or("*"),
            history_rows = rows,
            property_rows = props,
            "Delete cascade complete"
        );
        Ok(())
    }
}

fn log_cache_error(e: &CacheError) {
    tracing::warn!(error = %e, "Hot-cache cleanup failed, stale entries repopulate on next BIRTH");
}
