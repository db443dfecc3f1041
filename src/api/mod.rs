//! External surface
//!
//! [`MantleApi`] is the authoritative operation surface: every query,
//! mutation and subscription the transport layer (GraphQL, an external
//! collaborator) exposes maps to one method here. Errors are structured
//! results carrying a human-readable message; the transport maps them 1:1.

use std::sync::Arc;

use thiserror::Error;

use crate::data::error::DataError;
use crate::data::postgres::repositories::{
    AlarmHistoryEntry, AlarmRule, AlarmStateRow, HiddenItem, HistoryRepo, MetricSeries,
    NewAlarmRule, StatsRepo, StorageStats, UsageStats, WindowQuery,
};
use crate::data::topics::{Subscriber, TopicError, TopicService};
use crate::domain::alarms::{AlarmEngine, AlarmError, AlarmRuleUpdate};
use crate::domain::delete::{DeleteCascade, DeleteError};
use crate::domain::events::{
    AlarmTransition, MetricUpdate, TOPIC_ALARM_STATE_CHANGE, TOPIC_METRIC_UPDATE,
};
use crate::domain::hidden::HiddenItems;
use crate::model::identity::MetricIdentity;
use crate::model::topology::{Host, TemplateDefinition, TopologyService};
use crate::sparkplug::command::{CommandError, MetricCommander};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Alarm(#[from] AlarmError),

    #[error(transparent)]
    Delete(#[from] DeleteError),

    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error("subscription failed: {0}")]
    Topic(#[from] TopicError),
}

/// Parameters of the `history` query.
#[derive(Debug, Clone)]
pub struct HistoryRequest {
    pub metrics: Vec<MetricIdentity>,
    pub start: i64,
    pub end: i64,
    pub interval_secs: Option<i64>,
    pub samples: Option<i64>,
    pub raw: bool,
}

pub struct MantleApi {
    topology: Arc<TopologyService>,
    hidden: Arc<HiddenItems>,
    history: HistoryRepo,
    stats: StatsRepo,
    alarms: Arc<AlarmEngine>,
    cascade: DeleteCascade,
    commander: Arc<MetricCommander>,
    topics: Arc<TopicService>,
}

impl MantleApi {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        topology: Arc<TopologyService>,
        hidden: Arc<HiddenItems>,
        history: HistoryRepo,
        stats: StatsRepo,
        alarms: Arc<AlarmEngine>,
        cascade: DeleteCascade,
        commander: Arc<MetricCommander>,
        topics: Arc<TopicService>,
    ) -> Self {
        Self {
            topology,
            hidden,
            history,
            stats,
            alarms,
            cascade,
            commander,
            topics,
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The topology projection, hidden items filtered out unless requested.
    pub fn groups(&self, include_hidden: bool) -> Host {
        self.hidden.apply(self.topology.snapshot(), include_hidden)
    }

    pub fn hidden_items(&self) -> Vec<HiddenItem> {
        self.hidden.list()
    }

    pub fn template_definitions(&self) -> Vec<TemplateDefinition> {
        self.topology.templates()
    }

    pub async fn history(&self, request: HistoryRequest) -> Result<Vec<MetricSeries>, ApiError> {
        let query = WindowQuery {
            start: request.start,
            end: request.end,
            interval_secs: request.interval_secs,
            samples: request.samples,
            raw: request.raw,
        };
        Ok(self.history.query_window(&request.metrics, &query).await?)
    }

    pub async fn usage(&self) -> Result<UsageStats, ApiError> {
        Ok(self.stats.usage().await?)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, ApiError> {
        Ok(self.stats.storage_stats().await?)
    }

    pub async fn alarm_rules(&self) -> Result<Vec<AlarmRule>, ApiError> {
        Ok(self.alarms.rules().await?)
    }

    pub async fn alarm_states(&self) -> Result<Vec<AlarmStateRow>, ApiError> {
        Ok(self.alarms.states().await?)
    }

    pub async fn alarm_history(
        &self,
        rule_id: Option<i64>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<AlarmHistoryEntry>, ApiError> {
        Ok(self.alarms.history(rule_id, start, end).await?)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Authoritative command write path: publish an NCMD/DCMD carrying the
    /// value with inferred type.
    pub async fn write_metric(
        &self,
        identity: &MetricIdentity,
        value: &str,
    ) -> Result<(), ApiError> {
        Ok(self.commander.write_metric(identity, value).await?)
    }

    pub async fn hide_node(&self, group: &str, node: &str) -> Result<(), ApiError> {
        Ok(self.hidden.hide_node(group, node).await?)
    }

    pub async fn hide_device(
        &self,
        group: &str,
        node: &str,
        device: &str,
    ) -> Result<(), ApiError> {
        Ok(self.hidden.hide_device(group, node, device).await?)
    }

    pub async fn hide_metric(&self, identity: &MetricIdentity) -> Result<(), ApiError> {
        Ok(self.hidden.hide_metric(identity).await?)
    }

    pub async fn unhide_node(&self, group: &str, node: &str) -> Result<bool, ApiError> {
        Ok(self.hidden.unhide_node(group, node).await?)
    }

    pub async fn unhide_device(
        &self,
        group: &str,
        node: &str,
        device: &str,
    ) -> Result<bool, ApiError> {
        Ok(self.hidden.unhide_device(group, node, device).await?)
    }

    pub async fn unhide_metric(&self, identity: &MetricIdentity) -> Result<bool, ApiError> {
        Ok(self.hidden.unhide_metric(identity).await?)
    }

    pub async fn delete_node(&self, group: &str, node: &str) -> Result<(), ApiError> {
        Ok(self.cascade.delete_node(group, node).await?)
    }

    pub async fn delete_device(
        &self,
        group: &str,
        node: &str,
        device: &str,
    ) -> Result<(), ApiError> {
        Ok(self.cascade.delete_device(group, node, device).await?)
    }

    pub async fn delete_metric(&self, identity: &MetricIdentity) -> Result<(), ApiError> {
        Ok(self.cascade.delete_metric(identity).await?)
    }

    pub async fn create_alarm_rule(&self, input: NewAlarmRule) -> Result<AlarmRule, ApiError> {
        Ok(self.alarms.create_rule(input).await?)
    }

    pub async fn update_alarm_rule(
        &self,
        rule_id: i64,
        update: AlarmRuleUpdate,
    ) -> Result<AlarmRule, ApiError> {
        Ok(self.alarms.update_rule(rule_id, update).await?)
    }

    pub async fn delete_alarm_rule(&self, rule_id: i64) -> Result<(), ApiError> {
        Ok(self.alarms.delete_rule(rule_id).await?)
    }

    pub async fn set_alarm_enabled(
        &self,
        rule_id: i64,
        enabled: bool,
    ) -> Result<AlarmRule, ApiError> {
        Ok(self.alarms.set_enabled(rule_id, enabled).await?)
    }

    pub async fn acknowledge_alarm(&self, rule_id: i64) -> Result<AlarmStateRow, ApiError> {
        Ok(self.alarms.acknowledge(rule_id).await?)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe_metric_updates(&self) -> Result<Subscriber<MetricUpdate>, ApiError> {
        Ok(self.topics.topic::<MetricUpdate>(TOPIC_METRIC_UPDATE)?.subscribe())
    }

    pub fn subscribe_alarm_transitions(&self) -> Result<Subscriber<AlarmTransition>, ApiError> {
        Ok(self
            .topics
            .topic::<AlarmTransition>(TOPIC_ALARM_STATE_CHANGE)?
            .subscribe())
    }
}
