//! Alarm engine
//!
//! One engine per process, held behind an explicit handle: the in-memory
//! rule cache keyed by pipe-joined identity, the per-rule delay timers, the
//! webhook configuration and the repository. Every state change is durable
//! (state row update plus history append in one transaction), then published
//! on `alarmStateChange`, with the webhook fired when the target state is
//! `active` or a non-normal state returns to `normal`.
//!
//! Delay timers are monotonic and single-shot. While a rule is `pending`,
//! further samples update `last_value` but never reset the timer. On startup
//! pending rules are recovered: the remaining delay is recomputed from
//! `condition_met_at` and either rescheduled or, when already elapsed,
//! transitioned to `active` immediately.

pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::data::error::DataError;
use crate::data::postgres::repositories::{
    AlarmHistoryEntry, AlarmRepo, AlarmRule, AlarmRuleType, AlarmStateKind, AlarmStateRow,
    AlarmStateUpdate, NewAlarmRule,
};
use crate::data::topics::{Topic, TopicError, TopicService};
use crate::domain::events::{AlarmTransition, TOPIC_ALARM_STATE_CHANGE};
use crate::model::identity::MetricIdentity;
use crate::model::value::MetricValue;
use crate::utils::time::now_ms;

pub use webhook::WebhookConfig;

#[derive(Debug, Error)]
pub enum AlarmError {
    /// Invariant violations leave no state mutated.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("invalid rule: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error("topic error: {0}")]
    Topic(#[from] TopicError),
}

/// What a sample does to a rule in its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// Record the observed value, nothing else.
    TouchValue,
    /// Enter `pending` and start the delay timer.
    EnterPending,
    /// Transition to the given state.
    Transition(AlarmStateKind),
}

/// The state machine's decision table.
fn decide(current: AlarmStateKind, condition_met: bool, delay_sec: i64) -> Decision {
    use AlarmStateKind::*;
    match (current, condition_met) {
        (Normal, true) if delay_sec <= 0 => Decision::Transition(Active),
        (Normal, true) => Decision::EnterPending,
        (Normal, false) => Decision::TouchValue,
        // incoming samples do not reset the timer
        (Pending, true) => Decision::TouchValue,
        (Pending, false) => Decision::Transition(Normal),
        (Active, true) => Decision::TouchValue,
        (Active, false) => Decision::Transition(Normal),
        (Acknowledged, true) => Decision::TouchValue,
        (Acknowledged, false) => Decision::Transition(Normal),
    }
}

/// The webhook fires on entry to `active` and whenever a non-normal state
/// returns to `normal`.
fn webhook_fires(from: AlarmStateKind, to: AlarmStateKind) -> bool {
    to == AlarmStateKind::Active || (from != AlarmStateKind::Normal && to == AlarmStateKind::Normal)
}

/// Whether a value meets the rule's condition. Values promote to numeric
/// (bool → 0/1, strings parse); unpromotable values and a missing threshold
/// both mean "condition not met".
fn condition_met(rule: &AlarmRule, value: &MetricValue) -> bool {
    let Some(v) = value.as_f64() else {
        return false;
    };
    match rule.rule_type {
        AlarmRuleType::True => v != 0.0,
        AlarmRuleType::False => v == 0.0,
        AlarmRuleType::Above => rule.threshold.is_some_and(|t| v > t),
        AlarmRuleType::Below => rule.threshold.is_some_and(|t| v < t),
    }
}

/// Milliseconds of delay still owed for a pending rule.
fn remaining_delay_ms(delay_sec: i64, condition_met_at: i64, now: i64) -> i64 {
    delay_sec * 1000 - (now - condition_met_at)
}

/// Reject programmer errors at the mutation boundary.
fn validate_rule(input: &NewAlarmRule) -> Result<(), AlarmError> {
    let identity = &input.identity;
    if identity.group.is_empty() || identity.node.is_empty() || identity.metric.is_empty() {
        return Err(AlarmError::InvalidInput(
            "group, node and metric must not be empty".into(),
        ));
    }
    if input.name.is_empty() {
        return Err(AlarmError::InvalidInput("rule name must not be empty".into()));
    }
    if input.delay_sec < 0 {
        return Err(AlarmError::InvalidInput("delay must not be negative".into()));
    }
    if input.rule_type.requires_threshold() && input.threshold.is_none() {
        return Err(AlarmError::InvalidInput(format!(
            "threshold is required for rule type '{}'",
            input.rule_type.as_str()
        )));
    }
    Ok(())
}

/// Mutable fields accepted by rule updates.
#[derive(Debug, Clone)]
pub struct AlarmRuleUpdate {
    pub name: Option<String>,
    pub rule_type: Option<AlarmRuleType>,
    pub threshold: Option<Option<f64>>,
    pub delay_sec: Option<i64>,
    pub enabled: Option<bool>,
}

pub struct AlarmEngine {
    repo: AlarmRepo,
    rules: RwLock<HashMap<String, Vec<AlarmRule>>>,
    timers: Mutex<HashMap<i64, JoinHandle<()>>>,
    topic: Topic<AlarmTransition>,
    webhook: Option<WebhookConfig>,
    http: reqwest::Client,
}

impl AlarmEngine {
    /// Build the engine, rebuild the rule cache from the rules table and
    /// recover pending delay timers.
    pub async fn init(
        repo: AlarmRepo,
        topics: &TopicService,
        webhook: Option<WebhookConfig>,
    ) -> Result<Arc<Self>, AlarmError> {
        let topic = topics.topic(TOPIC_ALARM_STATE_CHANGE)?;
        let engine = Arc::new(Self {
            repo,
            rules: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            topic,
            webhook,
            http: reqwest::Client::new(),
        });
        engine.reload_rules().await?;
        engine.recover_pending().await?;
        Ok(engine)
    }

    async fn reload_rules(&self) -> Result<(), AlarmError> {
        let rules = self.repo.list_rules().await?;
        let mut cache: HashMap<String, Vec<AlarmRule>> = HashMap::new();
        for rule in rules {
            cache.entry(rule.identity.key()).or_default().push(rule);
        }
        let count: usize = cache.values().map(Vec::len).sum();
        *self.rules.write() = cache;
        tracing::debug!(rules = count, "Alarm rule cache rebuilt");
        Ok(())
    }

    /// Restart safety: reschedule or immediately fire timers for rules that
    /// were pending when the process stopped; reset rules disabled while
    /// pending.
    async fn recover_pending(self: &Arc<Self>) -> Result<(), AlarmError> {
        let states = self.repo.list_states().await?;
        let now = now_ms();
        for state in states
            .into_iter()
            .filter(|s| s.state == AlarmStateKind::Pending)
        {
            let rule = self.rule_by_id(state.rule_id);
            match rule {
                Some(rule) if rule.enabled => {
                    let met_at = state.condition_met_at.unwrap_or(now);
                    let remaining = remaining_delay_ms(rule.delay_sec, met_at, now);
                    if remaining <= 0 {
                        tracing::info!(rule_id = rule.id, "Pending delay elapsed during restart");
                        self.transition(&rule, &state, AlarmStateKind::Active, state.last_value.clone())
                            .await?;
                    } else {
                        tracing::info!(
                            rule_id = rule.id,
                            remaining_ms = remaining,
                            "Rescheduling pending alarm timer"
                        );
                        self.schedule_timer(rule.id, remaining as u64);
                    }
                }
                _ => {
                    tracing::info!(rule_id = state.rule_id, "Resetting pending alarm for disabled rule");
                    self.force_normal(state.rule_id, &state).await?;
                }
            }
        }
        Ok(())
    }

    /// Evaluate one sample against every enabled rule on the identity.
    /// Errors are logged and swallowed (ingestion never stalls on the alarm
    /// path), but the await keeps per-identity evaluation ordered.
    pub async fn evaluate(self: &Arc<Self>, identity: &MetricIdentity, value: &MetricValue) {
        let rules: Vec<AlarmRule> = match self.rules.read().get(&identity.key()) {
            Some(rules) => rules.iter().filter(|r| r.enabled).cloned().collect(),
            None => return,
        };
        for rule in rules {
            if let Err(e) = self.evaluate_rule(&rule, value).await {
                tracing::warn!(rule_id = rule.id, error = %e, "Alarm evaluation failed");
            }
        }
    }

    async fn evaluate_rule(
        self: &Arc<Self>,
        rule: &AlarmRule,
        value: &MetricValue,
    ) -> Result<(), AlarmError> {
        let met = condition_met(rule, value);
        let state = self.repo.get_state(rule.id).await?;
        let value_str = value.to_display_string();

        match decide(state.state, met, rule.delay_sec) {
            Decision::TouchValue => {
                self.repo
                    .update_last_value(rule.id, &value_str, now_ms())
                    .await?;
            }
            Decision::EnterPending => {
                self.enter_pending(rule, &state, value_str).await?;
            }
            Decision::Transition(to) => {
                self.transition(rule, &state, to, Some(value_str)).await?;
            }
        }
        Ok(())
    }

    async fn enter_pending(
        self: &Arc<Self>,
        rule: &AlarmRule,
        state: &AlarmStateRow,
        value: String,
    ) -> Result<(), AlarmError> {
        let now = now_ms();
        let update = AlarmStateUpdate {
            state: AlarmStateKind::Pending,
            condition_met_at: Some(now),
            activated_at: None,
            last_notified_at: state.last_notified_at,
            last_value: Some(value),
        };
        self.apply(rule, state.state, update).await?;
        self.schedule_timer(rule.id, (rule.delay_sec * 1000) as u64);
        Ok(())
    }

    async fn transition(
        self: &Arc<Self>,
        rule: &AlarmRule,
        state: &AlarmStateRow,
        to: AlarmStateKind,
        value: Option<String>,
    ) -> Result<(), AlarmError> {
        if state.state == AlarmStateKind::Pending {
            self.cancel_timer(rule.id);
        }
        let now = now_ms();
        let (condition_met_at, activated_at) = match to {
            AlarmStateKind::Active => (state.condition_met_at.or(Some(now)), Some(now)),
            AlarmStateKind::Normal => (None, None),
            AlarmStateKind::Pending | AlarmStateKind::Acknowledged => {
                (state.condition_met_at, state.activated_at)
            }
        };
        let update = AlarmStateUpdate {
            state: to,
            condition_met_at,
            activated_at,
            last_notified_at: state.last_notified_at,
            last_value: value.or_else(|| state.last_value.clone()),
        };
        self.apply(rule, state.state, update).await
    }

    /// Durable apply: state row + history row in one transaction, then the
    /// broadcast, then the webhook when the transition qualifies.
    async fn apply(
        &self,
        rule: &AlarmRule,
        from: AlarmStateKind,
        update: AlarmStateUpdate,
    ) -> Result<(), AlarmError> {
        let now = now_ms();
        let to = update.state;
        self.repo.apply_transition(rule.id, from, &update, now).await?;

        tracing::info!(
            rule_id = rule.id,
            rule = %rule.name,
            from = from.as_str(),
            to = to.as_str(),
            "Alarm transition"
        );

        let transition = AlarmTransition {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            group: rule.identity.group.clone(),
            node: rule.identity.node.clone(),
            device: rule.identity.device.clone(),
            metric: rule.identity.metric.clone(),
            from_state: from,
            to_state: to,
            value: update.last_value.clone(),
            timestamp: now,
        };
        if self.topic.publish(transition.clone()).is_err() {
            tracing::trace!(rule_id = rule.id, "alarmStateChange buffer full, event dropped");
        }

        if webhook_fires(from, to) {
            if let Some(config) = &self.webhook {
                webhook::dispatch(&self.http, config, &transition);
                self.repo.mark_notified(rule.id, now).await?;
            }
        }
        Ok(())
    }

    /// Reset to `normal` with both timestamps cleared.
    async fn force_normal(&self, rule_id: i64, state: &AlarmStateRow) -> Result<(), AlarmError> {
        let rule = match self.rule_by_id(rule_id) {
            Some(rule) => rule,
            None => self.repo.get_rule(rule_id).await?,
        };
        let update = AlarmStateUpdate {
            state: AlarmStateKind::Normal,
            condition_met_at: None,
            activated_at: None,
            last_notified_at: state.last_notified_at,
            last_value: state.last_value.clone(),
        };
        self.apply(&rule, state.state, update).await
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Single-shot monotonic timer. Any prior timer for the rule is
    /// cancelled first.
    fn schedule_timer(self: &Arc<Self>, rule_id: i64, delay_ms: u64) {
        let engine = Arc::clone(self);
        let mut timers = self.timers.lock();
        if let Some(old) = timers.remove(&rule_id) {
            old.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            engine.on_timer_fire(rule_id).await;
        });
        timers.insert(rule_id, handle);
    }

    fn cancel_timer(&self, rule_id: i64) {
        if let Some(handle) = self.timers.lock().remove(&rule_id) {
            handle.abort();
        }
    }

    async fn on_timer_fire(self: Arc<Self>, rule_id: i64) {
        self.timers.lock().remove(&rule_id);
        let Some(rule) = self.rule_by_id(rule_id) else {
            return;
        };
        match self.repo.get_state(rule_id).await {
            Ok(state) if state.state == AlarmStateKind::Pending => {
                let value = state.last_value.clone();
                if let Err(e) = self
                    .transition(&rule, &state, AlarmStateKind::Active, value)
                    .await
                {
                    tracing::warn!(rule_id, error = %e, "Delayed activation failed");
                }
            }
            Ok(_) => {} // condition cleared in the meantime
            Err(e) => {
                tracing::warn!(rule_id, error = %e, "State lookup on timer fire failed");
            }
        }
    }

    /// Cancel all pending timers; their durable states are restored on the
    /// next startup.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        tracing::debug!("Alarm timers cancelled");
    }

    // ========================================================================
    // Rule CRUD
    // ========================================================================

    pub async fn create_rule(&self, mut input: NewAlarmRule) -> Result<AlarmRule, AlarmError> {
        validate_rule(&input)?;
        if !input.rule_type.requires_threshold() {
            input.threshold = None;
        }
        let rule = self.repo.create_rule(&input).await?;
        self.rules
            .write()
            .entry(rule.identity.key())
            .or_default()
            .push(rule.clone());
        Ok(rule)
    }

    pub async fn update_rule(
        self: &Arc<Self>,
        rule_id: i64,
        update: AlarmRuleUpdate,
    ) -> Result<AlarmRule, AlarmError> {
        let mut rule = self.repo.get_rule(rule_id).await?;
        let was_enabled = rule.enabled;

        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(rule_type) = update.rule_type {
            rule.rule_type = rule_type;
        }
        if let Some(threshold) = update.threshold {
            rule.threshold = threshold;
        }
        if let Some(delay_sec) = update.delay_sec {
            rule.delay_sec = delay_sec;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }

        validate_rule(&NewAlarmRule {
            identity: rule.identity.clone(),
            name: rule.name.clone(),
            rule_type: rule.rule_type,
            threshold: rule.threshold,
            delay_sec: rule.delay_sec,
            enabled: rule.enabled,
        })?;
        if !rule.rule_type.requires_threshold() {
            rule.threshold = None;
        }

        let updated = self.repo.update_rule(&rule).await?;
        self.replace_cached(&updated);

        if was_enabled && !updated.enabled {
            self.disable_side_effects(&updated).await?;
        }
        Ok(updated)
    }

    pub async fn set_enabled(
        self: &Arc<Self>,
        rule_id: i64,
        enabled: bool,
    ) -> Result<AlarmRule, AlarmError> {
        self.update_rule(
            rule_id,
            AlarmRuleUpdate {
                name: None,
                rule_type: None,
                threshold: None,
                delay_sec: None,
                enabled: Some(enabled),
            },
        )
        .await
    }

    /// Disabling cancels the pending timer and forces `normal` with both
    /// timestamps cleared.
    async fn disable_side_effects(&self, rule: &AlarmRule) -> Result<(), AlarmError> {
        self.cancel_timer(rule.id);
        let state = self.repo.get_state(rule.id).await?;
        if state.state != AlarmStateKind::Normal
            || state.condition_met_at.is_some()
            || state.activated_at.is_some()
        {
            self.force_normal(rule.id, &state).await?;
        }
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: i64) -> Result<(), AlarmError> {
        self.cancel_timer(rule_id);
        let rule = self.repo.get_rule(rule_id).await?;
        self.repo.delete_rule(rule_id).await?;
        let mut cache = self.rules.write();
        if let Some(rules) = cache.get_mut(&rule.identity.key()) {
            rules.retain(|r| r.id != rule_id);
            if rules.is_empty() {
                cache.remove(&rule.identity.key());
            }
        }
        Ok(())
    }

    /// Acknowledge an active alarm. Only permitted in `active`.
    pub async fn acknowledge(self: &Arc<Self>, rule_id: i64) -> Result<AlarmStateRow, AlarmError> {
        let rule = self.repo.get_rule(rule_id).await?;
        let state = self.repo.get_state(rule_id).await?;
        if state.state != AlarmStateKind::Active {
            return Err(AlarmError::Invariant(format!(
                "alarm {} is '{}', only active alarms can be acknowledged",
                rule_id,
                state.state.as_str()
            )));
        }
        self.transition(&rule, &state, AlarmStateKind::Acknowledged, None)
            .await?;
        Ok(self.repo.get_state(rule_id).await?)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn rules(&self) -> Result<Vec<AlarmRule>, AlarmError> {
        Ok(self.repo.list_rules().await?)
    }

    pub async fn states(&self) -> Result<Vec<AlarmStateRow>, AlarmError> {
        Ok(self.repo.list_states().await?)
    }

    pub async fn history(
        &self,
        rule_id: Option<i64>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<AlarmHistoryEntry>, AlarmError> {
        Ok(self.repo.list_history(rule_id, start, end).await?)
    }

    fn rule_by_id(&self, rule_id: i64) -> Option<AlarmRule> {
        self.rules
            .read()
            .values()
            .flatten()
            .find(|r| r.id == rule_id)
            .cloned()
    }

    fn replace_cached(&self, rule: &AlarmRule) {
        let mut cache = self.rules.write();
        for rules in cache.values_mut() {
            rules.retain(|r| r.id != rule.id);
        }
        cache.retain(|_, rules| !rules.is_empty());
        cache
            .entry(rule.identity.key())
            .or_default()
            .push(rule.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rule_type: AlarmRuleType, threshold: Option<f64>) -> AlarmRule {
        AlarmRule {
            id: 1,
            identity: MetricIdentity::node_metric("G", "N", "M"),
            name: "r".into(),
            rule_type,
            threshold,
            delay_sec: 0,
            enabled: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn condition_true_false() {
        let r = rule(AlarmRuleType::True, None);
        assert!(condition_met(&r, &MetricValue::Int(1)));
        assert!(condition_met(&r, &MetricValue::Bool(true)));
        assert!(!condition_met(&r, &MetricValue::Int(0)));

        let r = rule(AlarmRuleType::False, None);
        assert!(condition_met(&r, &MetricValue::Int(0)));
        assert!(condition_met(&r, &MetricValue::Bool(false)));
        assert!(!condition_met(&r, &MetricValue::Float(0.5)));
    }

    #[test]
    fn condition_above_below() {
        let r = rule(AlarmRuleType::Above, Some(100.0));
        assert!(condition_met(&r, &MetricValue::Float(150.0)));
        assert!(!condition_met(&r, &MetricValue::Float(100.0)));
        assert!(condition_met(&r, &MetricValue::Str("101.5".into())));

        let r = rule(AlarmRuleType::Below, Some(10.0));
        assert!(condition_met(&r, &MetricValue::Int(5)));
        assert!(!condition_met(&r, &MetricValue::Int(10)));
    }

    #[test]
    fn condition_false_without_threshold_or_numeric() {
        let r = rule(AlarmRuleType::Above, None);
        assert!(!condition_met(&r, &MetricValue::Float(1e9)));

        let r = rule(AlarmRuleType::True, None);
        assert!(!condition_met(&r, &MetricValue::Str("running".into())));
        assert!(!condition_met(&r, &MetricValue::Null));
    }

    #[test]
    fn decision_table() {
        use AlarmStateKind::*;
        assert_eq!(decide(Normal, true, 0), Decision::Transition(Active));
        assert_eq!(decide(Normal, true, 30), Decision::EnterPending);
        assert_eq!(decide(Normal, false, 30), Decision::TouchValue);
        assert_eq!(decide(Pending, true, 30), Decision::TouchValue);
        assert_eq!(decide(Pending, false, 30), Decision::Transition(Normal));
        assert_eq!(decide(Active, true, 0), Decision::TouchValue);
        assert_eq!(decide(Active, false, 0), Decision::Transition(Normal));
        assert_eq!(decide(Acknowledged, true, 0), Decision::TouchValue);
        assert_eq!(decide(Acknowledged, false, 0), Decision::Transition(Normal));
    }

    #[test]
    fn webhook_rule() {
        use AlarmStateKind::*;
        assert!(webhook_fires(Normal, Active));
        assert!(webhook_fires(Pending, Active));
        assert!(webhook_fires(Active, Normal));
        assert!(webhook_fires(Acknowledged, Normal));
        assert!(webhook_fires(Pending, Normal));
        assert!(!webhook_fires(Normal, Pending));
        assert!(!webhook_fires(Active, Acknowledged));
    }

    #[test]
    fn remaining_delay_boundary() {
        // 30 s delay, condition met at t=0
        assert_eq!(remaining_delay_ms(30, 0, 10_000), 20_000);
        assert_eq!(remaining_delay_ms(30, 0, 30_000), 0);
        assert!(remaining_delay_ms(30, 0, 31_000) < 0);
    }

    #[test]
    fn rule_validation() {
        let base = NewAlarmRule {
            identity: MetricIdentity::node_metric("G", "N", "M"),
            name: "High temp".into(),
            rule_type: AlarmRuleType::Above,
            threshold: Some(100.0),
            delay_sec: 30,
            enabled: true,
        };
        assert!(validate_rule(&base).is_ok());

        let mut missing_threshold = base.clone();
        missing_threshold.threshold = None;
        assert!(validate_rule(&missing_threshold).is_err());

        let mut no_threshold_needed = base.clone();
        no_threshold_needed.rule_type = AlarmRuleType::True;
        no_threshold_needed.threshold = None;
        assert!(validate_rule(&no_threshold_needed).is_ok());

        let mut negative_delay = base.clone();
        negative_delay.delay_sec = -1;
        assert!(validate_rule(&negative_delay).is_err());

        let mut empty_identity = base.clone();
        empty_identity.identity.metric = String::new();
        assert!(validate_rule(&empty_identity).is_err());

        let mut empty_name = base;
        empty_name.name = String::new();
        assert!(validate_rule(&empty_name).is_err());
    }
}
