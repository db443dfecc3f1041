//! Alarm persistence: rules, one durable state row per rule, and the
//! append-only transition history. State and history rows share the rule's
//! lifetime through FK cascade.

use sqlx::{PgPool, QueryBuilder};

use crate::data::error::DataError;
use crate::model::identity::MetricIdentity;
use crate::utils::time::now_ms;

/// Rule condition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmRuleType {
    True,
    False,
    Above,
    Below,
}

impl AlarmRuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Above => "above",
            Self::Below => "below",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "true" => Some(Self::True),
            "false" => Some(Self::False),
            "above" => Some(Self::Above),
            "below" => Some(Self::Below),
            _ => None,
        }
    }

    pub fn requires_threshold(&self) -> bool {
        matches!(self, Self::Above | Self::Below)
    }
}

/// Alarm state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmStateKind {
    Normal,
    Pending,
    Active,
    Acknowledged,
}

impl AlarmStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "acknowledged" => Some(Self::Acknowledged),
            _ => None,
        }
    }
}

/// A persisted alarm rule.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AlarmRule {
    pub id: i64,
    #[serde(flatten)]
    pub identity: MetricIdentity,
    pub name: String,
    pub rule_type: AlarmRuleType,
    pub threshold: Option<f64>,
    pub delay_sec: i64,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for rule creation.
#[derive(Debug, Clone)]
pub struct NewAlarmRule {
    pub identity: MetricIdentity,
    pub name: String,
    pub rule_type: AlarmRuleType,
    pub threshold: Option<f64>,
    pub delay_sec: i64,
    pub enabled: bool,
}

/// The durable state row of one rule.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AlarmStateRow {
    pub rule_id: i64,
    pub state: AlarmStateKind,
    pub condition_met_at: Option<i64>,
    pub activated_at: Option<i64>,
    pub last_notified_at: Option<i64>,
    pub last_value: Option<String>,
    pub updated_at: i64,
}

/// Full replacement for a state row (durability requires every transition to
/// write the complete row).
#[derive(Debug, Clone)]
pub struct AlarmStateUpdate {
    pub state: AlarmStateKind,
    pub condition_met_at: Option<i64>,
    pub activated_at: Option<i64>,
    pub last_notified_at: Option<i64>,
    pub last_value: Option<String>,
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AlarmHistoryEntry {
    pub id: i64,
    pub rule_id: i64,
    pub from_state: AlarmStateKind,
    pub to_state: AlarmStateKind,
    pub value: Option<String>,
    pub ts: i64,
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: i64,
    group_id: String,
    node_id: String,
    device_id: String,
    metric: String,
    name: String,
    rule_type: String,
    threshold: Option<f64>,
    delay_sec: i64,
    enabled: bool,
    created_at: i64,
    updated_at: i64,
}

impl RuleRow {
    fn into_rule(self) -> Result<AlarmRule, DataError> {
        let rule_type = AlarmRuleType::parse(&self.rule_type)
            .ok_or_else(|| DataError::InvalidInput(format!("unknown rule type {}", self.rule_type)))?;
        Ok(AlarmRule {
            id: self.id,
            identity: MetricIdentity::new(self.group_id, self.node_id, self.device_id, self.metric),
            name: self.name,
            rule_type,
            threshold: self.threshold,
            delay_sec: self.delay_sec,
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    rule_id: i64,
    state: String,
    condition_met_at: Option<i64>,
    activated_at: Option<i64>,
    last_notified_at: Option<i64>,
    last_value: Option<String>,
    updated_at: i64,
}

impl StateRow {
    fn into_state(self) -> Result<AlarmStateRow, DataError> {
        let state = AlarmStateKind::parse(&self.state)
            .ok_or_else(|| DataError::InvalidInput(format!("unknown alarm state {}", self.state)))?;
        Ok(AlarmStateRow {
            rule_id: self.rule_id,
            state,
            condition_met_at: self.condition_met_at,
            activated_at: self.activated_at,
            last_notified_at: self.last_notified_at,
            last_value: self.last_value,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    rule_id: i64,
    from_state: String,
    to_state: String,
    value: Option<String>,
    ts: i64,
}

const RULE_COLUMNS: &str = "id, group_id, node_id, device_id, metric, name, rule_type, \
                            threshold, delay_sec, enabled, created_at, updated_at";

const STATE_COLUMNS: &str = "rule_id, state, condition_met_at, activated_at, \
                             last_notified_at, last_value, updated_at";

#[derive(Clone)]
pub struct AlarmRepo {
    pool: PgPool,
}

impl AlarmRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a rule and its initial `normal` state row atomically.
    pub async fn create_rule(&self, input: &NewAlarmRule) -> Result<AlarmRule, DataError> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let row: RuleRow = sqlx::query_as(&format!(
            "INSERT INTO alarm_rules \
             (group_id, node_id, device_id, metric, name, rule_type, threshold, delay_sec, \
              enabled, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
             RETURNING {RULE_COLUMNS}"
        ))
        .bind(&input.identity.group)
        .bind(&input.identity.node)
        .bind(&input.identity.device)
        .bind(&input.identity.metric)
        .bind(&input.name)
        .bind(input.rule_type.as_str())
        .bind(input.threshold)
        .bind(input.delay_sec)
        .bind(input.enabled)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO alarm_state (rule_id, state, updated_at) VALUES ($1, 'normal', $2)")
            .bind(row.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        row.into_rule()
    }

    /// Replace the mutable fields of a rule.
    pub async fn update_rule(&self, rule: &AlarmRule) -> Result<AlarmRule, DataError> {
        let row: Option<RuleRow> = sqlx::query_as(&format!(
            "UPDATE alarm_rules SET name = $2, rule_type = $3, threshold = $4, delay_sec = $5, \
             enabled = $6, updated_at = $7 \
             WHERE id = $1 RETURNING {RULE_COLUMNS}"
        ))
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.rule_type.as_str())
        .bind(rule.threshold)
        .bind(rule.delay_sec)
        .bind(rule.enabled)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| DataError::NotFound(format!("alarm rule {}", rule.id)))?
            .into_rule()
    }

    /// Delete a rule. State and history rows go with it (FK cascade).
    pub async fn delete_rule(&self, rule_id: i64) -> Result<(), DataError> {
        let result = sqlx::query("DELETE FROM alarm_rules WHERE id = $1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DataError::NotFound(format!("alarm rule {rule_id}")));
        }
        Ok(())
    }

    pub async fn get_rule(&self, rule_id: i64) -> Result<AlarmRule, DataError> {
        let row: Option<RuleRow> =
            sqlx::query_as(&format!("SELECT {RULE_COLUMNS} FROM alarm_rules WHERE id = $1"))
                .bind(rule_id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| DataError::NotFound(format!("alarm rule {rule_id}")))?
            .into_rule()
    }

    pub async fn list_rules(&self) -> Result<Vec<AlarmRule>, DataError> {
        let rows: Vec<RuleRow> =
            sqlx::query_as(&format!("SELECT {RULE_COLUMNS} FROM alarm_rules ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(RuleRow::into_rule).collect()
    }

    pub async fn get_state(&self, rule_id: i64) -> Result<AlarmStateRow, DataError> {
        let row: Option<StateRow> =
            sqlx::query_as(&format!("SELECT {STATE_COLUMNS} FROM alarm_state WHERE rule_id = $1"))
                .bind(rule_id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| DataError::NotFound(format!("alarm state for rule {rule_id}")))?
            .into_state()
    }

    pub async fn list_states(&self) -> Result<Vec<AlarmStateRow>, DataError> {
        let rows: Vec<StateRow> =
            sqlx::query_as(&format!("SELECT {STATE_COLUMNS} FROM alarm_state ORDER BY rule_id"))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(StateRow::into_state).collect()
    }

    /// Write a state transition durably: full state row replacement plus one
    /// history row, in a single transaction.
    pub async fn apply_transition(
        &self,
        rule_id: i64,
        from: AlarmStateKind,
        update: &AlarmStateUpdate,
        ts: i64,
    ) -> Result<(), DataError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE alarm_state SET state = $2, condition_met_at = $3, activated_at = $4, \
             last_notified_at = $5, last_value = $6, updated_at = $7 \
             WHERE rule_id = $1",
        )
        .bind(rule_id)
        .bind(update.state.as_str())
        .bind(update.condition_met_at)
        .bind(update.activated_at)
        .bind(update.last_notified_at)
        .bind(&update.last_value)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        if from != update.state {
            sqlx::query(
                "INSERT INTO alarm_history (rule_id, from_state, to_state, value, ts) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(rule_id)
            .bind(from.as_str())
            .bind(update.state.as_str())
            .bind(&update.last_value)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Touch `last_value` without a state transition.
    pub async fn update_last_value(
        &self,
        rule_id: i64,
        value: &str,
        ts: i64,
    ) -> Result<(), DataError> {
        sqlx::query("UPDATE alarm_state SET last_value = $2, updated_at = $3 WHERE rule_id = $1")
            .bind(rule_id)
            .bind(value)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the notified timestamp after a webhook fires.
    pub async fn mark_notified(&self, rule_id: i64, ts: i64) -> Result<(), DataError> {
        sqlx::query("UPDATE alarm_state SET last_notified_at = $2 WHERE rule_id = $1")
            .bind(rule_id)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_history(
        &self,
        rule_id: Option<i64>,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Vec<AlarmHistoryEntry>, DataError> {
        let mut qb = QueryBuilder::new(
            "SELECT id, rule_id, from_state, to_state, value, ts FROM alarm_history WHERE TRUE",
        );
        if let Some(rule_id) = rule_id {
            qb.push(" AND rule_id = ");
            qb.push_bind(rule_id);
        }
        if let Some(start) = start {
            qb.push(" AND ts >= ");
            qb.push_bind(start);
        }
        if let Some(end) = end {
            qb.push(" AND ts <= ");
            qb.push_bind(end);
        }
        qb.push(" ORDER BY ts DESC, id DESC");

        let rows: Vec<HistoryRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let from_state = AlarmStateKind::parse(&row.from_state).ok_or_else(|| {
                    DataError::InvalidInput(format!("unknown alarm state {}", row.from_state))
                })?;
                let to_state = AlarmStateKind::parse(&row.to_state).ok_or_else(|| {
                    DataError::InvalidInput(format!("unknown alarm state {}", row.to_state))
                })?;
                Ok(AlarmHistoryEntry {
                    id: row.id,
                    rule_id: row.rule_id,
                    from_state,
                    to_state,
                    value: row.value,
                    ts: row.ts,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_type_round_trips() {
        for ty in [
            AlarmRuleType::True,
            AlarmRuleType::False,
            AlarmRuleType::Above,
            AlarmRuleType::Below,
        ] {
            assert_eq!(AlarmRuleType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(AlarmRuleType::parse("between"), None);
    }

    #[test]
    fn threshold_requirement() {
        assert!(AlarmRuleType::Above.requires_threshold());
        assert!(AlarmRuleType::Below.requires_threshold());
        assert!(!AlarmRuleType::True.requires_threshold());
        assert!(!AlarmRuleType::False.requires_threshold());
    }

    #[test]
    fn state_kind_round_trips() {
        for state in [
            AlarmStateKind::Normal,
            AlarmStateKind::Pending,
            AlarmStateKind::Active,
            AlarmStateKind::Acknowledged,
        ] {
            assert_eq!(AlarmStateKind::parse(state.as_str()), Some(state));
        }
        assert_eq!(AlarmStateKind::parse("armed"), None);
    }
}
