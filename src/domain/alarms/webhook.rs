//! Alarm webhook dispatcher
//!
//! POSTs a JSON document per qualifying transition. At-most-once by design:
//! the request is spawned, never retried, and failures log a warning without
//! ever blocking ingestion.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::domain::events::AlarmTransition;

/// Optional shared-secret header.
pub const SECRET_HEADER: &str = "X-Alarm-Webhook-Secret";

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Option<String>,
    pub space_short_id: String,
}

/// The POSTed document: a random event id, the space identifier, the target
/// state as `transition`, and the flattened transition record.
pub fn webhook_body(event_id: &str, space_short_id: &str, transition: &AlarmTransition) -> Value {
    let mut body = json!({
        "eventId": event_id,
        "spaceShortId": space_short_id,
        "transition": transition.to_state.as_str(),
    });
    if let (Value::Object(target), Ok(Value::Object(fields))) =
        (&mut body, serde_json::to_value(transition))
    {
        for (k, v) in fields {
            target.entry(k).or_insert(v);
        }
    }
    body
}

/// Fire-and-forget dispatch.
pub fn dispatch(http: &reqwest::Client, config: &WebhookConfig, transition: &AlarmTransition) {
    let body = webhook_body(
        &Uuid::new_v4().to_string(),
        &config.space_short_id,
        transition,
    );
    let request = {
        let mut builder = http.post(&config.url).json(&body);
        if let Some(secret) = &config.secret {
            builder = builder.header(SECRET_HEADER, secret);
        }
        builder
    };

    let url = config.url.clone();
    let rule_id = transition.rule_id;
    tokio::spawn(async move {
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(rule_id, "Alarm webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(
                    rule_id,
                    url = %url,
                    status = %response.status(),
                    "Alarm webhook rejected"
                );
            }
            Err(e) => {
                tracing::warn!(rule_id, url = %url, error = %e, "Alarm webhook failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::postgres::repositories::AlarmStateKind;

    fn transition(to: AlarmStateKind) -> AlarmTransition {
        AlarmTransition {
            rule_id: 7,
            rule_name: "High temp".into(),
            group: "G1".into(),
            node: "N1".into(),
            device: "".into(),
            metric: "Temp".into(),
            from_state: AlarmStateKind::Pending,
            to_state: to,
            value: Some("150".into()),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn body_carries_event_id_space_and_transition() {
        let body = webhook_body("evt-1", "plant-a", &transition(AlarmStateKind::Active));
        assert_eq!(body["eventId"], "evt-1");
        assert_eq!(body["spaceShortId"], "plant-a");
        assert_eq!(body["transition"], "active");
        assert_eq!(body["ruleId"], 7);
        assert_eq!(body["ruleName"], "High temp");
        assert_eq!(body["metric"], "Temp");
        assert_eq!(body["value"], "150");
        assert_eq!(body["fromState"], "pending");
        assert_eq!(body["timestamp"], 1_700_000_000_000_i64);
    }

    #[test]
    fn transition_field_reflects_target_state() {
        let body = webhook_body("evt-2", "plant-a", &transition(AlarmStateKind::Normal));
        assert_eq!(body["transition"], "normal");
    }
}
