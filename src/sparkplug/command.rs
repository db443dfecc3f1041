//! Command write path
//!
//! `write_metric` publishes an NCMD/DCMD frame carrying a single metric with
//! an inferred type. Control commands (`Node Control/*`, `Device Control/*`
//! metric names) travel the same path; the prefix is part of the metric name.

use std::sync::atomic::{AtomicU64, Ordering};

use prost::Message as _;
use rumqttc::{AsyncClient, ClientError, QoS};
use thiserror::Error;

use crate::model::identity::MetricIdentity;
use crate::utils::time::now_ms;

use super::proto::{Metric, Payload, datatype, metric};
use super::topic::{dcmd_topic, ncmd_topic};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("MQTT publish failed: {0}")]
    Publish(#[from] ClientError),
}

/// A typed command value inferred from the caller-supplied string.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    Bool(bool),
    Float(f32),
    Str(String),
}

/// `true`/`false` become Boolean, numeric strings become Float, everything
/// else is a String.
pub fn infer_command_value(raw: &str) -> CommandValue {
    match raw {
        "true" => CommandValue::Bool(true),
        "false" => CommandValue::Bool(false),
        _ => match raw.parse::<f32>() {
            Ok(v) => CommandValue::Float(v),
            Err(_) => CommandValue::Str(raw.to_string()),
        },
    }
}

/// Publishes Sparkplug command frames with a per-process sequence counter.
pub struct MetricCommander {
    client: AsyncClient,
    seq: AtomicU64,
}

impl MetricCommander {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            seq: AtomicU64::new(0),
        }
    }

    /// Sequence numbers wrap at 256 per the Sparkplug-B rules.
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) % 256
    }

    /// Publish a command writing `value` to the metric at `identity`.
    /// Node-level identities (empty device) publish NCMD, device-level DCMD.
    pub async fn write_metric(
        &self,
        identity: &MetricIdentity,
        value: &str,
    ) -> Result<(), CommandError> {
        let topic = if identity.device.is_empty() {
            ncmd_topic(&identity.group, &identity.node)
        } else {
            dcmd_topic(&identity.group, &identity.node, &identity.device)
        };

        let payload = command_payload(&identity.metric, infer_command_value(value), self.next_seq());
        let buf = payload.encode_to_vec();

        tracing::debug!(
            topic = %topic,
            metric = %identity.metric,
            "Publishing command"
        );
        self.client
            .publish(topic, QoS::AtLeastOnce, false, buf)
            .await?;
        Ok(())
    }
}

fn command_payload(metric_name: &str, value: CommandValue, seq: u64) -> Payload {
    let (code, wire_value) = match value {
        CommandValue::Bool(v) => (datatype::BOOLEAN, metric::Value::BooleanValue(v)),
        CommandValue::Float(v) => (datatype::FLOAT, metric::Value::FloatValue(v)),
        CommandValue::Str(v) => (datatype::STRING, metric::Value::StringValue(v)),
    };
    let now = now_ms() as u64;
    Payload {
        timestamp: Some(now),
        metrics: vec![Metric {
            name: Some(metric_name.to_string()),
            timestamp: Some(now),
            datatype: Some(code),
            value: Some(wire_value),
            ..Default::default()
        }],
        seq: Some(seq),
        uuid: None,
        body: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_inference() {
        assert_eq!(infer_command_value("true"), CommandValue::Bool(true));
        assert_eq!(infer_command_value("false"), CommandValue::Bool(false));
        assert_eq!(infer_command_value("72.5"), CommandValue::Float(72.5));
        assert_eq!(infer_command_value("-3"), CommandValue::Float(-3.0));
        assert_eq!(
            infer_command_value("START"),
            CommandValue::Str("START".into())
        );
        // only exact lowercase literals are booleans
        assert_eq!(infer_command_value("True"), CommandValue::Str("True".into()));
    }

    #[test]
    fn payload_carries_one_typed_metric_and_seq() {
        let p = command_payload("Node Control/Rebirth", CommandValue::Bool(true), 7);
        assert_eq!(p.seq, Some(7));
        assert_eq!(p.metrics.len(), 1);
        let m = &p.metrics[0];
        assert_eq!(m.name.as_deref(), Some("Node Control/Rebirth"));
        assert_eq!(m.datatype, Some(datatype::BOOLEAN));
        assert_eq!(m.value, Some(metric::Value::BooleanValue(true)));
    }

    #[test]
    fn numeric_command_is_float() {
        let p = command_payload("Setpoint", CommandValue::Float(101.5), 0);
        assert_eq!(p.metrics[0].datatype, Some(datatype::FLOAT));
        assert_eq!(p.metrics[0].value, Some(metric::Value::FloatValue(101.5)));
    }

    #[tokio::test]
    async fn sequence_wraps_at_256() {
        let (client, _eventloop) =
            AsyncClient::new(rumqttc::MqttOptions::new("t", "localhost", 1883), 10);
        let commander = MetricCommander::new(client);
        for _ in 0..255 {
            commander.next_seq();
        }
        assert_eq!(commander.next_seq(), 255);
        assert_eq!(commander.next_seq(), 0);
    }
}
