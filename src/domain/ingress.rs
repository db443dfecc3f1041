//! Sparkplug ingress
//!
//! The MQTT subscriber and dispatch pipeline. One task polls the event loop;
//! each NBIRTH/DBIRTH/NDATA/DDATA frame is decoded and its metrics flow, in
//! arrival order, into the topology, the historian, the property store, the
//! alarm engine and the live update path (hot cache when connected, the
//! in-memory `metricUpdate` topic otherwise).
//!
//! Alarm evaluation is awaited inline so per-identity evaluation order is
//! preserved; its errors are logged and swallowed. Property upserts carry no
//! ordering requirement and are spawned fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::MqttConfig;
use crate::data::cache::{CacheEntry, HotValueCache};
use crate::data::error::DataError;
use crate::data::postgres::repositories::{HistoryRepo, PropertyRepo};
use crate::data::topics::Topic;
use crate::domain::alarms::AlarmEngine;
use crate::domain::events::MetricUpdate;
use crate::model::identity::MetricIdentity;
use crate::model::topology::{MetricNode, MetricProperty, TopologyService};
use crate::sparkplug::payload::{self, DecodedMetric};
use crate::sparkplug::topic::{SparkplugTopic, subscription_filters};
use crate::utils::time::now_ms;

/// Delay before re-polling after an event-loop error.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT configuration error: {0}")]
    Config(String),
}

/// Everything the frame pipeline fans out into.
pub struct IngressDeps {
    pub topology: Arc<TopologyService>,
    pub history: HistoryRepo,
    pub properties: PropertyRepo,
    pub alarms: Arc<AlarmEngine>,
    pub cache: Option<Arc<HotValueCache>>,
    pub metric_topic: Topic<MetricUpdate>,
    pub historian: bool,
}

pub struct SparkplugIngress;

impl SparkplugIngress {
    /// Connect, subscribe to the four topic classes and start the poll task.
    /// Returns the client (for the command write path) and the task handle.
    pub fn start(
        config: &MqttConfig,
        deps: IngressDeps,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(AsyncClient, JoinHandle<()>), IngressError> {
        let options = mqtt_options(config)?;
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let filters = subscription_filters(config.shared_group.as_deref());
        let task_client = client.clone();
        let deps = Arc::new(deps);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            let _ = task_client.disconnect().await;
                            break;
                        }
                    }
                    event = eventloop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("MQTT connected, subscribing");
                            for filter in &filters {
                                if let Err(e) =
                                    task_client.subscribe(filter, QoS::AtLeastOnce).await
                                {
                                    tracing::error!(filter = %filter, error = %e, "Subscribe failed");
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            handle_frame(&deps, &publish.topic, &publish.payload).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "MQTT event loop error");
                            tokio::select! {
                                _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                                _ = shutdown_rx.changed() => {}
                            }
                        }
                    }
                }
            }
            tracing::debug!("Sparkplug ingress stopped");
        });

        Ok((client, handle))
    }
}

fn mqtt_options(config: &MqttConfig) -> Result<MqttOptions, IngressError> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
    options.set_clean_session(true);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    if config.tls {
        let ca_path = config.ca_file.as_ref().ok_or_else(|| {
            IngressError::Config("mqtts requires a CA file (MANTLE_SSL_CA)".into())
        })?;
        let ca = std::fs::read(ca_path)
            .map_err(|e| IngressError::Config(format!("cannot read CA file: {e}")))?;

        let client_auth = match (&config.client_cert, &config.client_key) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).map_err(|e| {
                    IngressError::Config(format!("cannot read client certificate: {e}"))
                })?;
                let key = std::fs::read(key_path)
                    .map_err(|e| IngressError::Config(format!("cannot read client key: {e}")))?;
                Some((cert, key))
            }
            _ => None,
        };

        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }
    Ok(options)
}

/// Decode one frame and fan its metrics out. Decode failures and foreign
/// topics drop the frame with a log line; ingestion continues.
async fn handle_frame(deps: &IngressDeps, topic: &str, raw: &[u8]) {
    let Some(parsed) = SparkplugTopic::parse(topic) else {
        tracing::trace!(topic = %topic, "Ignoring non-Sparkplug topic");
        return;
    };
    if !parsed.kind.is_birth() && !parsed.kind.is_data() {
        return;
    }

    let decoded = match payload::decode(raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "Dropping undecodable frame");
            return;
        }
    };

    let device = parsed.device.unwrap_or_default();
    tracing::trace!(
        group = %parsed.group,
        node = %parsed.node,
        device = %device,
        metrics = decoded.metrics.len(),
        "Processing frame"
    );

    for metric in &decoded.metrics {
        let identity = MetricIdentity::new(
            parsed.group.clone(),
            parsed.node.clone(),
            device.clone(),
            metric.name.clone(),
        );
        let ts = resolve_timestamp(metric.timestamp, decoded.timestamp);
        process_metric(deps, &identity, metric, ts).await;
    }
}

/// Effective timestamp: per-metric, then payload, then ingress wall clock.
fn resolve_timestamp(metric_ts: Option<i64>, payload_ts: Option<i64>) -> i64 {
    metric_ts.or(payload_ts).unwrap_or_else(now_ms)
}

/// The `scanRate` property, when a frame carries one.
fn scan_rate_of(properties: &[MetricProperty]) -> Option<i64> {
    properties
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case("scanRate"))
        .and_then(|p| p.value.as_f64())
        .map(|v| v as i64)
}

async fn process_metric(
    deps: &IngressDeps,
    identity: &MetricIdentity,
    metric: &DecodedMetric,
    ts: i64,
) {
    if let Some(def) = &metric.template_def {
        deps.topology.register_template(def.clone());
    }

    deps.topology.upsert_metric(
        identity,
        MetricNode {
            name: metric.name.clone(),
            metric_type: metric.metric_type.clone(),
            value: metric.value.clone(),
            timestamp: ts,
            scan_rate: scan_rate_of(&metric.properties),
            properties: metric.properties.clone(),
            template: metric.template_ref.clone(),
        },
    );

    if deps.historian {
        match deps
            .history
            .record_sample(identity, ts, &metric.value, &metric.metric_type)
            .await
        {
            Ok(()) => {}
            Err(e) if matches!(e, DataError::Conflict(_)) => {
                tracing::trace!(identity = %identity.key(), "Duplicate sample");
            }
            Err(e) => {
                tracing::warn!(identity = %identity.key(), error = %e, "Sample dropped");
            }
        }
    }

    if !metric.properties.is_empty() {
        let repo = deps.properties.clone();
        let id = identity.clone();
        let props = metric.properties.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.upsert(&id, &props, ts).await {
                tracing::warn!(identity = %id.key(), error = %e, "Property upsert failed");
            }
        });
    }

    deps.alarms.evaluate(identity, &metric.value).await;

    match &deps.cache {
        Some(cache) => {
            let entry = CacheEntry {
                name: metric.name.clone(),
                metric_type: metric.metric_type.clone(),
                value: metric.value.clone(),
                timestamp: ts,
            };
            if let Err(e) = cache.set_current(identity, &entry).await {
                tracing::warn!(identity = %identity.key(), error = %e, "Hot-cache write failed");
            }
        }
        None => {
            let update = MetricUpdate::new(identity, &metric.metric_type, &metric.value, ts);
            if deps.metric_topic.publish(update).is_err() {
                tracing::trace!("metricUpdate buffer full, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::value::MetricValue;

    #[test]
    fn timestamp_resolution_order() {
        assert_eq!(resolve_timestamp(Some(5), Some(9)), 5);
        assert_eq!(resolve_timestamp(None, Some(9)), 9);
        let now = resolve_timestamp(None, None);
        assert!(now > 1_672_531_200_000);
    }

    #[test]
    fn scan_rate_reads_the_property_case_insensitively() {
        let props = vec![
            MetricProperty {
                name: "engUnit".into(),
                value: MetricValue::Str("degF".into()),
                property_type: "String".into(),
            },
            MetricProperty {
                name: "ScanRate".into(),
                value: MetricValue::Int(1000),
                property_type: "Int64".into(),
            },
        ];
        assert_eq!(scan_rate_of(&props), Some(1000));
        assert_eq!(scan_rate_of(&props[..1]), None);
    }
}
