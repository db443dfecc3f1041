//! Hot-value cache
//!
//! Optional Redis-backed cache of the last value per metric identity. Keys
//! are the identity JSON, values the flattened metric JSON. One pooled
//! *publisher* side handles `SET`/`DEL`/`SCAN`; one dedicated *subscriber*
//! connection enables keyspace notifications and psubscribes
//! `__keyevent@0__:*`; each `set` event fetches the current value into a
//! buffer that a fixed 1 s drain publishes on the `metricUpdate` topic.
//!
//! Connection establishment is the only retried operation (bounded count,
//! fixed delay). When the cache is unreachable the process falls back to the
//! in-memory pub/sub path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::redis::AsyncCommands;
use deadpool_redis::{Config, Pool, Runtime};
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::data::topics::{Topic, TopicService};
use crate::domain::events::{MetricUpdate, TOPIC_METRIC_UPDATE};
use crate::model::identity::{IdentityScope, MetricIdentity};
use crate::model::topology::{Host, MetricNode};
use crate::model::value::MetricValue;

/// Fixed delay between connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Bounded connection attempts before falling back to in-memory pub/sub.
const CONNECT_MAX_RETRIES: u32 = 5;

/// Interval of the notification drain.
const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Keyspace-notification pattern (database 0).
const KEYEVENT_PATTERN: &str = "__keyevent@0__:*";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection failed: {0}")]
    Connection(String),

    #[error("cache pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("cache command failed: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),
}

/// The value stored per identity key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub value: MetricValue,
    pub timestamp: i64,
}

pub struct HotValueCache {
    pool: Pool,
    url: String,
    pending: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl HotValueCache {
    /// Connect with bounded retries and a fixed delay. Returns an error only
    /// after the final attempt fails; the caller decides on the fallback.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let config = Config::from_url(url);
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Connection(format!("failed to create pool: {e}")))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::ping(&pool).await {
                Ok(()) => break,
                Err(e) if attempt < CONNECT_MAX_RETRIES => {
                    tracing::warn!(
                        attempt,
                        max = CONNECT_MAX_RETRIES,
                        error = %e,
                        "Hot cache unreachable, retrying"
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!("Hot-value cache connected");
        Ok(Self {
            pool,
            url: url.to_string(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn ping(pool: &Pool) -> Result<(), CacheError> {
        let mut conn = pool.get().await?;
        deadpool_redis::redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    /// `SET` the current value for an identity.
    pub async fn set_current(
        &self,
        identity: &MetricIdentity,
        entry: &CacheEntry,
    ) -> Result<(), CacheError> {
        let key = identity.cache_key();
        let value = serde_json::to_string(entry)
            .map_err(|e| CacheError::Connection(format!("encode failed: {e}")))?;
        let mut conn = self.pool.get().await?;
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    /// Remove every key whose identity falls under `scope` (delete cascade
    /// step b). Unparseable keys are skipped, never fatal.
    pub async fn delete_scope(&self, scope: &IdentityScope) -> Result<u64, CacheError> {
        let keys = self.all_keys().await?;
        let mut conn = self.pool.get().await?;
        let mut removed = 0;
        for key in keys {
            let Ok(identity) = serde_json::from_str::<MetricIdentity>(&key) else {
                tracing::debug!(key = %key, "Skipping non-identity cache key");
                continue;
            };
            if scope.matches(&identity) {
                conn.del::<_, ()>(&key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Fold every cached entry into a `Host` projection. Entries that fail
    /// to parse are logged and skipped.
    pub async fn rebuild_host(&self) -> Result<Host, CacheError> {
        let keys = self.all_keys().await?;
        let mut conn = self.pool.get().await?;
        let mut host = Host::default();
        for key in keys {
            let identity = match serde_json::from_str::<MetricIdentity>(&key) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Malformed cache key");
                    continue;
                }
            };
            let raw: Option<String> = conn.get(&key).await?;
            let Some(raw) = raw else { continue };
            let entry = match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Malformed cache value");
                    continue;
                }
            };
            host.upsert_metric(&identity, metric_node(entry));
        }
        Ok(host)
    }

    async fn all_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut conn = self.pool.get().await?;
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>("*").await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Start the keyspace-notification feed: one subscriber task buffering
    /// `set` events, one drain task publishing the accumulated batch every
    /// second on the `metricUpdate` topic.
    pub fn start_feed(
        self: &Arc<Self>,
        topics: &TopicService,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, CacheError> {
        let topic: Topic<MetricUpdate> = topics
            .topic(TOPIC_METRIC_UPDATE)
            .map_err(|e| CacheError::Connection(format!("topic setup failed: {e}")))?;

        let subscriber = self.spawn_subscriber(shutdown_rx.clone());
        let drainer = self.spawn_drainer(topic, shutdown_rx);
        Ok(vec![subscriber, drainer])
    }

    fn spawn_subscriber(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match cache.run_subscriber(&mut shutdown_rx).await {
                    Ok(()) => break, // clean shutdown
                    Err(e) => {
                        tracing::warn!(error = %e, "Cache subscriber error, reconnecting");
                        tokio::select! {
                            _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                }
            }
            tracing::debug!("Cache subscriber stopped");
        })
    }

    /// One subscriber session: dedicated connection, notifications enabled,
    /// pattern subscription, buffer every `set` event.
    async fn run_subscriber(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), CacheError> {
        // Keyspace notifications are a server-side config; KEA covers all
        // event classes.
        {
            let mut conn = self.pool.get().await?;
            deadpool_redis::redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("KEA")
                .query_async::<()>(&mut conn)
                .await?;
        }

        let client = deadpool_redis::redis::Client::open(self.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(KEYEVENT_PATTERN).await?;
        tracing::debug!(pattern = KEYEVENT_PATTERN, "Cache keyspace feed subscribed");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(CacheError::Connection("subscriber stream closed".into()));
                    };
                    if !msg.get_channel_name().ends_with(":set") {
                        continue;
                    }
                    let key: String = match msg.get_payload() {
                        Ok(key) => key,
                        Err(e) => {
                            tracing::debug!(error = %e, "Unreadable keyevent payload");
                            continue;
                        }
                    };
                    self.buffer_key(&key).await;
                }
            }
        }
    }

    /// Fetch the current value for a notified key into the pending buffer.
    async fn buffer_key(&self, key: &str) {
        if serde_json::from_str::<MetricIdentity>(key).is_err() {
            // foreign key in a shared database, not ours
            return;
        }
        let raw: Option<String> = match self.pool.get().await {
            Ok(mut conn) => match conn.get(key).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::debug!(error = %e, "Cache fetch after notification failed");
                    return;
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "Cache pool unavailable for notification");
                return;
            }
        };
        let Some(raw) = raw else { return };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => {
                self.pending.lock().insert(key.to_string(), entry);
            }
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "Malformed cache value in notification");
            }
        }
    }

    fn spawn_drainer(
        self: &Arc<Self>,
        topic: Topic<MetricUpdate>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DRAIN_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            cache.drain_into(&topic);
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        cache.drain_into(&topic);
                    }
                }
            }
            tracing::debug!("Cache drainer stopped");
        })
    }

    fn drain_into(&self, topic: &Topic<MetricUpdate>) {
        let batch: Vec<(String, CacheEntry)> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (key, entry) in batch {
            let Ok(identity) = serde_json::from_str::<MetricIdentity>(&key) else {
                continue;
            };
            let update = MetricUpdate::from_cache(&identity, &entry);
            if topic.publish(update).is_err() {
                tracing::trace!("metricUpdate buffer full, dropping cache batch event");
            }
        }
    }
}

fn metric_node(entry: CacheEntry) -> MetricNode {
    MetricNode {
        name: entry.name,
        metric_type: entry.metric_type,
        value: entry.value,
        timestamp: entry.timestamp,
        scan_rate: None,
        properties: Vec::new(),
        template: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_entry_round_trips() {
        let entry = CacheEntry {
            name: "Temp".into(),
            metric_type: "Float".into(),
            value: MetricValue::Float(72.5),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""type":"Float""#));
        let parsed: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn metric_node_projection_keeps_value_and_type() {
        let node = metric_node(CacheEntry {
            name: "Temp".into(),
            metric_type: "Float".into(),
            value: MetricValue::Float(1.5),
            timestamp: 42,
        });
        assert_eq!(node.metric_type, "Float");
        assert_eq!(node.value, MetricValue::Float(1.5));
        assert_eq!(node.timestamp, 42);
    }
}
