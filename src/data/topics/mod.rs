//! In-process pub/sub fabric
//!
//! Topic-based multi-subscriber broadcast for metric updates and alarm
//! transitions. Each topic has a bounded, byte-budgeted publish queue drained
//! by a dispatcher task into a `tokio::broadcast` channel; every subscriber
//! gets its own bounded buffer and lagging subscribers lose events rather
//! than applying backpressure. Throughput is preferred over lossless
//! delivery.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default per-topic publish buffer budget in bytes.
const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Default channel capacity (messages) for the publish queue and each
/// subscriber buffer.
const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum TopicError {
    #[error("publish buffer full")]
    BufferFull,

    #[error("channel closed")]
    ChannelClosed,

    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),

    #[error("topic '{0}' already exists with a different message type")]
    TypeMismatch(String),
}

impl From<broadcast::error::RecvError> for TopicError {
    fn from(e: broadcast::error::RecvError) -> Self {
        match e {
            broadcast::error::RecvError::Closed => TopicError::ChannelClosed,
            broadcast::error::RecvError::Lagged(n) => TopicError::Lagged(n),
        }
    }
}

/// Messages that can be published to topics.
pub trait TopicMessage: Clone + Send + Sync + 'static {
    /// Estimated size in bytes, used for the publish buffer budget.
    fn size_bytes(&self) -> usize;
}

/// Topic configuration.
#[derive(Clone)]
pub struct TopicConfig {
    pub buffer_size: usize,
    pub channel_capacity: usize,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Publisher handle; clone and share across producers.
#[derive(Clone)]
pub struct Publisher<T: TopicMessage> {
    tx: mpsc::Sender<T>,
    buffer_bytes: Arc<AtomicUsize>,
    max_bytes: usize,
}

impl<T: TopicMessage> Publisher<T> {
    /// Publish a message. Fails fast when the buffer budget is exhausted;
    /// the event is dropped, not queued.
    pub fn publish(&self, msg: T) -> Result<(), TopicError> {
        let msg_size = msg.size_bytes();

        loop {
            let current = self.buffer_bytes.load(Ordering::Relaxed);
            if current + msg_size > self.max_bytes {
                return Err(TopicError::BufferFull);
            }
            if self
                .buffer_bytes
                .compare_exchange(
                    current,
                    current + msg_size,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }

        self.tx.try_send(msg).map_err(|_| {
            self.buffer_bytes.fetch_sub(msg_size, Ordering::SeqCst);
            TopicError::ChannelClosed
        })
    }
}

/// Subscriber handle with its own bounded buffer.
pub struct Subscriber<T: TopicMessage> {
    rx: broadcast::Receiver<T>,
}

impl<T: TopicMessage> Subscriber<T> {
    pub async fn recv(&mut self) -> Result<T, TopicError> {
        self.rx.recv().await.map_err(TopicError::from)
    }
}

struct TopicInner<T: TopicMessage> {
    broadcast_tx: broadcast::Sender<T>,
    publisher: Publisher<T>,
}

trait AnyTopic: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: TopicMessage> AnyTopic for TopicInner<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct DispatcherEntry {
    handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

/// Central topic registry. One per process.
pub struct TopicService {
    topics: RwLock<HashMap<String, (TypeId, Arc<dyn AnyTopic>)>>,
    dispatchers: RwLock<Vec<DispatcherEntry>>,
    config: TopicConfig,
}

impl TopicService {
    pub fn new() -> Self {
        Self::with_config(TopicConfig::default())
    }

    pub fn with_config(config: TopicConfig) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            dispatchers: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Create a topic or return the existing handle.
    pub fn topic<T: TopicMessage>(&self, name: &str) -> Result<Topic<T>, TopicError> {
        let type_id = TypeId::of::<T>();
        let mut topics = self.topics.write();

        if let Some((existing_type, topic)) = topics.get(name) {
            if *existing_type == type_id {
                // registered under this TypeId above, downcast cannot fail
                let inner = topic.as_any().downcast_ref::<TopicInner<T>>().unwrap();
                return Ok(Topic {
                    name: name.to_string(),
                    publisher: inner.publisher.clone(),
                    broadcast_tx: inner.broadcast_tx.clone(),
                });
            }
            return Err(TopicError::TypeMismatch(name.to_string()));
        }

        let (mpsc_tx, mpsc_rx) = mpsc::channel(self.config.channel_capacity);
        let (broadcast_tx, _) = broadcast::channel(self.config.channel_capacity);
        let buffer_bytes = Arc::new(AtomicUsize::new(0));

        let publisher = Publisher {
            tx: mpsc_tx,
            buffer_bytes: buffer_bytes.clone(),
            max_bytes: self.config.buffer_size,
        };

        let inner = TopicInner {
            broadcast_tx: broadcast_tx.clone(),
            publisher: publisher.clone(),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = Self::run_dispatcher(mpsc_rx, broadcast_tx.clone(), buffer_bytes, shutdown_rx);
        self.dispatchers
            .write()
            .push(DispatcherEntry { handle, shutdown_tx });

        topics.insert(name.to_string(), (type_id, Arc::new(inner)));

        Ok(Topic {
            name: name.to_string(),
            publisher,
            broadcast_tx,
        })
    }

    fn run_dispatcher<T: TopicMessage>(
        mut rx: mpsc::Receiver<T>,
        broadcast_tx: broadcast::Sender<T>,
        buffer_bytes: Arc<AtomicUsize>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        // drain what was already accepted before exiting
                        while let Ok(msg) = rx.try_recv() {
                            let msg_size = msg.size_bytes();
                            let _ = broadcast_tx.send(msg);
                            buffer_bytes.fetch_sub(msg_size, Ordering::SeqCst);
                        }
                        break;
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => {
                                let msg_size = msg.size_bytes();
                                let _ = broadcast_tx.send(msg);
                                buffer_bytes.fetch_sub(msg_size, Ordering::SeqCst);
                            }
                            None => break,
                        }
                    }
                }
            }
        })
    }

    /// Signal all dispatcher tasks to drain and wait for them.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = std::mem::take(&mut *self.dispatchers.write());
        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            let _ = entry.shutdown_tx.send(());
            handles.push(entry.handle);
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!("Topic dispatchers stopped");
    }
}

impl Default for TopicService {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a single topic.
#[derive(Clone)]
pub struct Topic<T: TopicMessage> {
    name: String,
    publisher: Publisher<T>,
    broadcast_tx: broadcast::Sender<T>,
}

impl<T: TopicMessage> Topic<T> {
    pub fn publisher(&self) -> Publisher<T> {
        self.publisher.clone()
    }

    pub fn subscribe(&self) -> Subscriber<T> {
        Subscriber {
            rx: self.broadcast_tx.subscribe(),
        }
    }

    pub fn publish(&self, msg: T) -> Result<(), TopicError> {
        self.publisher.publish(msg)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestMessage {
        data: String,
        size: usize,
    }

    impl TopicMessage for TestMessage {
        fn size_bytes(&self) -> usize {
            self.size
        }
    }

    fn msg(data: &str, size: usize) -> TestMessage {
        TestMessage {
            data: data.to_string(),
            size,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_messages() {
        let service = TopicService::new();
        let topic = service.topic::<TestMessage>("test").unwrap();
        let mut subscriber = topic.subscribe();

        topic.publish(msg("hello", 10)).unwrap();

        let received = subscriber.recv().await.unwrap();
        assert_eq!(received.data, "hello");
    }

    #[tokio::test]
    async fn all_subscribers_receive_each_message() {
        let service = TopicService::new();
        let topic = service.topic::<TestMessage>("fanout").unwrap();
        let mut sub1 = topic.subscribe();
        let mut sub2 = topic.subscribe();

        topic.publish(msg("broadcast", 10)).unwrap();

        assert_eq!(sub1.recv().await.unwrap().data, "broadcast");
        assert_eq!(sub2.recv().await.unwrap().data, "broadcast");
    }

    #[tokio::test]
    async fn publish_fails_fast_when_budget_exhausted() {
        let service = TopicService::with_config(TopicConfig {
            buffer_size: 100,
            channel_capacity: 10,
        });
        let topic = service.topic::<TestMessage>("bounded").unwrap();

        assert!(topic.publish(msg("a", 60)).is_ok());
        assert!(topic.publish(msg("b", 60)).is_err());
    }

    #[tokio::test]
    async fn budget_is_released_after_dispatch() {
        let service = TopicService::with_config(TopicConfig {
            buffer_size: 100,
            channel_capacity: 10,
        });
        let topic = service.topic::<TestMessage>("bounded").unwrap();
        let mut subscriber = topic.subscribe();

        topic.publish(msg("a", 100)).unwrap();
        let _ = subscriber.recv().await.unwrap();
        tokio::task::yield_now().await;

        assert!(topic.publish(msg("b", 100)).is_ok());
    }

    #[tokio::test]
    async fn same_name_returns_same_topic() {
        let service = TopicService::new();
        let t1 = service.topic::<TestMessage>("shared").unwrap();
        let t2 = service.topic::<TestMessage>("shared").unwrap();
        assert_eq!(t1.name(), t2.name());

        let mut sub = t1.subscribe();
        t2.publish(msg("via-second-handle", 10)).unwrap();
        assert_eq!(sub.recv().await.unwrap().data, "via-second-handle");
    }

    #[tokio::test]
    async fn type_mismatch_is_an_error() {
        #[derive(Clone)]
        struct Other;
        impl TopicMessage for Other {
            fn size_bytes(&self) -> usize {
                0
            }
        }

        let service = TopicService::new();
        let _t = service.topic::<TestMessage>("typed").unwrap();
        assert!(matches!(
            service.topic::<Other>("typed"),
            Err(TopicError::TypeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_drains_pending_messages() {
        let service = TopicService::new();
        let topic = service.topic::<TestMessage>("drain").unwrap();
        let mut subscriber = topic.subscribe();

        topic.publish(msg("pending", 10)).unwrap();
        service.shutdown().await;

        assert_eq!(subscriber.recv().await.unwrap().data, "pending");
    }
}
