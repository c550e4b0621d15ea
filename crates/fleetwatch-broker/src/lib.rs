// In-process pub/sub broker used as the local bus for load runs, demos and tests.
// Topics fan out to per-subscriber bounded queues; a slow subscriber drops
// locally instead of stalling publishers. Connections are accounted so callers
// can verify that every opened connection is released exactly once.
use ahash::RandomState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, mpsc};

mod connection;

pub use connection::{ConnectionGuard, ConnectionStats};
use connection::ConnectionTable;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("subscriber queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("connection refused for client {client_id}: {reason}")]
    ConnectionRefused {
        client_id: String,
        reason: &'static str,
    },
}

const DEFAULT_SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// What a publish does when one subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubQueuePolicy {
    /// Publisher waits for queue space.
    Block,
    /// The incoming payload is dropped for that subscriber only.
    #[default]
    DropNew,
}

/// Per-topic delivery accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopicStats {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug)]
struct Topic {
    name: Arc<str>,
    capacity: usize,
    policy: SubQueuePolicy,
    // Written on subscribe/unsubscribe only; publish reads `fanout`.
    registry: Mutex<Slab<mpsc::Sender<Bytes>>>,
    fanout: ArcSwap<Vec<(usize, mpsc::Sender<Bytes>)>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Topic {
    fn new(name: &str, capacity: usize, policy: SubQueuePolicy) -> Self {
        Self {
            name: Arc::from(name),
            capacity,
            policy,
            registry: Mutex::new(Slab::new()),
            fanout: ArcSwap::from_pointee(Vec::new()),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn attach(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut registry = self.registry.lock();
        let slot = registry.insert(tx);
        self.republish(&registry);
        Subscription {
            topic: Arc::clone(&self.name),
            receiver: rx,
            slot,
            owner: Arc::downgrade(self),
        }
    }

    fn detach(&self, slots: &[usize]) {
        let mut registry = self.registry.lock();
        let before = registry.len();
        for &slot in slots {
            registry.try_remove(slot);
        }
        if registry.len() != before {
            self.republish(&registry);
        }
    }

    fn republish(&self, registry: &Slab<mpsc::Sender<Bytes>>) {
        let fanout = registry
            .iter()
            .map(|(slot, tx)| (slot, tx.clone()))
            .collect::<Vec<_>>();
        self.fanout.store(Arc::new(fanout));
    }

    fn stats(&self) -> TopicStats {
        TopicStats {
            subscribers: self.registry.lock().len(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    async fn fan_out(&self, payload: Bytes) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let fanout = self.fanout.load_full();
        let mut gone = Vec::new();
        let mut delivered = 0usize;
        for (slot, tx) in fanout.iter() {
            let outcome = match self.policy {
                SubQueuePolicy::Block => tx.send(payload.clone()).await.map_err(|_| true),
                SubQueuePolicy::DropNew => tx.try_send(payload.clone()).map_err(|err| {
                    matches!(err, mpsc::error::TrySendError::Closed(_))
                }),
            };
            match outcome {
                Ok(()) => delivered += 1,
                Err(true) => gone.push(*slot),
                Err(false) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("fleetwatch_broker_dropped_total").increment(1);
                }
            }
        }
        if !gone.is_empty() {
            self.detach(&gone);
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

/// A live subscription; dropping it unregisters from the topic.
#[derive(Debug)]
pub struct Subscription {
    topic: Arc<str>,
    receiver: mpsc::Receiver<Bytes>,
    slot: usize,
    owner: Weak<Topic>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Bytes, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Payloads waiting in this subscriber's queue.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(topic) = self.owner.upgrade() {
            topic.detach(&[self.slot]);
        }
    }
}

/// In-process broker for pub/sub messaging.
///
/// ```
/// use bytes::Bytes;
/// use fleetwatch_broker::Broker;
///
/// let broker = Broker::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut sub = broker.subscribe("iot/device/data").await.expect("subscribe");
///     broker
///         .publish("iot/device/data", Bytes::from_static(b"hello"))
///         .await
///         .expect("publish");
///     assert_eq!(sub.recv().await.expect("recv"), Bytes::from_static(b"hello"));
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    topics: RwLock<HashMap<String, Arc<Topic>, RandomState>>,
    connections: Arc<ConnectionTable>,
    subscriber_queue_capacity: usize,
    subscriber_queue_policy: SubQueuePolicy,
    // When set, publish/subscribe on unregistered topics fail instead of creating them.
    strict_topics: bool,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::with_hasher(RandomState::new())),
            connections: Arc::new(ConnectionTable::new(0)),
            subscriber_queue_capacity: DEFAULT_SUBSCRIBER_QUEUE_CAPACITY,
            subscriber_queue_policy: SubQueuePolicy::default(),
            strict_topics: false,
        }
    }

    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BrokerError::ZeroCapacity);
        }
        self.subscriber_queue_capacity = capacity;
        Ok(self)
    }

    pub fn with_subscriber_queue_policy(mut self, policy: SubQueuePolicy) -> Self {
        self.subscriber_queue_policy = policy;
        self
    }

    /// Cap concurrently open connections; zero means unlimited.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.connections = Arc::new(ConnectionTable::new(max_connections));
        self
    }

    pub fn with_strict_topics(mut self) -> Self {
        self.strict_topics = true;
        self
    }

    /// Open a broker connection. The returned guard releases it on drop.
    pub fn connect(&self, client_id: &str) -> Result<ConnectionGuard> {
        self.connections.admit(client_id)
    }

    /// Refuse all future connections from `client_id` (fault injection).
    pub fn refuse_client(&self, client_id: impl Into<String>) {
        self.connections.refuse_client(client_id);
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.connections.set_accepting(accepting);
    }

    pub fn active_connections(&self) -> usize {
        self.connections.stats().active
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.connections.stats()
    }

    pub async fn register_topic(&self, topic: impl Into<String>) -> bool {
        let topic = topic.into();
        let mut guard = self.topics.write().await;
        if guard.contains_key(&topic) {
            return false;
        }
        let state = Topic::new(
            &topic,
            self.subscriber_queue_capacity,
            self.subscriber_queue_policy,
        );
        guard.insert(topic, Arc::new(state));
        true
    }

    pub async fn topic_exists(&self, topic: &str) -> bool {
        self.topics.read().await.contains_key(topic)
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topic_stats(topic).await.subscribers
    }

    /// Delivery counters for `topic`; all zero for a topic never used.
    pub async fn topic_stats(&self, topic: &str) -> TopicStats {
        match self.topics.read().await.get(topic) {
            Some(state) => state.stats(),
            None => TopicStats::default(),
        }
    }

    /// Publish one payload; returns the number of subscriber queues it reached.
    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize> {
        metrics::counter!("fleetwatch_broker_published_total").increment(1);
        match self.topic_state(topic).await? {
            Some(state) => Ok(state.fan_out(payload).await),
            // Nobody ever subscribed: nothing to deliver.
            None => Ok(0),
        }
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let topic_state = match self.topic_state(topic).await? {
            Some(state) => state,
            None => {
                self.register_topic(topic).await;
                self.topic_state(topic)
                    .await?
                    .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?
            }
        };
        Ok(topic_state.attach())
    }

    // Ok(None) means the topic is unknown and the broker is lenient about it.
    async fn topic_state(&self, topic: &str) -> Result<Option<Arc<Topic>>> {
        let state = self.topics.read().await.get(topic).cloned();
        match state {
            Some(state) => Ok(Some(state)),
            None if self.strict_topics => Err(BrokerError::TopicNotFound(topic.to_string())),
            None => Ok(None),
        }
    }
}
