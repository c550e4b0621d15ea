// Failures in one session must never abort its siblings.
use async_trait::async_trait;
use bytes::Bytes;
use fleetwatch_broker::Broker;
use fleetwatch_client::{
    BrokerClient, ConnectionError, Connector, InProcessConnector, InboundMessage,
};
use fleetwatch_loadgen::{LoadGenerator, LoadPlan, StaticPayload};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Refuses every third connection and drops every fifth one mid-burst.
#[derive(Default)]
struct FlakyConnector {
    attempts: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    published: Arc<AtomicU64>,
}

struct FlakyClient {
    id: String,
    fail_after: Option<u64>,
    sent: AtomicU64,
    disconnects: Arc<AtomicUsize>,
    published: Arc<AtomicU64>,
}

#[async_trait]
impl Connector for FlakyConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn BrokerClient>, ConnectionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt % 3 == 2 {
            return Err(ConnectionError::Refused {
                endpoint: self.endpoint(),
                reason: "connection limit".into(),
            });
        }
        Ok(Box::new(FlakyClient {
            id: client_id.to_string(),
            fail_after: (attempt % 5 == 4).then_some(3),
            sent: AtomicU64::new(0),
            disconnects: Arc::clone(&self.disconnects),
            published: Arc::clone(&self.published),
        }))
    }

    fn endpoint(&self) -> String {
        "flaky".into()
    }
}

#[async_trait]
impl BrokerClient for FlakyClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    async fn publish(&self, topic: &str, _payload: Bytes) -> Result<(), ConnectionError> {
        let sent = self.sent.fetch_add(1, Ordering::SeqCst);
        if self.fail_after.is_some_and(|limit| sent >= limit) {
            return Err(ConnectionError::Publish {
                topic: topic.to_string(),
                reason: "connection reset".into(),
            });
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&mut self, _topic: &str) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<InboundMessage, ConnectionError>> {
        None
    }

    async fn disconnect(self: Box<Self>) -> Result<(), ConnectionError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn failing_sessions_do_not_abort_siblings() {
    let connector = Arc::new(FlakyConnector::default());
    let disconnects = Arc::clone(&connector.disconnects);
    let published = Arc::clone(&connector.published);
    let (_tx, cancel) = watch::channel(false);
    let generator =
        LoadGenerator::new(connector, Arc::new(StaticPayload::spam())).with_cancel(cancel);

    let report = generator
        .run(&LoadPlan::new(30, 10, "iot/device/data").with_max_concurrent_sessions(1))
        .await
        .expect("run");

    // Serialized sessions make attempt order match session order.
    assert_eq!(report.spawned, 30);
    assert_eq!(report.completed + report.failed, 30);
    let refused = (0..30).filter(|a| a % 3 == 2).count();
    let dropped = (0..30).filter(|a| a % 3 != 2 && a % 5 == 4).count();
    assert_eq!(report.failed, refused + dropped);
    assert_eq!(report.failures.len(), report.failed);
    assert!(
        report
            .failures
            .windows(2)
            .all(|pair| pair[0].index < pair[1].index)
    );
    // Every connection that opened was closed exactly once.
    assert_eq!(disconnects.load(Ordering::SeqCst), 30 - refused);
    assert_eq!(report.published, published.load(Ordering::SeqCst));
}

#[tokio::test]
async fn refused_clients_are_isolated_on_a_real_broker() {
    let broker = Arc::new(Broker::new().with_max_connections(5));
    let connector = Arc::new(InProcessConnector::new(broker.clone()));
    let (_tx, cancel) = watch::channel(false);
    let generator =
        LoadGenerator::new(connector, Arc::new(StaticPayload::spam())).with_cancel(cancel);

    let report = generator
        .run(&LoadPlan::new(40, 50, "iot/device/data").with_max_concurrent_sessions(40))
        .await
        .expect("run");

    assert_eq!(report.spawned, 40);
    assert_eq!(report.completed + report.failed, 40);
    assert!(report.completed >= 1);
    assert_eq!(report.published, report.completed as u64 * 50);
    let stats = broker.connection_stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.refused as usize, report.failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_mid_run_disconnects_every_session() {
    let broker = Arc::new(Broker::new());
    let connector = Arc::new(InProcessConnector::new(broker.clone()));
    let (tx, cancel) = watch::channel(false);
    let generator =
        LoadGenerator::new(connector, Arc::new(StaticPayload::spam())).with_cancel(cancel);
    let plan = LoadPlan::new(100, 1_000, "iot/device/data")
        .with_max_concurrent_sessions(8)
        .with_publish_interval(Duration::from_millis(5));

    let handle = generator.spawn(plan);
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).expect("cancel");
    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("join within timeout")
        .expect("task")
        .expect("run");

    assert!(report.cancelled >= 1);
    assert_eq!(
        report.spawned,
        report.completed + report.failed + report.cancelled
    );
    assert_eq!(report.spawned + report.not_started, 100);
    assert_eq!(broker.connection_stats().active, 0);
}
