// One publishing session: connect, burst, disconnect.
//
// A session owns exactly one connection for its whole life. Once connected it
// always disconnects exactly once, whether the burst completed, a publish
// failed, or the run was cancelled.
use fleetwatch_client::{BrokerClient, ConnectionError, Connector};
use fleetwatch_common::ids::{RunId, SessionId};
use fleetwatch_common::shutdown;
use tokio::sync::watch;

use crate::LoadPlan;
use crate::payload::PayloadFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Connecting,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connecting => "connecting",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Final record of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub index: usize,
    pub client_id: String,
    pub state: SessionState,
    pub published: u64,
    pub error: Option<ConnectionError>,
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    index: usize,
    client_id: String,
    state: SessionState,
    published: u64,
}

impl Session {
    pub fn new(run_id: &RunId, index: usize) -> Self {
        Self {
            id: SessionId::new(),
            index,
            client_id: format!("fleetwatch-{}-{index}", run_id.short()),
            state: SessionState::Pending,
            published: 0,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to a terminal state.
    pub async fn run(
        mut self,
        connector: &dyn Connector,
        plan: &LoadPlan,
        factory: &dyn PayloadFactory,
        mut cancel: watch::Receiver<bool>,
    ) -> SessionOutcome {
        if shutdown::is_cancelled(&cancel) {
            return self.finish(SessionState::Cancelled, None);
        }

        self.state = SessionState::Connecting;
        let connected = tokio::select! {
            biased;
            _ = shutdown::cancelled(&mut cancel) => None,
            result = connector.connect(&self.client_id) => Some(result),
        };
        let client = match connected {
            None => return self.finish(SessionState::Cancelled, None),
            Some(Err(err)) => return self.finish(SessionState::Failed, Some(err)),
            Some(Ok(client)) => client,
        };
        tracing::debug!(client_id = %self.client_id, "session connected");

        self.state = SessionState::Publishing;
        let (state, error) = self.publish_burst(client.as_ref(), plan, factory, &mut cancel).await;

        let (state, error) = match client.disconnect().await {
            Ok(()) => (state, error),
            Err(err) => {
                tracing::warn!(client_id = %self.client_id, error = %err, "session disconnect failed");
                // A completed burst that was not flushed is not a success.
                match state {
                    SessionState::Completed => (SessionState::Failed, Some(err)),
                    _ => (state, error),
                }
            }
        };
        self.finish(state, error)
    }

    async fn publish_burst(
        &mut self,
        client: &dyn BrokerClient,
        plan: &LoadPlan,
        factory: &dyn PayloadFactory,
        cancel: &mut watch::Receiver<bool>,
    ) -> (SessionState, Option<ConnectionError>) {
        for seq in 0..plan.messages_per_session {
            if shutdown::is_cancelled(cancel) {
                return (SessionState::Cancelled, None);
            }
            let payload = factory.payload(&self.id, seq);
            let result = tokio::select! {
                biased;
                _ = shutdown::cancelled(cancel) => return (SessionState::Cancelled, None),
                result = client.publish(&plan.topic, payload) => result,
            };
            if let Err(err) = result {
                return (SessionState::Failed, Some(err));
            }
            self.published += 1;
            metrics::counter!("fleetwatch_loadgen_published_total").increment(1);

            if let Some(interval) = plan.publish_interval {
                tokio::select! {
                    biased;
                    _ = shutdown::cancelled(cancel) => return (SessionState::Cancelled, None),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        (SessionState::Completed, None)
    }

    fn finish(mut self, state: SessionState, error: Option<ConnectionError>) -> SessionOutcome {
        self.state = state;
        metrics::counter!("fleetwatch_loadgen_sessions_total", "outcome" => state.as_str())
            .increment(1);
        match &error {
            Some(err) => tracing::warn!(
                client_id = %self.client_id,
                published = self.published,
                error = %err,
                "session failed"
            ),
            None => tracing::debug!(
                client_id = %self.client_id,
                published = self.published,
                state = state.as_str(),
                "session finished"
            ),
        }
        SessionOutcome {
            index: self.index,
            client_id: self.client_id,
            state,
            published: self.published,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::StaticPayload;
    use fleetwatch_broker::Broker;
    use fleetwatch_client::InProcessConnector;
    use std::sync::Arc;

    #[test]
    fn client_id_embeds_run_and_index() {
        let run = RunId::new();
        let session = Session::new(&run, 42);
        assert_eq!(session.client_id(), format!("fleetwatch-{}-42", run.short()));
        assert_eq!(session.state(), SessionState::Pending);
    }

    #[tokio::test]
    async fn completed_session_publishes_everything_and_disconnects() {
        let broker = Arc::new(Broker::new());
        let mut sub = broker.subscribe("t").await.expect("subscribe");
        let connector = InProcessConnector::new(broker.clone());
        let (_tx, cancel) = watch::channel(false);
        let plan = LoadPlan::new(1, 5, "t");

        let outcome = Session::new(&RunId::new(), 0)
            .run(&connector, &plan, &StaticPayload::spam(), cancel)
            .await;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.published, 5);
        for _ in 0..5 {
            assert!(sub.try_recv().is_ok());
        }
        assert_eq!(broker.connection_stats().active, 0);
        assert_eq!(broker.connection_stats().closed, 1);
    }

    #[tokio::test]
    async fn refused_connect_fails_without_publishing() {
        let broker = Arc::new(Broker::new());
        broker.set_accepting(false);
        let connector = InProcessConnector::new(broker);
        let (_tx, cancel) = watch::channel(false);
        let outcome = Session::new(&RunId::new(), 3)
            .run(&connector, &LoadPlan::new(1, 5, "t"), &StaticPayload::spam(), cancel)
            .await;
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.published, 0);
        assert!(matches!(outcome.error, Some(ConnectionError::Refused { .. })));
    }

    #[tokio::test]
    async fn pre_cancelled_session_never_connects() {
        let broker = Arc::new(Broker::new());
        let connector = InProcessConnector::new(broker.clone());
        let (_tx, cancel) = watch::channel(true);
        let outcome = Session::new(&RunId::new(), 0)
            .run(&connector, &LoadPlan::new(1, 5, "t"), &StaticPayload::spam(), cancel)
            .await;
        assert_eq!(outcome.state, SessionState::Cancelled);
        assert_eq!(broker.connection_stats().opened, 0);
    }

    struct UnflushedConnector;

    struct UnflushedClient;

    #[async_trait::async_trait]
    impl Connector for UnflushedConnector {
        async fn connect(&self, _client_id: &str) -> Result<Box<dyn BrokerClient>, ConnectionError> {
            Ok(Box::new(UnflushedClient))
        }

        fn endpoint(&self) -> String {
            "unflushed".to_string()
        }
    }

    #[async_trait::async_trait]
    impl BrokerClient for UnflushedClient {
        fn client_id(&self) -> &str {
            "unflushed"
        }

        async fn publish(&self, _topic: &str, _payload: bytes::Bytes) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn subscribe(&mut self, _topic: &str) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn next_message(
            &mut self,
        ) -> Option<Result<fleetwatch_client::InboundMessage, ConnectionError>> {
            None
        }

        async fn disconnect(self: Box<Self>) -> Result<(), ConnectionError> {
            Err(ConnectionError::Disconnected("queued publishes may be lost".into()))
        }
    }

    #[tokio::test]
    async fn unflushed_disconnect_fails_a_completed_burst() {
        let (_tx, cancel) = watch::channel(false);
        let outcome = Session::new(&RunId::new(), 1)
            .run(&UnflushedConnector, &LoadPlan::new(1, 4, "t"), &StaticPayload::spam(), cancel)
            .await;
        assert_eq!(outcome.state, SessionState::Failed);
        assert_eq!(outcome.published, 4);
        assert!(matches!(outcome.error, Some(ConnectionError::Disconnected(_))));
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionState::Publishing.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
    }
}
