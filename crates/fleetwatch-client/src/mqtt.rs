// MQTT adapter built on rumqttc.
//
// Each connection owns one `AsyncClient` plus a background task that drives
// its event loop. The task forwards inbound publishes into a bounded inbox and
// reports a connection loss once before exiting; publishes issued after the
// loop died fail with `ConnectionError::Publish`.
use async_trait::async_trait;
use bytes::Bytes;
use fleetwatch_common::clock::unix_now_ms;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, QosLevel};
use crate::{BrokerClient, ConnectionError, Connector, InboundMessage};

// Bound on how long disconnect waits for the event loop to flush DISCONNECT.
const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttConnector {
    config: ClientConfig,
}

impl MqttConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(
            client_id,
            self.config.endpoint.host.clone(),
            self.config.endpoint.port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs));
        options.set_clean_session(true);
        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn BrokerClient>, ConnectionError> {
        let endpoint = self.endpoint();
        let timeout = self.config.connect_timeout();
        let (client, mut eventloop) =
            AsyncClient::new(self.options(client_id), self.config.request_capacity);

        // Drive the event loop until CONNACK so refusals surface from connect().
        let handshake = tokio::time::timeout(timeout, wait_for_connack(&mut eventloop)).await;
        match handshake {
            Err(_) => {
                metrics::counter!("fleetwatch_client_connect_failures_total", "reason" => "timeout")
                    .increment(1);
                return Err(ConnectionError::Timeout { endpoint, timeout });
            }
            Ok(Err(reason)) => {
                metrics::counter!("fleetwatch_client_connect_failures_total", "reason" => "refused")
                    .increment(1);
                return Err(ConnectionError::Refused { endpoint, reason });
            }
            Ok(Ok(())) => {}
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity);
        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            inbound_tx,
            client_id.to_string(),
        ));
        tracing::debug!(client_id, endpoint = %endpoint, "mqtt connected");
        Ok(Box::new(MqttClient {
            client,
            client_id: client_id.to_string(),
            qos: self.config.qos,
            inbound_rx,
            driver: Some(driver),
        }))
    }

    fn endpoint(&self) -> String {
        self.config.endpoint.to_string()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(format!("{:?}", ack.code));
            }
            Ok(_) => {}
            Err(err) => return Err(err.to_string()),
        }
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    inbound_tx: mpsc::Sender<Result<InboundMessage, ConnectionError>>,
    client_id: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    received_at_ms: unix_now_ms(),
                };
                if inbound_tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(client_id = %client_id, error = %err, "mqtt event loop ended");
                let _ = inbound_tx
                    .send(Err(ConnectionError::Disconnected(err.to_string())))
                    .await;
                break;
            }
        }
    }
}

pub struct MqttClient {
    client: AsyncClient,
    client_id: String,
    qos: QosLevel,
    inbound_rx: mpsc::Receiver<Result<InboundMessage, ConnectionError>>,
    driver: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.client_id)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    // Ok means queued for the event loop, not written to the socket.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), ConnectionError> {
        self.client
            .publish(topic, self.qos.to_mqtt(), false, payload.to_vec())
            .await
            .map_err(|err| ConnectionError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        self.client
            .subscribe(topic, self.qos.to_mqtt())
            .await
            .map_err(|err| ConnectionError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn next_message(&mut self) -> Option<Result<InboundMessage, ConnectionError>> {
        self.inbound_rx.recv().await
    }

    async fn disconnect(mut self: Box<Self>) -> Result<(), ConnectionError> {
        // A dead event loop makes DISCONNECT fail; the socket is already gone then.
        if let Err(err) = self.client.disconnect().await {
            tracing::debug!(client_id = %self.client_id, error = %err, "mqtt disconnect request failed");
        }
        match self.driver.take() {
            Some(driver) => drain_driver(&self.client_id, driver, DISCONNECT_DRAIN_TIMEOUT).await,
            None => Ok(()),
        }
    }
}

// Publishes return once queued, so a driver that has not drained by the
// deadline may still hold unsent messages. That loss is reported, not hidden.
async fn drain_driver(
    client_id: &str,
    mut driver: JoinHandle<()>,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    if tokio::time::timeout(timeout, &mut driver).await.is_ok() {
        return Ok(());
    }
    driver.abort();
    metrics::counter!("fleetwatch_client_unflushed_disconnects_total").increment(1);
    tracing::warn!(
        client_id,
        timeout_ms = timeout.as_millis() as u64,
        "mqtt event loop did not drain before disconnect; queued publishes may be lost"
    );
    Err(ConnectionError::Disconnected(format!(
        "event loop for {client_id} still busy after {timeout:?}; queued publishes may be lost"
    )))
}
