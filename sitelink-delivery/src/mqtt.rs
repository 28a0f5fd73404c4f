//! MQTT implementation of [`PublishGateway`] on top of `rumqttc`.
//!
//! The `rumqttc` event loop runs in its own task. That task is the only
//! writer of the connection state: a successful ConnAck marks the gateway
//! connected, any connection error or broker disconnect marks it
//! disconnected. Outgoing packet ids and their acknowledgements (PubAck for
//! QoS 1, PubComp for QoS 2) are forwarded to the publishing side so that
//! `publish` resolves only once the broker has taken that exact message.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sitelink_common::{BrokerConfig, SitePayload, TopicBuilder};

use crate::error::DeliveryError;
use crate::gateway::{ConnectionState, PublishGateway};
use crate::status::SiteStatus;

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 10;

/// How long `close` waits for the disconnect to flush.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Map a configured QoS level to the `rumqttc` value.
pub fn qos_from_level(level: u8) -> Result<QoS, DeliveryError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(DeliveryError::Rejected(format!(
            "invalid QoS level {} (expected 0, 1 or 2)",
            other
        ))),
    }
}

/// Packet id traffic forwarded by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckEvent {
    /// A QoS 1/2 publish was written to the socket with this id.
    Sent(u16),
    /// PubAck or PubComp for this id.
    Acked(u16),
}

/// Matches acknowledgements to the publish that is waiting for them.
#[derive(Debug)]
struct AckTracker {
    events: mpsc::UnboundedReceiver<AckEvent>,
    /// Publishes that gave up before their packet id was seen.
    unclaimed_sends: usize,
}

impl AckTracker {
    fn new(events: mpsc::UnboundedReceiver<AckEvent>) -> Self {
        Self {
            events,
            unclaimed_sends: 0,
        }
    }

    /// Drop events left over from earlier publishes.
    fn discard_stale(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let AckEvent::Sent(_) = event {
                self.unclaimed_sends = self.unclaimed_sends.saturating_sub(1);
            }
        }
    }

    /// Wait for the id of the next publish, then for its acknowledgement.
    async fn wait(&mut self, timeout: Duration) -> Result<u16, DeliveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut expected = None;

        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(DeliveryError::Transport(
                        "MQTT event loop stopped".to_string(),
                    ));
                }
                Err(_) => {
                    if expected.is_none() {
                        self.unclaimed_sends += 1;
                    }
                    return Err(DeliveryError::AckTimeout(timeout));
                }
            };

            match (event, expected) {
                (AckEvent::Sent(_), None) if self.unclaimed_sends > 0 => {
                    self.unclaimed_sends -= 1;
                }
                (AckEvent::Sent(pkid), None) => expected = Some(pkid),
                (AckEvent::Acked(pkid), Some(want)) if pkid == want => return Ok(pkid),
                (event, _) => debug!(?event, "Ignoring acknowledgement of another publish"),
            }
        }
    }
}

/// Gateway publishing site payloads to an MQTT broker.
pub struct MqttGateway {
    client: AsyncClient,
    topic: String,
    status_topic: String,
    qos: QoS,
    ack_timeout: Duration,
    offline_status: Vec<u8>,
    state_rx: watch::Receiver<ConnectionState>,
    acks: Mutex<AckTracker>,
    closing: Arc<AtomicBool>,
    shutdown: CancellationToken,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttGateway")
            .field("topic", &self.topic)
            .field("qos", &self.qos)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl MqttGateway {
    /// Build the client and start its event loop.
    ///
    /// The broker connection is established in the background; the gateway
    /// reports [`ConnectionState::Disconnected`] until the first ConnAck.
    /// Must be called from within a tokio runtime.
    pub fn connect(
        config: &BrokerConfig,
        topics: &TopicBuilder,
        identity: SiteStatus,
    ) -> Result<Self, DeliveryError> {
        let qos = qos_from_level(config.qos)?;

        if config.keep_alive_secs == 0 {
            return Err(DeliveryError::Rejected(
                "keep_alive_secs must be at least 1".to_string(),
            ));
        }

        let status_topic = topics.status();
        let online_status = SiteStatus {
            status: "online".to_string(),
            ..identity.clone()
        }
        .to_bytes();
        let offline_status = SiteStatus {
            status: "offline".to_string(),
            ..identity
        }
        .to_bytes();

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            &status_topic,
            offline_status.clone(),
            QoS::AtLeastOnce,
            true,
        ));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let driver = EventDriver {
            client: client.clone(),
            state_tx,
            ack_tx,
            status_topic: status_topic.clone(),
            online_status,
            reconnect_delay: config.reconnect_delay(),
            closing: closing.clone(),
            shutdown: shutdown.clone(),
        };
        let event_task = tokio::spawn(driver.run(eventloop));

        info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            topic = %topics.telemetry(),
            "MQTT gateway started"
        );

        Ok(Self {
            client,
            topic: topics.telemetry(),
            status_topic,
            qos,
            ack_timeout: config.ack_timeout(),
            offline_status,
            state_rx,
            acks: Mutex::new(AckTracker::new(ack_rx)),
            closing,
            shutdown,
            event_task: StdMutex::new(Some(event_task)),
        })
    }

    /// Telemetry topic this gateway publishes on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

}

#[async_trait]
impl PublishGateway for MqttGateway {
    async fn publish(&self, payload: &SitePayload) -> Result<(), DeliveryError> {
        if !self.is_connected() {
            return Err(DeliveryError::NotConnected);
        }

        let body = payload
            .to_json()
            .map_err(|e| DeliveryError::Serialization(e.to_string()))?;

        // One publish in flight at a time so that the next sent id belongs to it.
        let mut acks = self.acks.lock().await;
        acks.discard_stale();

        self.client
            .publish(&self.topic, self.qos, false, body)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        if self.qos == QoS::AtMostOnce {
            return Ok(());
        }

        let pkid = acks.wait(self.ack_timeout).await?;
        debug!(pkid, "Publish acknowledged");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);

        let handle = self
            .event_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if self.is_connected() {
            if let Err(e) = self
                .client
                .publish(
                    &self.status_topic,
                    QoS::AtMostOnce,
                    true,
                    self.offline_status.clone(),
                )
                .await
            {
                debug!(error = %e, "Failed to queue offline status");
            }
            if let Err(e) = self.client.disconnect().await {
                debug!(error = %e, "Failed to queue MQTT disconnect");
            }

            if let Some(mut handle) = handle {
                if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                    handle.abort();
                }
            }
        } else if let Some(handle) = handle {
            handle.abort();
        }

        self.shutdown.cancel();
        info!("MQTT gateway closed");
    }
}

/// State owned by the event loop task.
struct EventDriver {
    client: AsyncClient,
    state_tx: watch::Sender<ConnectionState>,
    ack_tx: mpsc::UnboundedSender<AckEvent>,
    status_topic: String,
    online_status: Vec<u8>,
    reconnect_delay: Duration,
    closing: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl EventDriver {
    async fn run(self, mut eventloop: EventLoop) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        self.on_connected();
                    } else {
                        warn!(code = ?ack.code, "Broker refused the connection");
                        self.set_state(ConnectionState::Disconnected);
                    }
                }
                // QoS 0 publishes carry id 0 and are never acknowledged.
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) if pkid != 0 => {
                    let _ = self.ack_tx.send(AckEvent::Sent(pkid));
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    let _ = self.ack_tx.send(AckEvent::Acked(ack.pkid));
                }
                Ok(Event::Incoming(Packet::PubComp(comp))) => {
                    let _ = self.ack_tx.send(AckEvent::Acked(comp.pkid));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed the session");
                    self.set_state(ConnectionState::Disconnected);
                }
                Ok(_) => {}
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    if self.closing.load(Ordering::SeqCst) {
                        break;
                    }
                    debug!(error = %e, "MQTT connection error");

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("MQTT event loop stopped");
    }

    fn on_connected(&self) {
        // try_publish: this task is the one draining the request channel.
        if let Err(e) = self.client.try_publish(
            &self.status_topic,
            QoS::AtMostOnce,
            true,
            self.online_status.clone(),
        ) {
            warn!(error = %e, "Failed to publish online status");
        }
        self.set_state(ConnectionState::Connected);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            match state {
                ConnectionState::Connected => info!("Connected to MQTT broker"),
                ConnectionState::Disconnected => warn!("Disconnected from MQTT broker"),
            }
        }
    }
}
