//! Broker connection – drives the MQTT event loop and owns the
//! connection state.
//!
//! `rumqttc` reconnects whenever its event loop is polled again after an
//! error, but it does not wait between attempts.  The loop here adds the
//! fixed backoff, both for the first connection and after a lost one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use snapper_common::config::MqttConfig;

/// Wait between connection attempts.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Capacity of the client's outgoing request queue.
const REQUEST_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("client request rejected: {0}")]
    Request(String),
    #[error("connection error: {0}")]
    Connection(String),
}

/// A raw message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct TriggerMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// What the event loop reports to the rest of the daemon.
#[derive(Debug)]
pub enum ChannelEvent {
    Connected,
    Message(TriggerMessage),
    /// The broker ended the session.
    Disconnected,
    Other,
}

/// Client-side operations.  Implementations must be callable from any
/// task while the event loop is being polled elsewhere, and must not block.
pub trait Channel: Send + Sync {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ChannelError>;
    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), ChannelError>;
    fn disconnect(&self) -> Result<(), ChannelError>;
}

impl Channel for AsyncClient {
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ChannelError> {
        self.try_subscribe(topic, qos)
            .map_err(|e| ChannelError::Request(e.to_string()))
    }

    fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.try_publish(topic, qos, false, payload)
            .map_err(|e| ChannelError::Request(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), ChannelError> {
        self.try_disconnect()
            .map_err(|e| ChannelError::Request(e.to_string()))
    }
}

/// Source of broker events; one call per event-loop turn.
#[async_trait]
pub trait EventSource: Send {
    async fn next_event(&mut self) -> Result<ChannelEvent, ChannelError>;
}

#[async_trait]
impl EventSource for EventLoop {
    async fn next_event(&mut self) -> Result<ChannelEvent, ChannelError> {
        match self.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Ok(ChannelEvent::Connected),
            Ok(Event::Incoming(Packet::Publish(p))) => Ok(ChannelEvent::Message(TriggerMessage {
                topic: p.topic,
                payload: p.payload,
            })),
            Ok(Event::Incoming(Packet::Disconnect)) => Ok(ChannelEvent::Disconnected),
            Ok(_) => Ok(ChannelEvent::Other),
            Err(e) => Err(ChannelError::Connection(e.to_string())),
        }
    }
}

/// Receives connection events from [`ConnectionManager::run`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Called after every successful (re)connect.
    async fn on_connected(&self);
    /// Must return promptly; the event loop is not polled meanwhile.
    async fn on_message(&self, message: TriggerMessage);
}

/// Shared handle to the one broker connection.
#[derive(Clone)]
pub struct ChannelHandle {
    client: Arc<dyn Channel>,
    state: watch::Receiver<ConnectionState>,
}

impl ChannelHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ChannelError> {
        self.client.subscribe(topic, qos)
    }

    /// Publish, or fail right away when there is no live connection.
    pub fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        self.client.publish(topic, qos, payload)
    }

    pub fn disconnect(&self) -> Result<(), ChannelError> {
        self.client.disconnect()
    }
}

/// Map a configured QoS number onto the client's enum.
pub fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Create the MQTT client and its (not yet polled) event loop.
pub fn mqtt_client(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(true);
    if let Some(user) = &config.username {
        options.set_credentials(user, config.password.clone().unwrap_or_default());
    }
    AsyncClient::new(options, REQUEST_QUEUE)
}

pub struct ConnectionManager {
    broker: String,
    state: watch::Sender<ConnectionState>,
    backoff: Duration,
}

impl ConnectionManager {
    /// `broker` is only used in log lines.
    pub fn new(broker: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionManager {
            broker: broker.into(),
            state,
            backoff: RECONNECT_BACKOFF,
        }
    }

    pub fn handle(&self, client: Arc<dyn Channel>) -> ChannelHandle {
        ChannelHandle {
            client,
            state: self.state.subscribe(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("Connection state {prev:?} → {next:?}");
        }
    }

    /// Drive the event loop forever.
    pub async fn run<E, H>(&self, events: &mut E, handler: &H)
    where
        E: EventSource + ?Sized,
        H: MessageHandler + ?Sized,
    {
        info!("Connecting to MQTT broker {} ...", self.broker);
        self.set_state(ConnectionState::Connecting);

        loop {
            match events.next_event().await {
                Ok(ChannelEvent::Connected) => {
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to MQTT broker {}", self.broker);
                    handler.on_connected().await;
                }
                Ok(ChannelEvent::Message(message)) => handler.on_message(message).await,
                Ok(ChannelEvent::Disconnected) => {
                    warn!("Broker {} closed the session", self.broker);
                    self.set_state(ConnectionState::Disconnected);
                }
                Ok(ChannelEvent::Other) => {}
                Err(e) => {
                    if *self.state.borrow() == ConnectionState::Connected {
                        warn!(
                            "Disconnected from MQTT ({e}). Will attempt reconnect in {}s",
                            self.backoff.as_secs()
                        );
                    } else {
                        error!(
                            "MQTT connect error: {e} – retrying in {}s",
                            self.backoff.as_secs()
                        );
                    }
                    self.set_state(ConnectionState::Disconnected);
                    tokio::time::sleep(self.backoff).await;
                    info!("Connecting to MQTT broker {} ...", self.broker);
                    self.set_state(ConnectionState::Connecting);
                }
            }
        }
    }
}
