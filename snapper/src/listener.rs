//! Trigger topic subscription and inbound message handling.

use async_trait::async_trait;
use rumqttc::QoS;
use tracing::{error, info};

use crate::connection::{ChannelHandle, MessageHandler, TriggerMessage};
use crate::dispatcher::JobDispatcher;

pub struct TriggerListener {
    channel: ChannelHandle,
    topic: String,
    qos: QoS,
    dispatcher: JobDispatcher,
}

impl TriggerListener {
    pub fn new(
        channel: ChannelHandle,
        topic: impl Into<String>,
        qos: QoS,
        dispatcher: JobDispatcher,
    ) -> Self {
        TriggerListener {
            channel,
            topic: topic.into(),
            qos,
            dispatcher,
        }
    }
}

/// Payload as text: UTF-8 when valid, otherwise the escaped raw bytes.
pub fn payload_text(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => payload.escape_ascii().to_string(),
    }
}

#[async_trait]
impl MessageHandler for TriggerListener {
    async fn on_connected(&self) {
        // Clean sessions: the subscription has to be renewed on every connect.
        match self.channel.subscribe(&self.topic, self.qos) {
            Ok(()) => info!("Subscribed to trigger topic: {}", self.topic),
            Err(e) => error!("Cannot subscribe to {}: {e}", self.topic),
        }
    }

    async fn on_message(&self, message: TriggerMessage) {
        let text = payload_text(&message.payload);
        info!("Trigger message received on {}: {}", message.topic, text);
        self.dispatcher.submit(text).await;
    }
}
