//! Status reports – one JSON message per finished capture job.

use rumqttc::QoS;
use tracing::{debug, error};

use snapper_common::protocol::StatusPayload;

use crate::connection::ChannelHandle;

pub struct StatusPublisher {
    channel: ChannelHandle,
    topic: String,
    qos: QoS,
}

impl StatusPublisher {
    pub fn new(channel: ChannelHandle, topic: impl Into<String>, qos: QoS) -> Self {
        StatusPublisher {
            channel,
            topic: topic.into(),
            qos,
        }
    }

    /// Best effort: failures are logged, never retried or returned.
    pub fn publish(&self, status: &StatusPayload) {
        let body = match serde_json::to_vec(status) {
            Ok(body) => body,
            Err(e) => {
                error!("Cannot serialize status: {e}");
                return;
            }
        };

        match self.channel.publish(&self.topic, self.qos, body) {
            Ok(()) => debug!("Published status to {}: {:?}", self.topic, status),
            Err(e) => error!("Failed to publish status to {}: {e}", self.topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::connection::tests::{connected_handle, MemoryChannel};
    use crate::connection::ConnectionState;

    fn status() -> StatusPayload {
        StatusPayload {
            timestamp: "2024-06-15T10:30:00+00:00".into(),
            success: true,
            info: "/data/snapshot_20240615_103000.jpg".into(),
            request_payload: Some(String::new()),
        }
    }

    #[test]
    fn test_publish_json_on_status_topic() {
        let channel = Arc::new(MemoryChannel::default());
        let (handle, _state) = connected_handle(channel.clone());
        let publisher = StatusPublisher::new(handle, "cam/status", QoS::AtLeastOnce);

        publisher.publish(&status());

        let published = channel.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "cam/status");
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["info"], "/data/snapshot_20240615_103000.jpg");
        assert_eq!(body["request_payload"], "");
    }

    #[test]
    fn test_publish_while_disconnected_is_swallowed() {
        let channel = Arc::new(MemoryChannel::default());
        let (handle, state) = connected_handle(channel.clone());
        state.send_replace(ConnectionState::Disconnected);
        let publisher = StatusPublisher::new(handle, "cam/status", QoS::AtLeastOnce);

        publisher.publish(&status());

        assert!(channel.published.lock().unwrap().is_empty());
    }
}
