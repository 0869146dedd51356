//! Pure routing of MQTT events and inbound topics
//!
//! Inbound publishes are classified here; the device agent decides what to do
//! with them once they reach it over the inbound channel.

use crate::protocol::{InboundMessage, TopicBuilder, DEVICE_TOPIC_PREFIX};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::SubscribeReasonCode;
use rumqttc::v5::Event;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What an inbound topic addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// `devices/{id}/commands/{name}`
    Command(String),
    /// `$aws/things/{id}/shadow/update/delta`
    ShadowDelta,
    /// `$aws/things/{id}/shadow/update/accepted`
    ShadowAccepted,
    Unknown,
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Classify an inbound topic relative to this device
    pub fn classify_inbound(topic: &str, device_id: &str) -> InboundKind {
        if topic == TopicBuilder::shadow_delta(device_id) {
            return InboundKind::ShadowDelta;
        }
        if topic == TopicBuilder::shadow_accepted(device_id) {
            return InboundKind::ShadowAccepted;
        }

        let mut segments = topic.split('/');
        match (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) {
            (Some(prefix), Some(id), Some("commands"), Some(name), None)
                if prefix == DEVICE_TOPIC_PREFIX && id == device_id && !name.is_empty() =>
            {
                InboundKind::Command(name.to_string())
            }
            _ => InboundKind::Unknown,
        }
    }

    /// Retained commands are stale replays and must not run again
    pub fn should_process_message(topic: &str, retain: bool, device_id: &str) -> bool {
        let kind = Self::classify_inbound(topic, device_id);

        if retain && matches!(kind, InboundKind::Command(_)) {
            debug!(topic = %topic, "Ignoring retained command");
            return false;
        }

        if kind == InboundKind::Unknown {
            debug!(topic = %topic, "Ignoring message on unrecognised topic");
            return false;
        }

        true
    }

    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.clone(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        return_codes: suback
                            .return_codes
                            .iter()
                            .map(|code| match code {
                                SubscribeReasonCode::Success(_) => 0x01,
                                _ => 0x80,
                            })
                            .collect(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Topics the device subscribes to after every ConnAck
    pub fn build_subscription_topics(device_id: &str) -> Vec<String> {
        vec![
            TopicBuilder::commands_filter(device_id),
            TopicBuilder::shadow_delta(device_id),
        ]
    }

    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.iter().any(|&code| code >= 0x80) {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Disconnected,
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    /// PingResp, PubAck and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Hands inbound messages to the device agent
#[derive(Clone)]
pub struct MessageForwarder {
    inbound_sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self {
            inbound_sender: None,
        }
    }

    pub fn set_inbound_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.inbound_sender = Some(sender);
    }

    pub async fn forward(&self, message: InboundMessage) -> Result<(), String> {
        if let Some(ref sender) = self.inbound_sender {
            debug!(topic = %message.topic, "Forwarding inbound message");
            sender
                .send(message)
                .await
                .map_err(|e| format!("Failed to forward inbound message: {e}"))
        } else {
            warn!("Received MQTT message but no inbound sender configured - message dropped");
            Err("No inbound sender configured".to_string())
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Packet, Publish, SubAck,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_classify_inbound() {
        assert_eq!(
            MessageHandler::classify_inbound("devices/dev-1/commands/ping", "dev-1"),
            InboundKind::Command("ping".to_string())
        );
        assert_eq!(
            MessageHandler::classify_inbound("$aws/things/dev-1/shadow/update/delta", "dev-1"),
            InboundKind::ShadowDelta
        );
        assert_eq!(
            MessageHandler::classify_inbound("$aws/things/dev-1/shadow/update/accepted", "dev-1"),
            InboundKind::ShadowAccepted
        );
        assert_eq!(
            MessageHandler::classify_inbound("devices/other/commands/ping", "dev-1"),
            InboundKind::Unknown
        );
        assert_eq!(
            MessageHandler::classify_inbound("devices/dev-1/commands/ping/extra", "dev-1"),
            InboundKind::Unknown
        );
        assert_eq!(
            MessageHandler::classify_inbound("devices/dev-1/commands/", "dev-1"),
            InboundKind::Unknown
        );
    }

    #[test]
    fn test_should_process_message() {
        let topic = "devices/dev-1/commands/calibrate";
        assert!(MessageHandler::should_process_message(topic, false, "dev-1"));
        assert!(!MessageHandler::should_process_message(topic, true, "dev-1"));
        assert!(!MessageHandler::should_process_message(
            "devices/dev-2/commands/calibrate",
            false,
            "dev-1"
        ));

        // Retained shadow deltas still carry current desired state
        assert!(MessageHandler::should_process_message(
            "$aws/things/dev-1/shadow/update/delta",
            true,
            "dev-1"
        ));
    }

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: true,
            topic: Bytes::from("devices/dev-1/commands/ping"),
            pkid: 1,
            payload: Bytes::from(r#"{"command":"ping"}"#),
            properties: None,
        }));

        if let EventRoute::MessageReceived {
            topic,
            payload,
            retain,
        } = MessageHandler::route_mqtt_event(&publish)
        {
            assert_eq!(topic, "devices/dev-1/commands/ping");
            assert_eq!(&payload[..], br#"{"command":"ping"}"#);
            assert!(retain);
        } else {
            panic!("Expected MessageReceived route");
        }
    }

    #[test]
    fn test_suback_reason_codes() {
        let suback = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 7,
            return_codes: vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::NotAuthorized,
            ],
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&suback) {
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                assert_eq!(packet_id, 7);
                assert_eq!(return_codes, vec![0x01, 0x80]);
                assert!(MessageHandler::validate_subscription_success(&return_codes).is_err());
            }
            other => panic!("Expected SubscriptionConfirmed, got {other:?}"),
        }
    }

    #[test]
    fn test_build_subscription_topics() {
        assert_eq!(
            MessageHandler::build_subscription_topics("dev-1"),
            vec![
                "devices/dev-1/commands/+".to_string(),
                "$aws/things/dev-1/shadow/update/delta".to_string()
            ]
        );
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[0x00, 0x01]).is_ok());
        assert!(MessageHandler::validate_subscription_success(&[0x80]).is_err());
        assert!(MessageHandler::validate_subscription_success(&[0x01, 0x87]).is_err());
    }

    #[tokio::test]
    async fn test_message_forwarder() {
        let mut forwarder = MessageForwarder::new();
        let message = InboundMessage::new("devices/dev-1/commands/ping", "{}");

        assert!(forwarder.forward(message.clone()).await.is_err());

        let (tx, mut rx) = mpsc::channel(1);
        forwarder.set_inbound_sender(tx);
        assert!(forwarder.forward(message.clone()).await.is_ok());

        assert_eq!(rx.recv().await, Some(message));
    }
}
