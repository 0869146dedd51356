//! Mock transport for testing
//!
//! `MockTransport` is cheap to clone; clones share the recorded history and
//! the connection flags, so a test can keep a handle after moving one into
//! the agent.

use crate::error::DeviceError;
use crate::protocol::InboundMessage;
use crate::transport::{mqtt::ConnectionState, Transport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One recorded publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON, `Value::Null` if it is not JSON
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    connected: Arc<AtomicBool>,
    should_fail: Arc<AtomicBool>,
    inbound: Arc<std::sync::Mutex<Option<mpsc::Sender<InboundMessage>>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A connected transport that accepts every publish
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
            should_fail: Arc::new(AtomicBool::new(false)),
            inbound: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// A transport whose connect and publish calls fail
    pub fn with_failure() -> Self {
        let transport = Self::new();
        transport.set_should_fail(true);
        transport
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Published messages whose topic starts with `prefix`
    pub async fn published_on(&self, prefix: &str) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().await.clone()
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
    }

    /// Deliver a message as if it arrived from the broker
    ///
    /// Returns false when no inbound sender is installed or the channel is closed.
    pub async fn inject_inbound(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let sender = match self.inbound.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => sender
                .send(InboundMessage::new(topic, payload.into()))
                .await
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = DeviceError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DeviceError::internal("Mock connection failure"));
        }
        self.set_connected(true);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.set_connected(false);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DeviceError::internal("Mock publish failure"));
        }
        if !self.is_connected() {
            return Err(DeviceError::internal("Mock transport not connected"));
        }

        self.published.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DeviceError::internal("Mock subscribe failure"));
        }
        self.subscriptions.lock().await.push(topic.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        if self.is_connected() {
            Some(ConnectionState::Connected)
        } else {
            Some(ConnectionState::Disconnected("Mock disconnection".to_string()))
        }
    }

    fn is_permanently_disconnected(&self) -> bool {
        false
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        if let Ok(mut guard) = self.inbound.lock() {
            *guard = Some(sender);
        }
    }
}
