//! Impure I/O side of the MQTT transport
//!
//! Owns the rumqttc client and runs the connection supervisor task: it polls
//! the event loop, forwards inbound publishes, resubscribes after every
//! ConnAck and rebuilds the connection with backoff when the link drops.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{
    ConnectionEvent, ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision,
};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::{DeviceSection, MqttSection};
use crate::observability::metrics::metrics;
use crate::protocol::InboundMessage;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Request channel capacity between `AsyncClient` and the event loop
const CLIENT_CHANNEL_CAPACITY: usize = 32;

type SharedTopics = Arc<std::sync::Mutex<Vec<String>>>;
type SharedForwarder = Arc<std::sync::Mutex<MessageForwarder>>;

/// MQTT transport client for a single device
pub struct MqttClient {
    device: DeviceSection,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    config: MqttSection,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: SharedTopics,
    message_forwarder: SharedForwarder,
    connect_time: Option<Instant>,
    last_publish_time: Arc<std::sync::Mutex<Option<Instant>>>,
    reconnect_count: Arc<AtomicU32>,
}

/// State shared by the supervisor task
struct Supervisor {
    device: DeviceSection,
    config: MqttSection,
    shared_client: Arc<Mutex<AsyncClient>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: SharedTopics,
    message_forwarder: SharedForwarder,
    state_tx: watch::Sender<ConnectionState>,
    reconnect_count: Arc<AtomicU32>,
}

impl MqttClient {
    pub async fn new(device: &DeviceSection, config: MqttSection) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(device, &config)?;
        let reconnect_config = ReconnectConfig::for_device(config.max_reconnect_attempts);

        HealthMonitor::validate_connection_config(&reconnect_config)
            .map_err(MqttError::ConnectionFailedStr)?;

        Ok(MqttClient {
            device: device.clone(),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            config,
            event_loop_handle: None,
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config,
            subscribed_topics: Arc::new(std::sync::Mutex::new(Vec::new())),
            message_forwarder: Arc::new(std::sync::Mutex::new(MessageForwarder::new())),
            connect_time: None,
            last_publish_time: Arc::new(std::sync::Mutex::new(None)),
            reconnect_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Build a fresh client and event loop for the initial connection or a reconnect
    fn create_connection(
        device: &DeviceSection,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(device, config)?;
        Ok(AsyncClient::new(mqtt_options, CLIENT_CHANNEL_CAPACITY))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait until the supervisor reports a ConnAck, a failure or the timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    // Transient failures are retried by the supervisor
                    ConnectionState::Disconnected(_)
                    | ConnectionState::Connecting
                    | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Start the supervisor and wait for the broker's ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self.event_loop.take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let supervisor = Supervisor {
            device: self.device.clone(),
            config: self.config.clone(),
            shared_client: self.client.clone(),
            reconnect_config: self.reconnect_config.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            message_forwarder: self.message_forwarder.clone(),
            state_tx,
            reconnect_count: self.reconnect_count.clone(),
        };

        metrics().mqtt_connection_attempt();
        info!(
            device_id = %self.device.id,
            broker = %self.config.broker_url,
            "Connecting to MQTT broker"
        );

        let handle = tokio::spawn(supervisor.run(event_loop, shutdown_rx));
        self.event_loop_handle = Some(handle);

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, connection_timeout).await
        {
            metrics().mqtt_connection_failed();
            return Err(e);
        }

        self.connect_time = Some(Instant::now());
        Ok(())
    }

    /// Sleep for the backoff delay unless shutdown arrives first
    /// Returns true if the sleep completed
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Stop the supervisor and close the session
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let quality = self.link_quality();
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            debug!("Sent shutdown signal to connection supervisor");
        }

        {
            let client = self.client.lock().await;
            client
                .disconnect()
                .await
                .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        }

        if let Some(state_tx) = &self.state_tx {
            let current = state_tx.borrow().clone();
            let next =
                HealthMonitor::determine_next_state(&current, ConnectionEvent::ShutdownRequested);
            let _ = state_tx.send(next);
        }
        metrics().mqtt_connection_lost();

        if let Some(handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!("Connection supervisor stopped"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!(error = %e, "Connection supervisor ended with error");
                }
                Err(_) => warn!("Connection supervisor did not stop in time, aborting"),
                _ => {}
            }
        }

        info!(
            device_id = %self.device.id,
            link_quality = ?quality,
            "MQTT client disconnected"
        );
        Ok(())
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    pub fn get_health_metrics(&self) -> HealthMetrics {
        let last_publish = self
            .last_publish_time
            .lock()
            .map(|guard| *guard)
            .unwrap_or(None);
        HealthMonitor::calculate_health_metrics(
            self.connect_time,
            last_publish,
            self.reconnect_count.load(Ordering::Relaxed),
            Duration::from_secs(self.config.heartbeat_interval_secs),
        )
    }

    pub fn link_quality(&self) -> ConnectionQuality {
        HealthMonitor::assess_connection_quality(&self.get_health_metrics())
    }

    /// Guard used by every publish and subscribe
    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected: state_rx is None".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    pub async fn publish_message(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        if let Err(e) = self.check_connection_state() {
            metrics().mqtt_publish_failed();
            return Err(e);
        }

        let client = self.client.lock().await;
        let result = client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)));

        match result {
            Ok(()) => {
                metrics().mqtt_message_published();
                if let Ok(mut last) = self.last_publish_time.lock() {
                    *last = Some(Instant::now());
                }
                debug!(topic = %topic, retain = retain, "Published message");
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                warn!(topic = %topic, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Subscribe with QoS 1 and remember the filter for resubscription
    pub async fn subscribe_topic(&mut self, topic: &str) -> Result<(), MqttError> {
        if let Some(state_rx) = &self.state_rx {
            let current_state = state_rx.borrow().clone();
            if !HealthMonitor::can_subscribe(&current_state) {
                return Err(MqttError::NotConnected {
                    state: current_state,
                });
            }
        }

        {
            let client = self.client.lock().await;
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| {
                    MqttError::SubscriptionFailed(
                        format!("Failed to subscribe to {topic}: {e}").into(),
                    )
                })?;
        }

        if let Ok(mut topics) = self.subscribed_topics.lock() {
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }

        info!(topic = %topic, "Subscribed");
        Ok(())
    }

    pub fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        match self.message_forwarder.lock() {
            Ok(mut forwarder) => forwarder.set_inbound_sender(sender),
            Err(poisoned) => poisoned.into_inner().set_inbound_sender(sender),
        }
    }
}

impl Supervisor {
    async fn run(self, event_loop: Arc<Mutex<EventLoop>>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(device_id = %self.device.id, "Starting MQTT connection supervisor");
        let mut reconnect_attempts = 0u32;
        let mut current_event_loop = event_loop;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping connection supervisor");
                        break;
                    }
                }

                event_result = async {
                    let mut event_loop_guard = current_event_loop.lock().await;
                    event_loop_guard.poll().await
                } => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(
                                route,
                                &mut reconnect_attempts,
                                shutdown_rx.clone(),
                                &mut current_event_loop,
                            ).await
                        }
                        Err(e) => {
                            self.handle_event_loop_error(
                                e,
                                &mut reconnect_attempts,
                                shutdown_rx.clone(),
                                &mut current_event_loop,
                            ).await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!(device_id = %self.device.id, "Connection supervisor stopped");
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.state_tx.borrow().clone();
        let next = HealthMonitor::determine_next_state(&current, event);
        let _ = self.state_tx.send(next);
    }

    /// Returns true to keep polling
    async fn handle_event_loop_error(
        &self,
        error: rumqttc::v5::ConnectionError,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> bool {
        let was_connected = matches!(*self.state_tx.borrow(), ConnectionState::Connected);
        if was_connected {
            metrics().mqtt_connection_lost();
        } else {
            metrics().mqtt_connection_failed();
        }

        error!(device_id = %self.device.id, error = %error, "MQTT event loop error");
        self.transition(ConnectionEvent::NetworkError(error.to_string()));

        self.attempt_reconnection(reconnect_attempts, shutdown_rx, current_event_loop)
            .await
    }

    /// Returns true to keep polling
    async fn process_event_route(
        &self,
        route: EventRoute,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let event = ConnectionEvent::ConnAckReceived;
                *reconnect_attempts =
                    HealthMonitor::next_attempt_count(*reconnect_attempts, &event);
                self.transition(event);
                metrics().mqtt_connection_established();
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                self.handle_message_received(topic, payload, retain).await;
                true
            }
            EventRoute::Disconnected => {
                metrics().mqtt_connection_lost();
                self.transition(ConnectionEvent::DisconnectedByBroker);
                self.attempt_reconnection(reconnect_attempts, shutdown_rx, current_event_loop)
                    .await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                if let Err(e) = MessageHandler::validate_subscription_success(&return_codes) {
                    warn!(packet_id = packet_id, error = %e, "Broker rejected subscription");
                } else {
                    debug!(packet_id = packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", event = %event_str, "MQTT event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_message_received(&self, topic: String, payload: Bytes, retain: bool) {
        debug!(target: "mqtt_transport", topic = %topic, "Received MQTT message");
        metrics().mqtt_message_received();

        if !MessageHandler::should_process_message(&topic, retain, &self.device.id) {
            return;
        }

        // Clone out of the lock so it is not held across the send
        let forwarder = match self.message_forwarder.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let message = InboundMessage {
            topic,
            payload,
            retain,
        };
        if let Err(e) = forwarder.forward(message).await {
            error!(error = %e, "Failed to forward inbound message");
        }
    }

    async fn resubscribe_to_topics(&self) {
        let topics = self
            .subscribed_topics
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();

        let client_guard = self.shared_client.lock().await;
        for topic in &topics {
            if let Err(e) = client_guard.subscribe(topic, QoS::AtLeastOnce).await {
                error!(topic = %topic, error = %e, "Failed to re-subscribe");
            } else {
                debug!(target: "mqtt_transport", topic = %topic, "Re-subscribed");
            }
        }
    }

    async fn apply_new_connection(&self, current_event_loop: &mut Arc<Mutex<EventLoop>>) {
        match MqttClient::create_connection(&self.device, &self.config) {
            Ok((new_client, new_event_loop)) => {
                *current_event_loop = Arc::new(Mutex::new(new_event_loop));
                let mut client_guard = self.shared_client.lock().await;
                *client_guard = new_client;
                debug!("Installed new MQTT connection for reconnection attempt");
            }
            Err(e) => {
                // The next poll fails again and consumes another attempt
                error!(error = %e, "Failed to create new connection");
            }
        }
    }

    /// Returns false once reconnection is abandoned
    async fn attempt_reconnection(
        &self,
        reconnect_attempts: &mut u32,
        shutdown_rx: watch::Receiver<bool>,
        current_event_loop: &mut Arc<Mutex<EventLoop>>,
    ) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &self.reconnect_config,
            *shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                let event = ConnectionEvent::ReconnectionStarted(attempt);
                *reconnect_attempts =
                    HealthMonitor::next_attempt_count(*reconnect_attempts, &event);
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                self.transition(event);

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    attempt = attempt,
                    max_attempts = %max_display,
                    delay_ms = delay_ms,
                    "Scheduling MQTT reconnection"
                );

                if !MqttClient::interruptible_sleep(shutdown_rx.clone(), delay_ms).await {
                    return false;
                }
                if *shutdown_rx.borrow() {
                    return false;
                }

                metrics().mqtt_connection_attempt();
                self.apply_new_connection(current_event_loop).await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, not reconnecting");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let max_attempts = self.reconnect_config.max_attempts.unwrap_or_default();
                let reason = format!("Max reconnection attempts ({max_attempts}) exceeded");
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        self.publish_message(topic, payload, retain).await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        self.subscribe_topic(topic).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn set_inbound_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        MqttClient::set_inbound_sender(self, sender)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // No async in Drop; callers wanting a clean session call disconnect()
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn test_config() -> MqttSection {
        MqttSection::with_broker("mqtt://localhost:1883")
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttClient::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);

        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(200))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_survives_transient_disconnect() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("refused".to_string()));
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = state_tx.send(ConnectionState::Reconnecting(1));
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(500))
                .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        let _handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(state_tx);
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(10)).await;

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ConnAck"), "got: {err_msg}");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_permanent_failure() {
        let ((state_tx, state_rx), (_, _)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::PermanentlyDisconnected(
                "Max reconnection attempts (5) exceeded".to_string(),
            ));
        });

        let result =
            MqttClient::wait_for_connection_confirmation(state_rx, Duration::from_millis(200))
                .await;
        assert!(result.unwrap_err().to_string().contains("Max reconnection"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let ((_, _), (_shutdown_tx, shutdown_rx)) = MqttClient::setup_connection_channels();
        assert!(MqttClient::interruptible_sleep(shutdown_rx, 10).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let ((_, _), (shutdown_tx, shutdown_rx)) = MqttClient::setup_connection_channels();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });

        // Backoff of a full minute must still be cut short
        assert!(!MqttClient::interruptible_sleep(shutdown_rx, 60_000).await);
    }

    #[tokio::test]
    async fn test_connection_state_before_connect() {
        let device = DeviceSection::new("test-device-state");
        let client = MqttClient::new(&device, test_config()).await.unwrap();
        assert!(client.connection_state().is_none());
        assert!(!client.is_permanently_disconnected());
        assert!(!Transport::is_connected(&client));
    }

    #[tokio::test]
    async fn test_get_health_metrics_initial_state() {
        let device = DeviceSection::new("test-device-health");
        let client = MqttClient::new(&device, test_config()).await.unwrap();

        let metrics = client.get_health_metrics();
        assert_eq!(metrics.uptime, None);
        assert_eq!(metrics.time_since_last_publish, None);
        assert_eq!(metrics.reconnect_count, 0);
        assert!(!metrics.is_healthy);
        assert_eq!(client.link_quality(), ConnectionQuality::Critical);
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        let device = DeviceSection::new("test-device-publish");
        let client = MqttClient::new(&device, test_config()).await.unwrap();

        let result =
            Transport::publish(&client, "devices/x/heartbeat", b"{}".to_vec(), false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publish_rejected_while_reconnecting() {
        let device = DeviceSection::new("test-device-reconnecting");
        let mut client = MqttClient::new(&device, test_config()).await.unwrap();
        let ((state_tx, state_rx), _) = MqttClient::setup_connection_channels();
        client.state_rx = Some(state_rx);
        state_tx.send(ConnectionState::Reconnecting(2)).unwrap();

        let result = client
            .publish_message("devices/x/heartbeat", b"{}".to_vec(), false)
            .await;
        assert!(matches!(
            result,
            Err(MqttError::NotConnected {
                state: ConnectionState::Reconnecting(2)
            })
        ));
    }

    #[tokio::test]
    async fn test_set_inbound_sender_is_immediate() {
        let device = DeviceSection::new("test-device-inbound");
        let client = MqttClient::new(&device, test_config()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        client.set_inbound_sender(tx);

        let forwarder = client.message_forwarder.lock().unwrap().clone();
        forwarder
            .forward(InboundMessage::new("devices/test-device-inbound/commands/ping", "{}"))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let device = DeviceSection::new("test-device-disc");
        let mut client = MqttClient::new(&device, test_config()).await.unwrap();
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_at_construction() {
        let device = DeviceSection::new("dev");
        let result = MqttClient::new(&device, MqttSection::with_broker("not a url")).await;
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }
}
