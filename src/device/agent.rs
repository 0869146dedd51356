//! Device runtime
//!
//! [`DeviceAgent`] owns the transport, the sensor hub, local storage and the
//! outbound pipeline, and drives them from one `select!` loop. Command
//! handlers reach the device through [`DeviceRuntime`], which implements
//! [`CommandContext`].

use crate::config::DeviceConfig;
use crate::device::commands::{CommandContext, CommandDispatcher};
use crate::device::sensors::{SensorHub, SensorSource, SensorTestResult};
use crate::device::shadow::{DeviceShadow, ShadowChange};
use crate::error::{DeviceError, DeviceResult};
use crate::observability::health::HealthServer;
use crate::observability::metrics::metrics;
use crate::ota::OtaManager;
use crate::protocol::{
    now_millis, AlertSeverity, DataQuality, DeviceStatus, DeviceStatusType, Heartbeat,
    InboundMessage, Telemetry, TopicBuilder,
};
use crate::storage::data_manager::{
    DataManager, HealthAlert, DEVICE_STATE_FILE, FAILED_MESSAGES_FILE,
};
use crate::transport::mqtt::{InboundKind, MessageHandler};
use crate::transport::{OutboundMessage, OutboundPipeline, Priority, Transport};
use crate::vitals::SensorReading;
use crate::{lifecycle_span, sensor_span};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

const INBOUND_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent not started")]
    NotStarted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// State kept across restarts in `device_state.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDeviceState {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub paired_at: Option<i64>,
    #[serde(default)]
    pub sample_rate: Option<u64>,
}

/// Everything a command handler may touch
pub struct DeviceRuntime<T: Transport, S: SensorSource> {
    config: DeviceConfig,
    transport: T,
    sensors: SensorHub<S>,
    data: DataManager,
    pipeline: OutboundPipeline,
    shadow: DeviceShadow,
    ota: Option<OtaManager>,
    health: Option<Arc<HealthServer>>,
    user_id: Option<String>,
    paired_at: Option<i64>,
    started_at: Instant,
}

impl<T: Transport, S: SensorSource> DeviceRuntime<T, S> {
    fn device_id_str(&self) -> &str {
        &self.config.device.id
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn enqueue<B: Serialize>(&mut self, topic: String, body: &B, retain: bool, priority: Priority) {
        match OutboundMessage::json(topic, body, retain, priority) {
            Ok(message) => {
                // Rejections are logged and counted by the pipeline
                let _ = self.pipeline.submit(message);
            }
            Err(e) => error!(error = %e, "Failed to serialize outbound message"),
        }
    }

    fn status_message(&self, status: DeviceStatusType) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device_id_str().to_string(),
            status,
            timestamp: now_millis(),
            user_id: self.user_id.clone(),
            firmware_version: self.config.device.firmware_version.clone(),
            uptime: self.uptime_secs(),
        }
    }

    fn queue_status(&mut self, status: DeviceStatusType) {
        let message = self.status_message(status);
        let topic = TopicBuilder::status(self.device_id_str());
        self.enqueue(topic, &message, true, Priority::Normal);
    }

    fn queue_shadow_report(&mut self) {
        let document = self.shadow.reported_document();
        let topic = TopicBuilder::shadow_update(self.device_id_str());
        self.enqueue(topic, &document, false, Priority::Normal);
    }

    fn telemetry_for(&self, reading: &SensorReading) -> Vec<Telemetry> {
        reading
            .telemetry_entries()
            .into_iter()
            .map(|entry| Telemetry {
                device_id: self.device_id_str().to_string(),
                sensor_type: entry.sensor_type.to_string(),
                value: entry.value,
                unit: entry.unit.to_string(),
                timestamp: reading.timestamp,
                user_id: self.user_id.clone(),
                firmware_version: self.config.device.firmware_version.clone(),
                metadata: entry.metadata,
                quality: DataQuality::assess(entry.valid, entry.quality_score),
                calibrated: self.sensors.is_calibrated(entry.sensor_type),
            })
            .collect()
    }

    fn queue_telemetry(&mut self, reading: &SensorReading) {
        for telemetry in self.telemetry_for(reading) {
            let topic = TopicBuilder::telemetry(self.device_id_str(), &telemetry.sensor_type);
            self.enqueue(topic, &telemetry, false, Priority::Normal);
        }
    }

    fn queue_alerts(&mut self, alerts: &[HealthAlert]) {
        for alert in alerts {
            let priority = if alert.severity == AlertSeverity::Critical {
                Priority::Critical
            } else {
                Priority::High
            };
            let message = alert.to_message(self.device_id_str());
            let topic = TopicBuilder::alerts(self.device_id_str());
            self.enqueue(topic, &message, false, priority);
        }
    }

    fn persisted_state(&self) -> PersistedDeviceState {
        PersistedDeviceState {
            user_id: self.user_id.clone(),
            paired_at: self.paired_at,
            sample_rate: Some(self.shadow.sample_rate),
        }
    }

    fn save_device_state(&self) -> DeviceResult<()> {
        let path = self.data.path_for(DEVICE_STATE_FILE);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&self.persisted_state())?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_device_state(&mut self) -> DeviceResult<()> {
        let path = self.data.path_for(DEVICE_STATE_FILE);
        if !path.exists() {
            return Ok(());
        }
        let state: PersistedDeviceState = serde_json::from_slice(&std::fs::read(&path)?)
            .map_err(|e| DeviceError::storage(format!("Corrupt device state file: {e}")))?;

        if let Some(user_id) = state.user_id {
            self.shadow.user_id = Some(user_id.clone());
            self.user_id = Some(user_id);
        }
        self.paired_at = state.paired_at;
        if let Some(rate) = state.sample_rate {
            let delta = json!({ "sampleRate": rate });
            for change in self.shadow.apply_delta(&delta) {
                if let ShadowChange::Rejected { field, reason } = change {
                    warn!(field = %field, reason = %reason, "Ignoring persisted setting");
                }
            }
        }
        debug!(user_id = ?self.user_id, "Restored device state");
        Ok(())
    }

    async fn flush(&mut self) -> usize {
        self.pipeline.process_message_queue(&self.transport).await
    }

    fn sync_health(&self) {
        let connected = self.transport.is_connected();
        if let Some(health) = &self.health {
            health.set_mqtt_connected(connected);
        }
        metrics().update_health_status(connected);
    }
}

#[async_trait]
impl<T: Transport, S: SensorSource> CommandContext for DeviceRuntime<T, S> {
    fn device_id(&self) -> &str {
        self.device_id_str()
    }

    fn firmware_version(&self) -> &str {
        &self.config.device.firmware_version
    }

    async fn pair_user(&mut self, user_id: &str) -> DeviceResult<()> {
        self.user_id = Some(user_id.to_string());
        self.paired_at = Some(now_millis());
        self.shadow.user_id = Some(user_id.to_string());
        self.save_device_state()?;
        self.queue_shadow_report();
        Ok(())
    }

    async fn test_sensor(&mut self, sensor: &str) -> DeviceResult<Vec<SensorTestResult>> {
        let results = self.sensors.test_sensor(sensor).await?;
        let timestamp = now_millis();
        for result in &results {
            let telemetry = Telemetry {
                device_id: self.device_id_str().to_string(),
                sensor_type: result.sensor.to_string(),
                value: result.value,
                unit: result.unit.to_string(),
                timestamp,
                user_id: self.user_id.clone(),
                firmware_version: self.config.device.firmware_version.clone(),
                metadata: json!({ "test": true }),
                quality: DataQuality::assess(result.status == "ok", None),
                calibrated: self.sensors.is_calibrated(result.sensor),
            };
            let topic = TopicBuilder::telemetry(self.device_id_str(), result.sensor);
            self.enqueue(topic, &telemetry, false, Priority::Normal);
        }
        Ok(results)
    }

    async fn calibrate(
        &mut self,
        sensor: &str,
        params: &Map<String,
        Value>,
    ) -> DeviceResult<String> {
        self.sensors.calibrate(sensor, params, now_millis()).await
    }

    fn status_document(&self) -> Value {
        let storage = self.data.statistics();
        json!({
            "deviceStatus": DeviceStatusType::Online.as_str(),
            "userId": self.user_id,
            "firmwareVersion": self.config.device.firmware_version,
            "uptime": self.uptime_secs(),
            "sampleRate": self.shadow.sample_rate,
            "sensorSource": self.sensors.source_name(),
            "connection": self.pipeline.connection_status(&self.transport),
            "queueSize": self.pipeline.queue_size(),
            "retryQueueSize": self.pipeline.retry_queue_size(),
            "pendingAlerts": storage.unacknowledged_alerts,
            "uploadSuccessRate": storage.upload_success_rate,
            "storage": storage,
            "ota": self.ota.as_ref().map(|ota| ota.status_string()),
        })
    }

    async fn publish_status(&mut self) -> DeviceResult<()> {
        self.queue_status(DeviceStatusType::Online);
        self.queue_shadow_report();
        Ok(())
    }
}

/// The device agent: runtime state plus command dispatch and the inbound channel
pub struct DeviceAgent<T: Transport, S: SensorSource> {
    runtime: DeviceRuntime<T, S>,
    dispatcher: CommandDispatcher,
    inbound_rx: Option<mpsc::Receiver<InboundMessage>>,
    started: bool,
}

impl<T: Transport, S: SensorSource> DeviceAgent<T, S> {
    pub fn new(config: DeviceConfig, transport: T, source: S) -> DeviceResult<Self> {
        let device_id = config.device.id.clone();
        let sensors = SensorHub::new(
            device_id.clone(),
            source,
            &config.sensors,
            config.user.clone(),
        );
        let data = DataManager::new(device_id.clone(), &config.storage, config.alerts.clone())?;
        let pipeline = OutboundPipeline::from_config(&config.mqtt);

        let mut shadow = DeviceShadow::new(
            config.device.firmware_version.clone(),
            config.sensors.sample_interval_ms(),
        );
        shadow.user_id = config.device.user_id.clone();

        let ota = match &config.ota {
            Some(section) => Some(
                OtaManager::new(
                    device_id.clone(),
                    config.device.firmware_version.clone(),
                    section,
                    config.storage.data_dir.join("ota"),
                )
                .map_err(DeviceError::from)?,
            ),
            None => None,
        };

        let user_id = config.device.user_id.clone();
        Ok(Self {
            runtime: DeviceRuntime {
                config,
                transport,
                sensors,
                data,
                pipeline,
                shadow,
                ota,
                health: None,
                user_id,
                paired_at: None,
                started_at: Instant::now(),
            },
            dispatcher: CommandDispatcher::with_builtin_handlers(),
            inbound_rx: None,
            started: false,
        })
    }

    pub fn set_health_server(&mut self, health: Arc<HealthServer>) {
        self.runtime.health = Some(health);
    }

    pub fn dispatcher_mut(&mut self) -> &mut CommandDispatcher {
        &mut self.dispatcher
    }

    pub fn device_id(&self) -> &str {
        self.runtime.device_id_str()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.runtime.user_id.as_deref()
    }

    pub fn shadow(&self) -> &DeviceShadow {
        &self.runtime.shadow
    }

    pub fn data(&self) -> &DataManager {
        &self.runtime.data
    }

    pub fn transport(&self) -> &T {
        &self.runtime.transport
    }

    pub fn pipeline(&self) -> &OutboundPipeline {
        &self.runtime.pipeline
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.runtime.transport.is_permanently_disconnected()
    }

    /// Connect, subscribe, restore persisted state and announce the device
    pub async fn start(&mut self) -> Result<(), AgentError> {
        let span = lifecycle_span!(device_id = %self.device_id(), phase = "start");
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&mut self) -> Result<(), AgentError> {
        metrics().set_agent_state("starting");
        let device_id = self.device_id().to_string();

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        self.runtime.transport.set_inbound_sender(tx);
        self.inbound_rx = Some(rx);

        self.runtime
            .transport
            .connect()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        for filter in [
            TopicBuilder::commands_filter(&device_id),
            TopicBuilder::shadow_delta(&device_id),
        ] {
            self.runtime
                .transport
                .subscribe(&filter)
                .await
                .map_err(|e| AgentError::Transport(e.to_string()))?;
            debug!(topic = %filter, "Subscribed");
        }

        let failed_path = self.runtime.data.path_for(FAILED_MESSAGES_FILE);
        match self.runtime.pipeline.load_failed_messages(&failed_path).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Restored unsent messages from previous run"),
            Err(e) => warn!(error = %e, "Could not restore unsent messages"),
        }
        if let Err(e) = self.runtime.load_device_state() {
            warn!(error = %e, "Could not restore device state");
        }
        if let Err(e) = self.runtime.data.load_alerts() {
            warn!(error = %e, "Could not restore alerts");
        }

        self.runtime.queue_status(DeviceStatusType::Online);
        self.runtime.queue_shadow_report();
        self.runtime.flush().await;
        self.runtime.sync_health();

        self.started = true;
        metrics().agent_started();
        metrics().set_agent_state("running");
        info!(
            device_id = %device_id,
            firmware_version = %self.runtime.config.device.firmware_version,
            sensor_source = %self.runtime.sensors.source_name(),
            "Device agent started"
        );
        Ok(())
    }

    /// One sampling pass: read sensors, store, queue telemetry and alerts
    pub async fn sample_once(&mut self, now_ms: i64) -> Vec<HealthAlert> {
        let started = Instant::now();
        let span = sensor_span!(timestamp = now_ms);
        let reading = self.runtime.sensors.sample_all(now_ms).instrument(span).await;
        metrics().sensor_sample_taken(started.elapsed());

        if let Some(health) = &self.runtime.health {
            health.record_sample_now();
        }
        self.runtime.shadow.update_from_reading(&reading);

        if !reading.has_measurements() {
            debug!(timestamp = now_ms, "No sensor due this tick");
            return Vec::new();
        }
        if !reading.is_valid() {
            debug!(timestamp = now_ms, "Sampling pass produced no valid data");
            metrics().sensor_reading_rejected();
            return Vec::new();
        }

        self.runtime.queue_telemetry(&reading);
        let alerts = match self.runtime.data.add_reading(reading) {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(error = %e, "Failed to store reading");
                Vec::new()
            }
        };
        self.runtime.queue_alerts(&alerts);
        self.runtime.flush().await;
        alerts
    }

    /// Queue the pending data batch and drain both queues
    pub async fn upload_once(&mut self, now_ms: i64) -> usize {
        let mut published = 0;

        if self.runtime.data.buffered_readings() > 0 {
            let batch = self.runtime.data.get_pending_data_json();
            let topic = TopicBuilder::events(self.device_id());
            let submitted = OutboundMessage::json(topic, &batch, false, Priority::Normal)
                .map_err(DeviceError::from)
                .and_then(|m| {
                    self.runtime
                        .pipeline
                        .submit(m)
                        .map_err(|e| DeviceError::internal(e.to_string()))
                });

            let retry_before = self.runtime.pipeline.retry_queue_size();
            published += self.runtime.flush().await;
            let delivered = submitted.is_ok()
                && self.runtime.pipeline.queue_size() == 0
                && self.runtime.pipeline.retry_queue_size() <= retry_before;
            self.runtime.data.record_upload(delivered);
        } else {
            published += self.runtime.flush().await;
        }

        let retried = self
            .runtime
            .pipeline
            .process_retry_queue(&self.runtime.transport, now_ms)
            .await;
        self.runtime.sync_health();
        published + retried
    }

    pub fn heartbeat(&self) -> Heartbeat {
        let runtime = &self.runtime;
        Heartbeat {
            device_id: runtime.device_id_str().to_string(),
            timestamp: now_millis(),
            uptime: runtime.uptime_secs(),
            firmware_version: runtime.config.device.firmware_version.clone(),
            queue_size: runtime.pipeline.queue_size(),
            retry_queue_size: runtime.pipeline.retry_queue_size(),
            connection: runtime.pipeline.connection_status(&runtime.transport),
            pending_alerts: runtime.data.unacknowledged_alert_count(),
            upload_success_rate: runtime.data.upload_success_rate(),
        }
    }

    pub async fn send_heartbeat(&mut self) {
        let heartbeat = self.heartbeat();
        let topic = TopicBuilder::heartbeat(self.device_id());
        self.runtime.enqueue(topic, &heartbeat, false, Priority::Low);
        self.runtime.flush().await;
        metrics().mqtt_heartbeat();
        self.runtime.sync_health();
        debug!(
            queue_size = heartbeat.queue_size,
            retry_queue_size = heartbeat.retry_queue_size,
            connection = %heartbeat.connection,
            "Heartbeat queued"
        );
    }

    /// Route one inbound message to the dispatcher or the shadow
    pub async fn handle_inbound(&mut self, message: InboundMessage) {
        let device_id = self.device_id().to_string();

        if !MessageHandler::should_process_message(&message.topic, message.retain, &device_id) {
            return;
        }

        match MessageHandler::classify_inbound(&message.topic, &device_id) {
            InboundKind::Command(name) => {
                let response = self
                    .dispatcher
                    .dispatch(&message.topic, &message.payload, &mut self.runtime)
                    .await;
                if let Some(response) = response {
                    let topic = TopicBuilder::response(&device_id, &name);
                    self.runtime.enqueue(topic, &response, false, Priority::High);
                }
                self.runtime.flush().await;
            }
            InboundKind::ShadowDelta => {
                let delta: Value = match serde_json::from_slice(&message.payload) {
                    Ok(delta) => delta,
                    Err(e) => {
                        warn!(error = %e, "Dropping malformed shadow delta");
                        return;
                    }
                };
                self.apply_shadow_delta(&delta).await;
            }
            InboundKind::ShadowAccepted => {
                debug!("Shadow update accepted");
            }
            InboundKind::Unknown => {}
        }
    }

    async fn apply_shadow_delta(&mut self, delta: &Value) {
        let changes = self.runtime.shadow.apply_delta(delta);
        let mut persist = false;

        for change in &changes {
            match change {
                ShadowChange::UserId(user_id) => {
                    info!(user_id = %user_id, "User updated from shadow");
                    self.runtime.user_id = Some(user_id.clone());
                    self.runtime.paired_at = Some(now_millis());
                    persist = true;
                }
                ShadowChange::SampleRate(ms) => {
                    info!(sample_rate_ms = ms, "Sample rate updated from shadow");
                    persist = true;
                }
                ShadowChange::Rejected { field, reason } => {
                    warn!(field = %field, reason = %reason, "Rejected shadow delta field");
                }
            }
        }

        if persist {
            if let Err(e) = self.runtime.save_device_state() {
                warn!(error = %e, "Failed to persist device state");
            }
        }
        if !changes.is_empty() {
            self.runtime.queue_shadow_report();
            self.runtime.flush().await;
        }
    }

    async fn check_ota(&mut self, now_ms: i64) {
        let Some(ota) = self.runtime.ota.as_mut() else {
            return;
        };
        let result = ota.handle_auto_updates(now_ms).await;
        let status = ota.status_string();
        let version = ota.latest_update().map(|u| u.version.clone());

        match result {
            Ok(true) => {
                info!(version = ?version, "Firmware update installed, restart to apply");
                let event = json!({
                    "deviceId": self.device_id(),
                    "event": "ota_installed",
                    "version": version,
                    "status": status,
                    "timestamp": now_ms,
                });
                let topic = TopicBuilder::events(self.device_id());
                self.runtime.enqueue(topic, &event, false, Priority::High);
            }
            Ok(false) => debug!(status = %status, "OTA check complete"),
            Err(e) => warn!(error = %e, "OTA check failed"),
        }
    }

    fn sample_period(&self) -> Duration {
        Duration::from_millis(self.runtime.shadow.sample_rate)
    }

    /// Drive the agent until `shutdown` resolves or the link is lost for good
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()> + Send,
    {
        if !self.started {
            return Err(AgentError::NotStarted);
        }
        let Some(mut inbound_rx) = self.inbound_rx.take() else {
            return Err(AgentError::NotStarted);
        };
        tokio::pin!(shutdown);

        let config = &self.runtime.config;
        let mut period = self.sample_period();
        let mut sample_tick = interval(period);
        let mut upload_tick = interval(Duration::from_millis(config.sensors.upload_interval_ms));
        let mut heartbeat_tick =
            interval(Duration::from_secs(config.mqtt.heartbeat_interval_secs));
        let ota_period = config
            .ota
            .as_ref()
            .map(|ota| Duration::from_secs(ota.check_interval_secs.max(1)));
        let mut ota_tick = interval(ota_period.unwrap_or(Duration::from_secs(3600)));
        for tick in [&mut sample_tick, &mut upload_tick, &mut heartbeat_tick, &mut ota_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // Heartbeat waits one full interval
        heartbeat_tick.reset();

        info!(sample_period_ms = period.as_millis() as u64, "Device agent loop running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = sample_tick.tick() => {
                    self.sample_once(now_millis()).await;
                }
                _ = upload_tick.tick() => {
                    self.upload_once(now_millis()).await;
                }
                _ = heartbeat_tick.tick() => {
                    self.send_heartbeat().await;
                    if self.is_permanently_disconnected() {
                        error!("MQTT connection permanently lost, stopping agent loop");
                        break;
                    }
                }
                _ = ota_tick.tick(), if ota_period.is_some() => {
                    self.check_ota(now_millis()).await;
                }
                message = inbound_rx.recv() => {
                    match message {
                        Some(message) => self.handle_inbound(message).await,
                        None => {
                            warn!("Inbound channel closed");
                            break;
                        }
                    }
                }
            }

            let wanted = self.sample_period();
            if wanted != period {
                period = wanted;
                sample_tick = interval(period);
                sample_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                sample_tick.reset();
            }
        }

        self.inbound_rx = Some(inbound_rx);
        Ok(())
    }

    /// Announce offline, persist unsent messages and disconnect
    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let span = lifecycle_span!(device_id = %self.device_id(), phase = "shutdown");
        self.shutdown_inner().instrument(span).await
    }

    async fn shutdown_inner(&mut self) -> Result<(), AgentError> {
        metrics().set_agent_state("stopping");

        self.runtime.queue_status(DeviceStatusType::Offline);
        self.runtime.flush().await;

        let failed_path = self.runtime.data.path_for(FAILED_MESSAGES_FILE);
        match self.runtime.pipeline.save_failed_messages(&failed_path).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Saved unsent messages for next start"),
            Err(e) => error!(error = %e, "Failed to save unsent messages"),
        }

        if let Err(e) = self.runtime.transport.disconnect().await {
            warn!(error = %e, "Error while disconnecting");
        }
        self.runtime.sync_health();
        self.started = false;
        metrics().set_agent_state("stopped");
        info!("Device agent stopped");
        Ok(())
    }
}
