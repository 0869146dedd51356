//! Inbound command dispatch
//!
//! Commands arrive on `devices/{id}/commands/{name}` as JSON. The dispatcher
//! looks up a registered [`CommandHandler`] by name, runs it against the
//! device through [`CommandContext`], and builds the [`CommandResponse`]
//! the agent publishes on `devices/{id}/responses/{name}`.

use crate::command_span;
use crate::device::sensors::SensorTestResult;
use crate::error::{DeviceError, DeviceResult};
use crate::observability::metrics::metrics;
use crate::protocol::{now_millis, CommandResponse, ResponseStatus};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Parsed inbound command
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    #[serde(default)]
    pub command: String,
    #[serde(default = "default_request_id", deserialize_with = "string_or_number")]
    pub request_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_sensor_type")]
    pub sensor_type: String,
    /// Every other field of the payload
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

fn default_request_id() -> String {
    now_millis().to_string()
}

fn default_sensor_type() -> String {
    "all".to_string()
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(default_request_id()),
        other => Err(serde::de::Error::custom(format!(
            "requestId must be a string or number, got {other}"
        ))),
    }
}

impl DeviceCommand {
    /// Parse a payload; the command name falls back to the last topic segment
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        let mut command: DeviceCommand = serde_json::from_slice(payload)?;
        if command.command.is_empty() {
            command.command = topic.rsplit('/').next().unwrap_or_default().to_string();
        }
        Ok(command)
    }
}

/// What handlers may do to the device
#[async_trait]
pub trait CommandContext: Send {
    fn device_id(&self) -> &str;

    fn firmware_version(&self) -> &str;

    /// Store and persist the paired user, then queue a shadow update
    async fn pair_user(&mut self, user_id: &str) -> DeviceResult<()>;

    /// Probe sensors and queue a telemetry message per result
    async fn test_sensor(&mut self, sensor: &str) -> DeviceResult<Vec<SensorTestResult>>;

    async fn calibrate(
        &mut self,
        sensor: &str,
        params: &Map<String, Value>,
    ) -> DeviceResult<String>;

    fn status_document(&self) -> Value;

    /// Queue the status message and a shadow report
    async fn publish_status(&mut self) -> DeviceResult<()>;
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Result fields merged into the response document
    async fn handle(
        &self,
        command: &DeviceCommand,
        ctx: &mut dyn CommandContext,
    ) -> DeviceResult<Value>;
}

pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn handle(
        &self,
        _command: &DeviceCommand,
        _ctx: &mut dyn CommandContext,
    ) -> DeviceResult<Value> {
        Ok(json!({ "responseTime": now_millis() }))
    }
}

pub struct PairDeviceHandler;

#[async_trait]
impl CommandHandler for PairDeviceHandler {
    fn name(&self) -> &'static str {
        "pair_device"
    }

    async fn handle(
        &self,
        command: &DeviceCommand,
        ctx: &mut dyn CommandContext,
    ) -> DeviceResult<Value> {
        let user_id = command
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DeviceError::invalid_input("pair_device requires a non-empty userId"))?;

        ctx.pair_user(user_id).await?;
        info!(device_id = %ctx.device_id(), user_id = %user_id, "Device paired");

        Ok(json!({
            "userId": user_id,
            "firmwareVersion": ctx.firmware_version(),
        }))
    }
}

pub struct TestSensorHandler;

#[async_trait]
impl CommandHandler for TestSensorHandler {
    fn name(&self) -> &'static str {
        "test_sensor"
    }

    async fn handle(
        &self,
        command: &DeviceCommand,
        ctx: &mut dyn CommandContext,
    ) -> DeviceResult<Value> {
        let results = ctx.test_sensor(&command.sensor_type).await?;

        let mut by_sensor = Map::new();
        for result in results {
            by_sensor.insert(
                result.sensor.to_string(),
                json!({
                    "value": result.value,
                    "unit": result.unit,
                    "status": result.status,
                }),
            );
        }
        Ok(json!({ "sensorType": command.sensor_type, "results": by_sensor }))
    }
}

pub struct CalibrateHandler;

#[async_trait]
impl CommandHandler for CalibrateHandler {
    fn name(&self) -> &'static str {
        "calibrate"
    }

    async fn handle(
        &self,
        command: &DeviceCommand,
        ctx: &mut dyn CommandContext,
    ) -> DeviceResult<Value> {
        if command.sensor_type == "all" {
            return Err(DeviceError::invalid_input(
                "calibrate requires a specific sensorType",
            ));
        }
        let message = ctx.calibrate(&command.sensor_type, &command.params).await?;
        Ok(json!({
            "sensorType": command.sensor_type,
            "message": message,
            "calibratedAt": now_millis(),
        }))
    }
}

pub struct GetStatusHandler;

#[async_trait]
impl CommandHandler for GetStatusHandler {
    fn name(&self) -> &'static str {
        "get_status"
    }

    async fn handle(
        &self,
        _command: &DeviceCommand,
        ctx: &mut dyn CommandContext,
    ) -> DeviceResult<Value> {
        ctx.publish_status().await?;
        Ok(ctx.status_document())
    }
}

/// Registry of command handlers keyed by name
pub struct CommandDispatcher {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Dispatcher with the five built-in handlers registered
    pub fn with_builtin_handlers() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(Box::new(PingHandler));
        dispatcher.register(Box::new(PairDeviceHandler));
        dispatcher.register(Box::new(TestSensorHandler));
        dispatcher.register(Box::new(CalibrateHandler));
        dispatcher.register(Box::new(GetStatusHandler));
        dispatcher
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(&mut self, handler: Box<dyn CommandHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(command = %name, "Replaced command handler");
        }
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle one inbound command
    ///
    /// Returns None when the payload is not a valid command document; such
    /// messages are logged and get no response.
    pub async fn dispatch(
        &self,
        topic: &str,
        payload: &[u8],
        ctx: &mut dyn CommandContext,
    ) -> Option<CommandResponse> {
        let command = match DeviceCommand::parse(topic, payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping malformed command payload");
                return None;
            }
        };

        let span = command_span!(
            command = %command.command,
            request_id = %command.request_id
        );

        Some(self.execute(command, ctx).instrument(span).await)
    }

    async fn execute(
        &self,
        command: DeviceCommand,
        ctx: &mut dyn CommandContext,
    ) -> CommandResponse {
        metrics().command_received(&command.command);
        let started = Instant::now();

        let outcome = match self.handlers.get(&command.command) {
            Some(handler) => handler.handle(&command, ctx).await,
            None => Err(DeviceError::command(format!(
                "Unknown command: {}",
                command.command
            ))),
        };

        metrics().command_completed(&command.command, started.elapsed(), outcome.is_ok());

        let mut response = CommandResponse {
            command: command.command.clone(),
            request_id: command.request_id.clone(),
            status: ResponseStatus::Success,
            device_id: ctx.device_id().to_string(),
            timestamp: now_millis(),
            message: None,
            result: Map::new(),
        };

        match outcome {
            Ok(Value::Object(fields)) => {
                let moved = response.merge_result(fields);
                if !moved.is_empty() {
                    warn!(
                        command = %command.command,
                        fields = ?moved,
                        "Handler result used reserved response fields, nested under result"
                    );
                }
            }
            Ok(Value::Null) => {}
            Ok(other) => {
                response.result.insert("result".to_string(), other);
            }
            Err(e) => {
                warn!(command = %command.command, error = %e, "Command failed");
                response.status = ResponseStatus::Error;
                response.message = Some(match &e {
                    DeviceError::Command { message } => {
                        crate::error::sanitize_error_message(message)
                    }
                    other => other.public_message(),
                });
                response
                    .result
                    .insert("errorCode".to_string(), Value::String(e.code().to_string()));
            }
        }

        response
    }
}
