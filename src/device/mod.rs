//! Device runtime: sensors, shadow, command dispatch and the agent loop

pub mod agent;
pub mod commands;
pub mod sensors;
pub mod shadow;

pub use agent::{AgentError, DeviceAgent, DeviceRuntime, PersistedDeviceState};
pub use commands::{
    CommandContext, CommandDispatcher, CommandHandler, DeviceCommand, CalibrateHandler,
    GetStatusHandler, PairDeviceHandler, PingHandler, TestSensorHandler,
};
pub use sensors::{SensorHub, SensorSource, SensorTestResult, SimulatedSensors};
pub use shadow::{DeviceShadow, ShadowChange};
