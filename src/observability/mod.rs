//! Observability: structured logging, process-wide metrics and the health endpoint

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthCheck, HealthServer};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{command_span, lifecycle_span, mqtt_span, sensor_span};
