//! Health check HTTP server
//!
//! Lets a gateway supervisor or an operator on the bench see whether the
//! device is connected and still sampling.

use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Sensor data older than this is reported stale
pub const DEFAULT_SENSOR_STALENESS_SECS: u64 = 120;

/// HTTP health check server
pub struct HealthServer {
    device_id: String,
    port: u16,
    sensor_staleness_secs: u64,
    mqtt_connected: Arc<AtomicBool>,
    last_sample: Arc<AtomicU64>,
    additional_checks: Arc<RwLock<BTreeMap<String, HealthCheck>>>,
}

impl HealthServer {
    pub fn new(device_id: impl Into<String>, port: u16) -> Self {
        Self {
            device_id: device_id.into(),
            port,
            sensor_staleness_secs: DEFAULT_SENSOR_STALENESS_SECS,
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            last_sample: Arc::new(AtomicU64::new(0)),
            additional_checks: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Port from `HEALTH_PORT`, falling back to 8080
    pub fn port_from_env() -> u16 {
        std::env::var("HEALTH_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_HEALTH_PORT)
    }

    pub fn with_sensor_staleness(mut self, secs: u64) -> Self {
        self.sensor_staleness_secs = secs;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    /// Record a sampling pass (Unix seconds)
    pub fn set_last_sample(&self, timestamp: u64) {
        self.last_sample.store(timestamp, Ordering::Relaxed);
    }

    pub fn record_sample_now(&self) {
        self.set_last_sample(current_timestamp());
    }

    pub async fn add_health_check(&self, name: impl Into<String>, check: HealthCheck) {
        self.additional_checks.write().await.insert(name.into(), check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// All routes served by [`HealthServer::start`]
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = Arc::clone(self);
        let ready_server = Arc::clone(self);

        // GET /health
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&health_server);
                async move {
                    let status = server.get_health_status().await;
                    let code = if status.status == "healthy" {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
                }
            });

        // GET /metrics
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&metrics().get_metrics()),
                    StatusCode::OK,
                ))
            });

        // GET /ready
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let server = Arc::clone(&ready_server);
                async move {
                    let ready = server.mqtt_connected.load(Ordering::Relaxed);
                    let response = ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    };
                    let code = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    Ok::<_, Infallible>(warp::reply::with_status(
                        warp::reply::json(&response),
                        code,
                    ))
                }
            });

        // GET /live
        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(|| async move {
                let response = LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    StatusCode::OK,
                ))
            });

        // GET /
        let root_route = warp::path::end().and(warp::get()).and_then(|| async move {
            let endpoints = BTreeMap::from([
                ("/health", "MQTT connectivity and sensor freshness"),
                ("/metrics", "Counters for sensors, queues, MQTT and commands"),
                ("/ready", "200 once the broker session is up"),
                ("/live", "Always 200 while the process runs"),
            ]);
            Ok::<_, Infallible>(warp::reply::with_status(
                warp::reply::json(&ApiDocumentationResponse { endpoints }),
                StatusCode::OK,
            ))
        });

        health_route
            .or(metrics_route)
            .unify()
            .or(ready_route)
            .unify()
            .or(live_route)
            .unify()
            .or(root_route)
            .unify()
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until the task is dropped
    pub async fn start(self: Arc<Self>) {
        let routes = self.routes();
        tracing::info!(port = self.port, device_id = %self.device_id, "Starting health server");
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = BTreeMap::new();
        checks.insert("mqtt".to_string(), self.check_mqtt_health());
        checks.insert("sensors".to_string(), self.check_sensor_freshness());

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        let healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            device_id: self.device_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_mqtt_health(&self) -> HealthCheck {
        if self.mqtt_connected.load(Ordering::Relaxed) {
            HealthCheck::healthy("MQTT connection established")
        } else {
            HealthCheck::new("unhealthy", "MQTT disconnected")
        }
    }

    fn check_sensor_freshness(&self) -> HealthCheck {
        let last = self.last_sample.load(Ordering::Relaxed);
        if last == 0 {
            return HealthCheck::healthy("No samples yet");
        }

        let age = current_timestamp().saturating_sub(last);
        if age > self.sensor_staleness_secs {
            HealthCheck::new("stale", format!("No sensor data for {age} seconds"))
        } else {
            HealthCheck::healthy("Sensor data is fresh")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new("healthy", message)
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    device_id: String,
    uptime_seconds: u64,
    checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
