//! Pure reconnection decisions and link health assessment
//!
//! Nothing here touches the network; the supervisor in [`super::client`]
//! feeds events in and acts on the decisions that come out.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Missed heartbeats tolerated before the link is considered stale
const STALE_HEARTBEAT_FACTOR: u32 = 3;

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether the supervisor should try another reconnect
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// How long `connect` waits for the first ConnAck
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => Duration::from_millis(max_total_time + 10_000),
            None => Duration::from_secs(60),
        }
    }

    /// Next connection state for an event
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        let next = match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
            ConnectionEvent::ShutdownRequested => {
                ConnectionState::Disconnected("Shutdown requested".to_string())
            }
        };
        Self::log_state_transition(current_state, &next);
        next
    }

    /// Attempt counter after an event; a ConnAck starts the next outage from zero
    pub fn next_attempt_count(current_attempts: u32, event: &ConnectionEvent) -> u32 {
        match event {
            ConnectionEvent::ConnAckReceived => 0,
            ConnectionEvent::ReconnectionStarted(attempt) => *attempt,
            _ => current_attempts,
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Link health from connection age and the last successful publish
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_publish_time: Option<Instant>,
        reconnect_count: u32,
        heartbeat_interval: Duration,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_publish = last_publish_time.map(|t| now.duration_since(t));
        let stale_after = heartbeat_interval * STALE_HEARTBEAT_FACTOR;

        HealthMetrics {
            uptime,
            time_since_last_publish,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_publish, stale_after),
        }
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_publish: Option<Duration>,
        stale_after: Duration,
    ) -> bool {
        match (uptime, time_since_last_publish) {
            (Some(_), None) => true,
            (Some(_), Some(last)) => last < stale_after,
            _ => false,
        }
    }

    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!(attempt = attempt, "MQTT reconnection successful");
            }
            (_, ConnectionState::Connected) => {
                info!("MQTT session established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt = attempt, "Starting MQTT reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!(from = ?from, to = ?to, "MQTT connection state changed");
            }
        }
    }

    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        if config.backoff_pattern.iter().any(|delay| *delay == 0) {
            return Err("backoff_pattern entries must be greater than 0".to_string());
        }

        if config
            .backoff_pattern
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err("backoff_pattern must not decrease".to_string());
        }

        Ok(())
    }

    /// Grade the link from its health and how often it has dropped
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        let uptime = metrics.uptime.unwrap_or_default();
        match metrics.reconnect_count {
            0 if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            0 => ConnectionQuality::Good,
            1..=2 if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            1..=5 => ConnectionQuality::Fair,
            6..=10 => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
    ShutdownRequested,
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub uptime: Option<Duration>,
    pub time_since_last_publish: Option<Duration>,
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection_follows_device_backoff() {
        let config = ReconnectConfig::for_device(5);

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 1000
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 4,
                delay_ms: 8000
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(5, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_unlimited_reconnection_sustains() {
        let config = ReconnectConfig::default();
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(50, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 51,
                delay_ms: 30000
            }
        );
    }

    #[test]
    fn test_calculate_connection_timeout() {
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&ReconnectConfig::default()),
            Duration::from_secs(60)
        );

        let limited = ReconnectConfig::for_device(3);
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&limited),
            Duration::from_millis(1000 + 2000 + 4000 + 10_000)
        );
    }

    #[test]
    fn test_determine_next_state() {
        let connecting = ConnectionState::Connecting;
        assert_eq!(
            HealthMonitor::determine_next_state(&connecting, ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );

        let connected = ConnectionState::Connected;
        assert_eq!(
            HealthMonitor::determine_next_state(&connected, ConnectionEvent::DisconnectedByBroker),
            ConnectionState::Disconnected("Broker disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(
                &connected,
                ConnectionEvent::NetworkError("tls alert".to_string())
            ),
            ConnectionState::Disconnected("tls alert".to_string())
        );

        let disconnected = ConnectionState::Disconnected("x".to_string());
        assert_eq!(
            HealthMonitor::determine_next_state(
                &disconnected,
                ConnectionEvent::ReconnectionStarted(2)
            ),
            ConnectionState::Reconnecting(2)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(
                &disconnected,
                ConnectionEvent::PermanentFailure("max attempts".to_string())
            ),
            ConnectionState::PermanentlyDisconnected("max attempts".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(&connected, ConnectionEvent::ShutdownRequested),
            ConnectionState::Disconnected("Shutdown requested".to_string())
        );
    }

    #[test]
    fn test_attempt_counter_resets_on_connack() {
        assert_eq!(
            HealthMonitor::next_attempt_count(4, &ConnectionEvent::ConnAckReceived),
            0
        );
        assert_eq!(
            HealthMonitor::next_attempt_count(1, &ConnectionEvent::ReconnectionStarted(2)),
            2
        );
        assert_eq!(
            HealthMonitor::next_attempt_count(
                3,
                &ConnectionEvent::NetworkError("reset".to_string())
            ),
            3
        );
    }

    #[test]
    fn test_only_connected_state_allows_traffic() {
        let states = [
            ConnectionState::Connecting,
            ConnectionState::Disconnected("x".to_string()),
            ConnectionState::Reconnecting(1),
            ConnectionState::PermanentlyDisconnected("x".to_string()),
        ];
        for state in &states {
            assert!(!HealthMonitor::can_publish(state));
            assert!(!HealthMonitor::can_subscribe(state));
        }
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(HealthMonitor::can_subscribe(&ConnectionState::Connected));
    }

    #[test]
    fn test_health_metrics_use_heartbeat_interval() {
        let now = Instant::now();
        let heartbeat = Duration::from_secs(60);

        let metrics = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(3600)),
            Some(now - Duration::from_secs(100)),
            1,
            heartbeat,
        );
        assert!(metrics.is_healthy);
        assert_eq!(metrics.reconnect_count, 1);

        let stale = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(3600)),
            Some(now - Duration::from_secs(200)),
            0,
            heartbeat,
        );
        assert!(!stale.is_healthy);

        let disconnected = HealthMonitor::calculate_health_metrics(None, None, 0, heartbeat);
        assert!(!disconnected.is_healthy);

        let fresh = HealthMonitor::calculate_health_metrics(Some(now), None, 0, heartbeat);
        assert!(fresh.is_healthy);
    }

    #[test]
    fn test_validate_connection_config() {
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig::default()).is_ok());
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig::for_device(5)).is_ok());

        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_attempts).is_err());

        let zero_sustained = ReconnectConfig {
            sustained_delay: 0,
            ..Default::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_sustained).is_err());

        let decreasing = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![4000, 1000],
            sustained_delay: 30000,
        };
        assert!(HealthMonitor::validate_connection_config(&decreasing).is_err());
    }

    #[test]
    fn test_assess_connection_quality() {
        let metrics = |uptime_secs: Option<u64>, reconnects: u32, healthy: bool| HealthMetrics {
            uptime: uptime_secs.map(Duration::from_secs),
            time_since_last_publish: Some(Duration::from_secs(30)),
            reconnect_count: reconnects,
            is_healthy: healthy,
        };

        let cases = [
            (Some(7200), 0, true, ConnectionQuality::Excellent),
            (Some(600), 0, true, ConnectionQuality::Good),
            (Some(2400), 2, true, ConnectionQuality::Good),
            (Some(600), 2, true, ConnectionQuality::Fair),
            (Some(600), 8, true, ConnectionQuality::Poor),
            (Some(600), 20, true, ConnectionQuality::Critical),
            (None, 0, false, ConnectionQuality::Critical),
        ];
        for (uptime, reconnects, healthy, expected) in cases {
            assert_eq!(
                HealthMonitor::assess_connection_quality(&metrics(uptime, reconnects, healthy)),
                expected,
                "uptime {uptime:?}, reconnects {reconnects}"
            );
        }
    }
}
