//! Process-wide counters
//!
//! Sampling, the outbound queues, the MQTT link and command handling each
//! update their own group of atomics. [`MetricsCollector::get_metrics`]
//! folds them into a serializable [`MetricsSnapshot`] for `/metrics`.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sampling durations and per-command timings kept for percentiles
const TIMING_WINDOW: usize = 1000;

pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// The global collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn zero(counters: &[&AtomicU64]) {
    for counter in counters {
        counter.store(0, Ordering::Relaxed);
    }
}

fn push_bounded(window: &mut VecDeque<u64>, value: u64) {
    if window.len() == TIMING_WINDOW {
        window.pop_front();
    }
    window.push_back(value);
}

#[derive(Default)]
struct SensorCounters {
    samples: AtomicU64,
    rejected: AtomicU64,
    alerts: AtomicU64,
    last_sample: AtomicU64,
    durations_ms: Mutex<VecDeque<u64>>,
}

impl SensorCounters {
    fn snapshot(&self) -> SensorMetrics {
        let (avg, p50, p95) = self
            .durations_ms
            .lock()
            .map(|window| timing_summary(window.iter().copied().collect()))
            .unwrap_or_default();

        SensorMetrics {
            samples_taken: load(&self.samples),
            readings_rejected: load(&self.rejected),
            alerts_raised: load(&self.alerts),
            last_sample: load(&self.last_sample),
            avg_sample_time_ms: avg,
            sample_time_p50_ms: p50,
            sample_time_p95_ms: p95,
        }
    }

    fn clear(&self) {
        zero(&[&self.samples, &self.rejected, &self.alerts, &self.last_sample]);
        if let Ok(mut window) = self.durations_ms.lock() {
            window.clear();
        }
    }
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    persisted: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueMetrics {
        QueueMetrics {
            messages_enqueued: load(&self.enqueued),
            messages_dropped: load(&self.dropped),
            messages_retried: load(&self.retried),
            messages_persisted: load(&self.persisted),
        }
    }

    fn clear(&self) {
        zero(&[&self.enqueued, &self.dropped, &self.retried, &self.persisted]);
    }
}

#[derive(Default)]
struct MqttCounters {
    connected: AtomicBool,
    attempts: AtomicU64,
    established: AtomicU64,
    failures: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    last_heartbeat: AtomicU64,
    connected_since: AtomicU64,
}

impl MqttCounters {
    fn snapshot(&self, now: u64) -> MqttMetrics {
        let connected = self.connected.load(Ordering::Relaxed);
        let since = load(&self.connected_since);
        MqttMetrics {
            connected,
            connection_attempts: load(&self.attempts),
            connections_established: load(&self.established),
            connection_failures: load(&self.failures),
            messages_published: load(&self.published),
            publish_failures: load(&self.publish_failures),
            messages_received: load(&self.received),
            last_heartbeat: load(&self.last_heartbeat),
            connection_duration_seconds: if connected && since > 0 {
                now.saturating_sub(since)
            } else {
                0
            },
        }
    }

    fn clear(&self) {
        self.connected.store(false, Ordering::Relaxed);
        zero(&[
            &self.attempts,
            &self.established,
            &self.failures,
            &self.published,
            &self.publish_failures,
            &self.received,
            &self.last_heartbeat,
            &self.connected_since,
        ]);
    }
}

#[derive(Debug, Default)]
struct CommandStats {
    received: u64,
    succeeded: u64,
    failed: u64,
    durations_ms: VecDeque<u64>,
    last_execution: u64,
}

impl CommandStats {
    fn snapshot(&self, name: &str) -> CommandStatsSnapshot {
        let completed = self.succeeded + self.failed;
        CommandStatsSnapshot {
            name: name.to_string(),
            received: self.received,
            succeeded: self.succeeded,
            failed: self.failed,
            avg_execution_time_ms: timing_summary(self.durations_ms.iter().copied().collect()).0,
            last_execution: self.last_execution,
            success_rate: if completed == 0 {
                0.0
            } else {
                self.succeeded as f64 / completed as f64
            },
        }
    }
}

struct Lifecycle {
    state: Mutex<String>,
    started_at: AtomicU64,
    transitions: AtomicU64,
    healthy: AtomicBool,
    last_health_check: AtomicU64,
}

impl Lifecycle {
    fn new(now: u64) -> Self {
        Self {
            state: Mutex::new("initializing".to_string()),
            started_at: AtomicU64::new(now),
            transitions: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }
}

/// Lock-light metrics store shared by every component
pub struct MetricsCollector {
    sensors: SensorCounters,
    queue: QueueCounters,
    mqtt: MqttCounters,
    commands: Mutex<HashMap<String, CommandStats>>,
    lifecycle: Lifecycle,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            sensors: SensorCounters::default(),
            queue: QueueCounters::default(),
            mqtt: MqttCounters::default(),
            commands: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(current_timestamp()),
        }
    }

    pub fn sensor_sample_taken(&self, duration: Duration) {
        bump(&self.sensors.samples);
        self.sensors
            .last_sample
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut window) = self.sensors.durations_ms.lock() {
            push_bounded(&mut window, duration.as_millis() as u64);
        }
    }

    pub fn sensor_reading_rejected(&self) {
        bump(&self.sensors.rejected);
    }

    pub fn alert_raised(&self) {
        bump(&self.sensors.alerts);
    }

    pub fn message_enqueued(&self) {
        bump(&self.queue.enqueued);
    }

    pub fn message_dropped(&self) {
        bump(&self.queue.dropped);
    }

    pub fn message_retried(&self) {
        bump(&self.queue.retried);
    }

    pub fn messages_persisted(&self, count: u64) {
        self.queue.persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn mqtt_connection_attempt(&self) {
        bump(&self.mqtt.attempts);
    }

    pub fn mqtt_connection_established(&self) {
        bump(&self.mqtt.established);
        self.mqtt.connected.store(true, Ordering::Relaxed);
        self.mqtt
            .connected_since
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        bump(&self.mqtt.failures);
        self.mqtt_connection_lost();
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt.connected.store(false, Ordering::Relaxed);
        self.mqtt.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        bump(&self.mqtt.published);
    }

    pub fn mqtt_publish_failed(&self) {
        bump(&self.mqtt.publish_failures);
    }

    pub fn mqtt_message_received(&self) {
        bump(&self.mqtt.received);
    }

    pub fn mqtt_heartbeat(&self) {
        self.mqtt
            .last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn command_received(&self, command: &str) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.entry(command.to_string()).or_default().received += 1;
        }
    }

    pub fn command_completed(&self, command: &str, duration: Duration, success: bool) {
        if let Ok(mut commands) = self.commands.lock() {
            let stats = commands.entry(command.to_string()).or_default();
            stats.last_execution = current_timestamp();
            push_bounded(&mut stats.durations_ms, duration.as_millis() as u64);
            if success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
        }
    }

    /// Record a lifecycle state; repeated states are not transitions
    pub fn set_agent_state(&self, state: &str) {
        if let Ok(mut current) = self.lifecycle.state.lock() {
            if *current != state {
                bump(&self.lifecycle.transitions);
                *current = state.to_string();
            }
        }
    }

    pub fn agent_started(&self) {
        self.lifecycle
            .started_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.lifecycle.healthy.store(healthy, Ordering::Relaxed);
        self.lifecycle
            .last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Zero every counter and restart the uptime clock
    pub fn reset(&self) {
        self.sensors.clear();
        self.queue.clear();
        self.mqtt.clear();
        if let Ok(mut commands) = self.commands.lock() {
            commands.clear();
        }
        if let Ok(mut state) = self.lifecycle.state.lock() {
            *state = "initializing".to_string();
        }
        let now = current_timestamp();
        self.lifecycle.started_at.store(now, Ordering::Relaxed);
        self.lifecycle.transitions.store(0, Ordering::Relaxed);
        self.lifecycle.healthy.store(true, Ordering::Relaxed);
        self.lifecycle.last_health_check.store(now, Ordering::Relaxed);
    }

    fn command_summary(&self) -> CommandMetrics {
        let mut summary = CommandMetrics::default();
        let Ok(commands) = self.commands.lock() else {
            return summary;
        };
        for (name, stats) in commands.iter() {
            summary.total_received += stats.received;
            summary.total_succeeded += stats.succeeded;
            summary.total_failed += stats.failed;
            summary
                .command_stats
                .insert(name.clone(), stats.snapshot(name));
        }
        summary
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let lifecycle = &self.lifecycle;

        MetricsSnapshot {
            sensors: self.sensors.snapshot(),
            queue: self.queue.snapshot(),
            mqtt: self.mqtt.snapshot(now),
            commands: self.command_summary(),
            lifecycle: LifecycleMetrics {
                current_state: lifecycle
                    .state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(load(&lifecycle.started_at)),
                state_transitions: load(&lifecycle.transitions),
                healthy: lifecycle.healthy.load(Ordering::Relaxed),
                last_health_check: load(&lifecycle.last_health_check),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub sensors: SensorMetrics,
    pub queue: QueueMetrics,
    pub mqtt: MqttMetrics,
    pub commands: CommandMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct SensorMetrics {
    pub samples_taken: u64,
    pub readings_rejected: u64,
    pub alerts_raised: u64,
    /// Unix seconds of the last sampling pass, 0 before the first
    pub last_sample: u64,
    pub avg_sample_time_ms: f64,
    pub sample_time_p50_ms: f64,
    pub sample_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct QueueMetrics {
    pub messages_enqueued: u64,
    pub messages_dropped: u64,
    pub messages_retried: u64,
    pub messages_persisted: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub last_heartbeat: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize, Default)]
pub struct CommandMetrics {
    pub command_stats: HashMap<String, CommandStatsSnapshot>,
    pub total_received: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
}

#[derive(Debug, Serialize)]
pub struct CommandStatsSnapshot {
    pub name: String,
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_execution_time_ms: f64,
    pub last_execution: u64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// (average, p50, p95) of a set of millisecond timings
fn timing_summary(mut values: Vec<u64>) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    values.sort_unstable();
    let avg = values.iter().sum::<u64>() as f64 / values.len() as f64;
    (avg, percentile(&values, 50.0), percentile(&values, 95.0))
}

/// Linear interpolation between closest ranks
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = sorted[rank.floor() as usize] as f64;
    let upper = sorted[rank.ceil() as usize] as f64;
    lower + (upper - lower) * rank.fract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sensor_metrics() {
        let collector = MetricsCollector::new();
        assert_eq!(collector.get_metrics().sensors.last_sample, 0);

        collector.sensor_sample_taken(Duration::from_millis(40));
        collector.sensor_sample_taken(Duration::from_millis(60));
        collector.sensor_reading_rejected();
        collector.alert_raised();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.sensors.samples_taken, 2);
        assert_eq!(metrics.sensors.readings_rejected, 1);
        assert_eq!(metrics.sensors.alerts_raised, 1);
        assert_eq!(metrics.sensors.avg_sample_time_ms, 50.0);
        assert!(metrics.sensors.last_sample > 0);
    }

    #[test]
    fn test_queue_metrics() {
        let collector = MetricsCollector::new();

        collector.message_enqueued();
        collector.message_enqueued();
        collector.message_dropped();
        collector.message_retried();
        collector.messages_persisted(3);

        let queue = collector.get_metrics().queue;
        assert_eq!(queue.messages_enqueued, 2);
        assert_eq!(queue.messages_dropped, 1);
        assert_eq!(queue.messages_retried, 1);
        assert_eq!(queue.messages_persisted, 3);
    }

    #[test]
    fn test_mqtt_connection_tracking() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_message_published();

        let mqtt = collector.get_metrics().mqtt;
        assert_eq!(mqtt.connection_attempts, 1);
        assert_eq!(mqtt.connections_established, 1);
        assert_eq!(mqtt.messages_published, 1);
        assert!(mqtt.connected);

        collector.mqtt_connection_failed();
        let mqtt = collector.get_metrics().mqtt;
        assert!(!mqtt.connected);
        assert_eq!(mqtt.connection_failures, 1);
        assert_eq!(mqtt.connection_duration_seconds, 0);
    }

    #[test]
    fn test_command_metrics() {
        let collector = MetricsCollector::new();

        collector.command_received("ping");
        collector.command_completed("ping", Duration::from_millis(5), true);
        collector.command_received("pair_device");
        collector.command_completed("pair_device", Duration::from_millis(15), false);

        let commands = collector.get_metrics().commands;
        let ping = &commands.command_stats["ping"];
        assert_eq!(ping.received, 1);
        assert_eq!(ping.success_rate, 1.0);
        assert_eq!(ping.avg_execution_time_ms, 5.0);
        assert_eq!(commands.total_received, 2);
        assert_eq!(commands.total_failed, 1);
    }

    #[test]
    fn test_lifecycle_state_transitions() {
        let collector = MetricsCollector::new();

        collector.set_agent_state("running");
        collector.set_agent_state("running");
        collector.set_agent_state("stopping");

        let lifecycle = collector.get_metrics().lifecycle;
        assert_eq!(lifecycle.current_state, "stopping");
        assert_eq!(lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_counters_from_many_threads() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.message_enqueued();
                        collector.mqtt_message_published();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.queue.messages_enqueued, 1000);
        assert_eq!(metrics.mqtt.messages_published, 1000);
    }

    #[test]
    fn test_reset_clears_every_group() {
        let collector = MetricsCollector::new();
        collector.sensor_sample_taken(Duration::from_millis(12));
        collector.message_enqueued();
        collector.mqtt_connection_established();
        collector.command_received("ping");
        collector.set_agent_state("running");

        collector.reset();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.sensors.samples_taken, 0);
        assert_eq!(snapshot.sensors.avg_sample_time_ms, 0.0);
        assert_eq!(snapshot.queue.messages_enqueued, 0);
        assert!(!snapshot.mqtt.connected);
        assert_eq!(snapshot.mqtt.connections_established, 0);
        assert!(snapshot.commands.command_stats.is_empty());
        assert_eq!(snapshot.lifecycle.current_state, "initializing");
        assert_eq!(snapshot.lifecycle.state_transitions, 0);
    }

    #[test]
    fn test_timing_window_is_bounded() {
        let mut window = VecDeque::new();
        for i in 0..(TIMING_WINDOW as u64 + 5) {
            push_bounded(&mut window, i);
        }
        assert_eq!(window.len(), TIMING_WINDOW);
        assert_eq!(window.front(), Some(&5));
    }

    #[test]
    fn test_percentile() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        assert!((percentile(&data, 50.0) - 5.5).abs() < 1e-9);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 1e-9);
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(timing_summary(vec![]), (0.0, 0.0, 0.0));
    }
}
