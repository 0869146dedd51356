//! End-to-end agent behaviour against the mock transport

mod test_helpers;

use biotrack_device::device::{DeviceAgent, SimulatedSensors};
use biotrack_device::observability::metrics::metrics;
use biotrack_device::protocol::{InboundMessage, TopicBuilder};
use biotrack_device::storage::data_manager::{DEVICE_STATE_FILE, FAILED_MESSAGES_FILE};
use biotrack_device::testing::MockTransport;
use serde_json::json;
use tempfile::TempDir;
use test_helpers::{started_agent, test_config, DEVICE_ID};

fn command_topic(name: &str) -> String {
    format!("devices/{DEVICE_ID}/commands/{name}")
}

#[tokio::test]
async fn test_ping_command_gets_response() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    agent
        .handle_inbound(InboundMessage::new(
            command_topic("ping"),
            br#"{"requestId":"req-1"}"#.to_vec(),
        ))
        .await;

    let responses = transport
        .published_on(&TopicBuilder::response(DEVICE_ID, "ping"))
        .await;
    assert_eq!(responses.len(), 1);
    let body = responses[0].json();
    assert_eq!(body["command"], "ping");
    assert_eq!(body["requestId"], "req-1");
    assert_eq!(body["status"], "success");
    assert_eq!(body["deviceId"], DEVICE_ID);
    assert!(body["responseTime"].is_number());
}

#[tokio::test]
async fn test_pair_device_persists_user() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    agent
        .handle_inbound(InboundMessage::new(
            command_topic("pair_device"),
            br#"{"requestId":7,"userId":"user-123"}"#.to_vec(),
        ))
        .await;

    assert_eq!(agent.user_id(), Some("user-123"));
    let responses = transport
        .published_on(&TopicBuilder::response(DEVICE_ID, "pair_device"))
        .await;
    let body = responses[0].json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["requestId"], "7");
    assert_eq!(body["userId"], "user-123");

    let state = std::fs::read_to_string(dir.path().join(DEVICE_STATE_FILE)).unwrap();
    assert!(state.contains("user-123"));

    // A fresh agent on the same data directory picks the pairing up
    let (restarted, _) = started_agent(test_config(dir.path())).await;
    assert_eq!(restarted.user_id(), Some("user-123"));
}

#[tokio::test]
async fn test_test_sensor_reports_and_queues_telemetry() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;
    transport.clear_history().await;

    agent
        .handle_inbound(InboundMessage::new(
            command_topic("test_sensor"),
            br#"{"requestId":"t-1","sensorType":"temperature"}"#.to_vec(),
        ))
        .await;

    let responses = transport
        .published_on(&TopicBuilder::response(DEVICE_ID, "test_sensor"))
        .await;
    assert_eq!(responses.len(), 1);
    let body = responses[0].json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["requestId"], "t-1");
    assert_eq!(body["results"]["temperature"]["unit"], "°C");

    let telemetry = transport
        .published_on(&TopicBuilder::telemetry(DEVICE_ID, "temperature"))
        .await;
    assert_eq!(telemetry.len(), 1);
    assert_eq!(telemetry[0].json()["metadata"]["test"], true);
}

#[tokio::test]
async fn test_calibrate_command_marks_sensor() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    agent
        .handle_inbound(InboundMessage::new(
            command_topic("calibrate"),
            br#"{"requestId":"c-1","sensorType":"weight"}"#.to_vec(),
        ))
        .await;

    let responses = transport
        .published_on(&TopicBuilder::response(DEVICE_ID, "calibrate"))
        .await;
    assert_eq!(responses.len(), 1);
    let body = responses[0].json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Weight sensor tared");
}

#[tokio::test]
async fn test_unknown_command_reports_error() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    agent
        .handle_inbound(InboundMessage::new(
            command_topic("reboot"),
            br#"{"requestId":"r"}"#.to_vec(),
        ))
        .await;

    let responses = transport
        .published_on(&TopicBuilder::response(DEVICE_ID, "reboot"))
        .await;
    assert_eq!(responses.len(), 1);
    let body = responses[0].json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Unknown command: reboot");
}

#[tokio::test]
async fn test_malformed_and_retained_commands_are_ignored() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;
    transport.clear_history().await;

    agent
        .handle_inbound(InboundMessage::new(command_topic("ping"), b"not json".to_vec()))
        .await;

    let mut retained = InboundMessage::new(command_topic("ping"), br#"{}"#.to_vec());
    retained.retain = true;
    agent.handle_inbound(retained).await;

    agent
        .handle_inbound(InboundMessage::new(
            "devices/other_device/commands/ping",
            br#"{}"#.to_vec(),
        ))
        .await;

    let responses = transport
        .published_on(&format!("devices/{DEVICE_ID}/responses"))
        .await;
    assert!(responses.is_empty());
}

#[tokio::test]
async fn test_get_status_publishes_status_and_shadow() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;
    transport.clear_history().await;

    agent
        .handle_inbound(InboundMessage::new(command_topic("get_status"), br#"{}"#.to_vec()))
        .await;

    let status = transport.published_on(&TopicBuilder::status(DEVICE_ID)).await;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].json()["status"], "online");

    let response = transport
        .published_on(&TopicBuilder::response(DEVICE_ID, "get_status"))
        .await;
    let body = response[0].json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["deviceStatus"], "online");
    assert_eq!(body["firmwareVersion"], "1.0.0");
    assert_eq!(body["sensorSource"], "simulated");
    assert_eq!(body["connection"], "Connected");
}

#[tokio::test]
async fn test_sampling_publishes_telemetry() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    let alerts = agent.sample_once(1_700_000_000_000).await;
    assert!(alerts.is_empty());
    assert_eq!(agent.data().buffered_readings(), 1);

    let heart_rate = transport
        .published_on(&TopicBuilder::telemetry(DEVICE_ID, "heart_rate"))
        .await;
    assert_eq!(heart_rate.len(), 1);
    let body = heart_rate[0].json();
    assert_eq!(body["sensorType"], "heart_rate");
    assert_eq!(body["unit"], "bpm");
    assert_eq!(body["quality"], "good");
    assert_eq!(body["timestamp"], 1_700_000_000_000i64);

    let temperature = transport
        .published_on(&TopicBuilder::telemetry(DEVICE_ID, "temperature"))
        .await;
    assert_eq!(temperature.len(), 1);
    assert!(agent.shadow().sensors.heart_rate.is_some());
}

#[tokio::test]
async fn test_threshold_breach_raises_alert() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.alerts.heart_rate_high = 60.0;
    let (mut agent, transport) = started_agent(config).await;

    let alerts = agent.sample_once(1_700_000_000_000).await;
    assert_eq!(alerts.len(), 1);

    let published = transport.published_on(&TopicBuilder::alerts(DEVICE_ID)).await;
    assert_eq!(published.len(), 1);
    let body = published[0].json();
    assert_eq!(body["alertType"], "HIGH_HEART_RATE");
    assert_eq!(body["severity"], "high");
    assert_eq!(agent.data().unacknowledged_alert_count(), 1);
}

#[tokio::test]
async fn test_upload_publishes_batch() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    agent.sample_once(1_700_000_000_000).await;
    agent.sample_once(1_700_000_001_000).await;
    let published = agent.upload_once(1_700_000_002_000).await;
    assert_eq!(published, 1);

    let events = transport.published_on(&TopicBuilder::events(DEVICE_ID)).await;
    assert_eq!(events.len(), 1);
    let batch = events[0].json();
    assert_eq!(batch["deviceId"], DEVICE_ID);
    assert_eq!(batch["count"], 2);
    assert_eq!(batch["readings"][0]["timestamp"], 1_700_000_001_000i64);
    assert_eq!(agent.data().upload_success_rate(), 100.0);
}

#[tokio::test]
async fn test_idle_sampling_pass_is_not_counted_as_rejected() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    agent.sample_once(1_700_000_000_000).await;
    transport.clear_history().await;
    let rejected = metrics().get_metrics().sensors.readings_rejected;

    // Every sensor ran at this timestamp already
    let alerts = agent.sample_once(1_700_000_000_000).await;
    assert!(alerts.is_empty());
    assert_eq!(metrics().get_metrics().sensors.readings_rejected, rejected);
    assert!(transport
        .published_on(&format!("devices/{DEVICE_ID}/telemetry/"))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_failed_publishes_are_retried() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    transport.set_should_fail(true);
    agent.send_heartbeat().await;
    assert_eq!(agent.pipeline().retry_queue_size(), 1);

    transport.set_should_fail(false);
    transport.clear_history().await;
    let now = biotrack_device::protocol::now_millis();
    let published = agent.upload_once(now + 5_000).await;
    assert_eq!(published, 1);
    assert_eq!(agent.pipeline().retry_queue_size(), 0);

    let beats = transport.published_on(&TopicBuilder::heartbeat(DEVICE_ID)).await;
    assert_eq!(beats.len(), 1);
}

#[tokio::test]
async fn test_unsent_messages_survive_restart() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    transport.set_connected(false);
    agent.sample_once(1_700_000_000_000).await;
    assert!(agent.pipeline().queue_size() > 0);

    agent.shutdown().await.unwrap();
    assert!(!agent.is_started());
    assert!(dir.path().join(FAILED_MESSAGES_FILE).exists());

    let transport = MockTransport::new();
    let handle = transport.clone();
    let mut restarted =
        DeviceAgent::new(test_config(dir.path()), transport, SimulatedSensors::default()).unwrap();
    restarted.start().await.unwrap();
    assert!(!dir.path().join(FAILED_MESSAGES_FILE).exists());

    // Restored messages drain with the startup flush
    assert_eq!(restarted.pipeline().queue_size(), 0);
    assert_eq!(restarted.pipeline().retry_queue_size(), 0);
    let telemetry = handle
        .published_on(&format!("devices/{DEVICE_ID}/telemetry/"))
        .await;
    assert!(!telemetry.is_empty());
}

#[tokio::test]
async fn test_shadow_delta_updates_sample_rate() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;
    transport.clear_history().await;

    let delta = json!({ "state": { "sampleRate": 5000 }, "version": 3 });
    agent
        .handle_inbound(InboundMessage::new(
            TopicBuilder::shadow_delta(DEVICE_ID),
            serde_json::to_vec(&delta).unwrap(),
        ))
        .await;

    assert_eq!(agent.shadow().sample_rate, 5000);
    let reports = transport
        .published_on(&TopicBuilder::shadow_update(DEVICE_ID))
        .await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].json()["state"]["reported"]["sampleRate"], 5000);

    let (restarted, _) = started_agent(test_config(dir.path())).await;
    assert_eq!(restarted.shadow().sample_rate, 5000);
}

#[tokio::test]
async fn test_out_of_range_sample_rate_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (mut agent, _) = started_agent(test_config(dir.path())).await;
    let before = agent.shadow().sample_rate;

    agent
        .handle_inbound(InboundMessage::new(
            TopicBuilder::shadow_delta(DEVICE_ID),
            br#"{"state":{"sampleRate":5}}"#.to_vec(),
        ))
        .await;

    assert_eq!(agent.shadow().sample_rate, before);
}

#[tokio::test]
async fn test_run_loop_handles_injected_command() {
    let dir = TempDir::new().unwrap();
    let (mut agent, transport) = started_agent(test_config(dir.path())).await;

    let injector = transport.clone();
    let shutdown = async move {
        let delivered = injector
            .inject_inbound(&command_topic("ping"), br#"{"requestId":"loop"}"#.to_vec())
            .await;
        assert!(delivered);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    };
    agent.run(shutdown).await.unwrap();

    let responses = transport
        .published_on(&TopicBuilder::response(DEVICE_ID, "ping"))
        .await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].json()["status"], "success");
    assert_eq!(responses[0].json()["requestId"], "loop");

    agent.shutdown().await.unwrap();
    let status = transport.published_on(&TopicBuilder::status(DEVICE_ID)).await;
    assert_eq!(status.last().unwrap().json()["status"], "offline");
}

#[tokio::test]
async fn test_start_fails_when_broker_unreachable() {
    let dir = TempDir::new().unwrap();
    let mut agent = DeviceAgent::new(
        test_config(dir.path()),
        MockTransport::with_failure(),
        SimulatedSensors::default(),
    )
    .unwrap();

    assert!(agent.start().await.is_err());
    assert!(!agent.is_started());
}
