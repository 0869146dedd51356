//! Outbound message buffering
//!
//! Every message the device publishes goes through a bounded priority queue.
//! Messages that fail to publish move to a bounded retry queue with
//! exponential backoff. Both queues can be persisted so nothing queued is
//! lost across a restart.

use crate::config::MqttSection;
use crate::observability::metrics::metrics;
use crate::protocol::now_millis;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Base retry delay; doubles per failed attempt
const RETRY_BASE_DELAY_MS: i64 = 1000;
/// Ceiling for the retry delay
const RETRY_MAX_DELAY_MS: i64 = 60_000;

/// Publish priority. Ordering is significant: `Critical` outranks everything
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    const LEVELS: usize = 4;

    fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    fn from_index(index: usize) -> Self {
        match index {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

/// A message waiting to be published
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub priority: Priority,
    /// Failed publish attempts so far
    pub attempts: u32,
    pub created_at: i64,
    pub last_attempt_at: Option<i64>,
}

impl OutboundMessage {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<String>,
        retain: bool,
        priority: Priority,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
            priority,
            attempts: 0,
            created_at: now_millis(),
            last_attempt_at: None,
        }
    }

    /// Serialize `body` as the JSON payload
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        body: &T,
        retain: bool,
        priority: Priority,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, serde_json::to_string(body)?, retain, priority))
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue full ({capacity} messages) and message priority too low to evict")]
    Full { capacity: usize },
    #[error("Failed to persist queued messages: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid persisted queue file: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bounded priority queue, FIFO within each priority level
#[derive(Debug)]
pub struct MessageQueue {
    levels: [VecDeque<OutboundMessage>; Priority::LEVELS],
    capacity: usize,
    dropped: u64,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            levels: Default::default(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Add a message. When full, the oldest message of the lowest occupied
    /// level is evicted and returned, but only if the new message outranks it
    pub fn enqueue(
        &mut self,
        message: OutboundMessage,
    ) -> Result<Option<OutboundMessage>, QueueError> {
        if self.len() < self.capacity {
            self.levels[message.priority.index()].push_back(message);
            return Ok(None);
        }

        let lowest = self.lowest_occupied_level();
        match lowest {
            Some(level) if message.priority > level => {
                let evicted = self.levels[level.index()].pop_front();
                self.levels[message.priority.index()].push_back(message);
                self.dropped += 1;
                Ok(evicted)
            }
            _ => {
                self.dropped += 1;
                Err(QueueError::Full {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Oldest message of the highest occupied priority
    pub fn dequeue(&mut self) -> Option<OutboundMessage> {
        self.levels
            .iter_mut()
            .rev()
            .find_map(|level| level.pop_front())
    }

    fn lowest_occupied_level(&self) -> Option<Priority> {
        self.levels
            .iter()
            .position(|level| !level.is_empty())
            .map(Priority::from_index)
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages rejected or evicted since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Queued messages in dequeue order, without removing them
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.levels
            .iter()
            .rev()
            .flat_map(|level| level.iter().cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        for level in &mut self.levels {
            level.clear();
        }
    }
}

/// What happened to a message handed to the retry queue
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Queued,
    /// Queued, but the oldest retry entry was evicted to make room
    QueuedWithEviction(OutboundMessage),
    /// Retry budget exhausted; the message is gone
    Discarded(OutboundMessage),
}

/// Bounded FIFO of messages that failed to publish
#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<OutboundMessage>,
    capacity: usize,
    max_attempts: u32,
}

impl RetryQueue {
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay after the given number of failed attempts
    pub fn backoff_delay_ms(attempts: u32) -> i64 {
        let exponent = attempts.saturating_sub(1).min(16);
        (RETRY_BASE_DELAY_MS << exponent).min(RETRY_MAX_DELAY_MS)
    }

    /// Record a failed attempt and queue the message for another try
    pub fn push_failed(&mut self, mut message: OutboundMessage, now: i64) -> RetryOutcome {
        message.attempts += 1;
        message.last_attempt_at = Some(now);

        if message.attempts >= self.max_attempts {
            return RetryOutcome::Discarded(message);
        }

        self.insert(message)
    }

    /// Put a message back without counting an attempt (restart recovery)
    pub fn restore(&mut self, message: OutboundMessage) -> RetryOutcome {
        self.insert(message)
    }

    fn insert(&mut self, message: OutboundMessage) -> RetryOutcome {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        match evicted {
            Some(old) => RetryOutcome::QueuedWithEviction(old),
            None => RetryOutcome::Queued,
        }
    }

    fn is_due(message: &OutboundMessage, now: i64) -> bool {
        match message.last_attempt_at {
            None => true,
            Some(last) => now - last >= Self::backoff_delay_ms(message.attempts),
        }
    }

    /// Remove and return every message whose backoff has elapsed, oldest first
    pub fn ready(&mut self, now: i64) -> Vec<OutboundMessage> {
        let (due, waiting): (VecDeque<_>, VecDeque<_>) = self
            .entries
            .drain(..)
            .partition(|message| Self::is_due(message, now));
        self.entries = waiting;
        due.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.entries.iter().cloned().collect()
    }
}

/// On-disk form of unsent messages
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedMessages {
    saved_at: i64,
    #[serde(default)]
    retry: Vec<OutboundMessage>,
    #[serde(default)]
    queued: Vec<OutboundMessage>,
}

impl PersistedMessages {
    fn len(&self) -> usize {
        self.retry.len() + self.queued.len()
    }
}

/// Outbound queue plus retry queue, drained through a [`Transport`]
#[derive(Debug)]
pub struct OutboundPipeline {
    queue: MessageQueue,
    retry: RetryQueue,
}

impl OutboundPipeline {
    pub fn new(queue_size: usize, retry_queue_size: usize, max_publish_attempts: u32) -> Self {
        Self {
            queue: MessageQueue::new(queue_size),
            retry: RetryQueue::new(retry_queue_size, max_publish_attempts),
        }
    }

    pub fn from_config(config: &MqttSection) -> Self {
        Self::new(
            config.message_queue_size,
            config.retry_queue_size,
            config.max_publish_attempts,
        )
    }

    /// Queue a message for the next drain
    pub fn submit(&mut self, message: OutboundMessage) -> Result<(), QueueError> {
        let topic = message.topic.clone();
        match self.queue.enqueue(message) {
            Ok(None) => {
                metrics().message_enqueued();
                Ok(())
            }
            Ok(Some(evicted)) => {
                metrics().message_enqueued();
                metrics().message_dropped();
                warn!(
                    topic = %evicted.topic,
                    priority = ?evicted.priority,
                    "Outbound queue full, evicted lower priority message"
                );
                Ok(())
            }
            Err(e) => {
                metrics().message_dropped();
                warn!(topic = %topic, error = %e, "Outbound message rejected");
                Err(e)
            }
        }
    }

    async fn try_publish<T: Transport>(transport: &T, message: &OutboundMessage) -> bool {
        match transport
            .publish(
                &message.topic,
                message.payload.as_bytes().to_vec(),
                message.retain,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    attempts = message.attempts,
                    error = %e,
                    "Publish failed, moving message to retry queue"
                );
                false
            }
        }
    }

    fn record_failure(&mut self, message: OutboundMessage, now: i64) {
        match self.retry.push_failed(message, now) {
            RetryOutcome::Queued => metrics().message_retried(),
            RetryOutcome::QueuedWithEviction(evicted) => {
                metrics().message_retried();
                metrics().message_dropped();
                warn!(topic = %evicted.topic, "Retry queue full, evicted oldest entry");
            }
            RetryOutcome::Discarded(discarded) => {
                metrics().message_dropped();
                warn!(
                    topic = %discarded.topic,
                    attempts = discarded.attempts,
                    "Retry budget exhausted, discarding message"
                );
            }
        }
    }

    /// Publish queued messages while the transport is connected.
    /// Stops at the first failure; returns the number published
    pub async fn process_message_queue<T: Transport>(&mut self, transport: &T) -> usize {
        let mut published = 0;
        while transport.is_connected() {
            let Some(message) = self.queue.dequeue() else {
                break;
            };
            if Self::try_publish(transport, &message).await {
                published += 1;
            } else {
                self.record_failure(message, now_millis());
                break;
            }
        }
        if published > 0 {
            debug!(published = published, remaining = self.queue.len(), "Drained outbound queue");
        }
        published
    }

    /// Retry messages whose backoff elapsed by `now`; returns the number published
    pub async fn process_retry_queue<T: Transport>(&mut self, transport: &T, now: i64) -> usize {
        if !transport.is_connected() {
            return 0;
        }

        let mut due = self.retry.ready(now).into_iter();
        let mut published = 0;
        while let Some(message) = due.next() {
            if Self::try_publish(transport, &message).await {
                published += 1;
            } else {
                self.record_failure(message, now);
                // Link is likely down; keep the rest without charging an attempt
                for rest in due.by_ref() {
                    self.retry.restore(rest);
                }
                break;
            }
        }
        if published > 0 {
            info!(published = published, "Retried messages delivered");
        }
        published
    }

    /// Write the retry queue and any undrained messages to `path`
    pub async fn save_failed_messages(&self, path: &Path) -> Result<usize, QueueError> {
        let persisted = PersistedMessages {
            saved_at: now_millis(),
            retry: self.retry.snapshot(),
            queued: self.queue.snapshot(),
        };
        let count = persisted.len();

        if count == 0 {
            match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => return Ok(0),
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(&persisted)?).await?;
        tokio::fs::rename(&tmp_path, path).await?;

        metrics().messages_persisted(count as u64);
        info!(
            retry = persisted.retry.len(),
            queued = persisted.queued.len(),
            path = %path.display(),
            "Saved unsent messages"
        );
        Ok(count)
    }

    /// Restore previously saved messages and remove the file. Undrained
    /// messages go back into the priority queue; retry entries go back into
    /// the retry queue, spilling into the priority queue when it is full.
    /// Returns the number of messages restored
    pub async fn load_failed_messages(&mut self, path: &Path) -> Result<usize, QueueError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedMessages = serde_json::from_slice(&content)?;
        let total = persisted.len();

        let before = self.queue.len() + self.retry.len();
        for message in persisted.queued {
            self.restore_queued(message);
        }
        for message in persisted.retry {
            if let RetryOutcome::QueuedWithEviction(spilled) = self.retry.restore(message) {
                self.restore_queued(spilled);
            }
        }
        let restored = (self.queue.len() + self.retry.len()).saturating_sub(before);
        tokio::fs::remove_file(path).await?;

        if restored < total {
            warn!(dropped = total - restored, "Some unsent messages did not fit after restart");
        }
        info!(count = restored, path = %path.display(), "Restored unsent messages");
        Ok(restored)
    }

    fn restore_queued(&mut self, message: OutboundMessage) {
        let topic = message.topic.clone();
        match self.queue.enqueue(message) {
            Ok(None) => {}
            Ok(Some(evicted)) => {
                metrics().message_dropped();
                warn!(
                    topic = %evicted.topic,
                    priority = ?evicted.priority,
                    "Outbound queue full while restoring, evicted lower priority message"
                );
            }
            Err(e) => {
                metrics().message_dropped();
                warn!(topic = %topic, error = %e, "Restored message did not fit");
            }
        }
    }

    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    pub fn retry_queue_size(&self) -> usize {
        self.retry.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped_count()
    }

    pub fn connection_status<T: Transport>(&self, transport: &T) -> String {
        transport
            .connection_state()
            .map(|state| state.describe())
            .unwrap_or_else(|| "Not connected".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::transport::mqtt::ConnectionState;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn msg(topic: &str, priority: Priority) -> OutboundMessage {
        OutboundMessage::new(topic, "{}", false, priority)
    }

    #[test]
    fn test_dequeue_highest_priority_first_fifo_within_level() {
        let mut queue = MessageQueue::new(10);
        queue.enqueue(msg("hb-1", Priority::Low)).unwrap();
        queue.enqueue(msg("tele-1", Priority::Normal)).unwrap();
        queue.enqueue(msg("alert-1", Priority::High)).unwrap();
        queue.enqueue(msg("tele-2", Priority::Normal)).unwrap();
        queue.enqueue(msg("crit-1", Priority::Critical)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|m| m.topic)
            .collect();
        assert_eq!(order, vec!["crit-1", "alert-1", "tele-1", "tele-2", "hb-1"]);
    }

    #[test]
    fn test_full_queue_evicts_oldest_of_lowest_level() {
        let mut queue = MessageQueue::new(3);
        queue.enqueue(msg("hb-1", Priority::Low)).unwrap();
        queue.enqueue(msg("hb-2", Priority::Low)).unwrap();
        queue.enqueue(msg("tele-1", Priority::Normal)).unwrap();

        let evicted = queue.enqueue(msg("alert-1", Priority::High)).unwrap();
        assert_eq!(evicted.map(|m| m.topic), Some("hb-1".to_string()));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn test_full_queue_rejects_equal_or_lower_priority() {
        let mut queue = MessageQueue::new(2);
        queue.enqueue(msg("tele-1", Priority::Normal)).unwrap();
        queue.enqueue(msg("tele-2", Priority::Normal)).unwrap();

        assert!(matches!(
            queue.enqueue(msg("tele-3", Priority::Normal)),
            Err(QueueError::Full { capacity: 2 })
        ));
        assert!(matches!(
            queue.enqueue(msg("hb-1", Priority::Low)),
            Err(QueueError::Full { .. })
        ));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.snapshot()[0].topic, "tele-1");
    }

    #[test]
    fn test_retry_backoff_curve() {
        assert_eq!(RetryQueue::backoff_delay_ms(1), 1000);
        assert_eq!(RetryQueue::backoff_delay_ms(2), 2000);
        assert_eq!(RetryQueue::backoff_delay_ms(3), 4000);
        assert_eq!(RetryQueue::backoff_delay_ms(6), 32000);
        assert_eq!(RetryQueue::backoff_delay_ms(7), 60000);
        assert_eq!(RetryQueue::backoff_delay_ms(40), 60000);
    }

    #[test]
    fn test_retry_discards_after_budget() {
        let mut retry = RetryQueue::new(5, 3);
        let message = msg("tele", Priority::Normal);

        assert_eq!(retry.push_failed(message, 0), RetryOutcome::Queued);
        let message = retry.ready(10_000).pop().unwrap();
        assert_eq!(message.attempts, 1);

        assert_eq!(retry.push_failed(message, 10_000), RetryOutcome::Queued);
        let message = retry.ready(20_000).pop().unwrap();

        match retry.push_failed(message, 20_000) {
            RetryOutcome::Discarded(m) => assert_eq!(m.attempts, 3),
            other => panic!("expected discard, got {other:?}"),
        }
        assert!(retry.is_empty());
    }

    #[test]
    fn test_retry_evicts_oldest_when_full() {
        let mut retry = RetryQueue::new(2, 5);
        retry.push_failed(msg("a", Priority::Normal), 0);
        retry.push_failed(msg("b", Priority::Normal), 0);

        match retry.push_failed(msg("c", Priority::Normal), 0) {
            RetryOutcome::QueuedWithEviction(evicted) => assert_eq!(evicted.topic, "a"),
            other => panic!("expected eviction, got {other:?}"),
        }
        let topics: Vec<_> = retry.snapshot().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["b", "c"]);
    }

    #[test]
    fn test_retry_ready_respects_backoff() {
        let mut retry = RetryQueue::new(5, 5);
        retry.push_failed(msg("a", Priority::Normal), 1_000);

        assert!(retry.ready(1_500).is_empty());
        assert_eq!(retry.len(), 1);
        assert_eq!(retry.ready(2_000).len(), 1);
        assert!(retry.is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_drains_while_connected() {
        let transport = MockTransport::new();
        let mut pipeline = OutboundPipeline::new(10, 5, 3);
        pipeline.submit(msg("devices/d/heartbeat", Priority::Low)).unwrap();
        pipeline.submit(msg("devices/d/alerts", Priority::High)).unwrap();

        assert_eq!(pipeline.process_message_queue(&transport).await, 2);
        assert_eq!(pipeline.queue_size(), 0);

        let published = transport.get_published_messages().await;
        assert_eq!(published[0].topic, "devices/d/alerts");
        assert_eq!(published[1].topic, "devices/d/heartbeat");
    }

    #[tokio::test]
    async fn test_pipeline_holds_messages_while_disconnected() {
        let transport = MockTransport::new();
        transport.set_connected(false);
        let mut pipeline = OutboundPipeline::new(10, 5, 3);
        pipeline.submit(msg("devices/d/events", Priority::Normal)).unwrap();

        assert_eq!(pipeline.process_message_queue(&transport).await, 0);
        assert_eq!(pipeline.queue_size(), 1);
        assert_eq!(pipeline.retry_queue_size(), 0);
        assert_eq!(
            pipeline.connection_status(&transport),
            ConnectionState::Disconnected("Mock disconnection".to_string()).describe()
        );
    }

    #[tokio::test]
    async fn test_pipeline_failure_moves_to_retry_then_recovers() {
        let transport = MockTransport::new();
        transport.set_should_fail(true);
        let mut pipeline = OutboundPipeline::new(10, 5, 3);
        pipeline.submit(msg("devices/d/events", Priority::Normal)).unwrap();
        pipeline.submit(msg("devices/d/heartbeat", Priority::Low)).unwrap();

        assert_eq!(pipeline.process_message_queue(&transport).await, 0);
        assert_eq!(pipeline.retry_queue_size(), 1);
        assert_eq!(pipeline.queue_size(), 1);

        transport.set_should_fail(false);
        let later = now_millis() + 5_000;
        assert_eq!(pipeline.process_retry_queue(&transport, later).await, 1);
        assert_eq!(pipeline.retry_queue_size(), 0);
    }

    #[tokio::test]
    async fn test_save_and_load_failed_messages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed_messages.json");

        let mut pipeline = OutboundPipeline::new(10, 5, 3);
        pipeline.submit(msg("devices/d/events", Priority::Normal)).unwrap();
        pipeline.retry.push_failed(msg("devices/d/alerts", Priority::High), 0);

        assert_eq!(pipeline.save_failed_messages(&path).await.unwrap(), 2);
        assert!(path.exists());

        let mut restored = OutboundPipeline::new(10, 5, 3);
        assert_eq!(restored.load_failed_messages(&path).await.unwrap(), 2);
        assert_eq!(restored.retry_queue_size(), 1);
        assert_eq!(restored.queue_size(), 1);
        assert!(!path.exists());

        let retried = restored.retry.snapshot();
        assert_eq!(retried[0].topic, "devices/d/alerts");
        assert_eq!(retried[0].attempts, 1);
        assert_eq!(restored.queue.snapshot()[0].priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_restore_spills_full_retry_queue_into_priority_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed_messages.json");

        let mut pipeline = OutboundPipeline::new(10, 3, 5);
        for i in 0..3 {
            let topic = format!("devices/d/events/{i}");
            pipeline.retry.push_failed(msg(&topic, Priority::Normal), 0);
        }
        pipeline.save_failed_messages(&path).await.unwrap();

        let mut smaller = OutboundPipeline::new(10, 1, 5);
        assert_eq!(smaller.load_failed_messages(&path).await.unwrap(), 3);
        assert_eq!(smaller.retry_queue_size(), 1);
        assert_eq!(smaller.queue_size(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut pipeline = OutboundPipeline::new(10, 5, 3);
        assert_eq!(
            pipeline
                .load_failed_messages(&dir.path().join("absent.json"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_load_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed_messages.json");
        std::fs::write(&path, "not json").unwrap();

        let mut pipeline = OutboundPipeline::new(10, 5, 3);
        assert!(matches!(
            pipeline.load_failed_messages(&path).await,
            Err(QueueError::Serialization(_))
        ));
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
    }

    proptest! {
        #[test]
        fn message_queue_never_exceeds_capacity(
            capacity in 1usize..16,
            priorities in proptest::collection::vec(priority_strategy(), 0..64)
        ) {
            let mut queue = MessageQueue::new(capacity);
            for (i, priority) in priorities.into_iter().enumerate() {
                let _ = queue.enqueue(msg(&format!("t{i}"), priority));
                prop_assert!(queue.len() <= capacity);
            }
        }

        #[test]
        fn dequeue_order_is_non_increasing_priority(
            priorities in proptest::collection::vec(priority_strategy(), 0..32)
        ) {
            let mut queue = MessageQueue::new(64);
            for (i, priority) in priorities.into_iter().enumerate() {
                queue.enqueue(msg(&format!("t{i}"), priority)).unwrap();
            }
            let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
            for pair in drained.windows(2) {
                prop_assert!(pair[0].priority >= pair[1].priority);
            }
        }

        #[test]
        fn retry_queue_never_exceeds_capacity(
            capacity in 1usize..8,
            count in 0usize..32
        ) {
            let mut retry = RetryQueue::new(capacity, 10);
            for i in 0..count {
                retry.push_failed(msg(&format!("t{i}"), Priority::Normal), 0);
                prop_assert!(retry.len() <= capacity);
            }
        }
    }
}
