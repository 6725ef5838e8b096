mod common;

use async_trait::async_trait;
use common::{eventually, spawn_registry, RecordingTransport};
use realtime_service::config::BridgeConfig;
use realtime_service::error::{BridgeError, DeliveryError};
use realtime_service::models::{ChannelName, NotificationEnvelope};
use realtime_service::services::{
    Broker, BrokerMessage, LocalDeduplicator, MemoryBroker, MemoryDeadLetterSink, MessageBridge,
    NotificationPublisher, NotificationSink, Processed,
};
use realtime_service::websocket::{DeliveryReport, OutboundEnvelope, RegistryConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counts calls; fails the first `failures` of them.
struct CountingSink {
    calls: Mutex<u32>,
    failures: u32,
}

impl CountingSink {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(0),
            failures,
        })
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl NotificationSink for CountingSink {
    async fn deliver(
        &self,
        _channel: &ChannelName,
        _payload: String,
    ) -> Result<DeliveryReport, DeliveryError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if *calls <= self.failures {
            return Err(DeliveryError::Failed("registry busy".into()));
        }
        Ok(DeliveryReport {
            recipients: 1,
            delivered: 1,
            dropped: 0,
        })
    }
}

fn bridge_with(
    sink: Arc<CountingSink>,
    dead_letters: Arc<MemoryDeadLetterSink>,
) -> MessageBridge {
    let config = BridgeConfig::default();
    MessageBridge::new(
        config.clone(),
        sink,
        Arc::new(LocalDeduplicator::new(
            config.dedup_capacity,
            config.dedup_retention,
        )),
        dead_letters,
    )
}

fn broker_message(channel: &str, envelope: &NotificationEnvelope) -> BrokerMessage {
    BrokerMessage {
        channel: channel.to_string(),
        payload: serde_json::to_string(envelope).unwrap(),
    }
}

#[tokio::test]
async fn replayed_envelope_is_delivered_at_most_once() {
    let sink = CountingSink::new(0);
    let bridge = bridge_with(sink.clone(), Arc::default());
    let envelope = NotificationEnvelope::new("n-1", "u1", "exam_graded", "Exam graded", "92/100");
    let message = broker_message("notifications:user:u1", &envelope);

    assert!(matches!(
        bridge.process(&message).await,
        Ok(Processed::Delivered(_))
    ));
    assert_eq!(bridge.process(&message).await, Ok(Processed::Duplicate));
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn invalid_envelopes_are_dropped_before_delivery() {
    let sink = CountingSink::new(0);
    let bridge = bridge_with(sink.clone(), Arc::default());

    let missing_title = BrokerMessage {
        channel: "notifications:user:u1".into(),
        payload: r#"{"id":"n1","user_id":"u1","type":"t","title":""}"#.into(),
    };
    assert!(matches!(
        bridge.process(&missing_title).await,
        Err(BridgeError::ValidationError(_))
    ));

    let unknown_channel = broker_message(
        "notifications:team:t1",
        &NotificationEnvelope::new("n2", "u1", "t", "title", ""),
    );
    assert!(matches!(
        bridge.process(&unknown_channel).await,
        Err(BridgeError::ValidationError(_))
    ));

    let expired = NotificationEnvelope::new("n3", "u1", "t", "title", "")
        .with_expiry(chrono::Utc::now() - chrono::Duration::minutes(1));
    assert!(matches!(
        bridge
            .process(&broker_message("notifications:user:u1", &expired))
            .await,
        Err(BridgeError::ValidationError(_))
    ));

    assert_eq!(sink.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_back_off_linearly_then_dead_letter() {
    let sink = CountingSink::new(u32::MAX);
    let dead_letters = Arc::new(MemoryDeadLetterSink::default());
    let bridge = bridge_with(sink.clone(), dead_letters.clone());
    let policy = bridge.retry_policy();
    assert_eq!(policy.backoff(1), Duration::from_millis(100));
    assert_eq!(policy.backoff(2), Duration::from_millis(200));

    let envelope = NotificationEnvelope::new("n-9", "u1", "reminder", "Class at 9", "");
    let started = tokio::time::Instant::now();
    let result = bridge
        .process(&broker_message("notifications:user:u1", &envelope))
        .await;
    let waited = started.elapsed();

    assert_eq!(
        result,
        Err(BridgeError::RetryExhausted {
            attempts: 3,
            last_error: "delivery failed: registry busy".into(),
        })
    );
    assert_eq!(sink.calls(), 3);
    // 1 × 100ms + 2 × 100ms between the three attempts
    assert!(waited >= Duration::from_millis(300));
    assert!(waited < Duration::from_millis(400));

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].envelope_id, "n-9");
    assert_eq!(letters[0].channel, "notifications:user:u1");
    assert_eq!(letters[0].attempts, 3);
}

#[tokio::test]
async fn broker_to_client_end_to_end() {
    let (registry, _registry_task, root) = spawn_registry(RegistryConfig::default());
    let student = RecordingTransport::new();
    let teacher = RecordingTransport::new();
    registry.register("s1", "student", student.clone()).await.unwrap();
    registry.register("t1", "teacher", teacher.clone()).await.unwrap();

    let broker = Arc::new(MemoryBroker::default());
    let config = BridgeConfig::default();
    let bridge = Arc::new(MessageBridge::new(
        config.clone(),
        Arc::new(registry.clone()),
        Arc::new(LocalDeduplicator::new(
            config.dedup_capacity,
            config.dedup_retention,
        )),
        Arc::new(MemoryDeadLetterSink::default()),
    ));
    let cancel: CancellationToken = root.child_token();
    let bridge_task = tokio::spawn(bridge.run(broker.clone(), cancel.clone()));

    assert!(eventually(Duration::from_secs(1), || broker.subscriber_count() == 1).await);

    let publisher = NotificationPublisher::new(broker.clone());
    let grade = NotificationEnvelope::new("n1", "s1", "grade", "Quiz graded", "A");
    publisher.to_user(&grade).await.unwrap();
    publisher.to_user(&grade).await.unwrap();
    publisher
        .to_role(
            "teacher",
            &NotificationEnvelope::new("n2", "", "staff", "Staff meeting", ""),
        )
        .await
        .unwrap();
    publisher
        .to_system(&NotificationEnvelope::new("n3", "", "maintenance", "Downtime", ""))
        .await
        .unwrap();
    broker
        .publish("notifications:user:s1", "not json")
        .await
        .unwrap();

    assert!(eventually(Duration::from_secs(2), || student.sent().len() == 2
        && teacher.sent().len() == 2)
    .await);

    let ids = |frames: Vec<String>| -> Vec<String> {
        frames
            .iter()
            .map(|f| OutboundEnvelope::from_json(f).unwrap())
            .map(|e| e.data.unwrap()["notification"]["id"].as_str().unwrap().to_string())
            .collect()
    };
    let mut student_ids = ids(student.sent());
    student_ids.sort();
    assert_eq!(student_ids, vec!["n1", "n3"]);
    let mut teacher_ids = ids(teacher.sent());
    teacher_ids.sort();
    assert_eq!(teacher_ids, vec!["n2", "n3"]);

    cancel.cancel();
    bridge_task.await.unwrap();
}
