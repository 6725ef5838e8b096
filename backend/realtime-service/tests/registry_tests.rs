mod common;

use common::{eventually, spawn_registry, RecordingTransport};
use realtime_service::websocket::{
    CloseReason, DeliveryReport, OutboundEnvelope, RegistryConfig, SessionState,
};
use std::time::Duration;

#[tokio::test]
async fn replacing_a_session_closes_the_old_transport() {
    let (registry, _handle, _root) = spawn_registry(RegistryConfig::default());
    let old_transport = RecordingTransport::new();
    let new_transport = RecordingTransport::new();

    let old = registry
        .register("u1", "student", old_transport.clone())
        .await
        .unwrap();
    let new = registry
        .register("u1", "student", new_transport.clone())
        .await
        .unwrap();

    assert_eq!(registry.session_count().await, 1);
    assert_eq!(registry.lookup("u1").await.unwrap().id(), new.id());
    assert!(
        eventually(Duration::from_secs(1), || old_transport.closed_with()
            == Some(CloseReason::Replaced))
        .await
    );
    assert_eq!(old.state(), SessionState::Closed);
    assert!(new_transport.closed_with().is_none());
}

#[tokio::test]
async fn messages_reach_the_transport_in_order() {
    let (registry, _handle, _root) = spawn_registry(RegistryConfig::default());
    let transport = RecordingTransport::new();
    registry.register("u1", "student", transport.clone()).await.unwrap();

    for n in 0..5 {
        let report = tokio_test::assert_ok!(registry.send_to_user("u1", format!("m{n}")).await);
        assert_eq!(report.delivered, 1);
    }

    assert!(eventually(Duration::from_secs(1), || transport.sent().len() == 5).await);
    assert_eq!(transport.sent(), vec!["m0", "m1", "m2", "m3", "m4"]);
}

#[tokio::test]
async fn sending_to_a_disconnected_user_touches_nobody() {
    let (registry, _handle, _root) = spawn_registry(RegistryConfig::default());
    let bystander = RecordingTransport::new();
    registry
        .register("u2", "student", bystander.clone())
        .await
        .unwrap();

    let report = registry.send_to_user("u1", "hello".into()).await.unwrap();
    assert_eq!(report, DeliveryReport::default());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bystander.sent().is_empty());
}

#[tokio::test]
async fn full_queue_drops_without_affecting_other_recipients() {
    let config = RegistryConfig {
        outbound_queue_size: 1,
        ..RegistryConfig::default()
    };
    let (registry, _handle, _root) = spawn_registry(config);
    let slow = RecordingTransport::new();
    let fast = RecordingTransport::new();
    let slow_session = registry.register("slow", "student", slow).await.unwrap();
    registry.register("fast", "student", fast.clone()).await.unwrap();

    // Fill the slow user's queue directly so the writer cannot keep up
    let mut filled = false;
    for _ in 0..64 {
        if slow_session.enqueue("filler".into()).is_err() {
            filled = true;
            break;
        }
    }
    assert!(filled);

    let report = registry.send_to_role("student", "x".into()).await.unwrap();
    assert_eq!(report.recipients, 2);
    assert!(report.delivered >= 1);
    assert!(eventually(Duration::from_secs(1), || fast.sent().contains(&"x".to_string())).await);
}

#[tokio::test]
async fn transport_failure_unregisters_the_session() {
    let (registry, _handle, _root) = spawn_registry(RegistryConfig::default());
    let transport = RecordingTransport::new();
    let session = registry
        .register("u1", "student", transport.clone())
        .await
        .unwrap();

    transport.break_writes();
    let payload = OutboundEnvelope::pong().to_json().unwrap();
    registry.send_to_user("u1", payload).await.unwrap();

    for _ in 0..100 {
        if registry.lookup("u1").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(registry.lookup("u1").await.is_none());
    assert_eq!(session.close_reason(), Some(CloseReason::TransportFailure));
}

#[tokio::test(start_paused = true)]
async fn unresponsive_session_is_removed_after_dead_timeout() {
    let (registry, _handle, _root) = spawn_registry(RegistryConfig::default());
    let silent = RecordingTransport::new();
    let chatty = RecordingTransport::new();
    let silent_session = registry.register("silent", "student", silent.clone()).await.unwrap();
    let chatty_session = registry.register("chatty", "student", chatty).await.unwrap();

    // 30s probes; only one client answers
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        chatty_session.touch();
    }

    assert!(registry.lookup("silent").await.is_none());
    assert!(registry.lookup("chatty").await.is_some());
    assert_eq!(
        silent_session.close_reason(),
        Some(CloseReason::LivenessTimeout)
    );
    assert!(*silent.pings.lock().unwrap() >= 2);
}

#[tokio::test]
async fn shutdown_closes_every_session_with_normal_reason() {
    let (registry, handle, root) = spawn_registry(RegistryConfig::default());
    let a = RecordingTransport::new();
    let b = RecordingTransport::new();
    registry.register("a", "student", a.clone()).await.unwrap();
    registry.register("b", "teacher", b.clone()).await.unwrap();

    root.cancel();
    handle.await.unwrap();

    assert_eq!(a.closed_with(), Some(CloseReason::Shutdown));
    assert_eq!(b.closed_with(), Some(CloseReason::Shutdown));
    assert!(registry.is_shutdown());
    tokio_test::assert_err!(
        registry
            .register("c", "student", RecordingTransport::new())
            .await
    );
}
