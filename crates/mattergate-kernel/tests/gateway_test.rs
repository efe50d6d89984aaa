//! Delivery gateway facade: sends, direct messages, health and shutdown.

mod common;

use common::{config, not_found, transient, MockBackend, BOT_ID};
use mattergate_kernel::{ConnectionState, DeliveryGateway};
use mattergate_runtime::graceful_shutdown::ShutdownPhase;
use mattergate_types::error::DeliveryError;
use mattergate_types::message::IdempotencyKey;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn gateway(backend: &Arc<MockBackend>) -> DeliveryGateway {
    DeliveryGateway::new(config(), backend.clone())
}

#[tokio::test(start_paused = true)]
async fn test_send_to_channel_acknowledged() {
    let backend = Arc::new(MockBackend::new());
    let gateway = gateway(&backend);
    gateway.start();

    let ack = gateway.send_to_channel("C1", "hello").await.unwrap();

    assert_eq!(ack.channel_id, "C1");
    assert_eq!(ack.attempts, 1);
    assert!(!ack.post_id.is_empty());
    assert!(ack.create_at > 0);
    let posts = backend.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].message, "hello");
    assert_eq!(posts[0].idempotency_key, ack.idempotency_key);
}

#[tokio::test(start_paused = true)]
async fn test_send_connects_on_demand() {
    let backend = Arc::new(MockBackend::new());
    let gateway = gateway(&backend);

    let ack = gateway.send_to_channel("C1", "no explicit start").await;

    assert!(ack.is_ok());
    assert_eq!(backend.auth_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_key_and_thread_are_forwarded() {
    let backend = Arc::new(MockBackend::new());
    let gateway = gateway(&backend);

    let key = IdempotencyKey::new("host-key-1");
    let ack = gateway
        .send_to_channel_with_key("C1", "keyed", key.clone())
        .await
        .unwrap();
    assert_eq!(ack.idempotency_key, key);

    gateway.send_in_thread("C1", "root-7", "reply").await.unwrap();

    let posts = backend.posts();
    assert_eq!(posts[0].idempotency_key.as_str(), "host-key-1");
    assert_eq!(posts[0].root_id, None);
    assert_eq!(posts[1].root_id.as_deref(), Some("root-7"));
}

#[tokio::test(start_paused = true)]
async fn test_send_direct_resolves_and_caches_channel() {
    let backend = Arc::new(MockBackend::new());
    let gateway = gateway(&backend);

    let first = gateway.send_direct("U1", "hi").await.unwrap();
    let second = gateway.send_direct("U1", "again").await.unwrap();

    let expected = format!("dm-{BOT_ID}-U1");
    assert_eq!(first.channel_id, expected);
    assert_eq!(second.channel_id, expected);
    assert_eq!(backend.dm_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.posts_to(&expected).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_direct_channel_cache_cleared_on_disconnect() {
    let backend = Arc::new(MockBackend::new());
    let gateway = gateway(&backend);
    gateway.send_direct("U1", "before").await.unwrap();

    let mut status = gateway.supervisor().subscribe();
    backend.drop_connection();
    status
        .wait_for(|s| s.state == ConnectionState::Backoff)
        .await
        .unwrap();

    gateway.send_direct("U1", "after").await.unwrap();
    assert_eq!(backend.dm_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_direct_channel_lookup_failures() {
    let backend = Arc::new(MockBackend::new());
    backend.dm_failures.lock().unwrap().extend([transient(), not_found()]);
    let gateway = gateway(&backend);

    let result = gateway.send_direct("U404", "hi").await;

    assert!(matches!(result, Err(DeliveryError::Rejected { .. })));
    assert_eq!(backend.dm_calls.load(Ordering::SeqCst), 2);
    assert!(backend.posts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_health_check_reflects_connection_and_queue() {
    let backend = Arc::new(MockBackend::new());
    backend.set_post_delay(Duration::from_secs(2));
    let gateway = gateway(&backend);

    let health = gateway.health_check();
    assert!(!health.ready);
    assert_eq!(health.connection.state, ConnectionState::Disconnected);
    assert_eq!(health.queue_depth, 0);

    let ticket = gateway.enqueue_to_channel("C1", "slow");
    let mut status = gateway.supervisor().subscribe();
    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    while gateway.queue().in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let health = gateway.health_check();
    assert!(health.ready);
    assert_eq!(health.queue_depth, 1);
    assert_eq!(health.in_flight, 1);
    assert_eq!(health.active_targets, 1);

    ticket.await.unwrap();
    let health = gateway.health_check();
    assert_eq!(health.queue_depth, 0);
    assert_eq!(health.in_flight, 0);
    assert_eq!(health.stats.delivered, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_queued_messages_while_disconnected() {
    let backend = Arc::new(MockBackend::new());
    backend.fail_auth(Some(transient()));
    let gateway = gateway(&backend);
    gateway.start();

    let tickets: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|text| gateway.enqueue_to_channel("C2", text))
        .collect();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let status = gateway.shutdown().await;

    for ticket in tickets {
        assert_eq!(ticket.await, Err(DeliveryError::Cancelled));
    }
    assert!(backend.posts().is_empty());
    assert_eq!(status.current_phase, ShutdownPhase::Complete);
    assert!(gateway.supervisor().status().shut_down);
    assert_eq!(gateway.health_check().stats.cancelled, 3);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_lets_in_flight_attempt_finish() {
    let backend = Arc::new(MockBackend::new());
    backend.set_post_delay(Duration::from_secs(2));
    let gateway = gateway(&backend);

    let in_flight = gateway.enqueue_to_channel("C1", "first");
    let queued = gateway.enqueue_to_channel("C1", "second");
    while gateway.queue().in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = gateway.shutdown().await;

    assert!(in_flight.await.is_ok());
    assert_eq!(queued.await, Err(DeliveryError::Cancelled));
    assert_eq!(backend.posts().len(), 1);
    assert!(status.phases_completed.iter().all(|p| p.success));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_attempts_past_grace() {
    let backend = Arc::new(MockBackend::new());
    backend.set_post_delay(Duration::from_secs(8));
    let mut config = config();
    config.delivery.shutdown_grace = Duration::from_secs(2);
    let gateway = DeliveryGateway::new(config, backend.clone());

    let ticket = gateway.enqueue_to_channel("C1", "slow");
    while gateway.queue().in_flight() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = gateway.shutdown().await;

    assert_eq!(ticket.await, Err(DeliveryError::Cancelled));
    let waiting = status
        .phases_completed
        .iter()
        .find(|p| p.phase == ShutdownPhase::WaitingForInFlight)
        .unwrap();
    assert!(!waiting.success);
    assert_eq!(gateway.queue().in_flight(), 0);
    assert_eq!(gateway.queue().depth(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sends_after_shutdown_are_cancelled() {
    let backend = Arc::new(MockBackend::new());
    let gateway = gateway(&backend);
    gateway.shutdown().await;

    assert_eq!(
        gateway.send_to_channel("C1", "late").await,
        Err(DeliveryError::Cancelled)
    );
    assert_eq!(
        gateway.send_direct("U1", "late").await,
        Err(DeliveryError::Cancelled)
    );
    // Second shutdown is a no-op
    assert_eq!(gateway.shutdown().await.current_phase, ShutdownPhase::Complete);
}
