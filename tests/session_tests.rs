mod common;

use common::{start_echo_server, start_mock_broker, BrokerBehavior, MockControlPlane};
use rev_tunnel::config::{ApiConfig, ClientConfig};
use rev_tunnel::session::{self, CloseReason, ForwardOptions, Session, SessionEvent};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::compat::FuturesAsyncReadCompatExt;

fn client_config(control_plane: &MockControlPlane) -> ClientConfig {
    ClientConfig {
        api: ApiConfig {
            url: control_plane.base_url(),
            path: String::new(),
        },
        skip_verify: true,
        ..Default::default()
    }
}

fn connection_json(id: &str, broker_port: u16, subdomain: &str, local_port: u16) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "host": "127.0.0.1",
        "port": broker_port,
        "domain": "tunnel.test",
        "key": "secret",
        "forwards": [
            { "subdomain": subdomain, "private_host": "127.0.0.1", "private_port": local_port }
        ]
    })
}

fn forward_options() -> ForwardOptions {
    ForwardOptions {
        key: "api-key".to_string(),
        ..Default::default()
    }
}

async fn wait_for(session: &mut Session, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
    loop {
        let event = timeout(Duration::from_secs(10), session.next_event())
            .await
            .expect("timed out waiting for session event")
            .expect("session event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_forward_exposes_public_urls() {
    let broker = start_mock_broker(BrokerBehavior::Accept).await;
    let (echo_port, _) = start_echo_server().await;
    let control_plane =
        start_mock_control_plane_for("c-urls", &broker, "app", echo_port, "ping").await;

    let mut session = session::forward(&client_config(&control_plane), forward_options())
        .await
        .unwrap();

    assert_eq!(session.connection_id(), "c-urls");
    assert_eq!(session.forwards().len(), 1);
    assert_eq!(session.forwards()[0].url, "https://app.tunnel.test");
    assert_eq!(session.forwards()[0].short_url, "app.tunnel.test");

    wait_for(&mut session, |e| matches!(e, SessionEvent::Ready(_))).await;
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let broker = start_mock_broker(BrokerBehavior::Accept).await;
    let (echo_port, _) = start_echo_server().await;
    let control_plane =
        start_mock_control_plane_for("c-idem", &broker, "app", echo_port, "ping").await;

    let mut session = session::forward(&client_config(&control_plane), forward_options())
        .await
        .unwrap();
    wait_for(&mut session, |e| matches!(e, SessionEvent::Ready(_))).await;

    session.close().await.unwrap();
    // Only the first close performs the control-plane delete; repeats are no-ops
    session.close().await.unwrap();
    session.timeout().await.unwrap();

    assert_eq!(control_plane.delete_count(), 1);
    let deletes = control_plane.recorded("DELETE", "/connections");
    assert!(deletes[0].query.contains("reason=disconnect"));
    assert!(deletes[0].query.contains("id=c-idem"));

    let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Close(_))).await;
    match event {
        SessionEvent::Close(info) => {
            assert_eq!(info.reason, CloseReason::Requested);
            assert!(!info.will_retry);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_revocation_closes_without_cleanup_delete() {
    let broker = start_mock_broker(BrokerBehavior::Accept).await;
    let (echo_port, _) = start_echo_server().await;
    let control_plane =
        start_mock_control_plane_for("c-revoke", &broker, "app", echo_port, "disconnect").await;

    let mut session = session::forward(&client_config(&control_plane), forward_options())
        .await
        .unwrap();
    wait_for(&mut session, |e| matches!(e, SessionEvent::Ready(_))).await;

    // The broker delivers a heartbeat frame; verification reports revocation
    let mut stream = broker.open_stream().await.compat();
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nx-ping-c-revoke: tok-r\r\n\r\n")
        .await
        .unwrap();
    let mut ack = vec![0u8; 4];
    stream.read_exact(&mut ack).await.unwrap();

    wait_for(&mut session, |e| matches!(e, SessionEvent::Revoking)).await;
    let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Close(_))).await;
    match event {
        SessionEvent::Close(info) => {
            assert_eq!(info.reason, CloseReason::Revoked);
            assert!(!info.will_retry);
        }
        _ => unreachable!(),
    }

    // Server-initiated teardown: no delete call is issued
    assert_eq!(control_plane.delete_count(), 0);
    assert_eq!(control_plane.recorded("GET", "/connections/ping").len(), 1);
}

#[tokio::test]
async fn test_fatal_auth_error_deletes_with_connection_error() {
    let broker = start_mock_broker(BrokerBehavior::Reject {
        level: "client-authentication",
        message: "key rejected",
    })
    .await;
    let (echo_port, _) = start_echo_server().await;
    let control_plane =
        start_mock_control_plane_for("c-fatal", &broker, "app", echo_port, "ping").await;

    let mut session = session::forward(&client_config(&control_plane), forward_options())
        .await
        .unwrap();

    wait_for(&mut session, |e| matches!(e, SessionEvent::Error(_))).await;
    let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Close(_))).await;
    match event {
        SessionEvent::Close(info) => {
            assert_eq!(info.reason, CloseReason::Error);
            assert!(!info.will_retry);
        }
        _ => unreachable!(),
    }

    assert_eq!(control_plane.delete_count(), 1);
    let deletes = control_plane.recorded("DELETE", "/connections");
    assert!(deletes[0].query.contains("reason=connection-error"));
}

#[tokio::test]
async fn test_unexpected_close_schedules_retry_without_delete() {
    let broker = start_mock_broker(BrokerBehavior::DropAfterBind).await;
    let (echo_port, _) = start_echo_server().await;
    let control_plane =
        start_mock_control_plane_for("c-retry", &broker, "app", echo_port, "ping").await;

    let mut session = session::forward(&client_config(&control_plane), forward_options())
        .await
        .unwrap();

    let event = wait_for(&mut session, |e| matches!(e, SessionEvent::Close(_))).await;
    match event {
        SessionEvent::Close(info) => {
            assert_eq!(info.reason, CloseReason::Unexpected);
            assert!(info.will_retry);
        }
        _ => unreachable!(),
    }

    // A reconnect happens at the backoff delay; no cleanup delete is issued
    wait_for(&mut session, |e| matches!(e, SessionEvent::Connect)).await;
    assert_eq!(control_plane.delete_count(), 0);
    assert!(broker.bind_count.load(std::sync::atomic::Ordering::SeqCst) >= 2);

    session.destroy();
}

#[tokio::test]
async fn test_close_grace_expiry_force_destroys() {
    let broker = start_mock_broker(BrokerBehavior::Accept).await;
    let (echo_port, _) = start_echo_server().await;
    let control_plane =
        start_mock_control_plane_for("c-grace", &broker, "app", echo_port, "ping").await;

    let mut config = client_config(&control_plane);
    // Zero grace forces the destroy branch; the close call still completes once, cleanly
    config.close_grace_ms = 0;

    let mut session = session::forward(&config, forward_options()).await.unwrap();
    wait_for(&mut session, |e| matches!(e, SessionEvent::Ready(_))).await;

    session.close().await.unwrap();
    assert_eq!(control_plane.delete_count(), 1);

    // Idempotent after the forced destroy as well
    session.close().await.unwrap();
    assert_eq!(control_plane.delete_count(), 1);
}

async fn start_mock_control_plane_for(
    id: &str,
    broker: &common::MockBroker,
    subdomain: &str,
    local_port: u16,
    ping_reply: &'static str,
) -> MockControlPlane {
    common::start_mock_control_plane(
        connection_json(id, broker.port, subdomain, local_port),
        ping_reply,
    )
    .await
}
