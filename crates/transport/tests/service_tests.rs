//! Link Service Integration Tests
//!
//! Drives the connection state machine through the mock transport.
//!
//! # Test Scenarios
//! - Connect outcomes and the events they produce
//! - Superseded and stopped connect attempts
//! - Ordered writes and write misuse
//! - Inbound frames, read failure and write failure
//! - Worker thread termination
//! - Random connect/stop sequences
//!
//! Run with: `cargo test -p transport --test service_tests`

use bytes::Bytes;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, expect_no_event, next_event, wait_until, with_timeout};
use common::{FailureReason, LinkEvent, LinkState};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use transport::test_utils::{MockBehavior, MockChannel, MockTarget, MockTransport};
use transport::{LinkError, LinkService};

const QUIET: Duration = Duration::from_millis(100);

fn succeed(name: &str) -> MockTarget {
    MockTarget::new(name, MockBehavior::Succeed)
}

async fn connected(service: &LinkService<MockTransport>) -> Arc<MockChannel> {
    service.connect(succeed("printer"));
    assert_eq!(next_event(&service.events()).await, LinkEvent::Connected);
    service
        .transport()
        .last_channel()
        .expect("connect opened no channel")
}

/// Join every worker thread, failing the test if that hangs
async fn shutdown(service: LinkService<MockTransport>) {
    with_timeout(
        DEFAULT_TEST_TIMEOUT,
        tokio::task::spawn_blocking(move || service.shutdown()),
    )
    .await
    .expect("worker threads did not exit")
    .expect("shutdown panicked");
}

// ============================================================================
// Connect Tests
// ============================================================================

#[tokio::test]
async fn test_connect_success() {
    let service = LinkService::new(MockTransport::new());
    let events = service.events();

    service.connect(succeed("printer"));
    assert_eq!(next_event(&events).await, LinkEvent::Connected);

    let status = service.status();
    assert_eq!(status.state, LinkState::Connected);
    assert!(status.channel_live);
    assert!(!status.attempt_active);

    shutdown(service).await;
}

#[tokio::test]
async fn test_connect_reports_peer_name() {
    let service = LinkService::new(MockTransport::new());
    service.connect(MockTarget::new(
        "bt",
        MockBehavior::SucceedAs("WSP-R240".to_string()),
    ));

    assert_eq!(
        next_event(&service.events()).await,
        LinkEvent::ConnectedTo("WSP-R240".to_string())
    );
    shutdown(service).await;
}

#[tokio::test]
async fn test_connect_failure_reasons() {
    let service = LinkService::new(MockTransport::new());
    let events = service.events();

    for reason in [
        FailureReason::UnknownHost,
        FailureReason::ConnectFailed,
        FailureReason::EndpointsNotFound,
        FailureReason::PermissionDenied,
    ] {
        service.connect(MockTarget::new("bad", MockBehavior::Fail(reason)));
        assert_eq!(next_event(&events).await, LinkEvent::Failure(reason));

        let status = service.status();
        assert_eq!(status.state, LinkState::None);
        assert!(!status.attempt_active);
        assert!(!status.channel_live);
    }

    expect_no_event(&events, QUIET).await;
    shutdown(service).await;
}

#[tokio::test]
async fn test_superseded_connect_is_silent() {
    let transport = MockTransport::new();
    let gate = transport.gate();
    let service = LinkService::new(transport);
    let events = service.events();

    service.connect(MockTarget::new("first", MockBehavior::WaitForGate));
    service.connect(succeed("second"));
    assert_eq!(next_event(&events).await, LinkEvent::Connected);

    // The first attempt finishes late and must not be reported
    gate.open();
    expect_no_event(&events, QUIET).await;

    assert_eq!(service.state(), LinkState::Connected);
    assert_eq!(service.status().session_id, 2);
    assert!(service.transport().live_channels() <= 1);

    shutdown(service).await;
}

#[tokio::test]
async fn test_stop_while_connecting() {
    let transport = MockTransport::new();
    let gate = transport.gate();
    let service = LinkService::new(transport);
    let events = service.events();

    service.connect(MockTarget::new("slow", MockBehavior::WaitForGate));
    assert_eq!(service.state(), LinkState::Connecting);

    service.stop();
    assert_eq!(service.state(), LinkState::None);

    gate.open();
    expect_no_event(&events, QUIET).await;
    assert_eq!(service.state(), LinkState::None);
    assert_eq!(service.transport().live_channels(), 0);

    shutdown(service).await;
}

#[tokio::test]
async fn test_connect_while_connected_replaces_channel() {
    let service = LinkService::new(MockTransport::new());
    let first = connected(&service).await;
    let second = connected(&service).await;

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(service.state(), LinkState::Connected);

    shutdown(service).await;
}

// ============================================================================
// Write Tests
// ============================================================================

#[tokio::test]
async fn test_write_not_connected_touches_nothing() {
    let service = LinkService::new(MockTransport::new());

    assert!(matches!(
        service.write(Bytes::from_static(b"\x1b@")),
        Err(LinkError::NotConnected)
    ));
    assert_eq!(service.state(), LinkState::None);
    assert_eq!(service.transport().open_count(), 0);
    expect_no_event(&service.events(), QUIET).await;

    shutdown(service).await;
}

#[tokio::test]
async fn test_writes_arrive_in_order() {
    let service = LinkService::new(MockTransport::new());
    let channel = connected(&service).await;

    service.write(b"\x1b@".to_vec()).unwrap();
    service.write(Bytes::from_static(b"Hello")).unwrap();
    service.write(vec![b'\n'; 3]).unwrap();

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || channel.written().len() == 3));
    assert_eq!(channel.written_bytes(), b"\x1b@Hello\n\n\n");

    shutdown(service).await;
}

#[tokio::test]
async fn test_empty_write_is_noop() {
    let service = LinkService::new(MockTransport::new());
    let channel = connected(&service).await;

    service.write(Vec::new()).unwrap();
    service.write(b"x".to_vec()).unwrap();

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !channel.written().is_empty()));
    assert_eq!(channel.written(), vec![b"x".to_vec()]);

    shutdown(service).await;
}

#[tokio::test]
async fn test_concurrent_writes_do_not_interleave() {
    let service = Arc::new(LinkService::new(MockTransport::new()));
    let channel = connected(&service).await;

    let writers: Vec<_> = (0..4u8)
        .map(|id| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                for _ in 0..25 {
                    service.write(vec![id; 64]).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || channel.written().len() == 100));
    for payload in channel.written() {
        assert_eq!(payload.len(), 64);
        assert!(payload.iter().all(|b| *b == payload[0]));
    }

    let service = Arc::try_unwrap(service).ok().expect("service still shared");
    shutdown(service).await;
}

#[tokio::test]
async fn test_pending_writes_drain() {
    let service = LinkService::new(MockTransport::new());
    assert_eq!(service.pending_writes(), 0);

    let channel = connected(&service).await;
    for _ in 0..10 {
        service.write(b"line\n".to_vec()).unwrap();
    }

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || service.pending_writes() == 0));
    assert_eq!(channel.written().len(), 10);

    service.stop();
    assert_eq!(service.pending_writes(), 0);
    shutdown(service).await;
}

// ============================================================================
// Connected Worker Tests
// ============================================================================

#[tokio::test]
async fn test_inbound_frames_are_delivered() {
    let service = LinkService::new(MockTransport::new());
    let events = service.events();
    let channel = connected(&service).await;

    channel.push_inbound(b"\x10\x04\x01");
    channel.push_inbound(b"OK");

    assert_eq!(
        next_event(&events).await,
        LinkEvent::Received(Bytes::from_static(b"\x10\x04\x01"))
    );
    assert_eq!(
        next_event(&events).await,
        LinkEvent::Received(Bytes::from_static(b"OK"))
    );

    shutdown(service).await;
}

#[tokio::test]
async fn test_read_failure_reports_loss_once() {
    let service = LinkService::new(MockTransport::new());
    let events = service.events();
    let channel = connected(&service).await;

    channel.fail_recv();
    assert_eq!(
        next_event(&events).await,
        LinkEvent::Failure(FailureReason::ConnectionLost)
    );
    expect_no_event(&events, QUIET).await;

    assert_eq!(service.state(), LinkState::None);
    assert!(channel.is_closed());
    assert!(matches!(
        service.write(b"x".to_vec()),
        Err(LinkError::NotConnected)
    ));

    // A fresh connect after the loss starts clean
    let again = connected(&service).await;
    assert!(!again.is_closed());
    assert_eq!(service.state(), LinkState::Connected);

    shutdown(service).await;
}

#[tokio::test]
async fn test_write_failure_reports_loss() {
    let service = LinkService::new(MockTransport::new());
    let events = service.events();
    let channel = connected(&service).await;

    channel.fail_send();
    service.write(b"lost".to_vec()).unwrap();

    assert_eq!(
        next_event(&events).await,
        LinkEvent::Failure(FailureReason::ConnectionLost)
    );
    expect_no_event(&events, QUIET).await;
    assert_eq!(service.state(), LinkState::None);
    assert_eq!(channel.close_calls(), 1);

    shutdown(service).await;
}

#[tokio::test]
async fn test_failed_write_never_reads_as_drained() {
    for _ in 0..20 {
        let service = LinkService::new(MockTransport::new());
        let events = service.events();
        let channel = connected(&service).await;
        let session = service.status().session_id;

        channel.fail_send();
        service.write(b"\x1b@receipt".to_vec()).unwrap();

        // While the session is still connected the failed payload stays counted
        let lost = wait_until(DEFAULT_TEST_TIMEOUT, || {
            let status = service.status();
            if status.state == LinkState::Connected {
                assert_eq!(status.session_id, session);
                assert_eq!(status.pending_writes, 1);
                false
            } else {
                true
            }
        });
        assert!(lost);
        assert_eq!(service.status().pending_writes, 0);
        assert_eq!(
            next_event(&events).await,
            LinkEvent::Failure(FailureReason::ConnectionLost)
        );

        shutdown(service).await;
    }
}

#[tokio::test]
async fn test_stop_closes_channel_and_workers_exit() {
    let service = LinkService::new(MockTransport::new());
    let events = service.events();
    let channel = connected(&service).await;

    service.stop();
    assert!(channel.is_closed());
    assert_eq!(service.state(), LinkState::None);

    // No loss report for an intentional stop
    expect_no_event(&events, QUIET).await;
    shutdown(service).await;
}

#[tokio::test]
async fn test_stop_racing_loss_closes_once() {
    for _ in 0..20 {
        let service = LinkService::new(MockTransport::new());
        let channel = connected(&service).await;

        let failing = Arc::clone(&channel);
        let loss = thread::spawn(move || failing.fail_recv());
        service.stop();
        loss.join().unwrap();

        // Whichever side won, the channel was closed exactly once
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || channel.is_closed()));
        assert_eq!(channel.close_calls(), 1);
        assert_eq!(service.state(), LinkState::None);

        shutdown(service).await;
        assert_eq!(channel.close_calls(), 1);
    }
}

#[tokio::test]
async fn test_drop_stops_link() {
    let transport_channel = {
        let service = LinkService::new(MockTransport::new());
        connected(&service).await
    };
    assert!(transport_channel.is_closed());
}

// ============================================================================
// Stress Tests
// ============================================================================

#[tokio::test]
async fn test_random_connect_stop_sequences() {
    let transport = MockTransport::new();
    let gate = transport.gate();
    let service = LinkService::new(transport);
    let events = service.events();
    let mut rng = rand::rng();

    for _ in 0..200 {
        match rng.random_range(0..4) {
            0 => service.connect(succeed("ok")),
            1 => service.connect(MockTarget::new("slow", MockBehavior::WaitForGate)),
            2 => service.connect(MockTarget::new(
                "bad",
                MockBehavior::Fail(FailureReason::ConnectFailed),
            )),
            _ => service.stop(),
        }

        let status = service.status();
        match status.state {
            LinkState::Connecting => assert!(status.attempt_active && !status.channel_live),
            LinkState::Connected => assert!(status.channel_live && !status.attempt_active),
            LinkState::None => assert!(!status.attempt_active && !status.channel_live),
        }
    }

    service.stop();
    gate.open();
    events.drain();
    expect_no_event(&events, QUIET).await;
    assert_eq!(service.state(), LinkState::None);

    let transport_live = || service.transport().live_channels();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || transport_live() == 0));

    shutdown(service).await;
}
