//! End-to-end relay scenarios driven through the coordinator, without a
//! network transport.

use std::sync::{Arc, Mutex};

use courier_core::{
    ConnectionRegistry, FrameOutcome, Identity, MessageRouter, MessageSink, OutboundFrame,
    RelayCoordinator, RelayMessage, RouteOutcome, RouteReport, SinkError,
};

/// Sink double that records every forwarded message.
#[derive(Default)]
struct RecordingSink {
    forwarded: Mutex<Vec<RelayMessage>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.forwarded.lock().unwrap().len()
    }
}

impl MessageSink for RecordingSink {
    fn forward(&self, message: &RelayMessage) -> Result<(), SinkError> {
        self.forwarded.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn relay() -> (Arc<RelayCoordinator>, Arc<RecordingSink>) {
    let registry = Arc::new(ConnectionRegistry::new());
    let sink = Arc::new(RecordingSink::default());
    let router = MessageRouter::new(registry, sink.clone());
    (Arc::new(RelayCoordinator::new(router, 16)), sink)
}

fn received(frame: OutboundFrame) -> serde_json::Value {
    match frame {
        OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
        OutboundFrame::Close => panic!("unexpected close frame"),
    }
}

#[test]
fn anonymous_client_appears_online_and_receives_messages() {
    let (relay, sink) = relay();

    let mut a = relay.open(Identity::from("A1"));
    assert!(relay.online_identities().contains(&Identity::from("A1")));

    let b = relay.open(Identity::from("B1"));
    let outcome = relay.handle_frame(b.id, r#"{"to":"A1","content":"hi"}"#);

    assert_eq!(
        outcome,
        FrameOutcome::Routed(RouteOutcome::Routed(RouteReport {
            delivered: 1,
            failed: 0,
            forwarded: true,
        }))
    );
    assert_eq!(
        received(a.outbound.try_recv().unwrap()),
        serde_json::json!({"from": "B1", "to": "A1", "content": "hi"})
    );
    assert_eq!(sink.count(), 1);
}

#[test]
fn message_to_offline_identity_goes_only_to_sink() {
    let (relay, sink) = relay();
    let mut b = relay.open(Identity::from("B1"));

    let outcome = relay.handle_frame(b.id, r#"{"to":"C9","content":"later"}"#);

    match outcome {
        FrameOutcome::Routed(RouteOutcome::Routed(report)) => {
            assert_eq!(report.delivered, 0);
            assert!(report.forwarded);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(sink.count(), 1);
    assert!(b.outbound.try_recv().is_err());
}

#[test]
fn every_device_of_an_identity_receives_the_message() {
    let (relay, sink) = relay();
    let mut phone = relay.open(Identity::from("A1"));
    let mut laptop = relay.open(Identity::from("A1"));
    let b = relay.open(Identity::from("B1"));

    relay.handle_frame(b.id, r#"{"to":"A1","content":"both"}"#);

    assert_eq!(received(phone.outbound.try_recv().unwrap())["content"], "both");
    assert_eq!(received(laptop.outbound.try_recv().unwrap())["content"], "both");
    assert_eq!(sink.count(), 1);
    assert_eq!(relay.online_identities().len(), 2);
}

#[test]
fn spoofed_sender_is_replaced_with_verified_identity() {
    let (relay, sink) = relay();
    let mut a = relay.open(Identity::from("A1"));
    let b = relay.open(Identity::from("B1"));

    relay.handle_frame(b.id, r#"{"from":"A1","to":"A1","content":"trust me"}"#);

    assert_eq!(received(a.outbound.try_recv().unwrap())["from"], "B1");
    assert_eq!(
        sink.forwarded.lock().unwrap()[0].from,
        Identity::from("B1")
    );
}

#[test]
fn empty_recipient_is_dropped_before_routing() {
    let (relay, sink) = relay();
    let b = relay.open(Identity::from("B1"));

    assert_eq!(
        relay.handle_frame(b.id, r#"{"to":"","content":"void"}"#),
        FrameOutcome::Routed(RouteOutcome::Dropped)
    );
    assert_eq!(sink.count(), 0);
}

#[test]
fn fan_out_reaches_exactly_n_connections() {
    for n in 0..5 {
        let (relay, sink) = relay();
        let mut receivers: Vec<_> = (0..n).map(|_| relay.open(Identity::from("A1"))).collect();
        let b = relay.open(Identity::from("B1"));

        let outcome = relay.handle_frame(b.id, r#"{"to":"A1","content":"x"}"#);

        assert_eq!(
            outcome,
            FrameOutcome::Routed(RouteOutcome::Routed(RouteReport {
                delivered: n,
                failed: 0,
                forwarded: true,
            }))
        );
        for conn in receivers.iter_mut() {
            assert!(conn.outbound.try_recv().is_ok());
        }
        assert_eq!(sink.count(), 1);
    }
}

#[test]
fn closing_removes_identity_from_presence() {
    let (relay, _sink) = relay();
    let a = relay.open(Identity::from("A1"));
    let other = relay.open(Identity::from("Z1"));

    assert!(relay.close(a.id));

    let online = relay.online_identities();
    assert!(!online.contains(&Identity::from("A1")));
    assert!(online.contains(&Identity::from("Z1")));
    assert!(relay.registry().connections_for(&Identity::from("A1")).is_empty());

    relay.close(other.id);
    assert!(relay.online_identities().is_empty());
}

#[test]
fn malformed_frames_do_not_interrupt_the_connection() {
    let (relay, sink) = relay();
    let mut a = relay.open(Identity::from("A1"));
    let b = relay.open(Identity::from("B1"));

    assert_eq!(relay.handle_frame(b.id, "garbage"), FrameOutcome::Malformed);
    relay.handle_frame(b.id, r#"{"to":"A1","content":"after"}"#);

    assert_eq!(received(a.outbound.try_recv().unwrap())["content"], "after");
    assert_eq!(sink.count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn presence_is_consistent_under_interleaved_churn() {
    let (relay, _sink) = relay();
    let watched = relay.open(Identity::from("watched"));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let relay = Arc::clone(&relay);
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let conn = relay.open(Identity::new(format!("churn-{}", i)));
                tokio::task::yield_now().await;
                assert!(relay.close(conn.id));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(relay.close(watched.id));
    assert!(relay.online_identities().is_empty());
    assert_eq!(relay.connection_count(), 0);
}
