//! End-to-end tests of single-transport broadcast channels
//!
//! Every built-in transport is exercised through the public channel API: two
//! channels with the same name, one sending and one listening.

mod test_utils;

use bridgecast_core::{BroadcastChannel, ChannelOptions, EventContext, Transport};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{
    init_tracing, options_for, settle, unique_name, wait_until, Collector, FailingTransport, ScratchDir,
};

const TRANSPORTS: [&str; 5] = ["native", "store", "kv", "relay", "simulate"];

// ----------------------------------------------------------------------------
// Round Trips
// ----------------------------------------------------------------------------

async fn round_trip(transport: &str) {
    let name = unique_name(transport);
    let scratch = ScratchDir::new();
    let options = options_for(transport, &scratch);
    let sender = BroadcastChannel::new(&name, Some(options.clone())).unwrap();
    let receiver = BroadcastChannel::new(&name, Some(options)).unwrap();
    assert_eq!(receiver.transport_type(), transport);

    let inbox = Collector::new();
    receiver.set_onmessage(Some(inbox.callback()));
    let echo = Collector::new();
    sender.set_onmessage(Some(echo.callback()));
    settle().await;

    let large = "x".repeat(3 * 1024);
    sender.post_message(json!({ "foo": "bar" })).await.unwrap();
    sender.post_message(json!({ "blob": large })).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || inbox.len() == 2).await,
        "{} delivered {:?}",
        transport,
        inbox.messages()
    );
    assert_eq!(inbox.messages()[0], json!({ "foo": "bar" }));
    assert_eq!(inbox.messages()[1]["blob"].as_str().map(str::len), Some(3 * 1024));

    // a channel never hears itself
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(echo.len(), 0, "{} echoed to the sender", transport);

    sender.close().await.unwrap();
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_round_trip_every_transport() {
    init_tracing();
    for transport in TRANSPORTS {
        round_trip(transport).await;
    }
}

#[tokio::test]
async fn test_internal_messages_reach_internal_listeners_only() {
    let name = unique_name("internal");
    let scratch = ScratchDir::new();
    let sender = BroadcastChannel::new(&name, Some(options_for("native", &scratch))).unwrap();
    let receiver = BroadcastChannel::new(&name, Some(options_for("native", &scratch))).unwrap();

    let messages = Collector::new();
    let internal = Collector::new();
    receiver.add_event_listener(EventContext::Message, messages.callback());
    receiver.add_event_listener(EventContext::Internal, internal.callback());

    sender.post_internal(json!({ "ping": 1 })).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || internal.len() == 1).await);
    assert_eq!(messages.len(), 0);

    sender.close().await.unwrap();
    receiver.close().await.unwrap();
}

// ----------------------------------------------------------------------------
// Filtering
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_listener_ignores_messages_sent_before_it_registered() {
    let name = unique_name("temporal");
    let scratch = ScratchDir::new();
    let sender = BroadcastChannel::new(&name, Some(options_for("simulate", &scratch))).unwrap();
    let receiver = BroadcastChannel::new(&name, Some(options_for("simulate", &scratch))).unwrap();

    let early = sender.post_message(json!("early"));
    let inbox = Collector::new();
    receiver.set_onmessage(Some(inbox.callback()));
    early.await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(inbox.len(), 0);

    sender.post_message(json!("late")).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || inbox.len() == 1).await);
    assert_eq!(inbox.messages(), vec![json!("late")]);

    sender.close().await.unwrap();
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_channels_with_other_names_stay_isolated() {
    let scratch = ScratchDir::new();
    let options = options_for("native", &scratch);
    let sender = BroadcastChannel::new(&unique_name("left"), Some(options.clone())).unwrap();
    let stranger = BroadcastChannel::new(&unique_name("right"), Some(options)).unwrap();

    let inbox = Collector::new();
    stranger.set_onmessage(Some(inbox.callback()));
    sender.post_message(json!({ "foo": "bar" })).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(inbox.len(), 0);

    sender.close().await.unwrap();
    stranger.close().await.unwrap();
}

// ----------------------------------------------------------------------------
// Ordering and Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_sends_arrive_in_posting_order() {
    for transport in TRANSPORTS {
        let name = unique_name("ordering");
        let scratch = ScratchDir::new();
        let options = options_for(transport, &scratch);
        let sender = BroadcastChannel::new(&name, Some(options.clone())).unwrap();
        let receiver = BroadcastChannel::new(&name, Some(options)).unwrap();

        let inbox = Collector::new();
        receiver.set_onmessage(Some(inbox.callback()));
        settle().await;

        let sends: Vec<_> = (0..300).map(|i| sender.post_message(json!(i))).collect();
        for result in futures::future::join_all(sends).await {
            result.unwrap();
        }

        assert!(
            wait_until(Duration::from_secs(5), || inbox.len() == 300).await,
            "{} delivered {} of 300",
            transport,
            inbox.len()
        );
        let expected: Vec<_> = (0..300).map(|i| json!(i)).collect();
        assert_eq!(inbox.messages(), expected, "{} reordered sends", transport);

        sender.close().await.unwrap();
        receiver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_close_drains_in_flight_sends() {
    let name = unique_name("drain");
    let scratch = ScratchDir::new();
    let options = options_for("native", &scratch).with_prepare_delay(Duration::from_millis(80));
    let receiver = BroadcastChannel::new(&name, Some(options_for("native", &scratch))).unwrap();
    let sender = BroadcastChannel::new(&name, Some(options)).unwrap();

    let inbox = Collector::new();
    receiver.set_onmessage(Some(inbox.callback()));

    let sends: Vec<_> = (0..3).map(|i| sender.post_message(json!(i))).collect();
    assert_eq!(sender.in_flight_count(), 3);

    sender.close().await.unwrap();
    assert_eq!(sender.in_flight_count(), 0);
    for send in sends {
        send.await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(1), || inbox.len() == 3).await);

    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_rejected_sends() {
    let flaky = FailingTransport::new("flaky");
    let attempts = flaky.attempts();
    let methods: Vec<Arc<dyn Transport>> = vec![Arc::new(flaky)];
    let options = ChannelOptions::default()
        .with_methods(methods)
        .with_type("flaky")
        .with_prepare_delay(Duration::from_millis(80));
    let channel = BroadcastChannel::new(&unique_name("drain-rejected"), Some(options)).unwrap();

    let sends: Vec<_> = (0..3).map(|i| channel.post_message(json!(i))).collect();
    assert_eq!(channel.in_flight_count(), 3);

    channel.close().await.unwrap();
    assert!(channel.is_closed());
    assert_eq!(channel.in_flight_count(), 0);
    // every send reached the transport before close resolved
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    for send in sends {
        assert!(send.await.is_err());
    }
}

#[tokio::test]
async fn test_closed_channel_stops_dispatching() {
    let name = unique_name("closed-dispatch");
    let scratch = ScratchDir::new();
    let sender = BroadcastChannel::new(&name, Some(options_for("native", &scratch))).unwrap();
    let receiver = BroadcastChannel::new(&name, Some(options_for("native", &scratch))).unwrap();

    let inbox = Collector::new();
    receiver.set_onmessage(Some(inbox.callback()));
    receiver.close().await.unwrap();

    sender.post_message(json!("after close")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inbox.len(), 0);

    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_scratch_store_root_is_removed_on_drop() {
    let scratch = ScratchDir::new();
    let root = scratch.path().to_path_buf();
    let name = unique_name("scratch");
    let channel = BroadcastChannel::new(&name, Some(options_for("store", &scratch))).unwrap();
    channel.post_message(json!("kept on disk")).await.unwrap();
    channel.close().await.unwrap();
    assert!(root.exists());

    drop(scratch);
    assert!(!root.exists());
}
