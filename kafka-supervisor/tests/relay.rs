use kafka_supervisor::config::RelayConfig;
use kafka_supervisor::test_utils::{RecordingAsyncPublisher, RecordingPublisher};
use kafka_supervisor::{
    AsyncProducer, ProducerMessage, RelayError, SyncProducer, MAX_BUFFER_SIZE,
};

fn numbered(count: usize) -> Vec<ProducerMessage> {
    (0..count)
        .map(|i| {
            ProducerMessage::new("events")
                .with_key(format!("key-{i}"))
                .with_payload(format!("{{\"seq\":{i}}}"))
        })
        .collect()
}

fn relay_config(buffer_size: i64) -> RelayConfig {
    RelayConfig {
        relay_buffer_size: buffer_size,
        ..RelayConfig::default()
    }
}

#[tokio::test]
async fn sync_relay_publishes_everything_before_closing() {
    let publisher = RecordingPublisher::new();
    let probe = publisher.probe();
    let relay = SyncProducer::new(publisher, &relay_config(4));

    let sent = numbered(50);
    for message in sent.clone() {
        relay.send(message).await.unwrap();
    }
    relay.close().await.unwrap();

    assert!(probe.is_closed());
    assert_eq!(probe.published_before_close(), Some(50));
    assert_eq!(probe.published(), sent);
}

#[tokio::test]
async fn sync_relay_keeps_going_past_failures() {
    let publisher = RecordingPublisher::new().failing_on(|m| m.key.as_deref() == Some(b"key-3"));
    let probe = publisher.probe();
    let relay = SyncProducer::new(publisher, &relay_config(2));

    for message in numbered(8) {
        relay.send(message).await.unwrap();
    }
    relay.close().await.unwrap();

    assert_eq!(probe.failures(), 1);
    assert_eq!(probe.published_before_close(), Some(8));
}

#[tokio::test]
async fn paused_publisher_fills_the_queue() {
    let publisher = RecordingPublisher::new();
    let probe = publisher.probe();
    let gate = probe.pause();
    let relay = SyncProducer::new(publisher, &relay_config(1));

    let mut messages = numbered(3).into_iter();
    // The worker holds the first, the queue holds the second
    relay.try_send(messages.next()).unwrap();
    probe.wait_for_attempts(1).await;
    relay.try_send(messages.next()).unwrap();
    assert!(matches!(relay.try_send(messages.next()), Err(RelayError::Full)));

    gate.open();
    relay.close().await.unwrap();
    assert_eq!(probe.published().len(), 2);
}

#[tokio::test]
async fn client_default_sizes_the_queue() {
    let relay = SyncProducer::new(RecordingPublisher::with_default_buffer(32), &relay_config(0));
    assert_eq!(relay.buffer_size(), 32);
    relay.close().await.unwrap();

    let relay = SyncProducer::new(RecordingPublisher::new(), &relay_config(-3));
    assert_eq!(relay.buffer_size(), 1);
    relay.close().await.unwrap();
}

#[tokio::test]
async fn oversized_buffer_is_capped_instead_of_panicking() {
    let publisher = RecordingPublisher::new();
    let probe = publisher.probe();
    let relay = SyncProducer::new(publisher, &relay_config(i64::MAX));
    assert_eq!(relay.buffer_size(), MAX_BUFFER_SIZE);

    for message in numbered(3) {
        relay.send(message).await.unwrap();
    }
    relay.close().await.unwrap();
    assert_eq!(probe.published_before_close(), Some(3));

    let relay = AsyncProducer::new(
        RecordingAsyncPublisher::new(false, true),
        &relay_config(i64::MAX),
    );
    assert_eq!(relay.buffer_size(), MAX_BUFFER_SIZE);
    relay.close().await.unwrap();
}

#[tokio::test]
async fn async_relay_hands_every_message_to_the_client() {
    let publisher = RecordingAsyncPublisher::new(true, true)
        .failing_on(|m| m.key.as_deref() == Some(b"key-1"));
    let probe = publisher.probe();
    let config = RelayConfig {
        relay_buffer_size: 8,
        relay_return_successes: true,
        relay_return_errors: true,
        ..RelayConfig::default()
    };
    let relay = AsyncProducer::new(publisher, &config);

    let sent = numbered(20);
    for message in sent.clone() {
        relay.send(message).await.unwrap();
    }
    relay.send(None).await.unwrap();
    relay.close().await.unwrap();

    assert_eq!(probe.inputs_before_close(), Some(20));
    assert_eq!(probe.inputs(), sent);
    assert_eq!(probe.reported_successes(), 19);
    assert_eq!(probe.reported_failures(), 1);
}

#[tokio::test]
async fn binary_payloads_are_not_altered() {
    let publisher = RecordingAsyncPublisher::new(false, true);
    let probe = publisher.probe();
    let relay = AsyncProducer::new(publisher, &RelayConfig::default());

    let payload: Vec<u8> = (0..=255).collect();
    let message = ProducerMessage::new("raw")
        .with_payload(payload.clone())
        .with_header("content-type", "application/octet-stream");
    relay.send(message).await.unwrap();
    relay.close().await.unwrap();

    let inputs = probe.inputs();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].payload.as_deref(), Some(payload.as_slice()));
    assert_eq!(inputs[0].headers.len(), 1);
}
