use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthRegistry};
use tokio_util::sync::CancellationToken;

use kafka_supervisor::test_utils::{
    consumed, CountingHandler, ScriptedSession, ScriptedSubscription, Step,
};
use kafka_supervisor::{
    ConsumeError, ConsumerGroup, GroupError, MessageHandler, SessionState, StreamingConsumer,
};

async fn wait_for_status(registry: &HealthRegistry, component: &str, expected: ComponentStatus) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = registry.get_status();
            if status.components.get(component) == Some(&expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{component} never reported {expected:?}");
}

#[tokio::test]
async fn generations_are_consumed_until_shutdown() {
    let session = ScriptedSession::new(vec![
        Step::Deliver(vec![consumed("events", 0, 10), consumed("events", 1, 20)]),
        Step::Rebalance,
        Step::Deliver(vec![consumed("events", 0, 11)]),
    ]);
    let probe = session.probe();
    let group = Arc::new(ConsumerGroup::new(
        session,
        "mirror",
        vec!["events".to_string()],
    ));
    let handler = Arc::new(CountingHandler::default());

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let group = group.clone();
        let shutdown = shutdown.clone();
        let handler: Arc<dyn MessageHandler> = handler.clone();
        async move { group.start(&shutdown, Some(handler)).await }
    });

    // Script exhausted, the fourth call waits for cancellation
    probe.wait_for_consume_calls(4).await;
    assert_eq!(group.state(), SessionState::Running);
    shutdown.cancel();

    task.await.unwrap().unwrap();
    assert_eq!(probe.marked(), vec![10, 20, 11]);
    assert_eq!(handler.setups.load(Ordering::SeqCst), 2);
    assert_eq!(handler.cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(group.failures(), 0);
    assert_eq!(probe.close_calls(), 1);
    assert_eq!(group.state(), SessionState::Closed);
}

#[tokio::test]
async fn lost_connection_is_reported_for_recreation() {
    let registry = HealthRegistry::new("liveness");
    let liveness = registry
        .register("consumer".to_string(), Duration::from_secs(30))
        .await;

    let session = ScriptedSession::new(vec![Step::Fail(ConsumeError::Other(
        "kafka: broker not connected".to_string(),
    ))]);
    let probe = session.probe();
    let errors = session.error_sender();
    let group = ConsumerGroup::new(session, "mirror", vec!["events".to_string()])
        .with_liveness(liveness);
    let handler: Arc<dyn MessageHandler> = Arc::new(CountingHandler::default());

    errors
        .send(ConsumeError::Other("read tcp 10.0.0.1:9092: i/o timeout".to_string()))
        .unwrap();
    let result = group.start(&CancellationToken::new(), Some(handler)).await;

    assert!(matches!(result, Err(GroupError::NeedsRecreation)));
    assert_eq!(probe.close_calls(), 1);
    wait_for_status(&registry, "consumer", ComponentStatus::Unhealthy).await;
    assert!(!registry.get_status().healthy);
}

#[tokio::test]
async fn closed_group_stops_and_reports_stopped() {
    let registry = HealthRegistry::new("liveness");
    let liveness = registry
        .register("consumer".to_string(), Duration::from_secs(30))
        .await;

    let session = ScriptedSession::new(Vec::new());
    let probe = session.probe();
    let group = Arc::new(
        ConsumerGroup::new(session, "mirror", vec!["events".to_string()]).with_liveness(liveness),
    );

    let task = tokio::spawn({
        let group = group.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(CountingHandler::default());
        async move { group.start(&CancellationToken::new(), Some(handler)).await }
    });
    probe.wait_for_consume_calls(1).await;

    group.close().await.unwrap();
    // Close only returns after the loop released the session
    assert_eq!(probe.close_calls(), 1);
    task.await.unwrap().unwrap();

    wait_for_status(&registry, "consumer", ComponentStatus::Stopped).await;
    group.close().await.unwrap();
    assert_eq!(probe.close_calls(), 1);
}

#[tokio::test]
async fn streaming_consumer_processes_until_closed() {
    let subscription = ScriptedSubscription::new(vec![
        Ok(consumed("clicks", 0, 1)),
        Err(ConsumeError::Other("corrupt message".to_string())),
        Ok(consumed("clicks", 0, 2)),
    ]);
    let probe = subscription.probe();
    let consumer = Arc::new(StreamingConsumer::new(
        subscription,
        "clicks-reader",
        vec!["clicks".to_string()],
    ));

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let task = tokio::spawn({
        let consumer = consumer.clone();
        let seen = seen.clone();
        async move {
            let handler = move |message: &kafka_supervisor::ConsumedMessage| {
                seen.lock().unwrap().push(message.offset);
            };
            consumer
                .start(&CancellationToken::new(), Some(handler))
                .await
        }
    });

    probe.wait_for_marks(2).await;
    consumer.close().await.unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(probe.marked(), vec![1, 2]);
    assert_eq!(consumer.processed(), 2);
    assert_eq!(probe.close_calls(), 1);
}
