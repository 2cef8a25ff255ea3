//! In-memory collaborators for exercising the relays and supervision
//! loops without a broker. Every fake hands out a cloneable probe so a
//! test can keep observing it after the fake was moved into a relay or
//! consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::client::{
    AsyncPublisher, ConsumeError, GroupSession, MessageHandler, OffsetMarker, PublishError,
    Subscription, SyncPublisher,
};
use crate::message::{
    ConsumedMessage, DeliveryFailure, DeliveryReport, Generation, Notification, ProducerMessage,
    TopicPartition,
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

type MessageFilter = Box<dyn Fn(&ProducerMessage) -> bool + Send + Sync>;

/// Polls `done` until it holds, panics after [`WAIT_LIMIT`].
async fn wait_until(what: &str, done: impl Fn() -> bool) {
    let waited = tokio::time::timeout(WAIT_LIMIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// Builds a consumed message with a recognisable payload.
pub fn consumed(topic: &str, partition: i32, offset: i64) -> ConsumedMessage {
    ConsumedMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(format!("payload-{offset}").into_bytes()),
        timestamp: None,
    }
}

// ==== Sync publisher ====

#[derive(Default)]
struct PublisherState {
    published: Mutex<Vec<ProducerMessage>>,
    failures: AtomicUsize,
    closed: AtomicBool,
    published_before_close: Mutex<Option<usize>>,
}

/// Records every publish attempt and acknowledges it with a fake offset.
pub struct RecordingPublisher {
    state: Arc<PublisherState>,
    gate: Arc<watch::Sender<bool>>,
    default_buffer: Option<usize>,
    fail_when: Option<MessageFilter>,
    close_error: Option<PublishError>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingPublisher {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Default::default(),
            gate: Arc::new(gate),
            default_buffer: None,
            fail_when: None,
            close_error: None,
        }
    }

    pub fn with_default_buffer(size: usize) -> Self {
        Self {
            default_buffer: Some(size),
            ..Self::new()
        }
    }

    /// Messages matching `filter` are attempted but fail to publish.
    pub fn failing_on(
        mut self,
        filter: impl Fn(&ProducerMessage) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(filter));
        self
    }

    pub fn close_error(mut self, err: PublishError) -> Self {
        self.close_error = Some(err);
        self
    }

    pub fn probe(&self) -> PublisherProbe {
        PublisherProbe {
            state: self.state.clone(),
            gate: self.gate.clone(),
        }
    }
}

#[async_trait]
impl SyncPublisher for RecordingPublisher {
    fn default_buffer_size(&self) -> Option<usize> {
        self.default_buffer
    }

    async fn send_message(&self, message: &ProducerMessage) -> Result<(i32, i64), PublishError> {
        let offset = {
            let mut published = self.state.published.lock().unwrap();
            published.push(message.clone());
            published.len() as i64 - 1
        };

        let mut gate = self.gate.subscribe();
        drop(gate.wait_for(|open| *open).await);

        if self.fail_when.as_ref().is_some_and(|fail| fail(message)) {
            self.state.failures.fetch_add(1, Ordering::SeqCst);
            return Err(PublishError::Other("scripted publish failure".to_string()));
        }
        Ok((message.partition.unwrap_or(0), offset))
    }

    async fn close(self) -> Result<(), PublishError> {
        let attempts = self.state.published.lock().unwrap().len();
        *self.state.published_before_close.lock().unwrap() = Some(attempts);
        self.state.closed.store(true, Ordering::SeqCst);
        match self.close_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct PublisherProbe {
    state: Arc<PublisherState>,
    gate: Arc<watch::Sender<bool>>,
}

impl PublisherProbe {
    /// Every attempted message, failed ones included, in attempt order.
    pub fn published(&self) -> Vec<ProducerMessage> {
        self.state.published.lock().unwrap().clone()
    }

    /// Attempts made by the time the publisher was closed.
    pub fn published_before_close(&self) -> Option<usize> {
        *self.state.published_before_close.lock().unwrap()
    }

    pub fn failures(&self) -> usize {
        self.state.failures.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Holds every publish attempt until the returned gate is opened.
    pub fn pause(&self) -> Gate {
        self.gate.send_replace(false);
        Gate {
            gate: self.gate.clone(),
        }
    }

    pub async fn wait_for_attempts(&self, attempts: usize) {
        wait_until("publish attempts", || {
            self.state.published.lock().unwrap().len() >= attempts
        })
        .await
    }
}

pub struct Gate {
    gate: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

// ==== Async publisher ====

#[derive(Default)]
struct AsyncPublisherState {
    inputs: Mutex<Vec<ProducerMessage>>,
    successes_taken: AtomicBool,
    errors_taken: AtomicBool,
    reported_successes: AtomicUsize,
    reported_failures: AtomicUsize,
    inputs_before_close: Mutex<Option<usize>>,
    closed: AtomicBool,
}

/// Accepts every input and reports its outcome on whichever event
/// streams it was built to populate.
pub struct RecordingAsyncPublisher {
    state: Arc<AsyncPublisherState>,
    fail_when: Option<MessageFilter>,
    successes_tx: Option<mpsc::UnboundedSender<DeliveryReport>>,
    successes_rx: Option<mpsc::UnboundedReceiver<DeliveryReport>>,
    errors_tx: Option<mpsc::UnboundedSender<DeliveryFailure>>,
    errors_rx: Option<mpsc::UnboundedReceiver<DeliveryFailure>>,
}

impl RecordingAsyncPublisher {
    pub fn new(report_successes: bool, report_errors: bool) -> Self {
        let (successes_tx, successes_rx) = if report_successes {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (errors_tx, errors_rx) = if report_errors {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        Self {
            state: Default::default(),
            fail_when: None,
            successes_tx,
            successes_rx,
            errors_tx,
            errors_rx,
        }
    }

    pub fn failing_on(
        mut self,
        filter: impl Fn(&ProducerMessage) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail_when = Some(Box::new(filter));
        self
    }

    pub fn probe(&self) -> AsyncPublisherProbe {
        AsyncPublisherProbe {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl AsyncPublisher for RecordingAsyncPublisher {
    async fn input(&self, message: ProducerMessage) {
        let offset = {
            let mut inputs = self.state.inputs.lock().unwrap();
            inputs.push(message.clone());
            inputs.len() as i64 - 1
        };

        if self.fail_when.as_ref().is_some_and(|fail| fail(&message)) {
            if let Some(errors) = &self.errors_tx {
                let failure = DeliveryFailure {
                    message,
                    error: PublishError::Other("scripted delivery failure".to_string()),
                };
                if errors.send(failure).is_ok() {
                    self.state.reported_failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        } else if let Some(successes) = &self.successes_tx {
            let report = DeliveryReport {
                topic: message.topic,
                partition: message.partition.unwrap_or(0),
                offset,
            };
            if successes.send(report).is_ok() {
                self.state.reported_successes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn successes(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>> {
        let taken = self.successes_rx.take();
        if taken.is_some() {
            self.state.successes_taken.store(true, Ordering::SeqCst);
        }
        taken
    }

    fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryFailure>> {
        let taken = self.errors_rx.take();
        if taken.is_some() {
            self.state.errors_taken.store(true, Ordering::SeqCst);
        }
        taken
    }

    async fn close(self) -> Result<(), PublishError> {
        let inputs = self.state.inputs.lock().unwrap().len();
        *self.state.inputs_before_close.lock().unwrap() = Some(inputs);
        self.state.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends both streams
        Ok(())
    }
}

#[derive(Clone)]
pub struct AsyncPublisherProbe {
    state: Arc<AsyncPublisherState>,
}

impl AsyncPublisherProbe {
    pub fn inputs(&self) -> Vec<ProducerMessage> {
        self.state.inputs.lock().unwrap().clone()
    }

    pub fn successes_taken(&self) -> bool {
        self.state.successes_taken.load(Ordering::SeqCst)
    }

    pub fn errors_taken(&self) -> bool {
        self.state.errors_taken.load(Ordering::SeqCst)
    }

    pub fn reported_successes(&self) -> usize {
        self.state.reported_successes.load(Ordering::SeqCst)
    }

    pub fn reported_failures(&self) -> usize {
        self.state.reported_failures.load(Ordering::SeqCst)
    }

    pub fn inputs_before_close(&self) -> Option<usize> {
        *self.state.inputs_before_close.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

// ==== Group session ====

/// One scripted outcome of a consume call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Generation ends without delivering anything
    Rebalance,
    /// Generation delivers these messages, then ends
    Deliver(Vec<ConsumedMessage>),
    Fail(ConsumeError),
}

#[derive(Default)]
struct SessionRecord {
    consume_calls: AtomicUsize,
    close_calls: AtomicUsize,
    closed: AtomicBool,
    generations: AtomicU64,
    marked: Mutex<Vec<i64>>,
}

/// Plays back one [`Step`] per consume call. Once the script runs out a
/// consume call blocks until it is cancelled, like a quiet generation.
pub struct ScriptedSession {
    steps: Mutex<VecDeque<Step>>,
    state: Arc<SessionRecord>,
    errors_tx: mpsc::UnboundedSender<ConsumeError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumeError>>>,
    close_error: Option<ConsumeError>,
}

impl ScriptedSession {
    pub fn new(steps: Vec<Step>) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            steps: Mutex::new(steps.into()),
            state: Default::default(),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            close_error: None,
        }
    }

    pub fn close_error(mut self, err: ConsumeError) -> Self {
        self.close_error = Some(err);
        self
    }

    /// Injects errors into the session's error stream.
    pub fn error_sender(&self) -> mpsc::UnboundedSender<ConsumeError> {
        self.errors_tx.clone()
    }

    pub fn probe(&self) -> SessionProbe {
        SessionProbe {
            state: self.state.clone(),
        }
    }
}

struct RecordingMarker {
    state: Arc<SessionRecord>,
}

impl OffsetMarker for RecordingMarker {
    fn mark_message(&self, message: &ConsumedMessage) {
        self.state.marked.lock().unwrap().push(message.offset);
    }
}

#[async_trait]
impl GroupSession for ScriptedSession {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        _topics: &[String],
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumeError> {
        self.state.consume_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ConsumeError::ClosedGroup);
        }

        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Rebalance) => Ok(()),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Deliver(messages)) => {
                let mut assignment: Vec<TopicPartition> =
                    messages.iter().map(ConsumedMessage::topic_partition).collect();
                assignment.sort();
                assignment.dedup();
                let generation = Generation {
                    id: self.state.generations.fetch_add(1, Ordering::SeqCst) + 1,
                    assignment,
                };
                let marker = RecordingMarker {
                    state: self.state.clone(),
                };

                handler
                    .setup(&generation)
                    .await
                    .map_err(|e| ConsumeError::Other(e.to_string()))?;
                for message in &messages {
                    if cancel.is_cancelled() {
                        break;
                    }
                    handler
                        .handle(message, &marker)
                        .await
                        .map_err(|e| ConsumeError::Other(e.to_string()))?;
                }
                handler
                    .cleanup(&generation)
                    .await
                    .map_err(|e| ConsumeError::Other(e.to_string()))?;
                Ok(())
            }
            None => {
                cancel.cancelled().await;
                Ok(())
            }
        }
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>> {
        self.errors_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.state.closed.store(true, Ordering::SeqCst);
        match &self.close_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct SessionProbe {
    state: Arc<SessionRecord>,
}

impl SessionProbe {
    pub fn consume_calls(&self) -> usize {
        self.state.consume_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Offsets marked by handlers, in marking order.
    pub fn marked(&self) -> Vec<i64> {
        self.state.marked.lock().unwrap().clone()
    }

    pub async fn wait_for_consume_calls(&self, calls: usize) {
        wait_until("consume calls", || self.consume_calls() >= calls).await
    }
}

/// Handler that marks everything it sees and counts lifecycle calls.
#[derive(Default)]
pub struct CountingHandler {
    pub setups: AtomicUsize,
    pub handled: AtomicUsize,
    pub cleanups: AtomicUsize,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn setup(&self, _generation: &Generation) -> anyhow::Result<()> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self, _generation: &Generation) -> anyhow::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle(
        &self,
        message: &ConsumedMessage,
        marker: &dyn OffsetMarker,
    ) -> anyhow::Result<()> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        marker.mark_message(message);
        Ok(())
    }
}

// ==== Subscription ====

#[derive(Default)]
struct SubscriptionState {
    reads: AtomicUsize,
    close_calls: AtomicUsize,
    marked: Mutex<Vec<i64>>,
}

/// Plays back a fixed list of messages and errors. Afterwards it either
/// waits forever or, when built with [`ScriptedSubscription::ending`],
/// reports the end of the subscription.
pub struct ScriptedSubscription {
    script: Mutex<VecDeque<Result<ConsumedMessage, ConsumeError>>>,
    ends: bool,
    state: Arc<SubscriptionState>,
    errors_tx: mpsc::UnboundedSender<ConsumeError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<ConsumeError>>>,
    notifications_tx: mpsc::UnboundedSender<Notification>,
    notifications_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
}

impl ScriptedSubscription {
    pub fn new(script: Vec<Result<ConsumedMessage, ConsumeError>>) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(script.into()),
            ends: false,
            state: Default::default(),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            notifications_tx,
            notifications_rx: Mutex::new(Some(notifications_rx)),
        }
    }

    pub fn ending(mut self) -> Self {
        self.ends = true;
        self
    }

    pub fn error_sender(&self) -> mpsc::UnboundedSender<ConsumeError> {
        self.errors_tx.clone()
    }

    pub fn notification_sender(&self) -> mpsc::UnboundedSender<Notification> {
        self.notifications_tx.clone()
    }

    pub fn probe(&self) -> SubscriptionProbe {
        SubscriptionProbe {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    async fn next_message(&self) -> Option<Result<ConsumedMessage, ConsumeError>> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(item) => Some(item),
            None if self.ends => None,
            None => std::future::pending().await,
        }
    }

    fn mark_offset(&self, message: &ConsumedMessage) -> Result<(), ConsumeError> {
        self.state.marked.lock().unwrap().push(message.offset);
        Ok(())
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>> {
        self.errors_rx.lock().unwrap().take()
    }

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SubscriptionProbe {
    state: Arc<SubscriptionState>,
}

impl SubscriptionProbe {
    pub fn marked(&self) -> Vec<i64> {
        self.state.marked.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    pub async fn wait_for_marks(&self, marks: usize) {
        wait_until("marked offsets", || self.marked().len() >= marks).await
    }

    pub async fn wait_for_reads(&self, reads: usize) {
        wait_until("subscription reads", || {
            self.state.reads.load(Ordering::SeqCst) >= reads
        })
        .await
    }
}
