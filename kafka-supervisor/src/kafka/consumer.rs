use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::ClientConfig;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::apply_tls;
use super::context::{ContextStreams, SupervisorContext};
use crate::client::{ConsumeError, GroupSession, MessageHandler, OffsetMarker, Subscription};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::message::{ConsumedMessage, Generation, Notification};

pub fn create_kafka_consumer(
    kafka: &KafkaConfig,
    consumer: &ConsumerConfig,
    liveness: HealthHandle,
    return_notifications: bool,
) -> Result<(StreamConsumer<SupervisorContext>, ContextStreams), KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &kafka.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("group.id", &consumer.kafka_consumer_group)
        .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
        .set(
            "session.timeout.ms",
            consumer.kafka_consumer_session_timeout_ms.to_string(),
        )
        .set("enable.auto.commit", "true")
        .set(
            "auto.commit.interval.ms",
            consumer.kafka_consumer_auto_commit_interval_ms.to_string(),
        );

    // Handlers decide what gets committed by marking messages
    client_config.set("enable.auto.offset.store", "false");
    apply_tls(&mut client_config, kafka);

    let (context, streams) = SupervisorContext::new(
        liveness,
        consumer.kafka_consumer_return_errors,
        return_notifications,
    );
    debug!("rdkafka configuration: {:?}", client_config);
    let api: StreamConsumer<SupervisorContext> = client_config.create_with_context(context)?;
    Ok((api, streams))
}

fn consumed_message(message: &BorrowedMessage<'_>) -> ConsumedMessage {
    ConsumedMessage {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp: message.timestamp().to_millis(),
    }
}

fn store_offset(
    consumer: &StreamConsumer<SupervisorContext>,
    message: &ConsumedMessage,
) -> Result<(), KafkaError> {
    // The stored offset is the next one to read
    consumer.store_offset(&message.topic, message.partition, message.offset + 1)
}

/// Commits whatever was stored and leaves the group.
fn release(consumer: &StreamConsumer<SupervisorContext>) -> Result<(), ConsumeError> {
    let committed = match consumer.commit_consumer_state(CommitMode::Sync) {
        Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
        Err(err) => Err(ConsumeError::Kafka(err)),
    };
    consumer.unsubscribe();
    committed
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

struct StoreOffset<'a> {
    consumer: &'a StreamConsumer<SupervisorContext>,
}

impl OffsetMarker for StoreOffset<'_> {
    fn mark_message(&self, message: &ConsumedMessage) {
        if let Err(err) = store_offset(self.consumer, message) {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                err = %err,
                "failed to store offset"
            );
        }
    }
}

enum Next {
    Stop,
    Rebalanced,
    GroupGone,
    Received(Result<ConsumedMessage, KafkaError>),
}

/// Consumer-group membership over an rdkafka `StreamConsumer`. A consume
/// call lasts one generation: it ends when the context reports a revoke
/// or a new assignment.
pub struct KafkaGroupSession {
    consumer: StreamConsumer<SupervisorContext>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<ConsumeError>>>,
    generation: watch::Receiver<Generation>,
    subscribed: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl KafkaGroupSession {
    pub fn new(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let (consumer, streams) = create_kafka_consumer(kafka, consumer, liveness, false)?;
        Ok(Self {
            consumer,
            errors: Mutex::new(streams.errors),
            generation: streams.generation,
            subscribed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError> {
        let mut subscribed = self
            .subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribed.as_slice() == topics {
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)?;
        info!(topics = ?topics, "subscribed");
        *subscribed = topics.to_vec();
        Ok(())
    }
}

#[async_trait]
impl GroupSession for KafkaGroupSession {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumeError::ClosedGroup);
        }
        self.subscribe(topics)?;

        let mut generation = self.generation.clone();
        let current = generation.borrow_and_update().clone();
        handler
            .setup(&current)
            .await
            .map_err(|e| ConsumeError::Other(format!("handler setup failed: {e}")))?;

        let marker = StoreOffset {
            consumer: &self.consumer,
        };
        let outcome = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Next::Stop,
                changed = generation.changed() => match changed {
                    Ok(()) => Next::Rebalanced,
                    Err(_) => Next::GroupGone,
                },
                received = self.consumer.recv() => {
                    Next::Received(received.map(|message| consumed_message(&message)))
                }
            };

            match next {
                Next::Stop | Next::Rebalanced => break Ok(()),
                Next::GroupGone => break Err(ConsumeError::ClosedGroup),
                Next::Received(Ok(message)) => {
                    if let Err(err) = handler.handle(&message, &marker).await {
                        error!(
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            err = %err,
                            "handler failed"
                        );
                    }
                }
                Next::Received(Err(err)) => break Err(ConsumeError::Kafka(err)),
            }
        };

        if let Err(err) = handler.cleanup(&current).await {
            error!(generation = current.id, err = %err, "handler cleanup failed");
        }
        outcome
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>> {
        take(&self.errors)
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        release(&self.consumer)
    }
}

/// Plain subscription over an rdkafka `StreamConsumer`, subscribed on
/// construction.
pub struct KafkaSubscription {
    consumer: StreamConsumer<SupervisorContext>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<ConsumeError>>>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    closed: AtomicBool,
}

impl KafkaSubscription {
    pub fn new(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let (api, streams) = create_kafka_consumer(
            kafka,
            consumer,
            liveness,
            consumer.kafka_consumer_return_notifications,
        )?;
        let topics = consumer.topics();
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        api.subscribe(&names)?;
        info!(topics = ?topics, "subscribed");

        Ok(Self {
            consumer: api,
            errors: Mutex::new(streams.errors),
            notifications: Mutex::new(streams.notifications),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next_message(&self) -> Option<Result<ConsumedMessage, ConsumeError>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let received = self
            .consumer
            .recv()
            .await
            .map(|message| consumed_message(&message))
            .map_err(ConsumeError::Kafka);
        Some(received)
    }

    fn mark_offset(&self, message: &ConsumedMessage) -> Result<(), ConsumeError> {
        store_offset(&self.consumer, message).map_err(ConsumeError::Kafka)
    }

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>> {
        take(&self.errors)
    }

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        take(&self.notifications)
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        release(&self.consumer)
    }
}
