//! Seams to the underlying broker client.
//!
//! The relays and sessions in this crate only orchestrate: publishing,
//! group membership and offset storage belong to whatever implements
//! these traits. The rdkafka implementations live in [`crate::kafka`],
//! scripted in-memory ones in [`crate::test_utils`].

use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::message::{
    ConsumedMessage, DeliveryFailure, DeliveryReport, Generation, Notification, ProducerMessage,
};

#[derive(Error, Debug, Clone)]
pub enum PublishError {
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
    #[error("failed to flush producer: {0}")]
    Flush(KafkaError),
    #[error("{0}")]
    Other(String),
}

/// Request/response publish primitive backing [`crate::SyncProducer`].
#[async_trait]
pub trait SyncPublisher: Send + Sync + Sized + 'static {
    /// Queue size the client would pick on its own, used when the relay
    /// is configured with a buffer size of 0.
    fn default_buffer_size(&self) -> Option<usize> {
        None
    }

    /// Publishes one message and waits for the broker acknowledgement.
    async fn send_message(&self, message: &ProducerMessage) -> Result<(i32, i64), PublishError>;

    /// Flushes and releases the handle.
    async fn close(self) -> Result<(), PublishError>;
}

/// Pipelined publish primitive backing [`crate::AsyncProducer`].
///
/// Outcomes are only reported on the event streams the client was
/// configured to populate. Both streams end once `close` returns.
#[async_trait]
pub trait AsyncPublisher: Send + Sync + Sized + 'static {
    fn default_buffer_size(&self) -> Option<usize> {
        None
    }

    /// Hands the message to the client. Waits while the client's own
    /// queue is full, never for the broker acknowledgement.
    async fn input(&self, message: ProducerMessage);

    /// Delivery acknowledgements, taken at most once.
    fn successes(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>>;

    /// Delivery failures, taken at most once.
    fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryFailure>>;

    async fn close(self) -> Result<(), PublishError>;
}

#[derive(Error, Debug, Clone)]
pub enum ConsumeError {
    #[error("kafka: tried to use a consumer group that was closed")]
    ClosedGroup,
    /// Client-level error reported outside of a consume call, with the
    /// client's own explanation attached.
    #[error("{error}: {reason}")]
    Client { error: KafkaError, reason: String },
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("{0}")]
    Other(String),
}

impl ConsumeError {
    /// Structured librdkafka code, when the error carries one.
    pub fn kafka_code(&self) -> Option<RDKafkaErrorCode> {
        match self {
            ConsumeError::Client { error, .. } | ConsumeError::Kafka(error) => {
                error.rdkafka_error_code()
            }
            ConsumeError::ClosedGroup | ConsumeError::Other(_) => None,
        }
    }
}

/// Stores the position of a processed message so the next commit covers it.
pub trait OffsetMarker: Send + Sync {
    fn mark_message(&self, message: &ConsumedMessage);
}

/// Business logic bound to a consumer group.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Called at the start of every generation, before any message.
    async fn setup(&self, _generation: &Generation) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once the generation ends, after the last message.
    async fn cleanup(&self, _generation: &Generation) -> anyhow::Result<()> {
        Ok(())
    }

    /// Processes one message. The handler decides when to mark it.
    async fn handle(
        &self,
        message: &ConsumedMessage,
        marker: &dyn OffsetMarker,
    ) -> anyhow::Result<()>;
}

/// Consumer-group membership backing [`crate::ConsumerGroup`].
#[async_trait]
pub trait GroupSession: Send + Sync + 'static {
    /// Runs one generation: joins the group, feeds claimed messages to the
    /// handler and returns `Ok(())` at the next rebalance. Returns promptly
    /// once `cancel` fires, and `ConsumeError::ClosedGroup` after `close`.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumeError>;

    /// Errors raised outside of `consume`, taken at most once.
    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>>;

    async fn close(&self) -> Result<(), ConsumeError>;
}

/// Plain topic subscription backing [`crate::StreamingConsumer`].
#[async_trait]
pub trait Subscription: Send + Sync + 'static {
    /// Next message, or `None` once the subscription has ended.
    async fn next_message(&self) -> Option<Result<ConsumedMessage, ConsumeError>>;

    fn mark_offset(&self, message: &ConsumedMessage) -> Result<(), ConsumeError>;

    fn errors(&self) -> Option<mpsc::UnboundedReceiver<ConsumeError>>;

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<Notification>>;

    async fn close(&self) -> Result<(), ConsumeError>;
}
