use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{effective_buffer_size, Intake, RelayError};
use crate::client::SyncPublisher;
use crate::config::RelayConfig;
use crate::message::ProducerMessage;
use crate::metrics_consts::RELAY_PUBLISH_ATTEMPTS;

const KIND: &str = "sync";

/// Relay in front of a request/response publisher: every message is
/// published and acknowledged one at a time, in enqueue order.
pub struct SyncProducer<P: SyncPublisher> {
    intake: Intake,
    worker: JoinHandle<P>,
}

impl<P: SyncPublisher> SyncProducer<P> {
    /// Starts the relay worker, must be called from within a tokio runtime.
    pub fn new(publisher: P, config: &RelayConfig) -> Self {
        let buffer_size =
            effective_buffer_size(config.relay_buffer_size, publisher.default_buffer_size());
        let (intake, messages) = Intake::new(KIND, buffer_size);
        let worker = tokio::spawn(relay_loop(publisher, messages));
        debug!(buffer_size, "[syncProducer] created");
        Self { intake, worker }
    }

    pub fn buffer_size(&self) -> usize {
        self.intake.buffer_size()
    }

    /// Queues a message, waiting while the queue is full. `None` is a no-op.
    pub async fn send(&self, message: impl Into<Option<ProducerMessage>>) -> Result<(), RelayError> {
        self.intake.send(message.into()).await
    }

    /// Queues a message without waiting, `RelayError::Full` when there is no room.
    pub fn try_send(&self, message: impl Into<Option<ProducerMessage>>) -> Result<(), RelayError> {
        self.intake.try_send(message.into())
    }

    /// Stops intake, waits for every queued message to be published, then
    /// closes the publisher. Consuming `self` makes a second close or a
    /// send after close impossible.
    pub async fn close(self) -> Result<(), RelayError> {
        let Self { intake, worker } = self;
        let buffer_size = intake.buffer_size();
        drop(intake);
        let publisher = worker.await?;
        info!(buffer_size, "[syncProducer] close");
        publisher.close().await?;
        Ok(())
    }
}

async fn relay_loop<P: SyncPublisher>(
    publisher: P,
    mut messages: mpsc::Receiver<ProducerMessage>,
) -> P {
    while let Some(message) = messages.recv().await {
        match publisher.send_message(&message).await {
            Ok((partition, offset)) => {
                counter!(RELAY_PUBLISH_ATTEMPTS, "relay" => KIND, "outcome" => "success")
                    .increment(1);
                debug!(partition, offset, topic = %message.topic, "[syncProducer] return");
            }
            Err(err) => {
                // One bad message must not hold up the ones behind it
                counter!(RELAY_PUBLISH_ATTEMPTS, "relay" => KIND, "outcome" => "error")
                    .increment(1);
                error!(
                    partition = message.partition.unwrap_or(-1),
                    msg = %message.describe(),
                    err = %err,
                    "[syncProducer] return"
                );
            }
        }
    }
    publisher
}
