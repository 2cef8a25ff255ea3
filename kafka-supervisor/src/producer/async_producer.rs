use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{effective_buffer_size, Intake, RelayError};
use crate::client::AsyncPublisher;
use crate::config::RelayConfig;
use crate::message::{DeliveryFailure, DeliveryReport, ProducerMessage};
use crate::metrics_consts::{RELAY_DELIVERY_REPORTS, RELAY_PUBLISH_ATTEMPTS};

const KIND: &str = "async";

/// Fire-and-forget relay: the worker hands messages to the client's own
/// pipeline and delivery outcomes come back on the client's event streams.
///
/// A stream is only drained when the relay config asks for it, and the
/// publisher is expected to be built from the same flags. Draining a
/// stream the client never fills would hold `close` open, leaving a
/// filled one undrained would grow without bound.
pub struct AsyncProducer<P: AsyncPublisher> {
    intake: Intake,
    worker: JoinHandle<P>,
    drains: Vec<JoinHandle<()>>,
}

impl<P: AsyncPublisher> AsyncProducer<P> {
    /// Starts the relay worker and the configured drains, must be called
    /// from within a tokio runtime.
    pub fn new(mut publisher: P, config: &RelayConfig) -> Self {
        let buffer_size =
            effective_buffer_size(config.relay_buffer_size, publisher.default_buffer_size());
        let (intake, messages) = Intake::new(KIND, buffer_size);

        let mut drains = Vec::new();
        if config.relay_return_successes {
            match publisher.successes() {
                Some(successes) => drains.push(tokio::spawn(drain_successes(successes))),
                None => warn!("[asyncProducer] successes requested but not reported by the client"),
            }
        }
        if config.relay_return_errors {
            match publisher.errors() {
                Some(errors) => drains.push(tokio::spawn(drain_errors(errors))),
                None => warn!("[asyncProducer] errors requested but not reported by the client"),
            }
        }

        let worker = tokio::spawn(relay_loop(publisher, messages));
        debug!(buffer_size, drains = drains.len(), "[asyncProducer] created");
        Self {
            intake,
            worker,
            drains,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.intake.buffer_size()
    }

    /// Queues a message, waiting while the queue is full. `None` is a no-op.
    pub async fn send(&self, message: impl Into<Option<ProducerMessage>>) -> Result<(), RelayError> {
        self.intake.send(message.into()).await
    }

    pub fn try_send(&self, message: impl Into<Option<ProducerMessage>>) -> Result<(), RelayError> {
        self.intake.try_send(message.into())
    }

    /// Stops intake and waits for the worker to hand every queued message
    /// to the client, then closes the client and waits for the drains to
    /// observe the end of their streams.
    pub async fn close(self) -> Result<(), RelayError> {
        let Self {
            intake,
            worker,
            drains,
        } = self;
        let buffer_size = intake.buffer_size();
        drop(intake);
        let publisher = worker.await?;
        info!(buffer_size, "[asyncProducer] close");
        let closed = publisher.close().await;
        for drain in drains {
            drain.await?;
        }
        closed?;
        Ok(())
    }
}

async fn relay_loop<P: AsyncPublisher>(
    publisher: P,
    mut messages: mpsc::Receiver<ProducerMessage>,
) -> P {
    while let Some(message) = messages.recv().await {
        publisher.input(message).await;
        counter!(RELAY_PUBLISH_ATTEMPTS, "relay" => KIND, "outcome" => "queued").increment(1);
    }
    publisher
}

async fn drain_successes(mut successes: mpsc::UnboundedReceiver<DeliveryReport>) {
    while let Some(report) = successes.recv().await {
        counter!(RELAY_DELIVERY_REPORTS, "outcome" => "success").increment(1);
        debug!(
            topic = %report.topic,
            partition = report.partition,
            offset = report.offset,
            "[asyncProducer] return, successes"
        );
    }
}

async fn drain_errors(mut errors: mpsc::UnboundedReceiver<DeliveryFailure>) {
    while let Some(failure) = errors.recv().await {
        counter!(RELAY_DELIVERY_REPORTS, "outcome" => "error").increment(1);
        error!(
            msg = %failure.message.describe(),
            err = %failure.error,
            "[asyncProducer] return, errors"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingAsyncPublisher;

    fn config(successes: bool, errors: bool) -> RelayConfig {
        RelayConfig {
            relay_buffer_size: 8,
            relay_return_successes: successes,
            relay_return_errors: errors,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn drains_only_what_was_requested() {
        let publisher = RecordingAsyncPublisher::new(true, true);
        let probe = publisher.probe();
        let producer = AsyncProducer::new(publisher, &config(false, true));

        assert!(!probe.successes_taken());
        assert!(probe.errors_taken());
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_waits_for_delivery_drains() {
        let publisher = RecordingAsyncPublisher::new(true, true)
            .failing_on(|m| m.payload.as_deref() == Some(&b"bad"[..]));
        let probe = publisher.probe();
        let producer = AsyncProducer::new(publisher, &config(true, true));

        producer
            .send(ProducerMessage::new("events").with_payload("good"))
            .await
            .unwrap();
        producer
            .send(ProducerMessage::new("events").with_payload("bad"))
            .await
            .unwrap();
        producer
            .send(ProducerMessage::new("events").with_payload("good again"))
            .await
            .unwrap();
        producer.close().await.unwrap();

        assert_eq!(probe.inputs().len(), 3);
        assert_eq!(probe.reported_successes(), 2);
        assert_eq!(probe.reported_failures(), 1);
        assert_eq!(probe.inputs_before_close(), Some(3));
    }

    #[tokio::test]
    async fn missing_stream_does_not_block_close() {
        // Client was not configured to report anything, relay asks anyway
        let publisher = RecordingAsyncPublisher::new(false, false);
        let probe = publisher.probe();
        let producer = AsyncProducer::new(publisher, &config(true, true));

        producer
            .send(ProducerMessage::new("events").with_payload("x"))
            .await
            .unwrap();
        producer.close().await.unwrap();
        assert_eq!(probe.inputs().len(), 1);
        assert!(probe.is_closed());
    }

    #[tokio::test]
    async fn payload_reaches_the_client_unchanged() {
        let publisher = RecordingAsyncPublisher::new(false, true);
        let probe = publisher.probe();
        let producer = AsyncProducer::new(publisher, &config(false, true));

        let payload: Vec<u8> = (0..=255u8).collect();
        let message = ProducerMessage::new("binary")
            .with_key(vec![0u8, 159, 146, 150])
            .with_payload(payload.clone())
            .with_header("trace", "abc");
        producer.send(message.clone()).await.unwrap();
        producer.close().await.unwrap();

        assert_eq!(probe.inputs(), vec![message]);
    }
}
