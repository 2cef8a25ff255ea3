//! Bounded relays between callers and a publish primitive.
//!
//! Both variants share the same shape: a fixed-capacity queue owned by
//! the relay, one worker task draining it in FIFO order, and a `close`
//! that stops intake, waits for the worker to drain what was queued and
//! only then releases the publish handle. Publish failures are logged
//! and counted, the worker keeps draining.

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinError;

use crate::client::PublishError;
use crate::message::ProducerMessage;
use crate::metrics_consts::{RELAY_BUFFER_SIZE, RELAY_MESSAGES_ENQUEUED};

pub mod async_producer;
pub mod sync_producer;

/// Smallest queue a relay will run with. A zero-capacity queue would
/// block every send.
pub const MIN_BUFFER_SIZE: usize = 1;

/// Largest queue a relay will run with, the most a tokio channel can hold.
pub const MAX_BUFFER_SIZE: usize = Semaphore::MAX_PERMITS;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay is closed")]
    Closed,
    #[error("relay queue is full")]
    Full,
    #[error("relay worker failed: {0}")]
    Worker(#[from] JoinError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Resolves the queue capacity for a relay.
///
/// `0` means "let the client decide" and uses `client_default`, anything
/// at or below [`MIN_BUFFER_SIZE`] (negative values included) is raised to
/// the floor and anything above [`MAX_BUFFER_SIZE`] is lowered to it. The
/// result is never 0.
pub fn effective_buffer_size(requested: i64, client_default: Option<usize>) -> usize {
    let size = match requested {
        0 => client_default.unwrap_or(MIN_BUFFER_SIZE),
        n => usize::try_from(n).unwrap_or(MIN_BUFFER_SIZE),
    };
    size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
}

/// Caller side of a relay queue. Dropping it is what closes the queue.
pub(crate) struct Intake {
    kind: &'static str,
    messages: mpsc::Sender<ProducerMessage>,
    buffer_size: usize,
}

impl Intake {
    pub(crate) fn new(
        kind: &'static str,
        buffer_size: usize,
    ) -> (Self, mpsc::Receiver<ProducerMessage>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        gauge!(RELAY_BUFFER_SIZE, "relay" => kind).set(buffer_size as f64);
        let intake = Self {
            kind,
            messages: tx,
            buffer_size,
        };
        (intake, rx)
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Waits for room in the queue. `None` is accepted and ignored.
    pub(crate) async fn send(&self, message: Option<ProducerMessage>) -> Result<(), RelayError> {
        let Some(message) = message else {
            return Ok(());
        };
        // Only fails once the worker is gone
        self.messages
            .send(message)
            .await
            .map_err(|_| RelayError::Closed)?;
        counter!(RELAY_MESSAGES_ENQUEUED, "relay" => self.kind).increment(1);
        Ok(())
    }

    pub(crate) fn try_send(&self, message: Option<ProducerMessage>) -> Result<(), RelayError> {
        let Some(message) = message else {
            return Ok(());
        };
        match self.messages.try_send(message) {
            Ok(()) => {
                counter!(RELAY_MESSAGES_ENQUEUED, "relay" => self.kind).increment(1);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(RelayError::Full),
            Err(TrySendError::Closed(_)) => Err(RelayError::Closed),
        }
    }
}
