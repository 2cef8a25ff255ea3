//! Supervision layer for Kafka clients.
//!
//! Bounded relays in front of the producers, a consumer-group loop that
//! survives rebalances and reports when its session has to be rebuilt,
//! and the close handshake both consumer kinds share. The broker client
//! itself sits behind the traits in [`client`]; [`kafka`] implements them
//! with rdkafka.
//!
//! ## Error logging
//!
//! Log errors as structured fields (`err = %err`) and keep the relay or
//! loop running unless the error is one of the terminal conditions
//! documented on [`ConsumerGroup::start`].

pub mod client;
pub mod config;
pub mod consumer;
pub mod kafka;
pub mod message;
pub mod metrics_consts;
pub mod mirror;
pub mod producer;
pub mod server;
pub mod shutdown;
pub mod test_utils;

pub use client::{
    AsyncPublisher, ConsumeError, GroupSession, MessageHandler, OffsetMarker, PublishError,
    Subscription, SyncPublisher,
};
pub use consumer::{ConsumerGroup, Disposition, ErrorClassifier, GroupError, StreamingConsumer};
pub use message::{
    ConsumedMessage, DeliveryFailure, DeliveryReport, Generation, Notification, ProducerMessage,
    TopicPartition,
};
pub use producer::async_producer::AsyncProducer;
pub use producer::sync_producer::SyncProducer;
pub use producer::{effective_buffer_size, RelayError, MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
pub use shutdown::{BindError, CloseOutcome, SessionState, ShutdownCoordinator, WorkerGuard};
