//! Supervision loops on the consuming side: [`ConsumerGroup`] keeps a
//! group session alive across rebalances, [`StreamingConsumer`] drives a
//! plain subscription. Both stop through a [`crate::ShutdownCoordinator`].

pub mod classifier;
pub mod group;
pub mod simple;

pub use classifier::{is_transient, Disposition, ErrorClassifier};
pub use group::{ConsumerGroup, GroupError, MISSING_HANDLER_BACKOFF};
pub use simple::StreamingConsumer;
