use health::HealthHandle;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::client::ConsumeError;
use crate::message::{Generation, Notification, TopicPartition};

/// Receiving ends of the events a [`SupervisorContext`] forwards. A
/// stream is `None` when the client was not asked to report it.
pub struct ContextStreams {
    pub errors: Option<mpsc::UnboundedReceiver<ConsumeError>>,
    pub notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    pub generation: watch::Receiver<Generation>,
}

/// Client context shared by every client this crate builds.
///
/// Liveness is reported from the statistics callback, so a client whose
/// main loop stalls goes stale in the health registry. Client errors and
/// rebalances are forwarded to the streams the supervision loops drain.
pub struct SupervisorContext {
    liveness: HealthHandle,
    errors: Option<mpsc::UnboundedSender<ConsumeError>>,
    notifications: Option<mpsc::UnboundedSender<Notification>>,
    generation: watch::Sender<Generation>,
}

impl SupervisorContext {
    pub fn new(
        liveness: HealthHandle,
        return_errors: bool,
        return_notifications: bool,
    ) -> (Self, ContextStreams) {
        let (errors, errors_rx) = if return_errors {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (notifications, notifications_rx) = if return_notifications {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (generation, generation_rx) = watch::channel(Generation::default());

        let context = Self {
            liveness,
            errors,
            notifications,
            generation,
        };
        let streams = ContextStreams {
            errors: errors_rx,
            notifications: notifications_rx,
            generation: generation_rx,
        };
        (context, streams)
    }

    fn forward_error(&self, err: ConsumeError) {
        match &self.errors {
            Some(errors) => {
                if let Err(unsent) = errors.send(err) {
                    error!(err = %unsent.0, "kafka client error, stream closed");
                }
            }
            None => error!(err = %err, "kafka client error"),
        }
    }

    fn notify(&self, notification: Notification) {
        if let Some(notifications) = &self.notifications {
            // A dropped receiver only means nobody is listening anymore
            drop(notifications.send(notification));
        }
    }

    /// Ends the current generation and starts the next one with `assignment`.
    fn next_generation(&self, assignment: Vec<TopicPartition>) {
        self.generation.send_modify(|generation| {
            generation.id += 1;
            generation.assignment = assignment;
        });
    }
}

impl From<HealthHandle> for SupervisorContext {
    /// Context for producers: liveness only, nothing is forwarded.
    fn from(liveness: HealthHandle) -> Self {
        Self::new(liveness, false, false).0
    }
}

pub(crate) fn partitions(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|element| TopicPartition {
            topic: element.topic().to_owned(),
            partition: element.partition(),
        })
        .collect()
}

impl ClientContext for SupervisorContext {
    fn stats(&self, _: Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy_blocking();
    }

    fn error(&self, error: KafkaError, reason: &str) {
        self.forward_error(ConsumeError::Client {
            error,
            reason: reason.to_owned(),
        });
    }
}

impl ConsumerContext for SupervisorContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(list) => {
                let revoked = partitions(list);
                info!(partitions = revoked.len(), "partitions revoked");
                self.next_generation(Vec::new());
                self.notify(Notification::Revoked(revoked));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(err) => self.forward_error(ConsumeError::Kafka(err.clone())),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(list) = rebalance {
            let assigned = partitions(list);
            info!(partitions = assigned.len(), "partitions assigned");
            self.next_generation(assigned.clone());
            self.notify(Notification::Assigned(assigned));
        }
    }
}
