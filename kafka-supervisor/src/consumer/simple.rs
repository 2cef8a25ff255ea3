use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::MISSING_HANDLER_BACKOFF;
use crate::client::{ConsumeError, Subscription};
use crate::message::{ConsumedMessage, Notification};
use crate::metrics_consts::{STREAMING_CONSUMER_ERRORS, STREAMING_CONSUMER_PROCESSED};
use crate::shutdown::{BindError, ShutdownCoordinator, SessionState};

/// Message loop over a plain subscription: every message goes to a
/// callback and its offset is marked once the callback returns.
pub struct StreamingConsumer<S: Subscription> {
    subscription: S,
    group_id: String,
    topics: Vec<String>,
    shutdown: ShutdownCoordinator,
    processed: AtomicU64,
    // Shared with the drain tasks
    stream_errors: Arc<AtomicU64>,
    notifications: Arc<AtomicU64>,
    released: AtomicBool,
}

impl<S: Subscription> StreamingConsumer<S> {
    pub fn new(subscription: S, group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            subscription,
            group_id: group_id.into(),
            topics,
            shutdown: ShutdownCoordinator::new(),
            processed: AtomicU64::new(0),
            stream_errors: Arc::new(AtomicU64::new(0)),
            notifications: Arc::new(AtomicU64::new(0)),
            released: AtomicBool::new(false),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Errors seen on the subscription's error stream.
    pub fn stream_errors(&self) -> u64 {
        self.stream_errors.load(Ordering::Relaxed)
    }

    /// Rebalance notifications seen on the subscription's notification stream.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        self.shutdown.state()
    }

    /// Feeds messages to `handler` until `parent` is cancelled, `close` is
    /// called, or the subscription ends. Without a handler this backs off
    /// and returns without consuming.
    pub async fn start<F>(
        &self,
        parent: &CancellationToken,
        handler: Option<F>,
    ) -> Result<(), BindError>
    where
        F: Fn(&ConsumedMessage) + Send + Sync,
    {
        let Some(handler) = handler else {
            error!(group = %self.group_id, "[consumer] start without a handler");
            tokio::time::sleep(MISSING_HANDLER_BACKOFF).await;
            return Ok(());
        };

        let (ctx, guard) = self.shutdown.bind(parent)?;
        info!(group = %self.group_id, topics = ?self.topics, "[consumer] start");

        let mut drains: Vec<JoinHandle<()>> = Vec::new();
        if let Some(errors) = self.subscription.errors() {
            drains.push(tokio::spawn(drain_errors(
                errors,
                self.stream_errors.clone(),
                self.group_id.clone(),
                ctx.clone(),
            )));
        }
        if let Some(notifications) = self.subscription.notifications() {
            drains.push(tokio::spawn(drain_notifications(
                notifications,
                self.notifications.clone(),
                self.group_id.clone(),
                ctx.clone(),
            )));
        }

        loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => break,
                next = self.subscription.next_message() => next,
            };

            match next {
                Some(Ok(message)) => {
                    handler(&message);
                    if let Err(err) = self.subscription.mark_offset(&message) {
                        error!(
                            group = %self.group_id,
                            topic = %message.topic,
                            partition = message.partition,
                            offset = message.offset,
                            err = %err,
                            "[consumer] mark offset"
                        );
                    }
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    counter!(STREAMING_CONSUMER_PROCESSED).increment(1);
                }
                Some(Err(err)) => {
                    counter!(STREAMING_CONSUMER_ERRORS, "source" => "message").increment(1);
                    error!(group = %self.group_id, err = %err, "[consumer] consume");
                }
                None => {
                    warn!(group = %self.group_id, "[consumer] subscription ended");
                    break;
                }
            }
        }

        ctx.cancel();
        for drain in drains {
            if let Err(err) = drain.await {
                error!(group = %self.group_id, err = %err, "[consumer] drain failed");
            }
        }
        info!(group = %self.group_id, processed = self.processed(), "[consumer] stopped");
        guard.finish();
        Ok(())
    }

    /// Stops the loop, waiting until it no longer reads from the
    /// subscription, then closes the subscription. Only the first call
    /// closes it.
    pub async fn close(&self) -> Result<(), ConsumeError> {
        let outcome = self.shutdown.close().await;
        debug!(group = %self.group_id, ?outcome, "[consumer] close");
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.subscription.close().await
    }
}

async fn drain_errors(
    mut errors: mpsc::UnboundedReceiver<ConsumeError>,
    seen: Arc<AtomicU64>,
    group_id: String,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            received = errors.recv() => match received {
                Some(err) => {
                    seen.fetch_add(1, Ordering::Relaxed);
                    counter!(STREAMING_CONSUMER_ERRORS, "source" => "stream").increment(1);
                    error!(group = %group_id, err = %err, "[consumer] consume errors");
                }
                None => break,
            }
        }
    }
}

async fn drain_notifications(
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    seen: Arc<AtomicU64>,
    group_id: String,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            received = notifications.recv() => match received {
                Some(notification) => {
                    seen.fetch_add(1, Ordering::Relaxed);
                    info!(group = %group_id, ?notification, "[consumer] consume notifications");
                }
                None => break,
            }
        }
    }
}
