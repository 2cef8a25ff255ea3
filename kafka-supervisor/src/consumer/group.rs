use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthHandle};
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classifier::{Disposition, ErrorClassifier};
use crate::client::{ConsumeError, GroupSession, MessageHandler};
use crate::metrics_consts::{CONSUMER_GROUP_FAILURES, CONSUMER_GROUP_GENERATIONS};
use crate::shutdown::{BindError, CloseOutcome, ShutdownCoordinator, SessionState};

/// How long `start` waits before returning when called without a handler,
/// so a caller retrying a failed construction does not spin.
pub const MISSING_HANDLER_BACKOFF: Duration = Duration::from_secs(1);

/// Terminal result of a [`ConsumerGroup::start`] call that did not end
/// with a plain cancellation.
#[derive(Error, Debug)]
pub enum GroupError {
    /// The session lost its connection, build a new group
    #[error("consumer group session needs to be recreated")]
    NeedsRecreation,
    #[error(transparent)]
    SessionClosed(ConsumeError),
    #[error("failed to close consumer group session: {0}")]
    Close(ConsumeError),
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Keeps a group session consuming across rebalances until it is
/// cancelled, closed, or loses its connection.
///
/// One instance owns one session. After a [`GroupError::NeedsRecreation`]
/// the owner builds a new instance; the group never reconnects by itself.
pub struct ConsumerGroup<S: GroupSession> {
    session: S,
    group_id: String,
    topics: Vec<String>,
    shutdown: ShutdownCoordinator,
    failures: AtomicU64,
    liveness: Option<HealthHandle>,
    // Set once the session has been closed, by whichever side got there first
    released: AtomicBool,
}

impl<S: GroupSession> ConsumerGroup<S> {
    pub fn new(session: S, group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            session,
            group_id: group_id.into(),
            topics,
            shutdown: ShutdownCoordinator::new(),
            failures: AtomicU64::new(0),
            liveness: None,
            released: AtomicBool::new(false),
        }
    }

    /// Reports `Unhealthy` on forced recreation and `Stopped` on close.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Consume calls that returned an error so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SessionState {
        self.shutdown.state()
    }

    /// Runs the consume loop until `parent` is cancelled, [`close`] is
    /// called, the session reports it was closed, or an error on the
    /// session's error stream forces a recreation. The session is closed
    /// before this returns.
    ///
    /// A clean return from a consume call is a rebalance and starts the
    /// next generation. Any other error is counted and retried.
    ///
    /// [`close`]: ConsumerGroup::close
    pub async fn start(
        &self,
        parent: &CancellationToken,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<(), GroupError> {
        let Some(handler) = handler else {
            error!(group = %self.group_id, "[consumerGroup] start without a handler");
            tokio::time::sleep(MISSING_HANDLER_BACKOFF).await;
            return Ok(());
        };

        let (ctx, guard) = self.shutdown.bind(parent)?;
        info!(group = %self.group_id, topics = ?self.topics, "[consumerGroup] start");

        let classifier = Arc::new(ErrorClassifier::new({
            let ctx = ctx.clone();
            move || ctx.cancel()
        }));
        let drain = self
            .session
            .errors()
            .map(|errors| tokio::spawn(drain_errors(errors, classifier.clone(), ctx.clone())));

        let mut handle_closed = None;
        loop {
            match self.session.consume(&ctx, &self.topics, &handler).await {
                Ok(()) => {
                    counter!(CONSUMER_GROUP_GENERATIONS).increment(1);
                    warn!(group = %self.group_id, "[consumerGroup] consume return, rebalancing");
                }
                Err(ConsumeError::ClosedGroup) => {
                    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    counter!(CONSUMER_GROUP_FAILURES).increment(1);
                    error!(group = %self.group_id, failures, "[consumerGroup] session closed under us");
                    handle_closed = Some(ConsumeError::ClosedGroup);
                    break;
                }
                Err(err) => {
                    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    counter!(CONSUMER_GROUP_FAILURES).increment(1);
                    error!(group = %self.group_id, failures, err = %err, "[consumerGroup] consume");
                }
            }

            if ctx.is_cancelled() {
                debug!(group = %self.group_id, "[consumerGroup] cancelled");
                break;
            }
        }

        // The drain only exits on its own for a recreation, stop it otherwise
        ctx.cancel();
        if let Some(drain) = drain {
            if let Err(err) = drain.await {
                error!(group = %self.group_id, err = %err, "[consumerGroup] error drain failed");
            }
        }

        let closed = self.release().await;
        match &closed {
            Ok(()) => info!(group = %self.group_id, failures = self.failures(), "[consumerGroup] closed"),
            Err(err) => error!(group = %self.group_id, err = %err, "[consumerGroup] close"),
        }

        let needs_recreation = classifier.needs_recreation();
        if let Some(liveness) = &self.liveness {
            let status = if needs_recreation {
                ComponentStatus::Unhealthy
            } else {
                ComponentStatus::Stopped
            };
            liveness.report_status(status).await;
        }
        guard.finish();

        match (closed, handle_closed) {
            (Err(err), _) => Err(GroupError::Close(err)),
            (Ok(()), Some(err)) => Err(GroupError::SessionClosed(err)),
            (Ok(()), None) if needs_recreation => Err(GroupError::NeedsRecreation),
            (Ok(()), None) => Ok(()),
        }
    }

    /// Cancels a running loop and waits until it has closed the session.
    /// A group that never started closes its session directly, and so
    /// does one whose loop was dropped before it got to close it.
    pub async fn close(&self) -> Result<(), ConsumeError> {
        let outcome = self.shutdown.close().await;
        if self.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        match outcome {
            CloseOutcome::NeverStarted => {
                info!(group = %self.group_id, "[consumerGroup] close before start");
            }
            CloseOutcome::Stopped | CloseOutcome::AlreadyClosed => {
                warn!(group = %self.group_id, "[consumerGroup] loop dropped before closing the session");
            }
        }
        self.release().await
    }

    /// Closes the session the first time it is called, later calls are no-ops.
    async fn release(&self) -> Result<(), ConsumeError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.close().await
    }
}

async fn drain_errors(
    mut errors: mpsc::UnboundedReceiver<ConsumeError>,
    classifier: Arc<ErrorClassifier>,
    ctx: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            received = errors.recv() => match received {
                Some(err) => {
                    if classifier.observe(&err) == Disposition::Recreate {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CountingHandler, ScriptedSession, Step};

    fn group(session: ScriptedSession) -> Arc<ConsumerGroup<ScriptedSession>> {
        Arc::new(ConsumerGroup::new(
            session,
            "test-group",
            vec!["events".to_string()],
        ))
    }

    fn handler() -> Option<Arc<dyn MessageHandler>> {
        Some(Arc::new(CountingHandler::default()))
    }

    #[tokio::test]
    async fn rebalances_are_not_failures() {
        let session = ScriptedSession::new(vec![Step::Rebalance, Step::Rebalance]);
        let probe = session.probe();
        let group = group(session);
        let parent = CancellationToken::new();

        let running = tokio::spawn({
            let group = group.clone();
            let parent = parent.clone();
            async move { group.start(&parent, handler()).await }
        });

        probe.wait_for_consume_calls(3).await;
        assert_eq!(group.state(), SessionState::Running);
        parent.cancel();

        running.await.unwrap().unwrap();
        assert_eq!(group.failures(), 0);
        assert_eq!(probe.close_calls(), 1);
        assert_eq!(group.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn consume_error_is_counted_and_retried() {
        let session =
            ScriptedSession::new(vec![Step::Fail(ConsumeError::Other("kafka: boom".into()))]);
        let probe = session.probe();
        let group = group(session);
        let parent = CancellationToken::new();

        let running = tokio::spawn({
            let group = group.clone();
            let parent = parent.clone();
            async move { group.start(&parent, handler()).await }
        });

        // The loop came back for another generation after the error
        probe.wait_for_consume_calls(2).await;
        assert_eq!(group.failures(), 1);
        assert_eq!(group.state(), SessionState::Running);

        parent.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(group.failures(), 1);
    }

    #[tokio::test]
    async fn closed_handle_ends_the_loop() {
        let session = ScriptedSession::new(vec![
            Step::Rebalance,
            Step::Fail(ConsumeError::ClosedGroup),
            Step::Rebalance,
        ]);
        let probe = session.probe();
        let group = group(session);

        let result = group.start(&CancellationToken::new(), handler()).await;
        assert!(matches!(
            result,
            Err(GroupError::SessionClosed(ConsumeError::ClosedGroup))
        ));
        assert_eq!(probe.consume_calls(), 2);
        assert_eq!(group.failures(), 1);
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn transient_error_forces_recreation() {
        let session = ScriptedSession::new(vec![]);
        let probe = session.probe();
        let errors = session.error_sender();
        let group = group(session);
        let parent = CancellationToken::new();

        let running = tokio::spawn({
            let group = group.clone();
            let parent = parent.clone();
            async move { group.start(&parent, handler()).await }
        });
        probe.wait_for_consume_calls(1).await;

        errors
            .send(ConsumeError::Other("kafka: error decoding packet".into()))
            .unwrap();
        errors
            .send(ConsumeError::Other(
                "read tcp 10.0.0.1:9092: connection reset by peer".into(),
            ))
            .unwrap();

        let result = running.await.unwrap();
        assert!(matches!(result, Err(GroupError::NeedsRecreation)));
        // Only the group's own token was cancelled
        assert!(!parent.is_cancelled());
        assert_eq!(group.failures(), 0);
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn close_error_wins() {
        let session = ScriptedSession::new(vec![Step::Fail(ConsumeError::ClosedGroup)])
            .close_error(ConsumeError::Other("commit failed".into()));
        let group = group(session);

        let result = group.start(&CancellationToken::new(), handler()).await;
        assert!(matches!(result, Err(GroupError::Close(ConsumeError::Other(_)))));
    }

    #[tokio::test]
    async fn close_waits_for_the_loop() {
        let session = ScriptedSession::new(vec![Step::Rebalance]);
        let probe = session.probe();
        let group = group(session);

        let running = tokio::spawn({
            let group = group.clone();
            async move { group.start(&CancellationToken::new(), handler()).await }
        });
        probe.wait_for_consume_calls(2).await;

        group.close().await.unwrap();
        // Session was released before close returned
        assert_eq!(probe.close_calls(), 1);
        assert_eq!(group.state(), SessionState::Closed);
        running.await.unwrap().unwrap();

        // A closed group can't be restarted
        assert!(matches!(
            group.start(&CancellationToken::new(), handler()).await,
            Err(GroupError::Bind(BindError::Closed))
        ));
    }

    #[tokio::test]
    async fn close_releases_the_session_of_an_aborted_loop() {
        let session = ScriptedSession::new(vec![]);
        let probe = session.probe();
        let group = group(session);

        let running = tokio::spawn({
            let group = group.clone();
            async move { group.start(&CancellationToken::new(), handler()).await }
        });
        probe.wait_for_consume_calls(1).await;
        running.abort();
        assert!(running.await.unwrap_err().is_cancelled());
        assert_eq!(probe.close_calls(), 0);

        group.close().await.unwrap();
        assert_eq!(probe.close_calls(), 1);
        assert_eq!(group.state(), SessionState::Closed);

        group.close().await.unwrap();
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn close_before_start_returns_immediately() {
        let session = ScriptedSession::new(vec![]);
        let probe = session.probe();
        let group = group(session);

        tokio::time::timeout(Duration::from_millis(100), group.close())
            .await
            .expect("close must not wait for a loop that never started")
            .unwrap();
        assert_eq!(probe.consume_calls(), 0);
        assert_eq!(probe.close_calls(), 1);
        assert_eq!(group.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_handler_backs_off_without_starting() {
        let session = ScriptedSession::new(vec![Step::Rebalance]);
        let probe = session.probe();
        let group = group(session);

        let started = tokio::time::Instant::now();
        group.start(&CancellationToken::new(), None).await.unwrap();
        assert!(started.elapsed() >= MISSING_HANDLER_BACKOFF);

        assert_eq!(probe.consume_calls(), 0);
        assert_eq!(group.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let session = ScriptedSession::new(vec![]);
        let probe = session.probe();
        let group = group(session);
        let parent = CancellationToken::new();

        let running = tokio::spawn({
            let group = group.clone();
            let parent = parent.clone();
            async move { group.start(&parent, handler()).await }
        });
        probe.wait_for_consume_calls(1).await;

        assert!(matches!(
            group.start(&parent, handler()).await,
            Err(GroupError::Bind(BindError::AlreadyStarted))
        ));
        parent.cancel();
        running.await.unwrap().unwrap();
    }
}
