use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use metrics::counter;
use rdkafka::error::RDKafkaErrorCode;
use tracing::{error, warn};

use crate::client::ConsumeError;
use crate::metrics_consts::{CONSUMER_GROUP_ERRORS, CONSUMER_GROUP_RECREATE};

/// Error text that marks a broken connection when no structured code is
/// available. Matched case-insensitively.
const TRANSIENT_PHRASES: [&str; 4] = [
    "connection reset by peer",
    "timeout",
    "timed out",
    "network is unreachable",
];

/// What the error drain should do after an error was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The session is unusable, its owner has to build a new one
    Recreate,
    /// Logged, keep draining
    Continue,
}

/// Whether an error means the session lost its connection to the cluster.
pub fn is_transient(err: &ConsumeError) -> bool {
    if let Some(code) = err.kafka_code() {
        if matches!(
            code,
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::Resolve
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NetworkException
        ) {
            return true;
        }
    }

    let text = err.to_string().to_lowercase();
    TRANSIENT_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// Sorts errors read from a session's error stream into "recreate the
/// session" and "log and carry on". The first transient error fires
/// `on_recreate`; later ones only repeat the verdict.
pub struct ErrorClassifier {
    on_recreate: Box<dyn Fn() + Send + Sync>,
    needs_recreation: AtomicBool,
    observed: AtomicU64,
}

impl ErrorClassifier {
    pub fn new(on_recreate: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_recreate: Box::new(on_recreate),
            needs_recreation: AtomicBool::new(false),
            observed: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, err: &ConsumeError) -> Disposition {
        self.observed.fetch_add(1, Ordering::Relaxed);

        if !is_transient(err) {
            counter!(CONSUMER_GROUP_ERRORS, "disposition" => "continue").increment(1);
            error!(err = %err, "[consumerGroup] error");
            return Disposition::Continue;
        }

        counter!(CONSUMER_GROUP_ERRORS, "disposition" => "recreate").increment(1);
        if !self.needs_recreation.swap(true, Ordering::SeqCst) {
            counter!(CONSUMER_GROUP_RECREATE).increment(1);
            warn!(err = %err, "[consumerGroup] connection lost, session needs to be recreated");
            (self.on_recreate)();
        }
        Disposition::Recreate
    }

    pub fn needs_recreation(&self) -> bool {
        self.needs_recreation.load(Ordering::SeqCst)
    }

    /// Number of errors seen so far, of either kind.
    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rdkafka::error::KafkaError;
    use test_case::test_case;

    use super::*;

    fn other(text: &str) -> ConsumeError {
        ConsumeError::Other(text.to_string())
    }

    fn counting() -> (ErrorClassifier, Arc<AtomicU64>) {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let classifier = ErrorClassifier::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (classifier, calls)
    }

    #[test_case("read tcp 10.0.0.1:9092: connection reset by peer" => true ; "connection reset")]
    #[test_case("kafka: i/o timeout" => true ; "timeout")]
    #[test_case("Request Timed Out" => true ; "timed out any case")]
    #[test_case("dial tcp: connect: network is unreachable" => true ; "unreachable")]
    #[test_case("kafka: insufficient data to decode packet" => false ; "decode error")]
    #[test_case("" => false ; "empty")]
    fn text_classification(text: &str) -> bool {
        is_transient(&other(text))
    }

    #[test_case(RDKafkaErrorCode::AllBrokersDown => true ; "all brokers down")]
    #[test_case(RDKafkaErrorCode::BrokerTransportFailure => true ; "transport failure")]
    #[test_case(RDKafkaErrorCode::Resolve => true ; "resolve")]
    #[test_case(RDKafkaErrorCode::NetworkException => true ; "network exception")]
    #[test_case(RDKafkaErrorCode::UnknownTopicOrPartition => false ; "unknown topic")]
    #[test_case(RDKafkaErrorCode::GroupAuthorizationFailed => false ; "authorization")]
    fn code_classification(code: RDKafkaErrorCode) -> bool {
        is_transient(&ConsumeError::Kafka(KafkaError::MessageConsumption(code)))
    }

    #[test]
    fn closed_group_is_not_transient() {
        assert!(!is_transient(&ConsumeError::ClosedGroup));
    }

    #[test]
    fn timeout_cancels_exactly_once() {
        let (classifier, calls) = counting();

        assert_eq!(classifier.observe(&other("i/o timeout")), Disposition::Recreate);
        assert_eq!(
            classifier.observe(&other("another timeout")),
            Disposition::Recreate
        );
        assert_eq!(
            classifier.observe(&ConsumeError::Kafka(KafkaError::MessageConsumption(
                RDKafkaErrorCode::AllBrokersDown
            ))),
            Disposition::Recreate
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(classifier.needs_recreation());
        assert_eq!(classifier.observed(), 3);
    }

    #[test]
    fn other_errors_are_only_logged() {
        let (classifier, calls) = counting();

        assert_eq!(
            classifier.observe(&other("kafka: offset out of range")),
            Disposition::Continue
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!classifier.needs_recreation());
        assert_eq!(classifier.observed(), 1);
    }
}
