use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::apply_tls;
use super::context::SupervisorContext;
use crate::client::{AsyncPublisher, PublishError, SyncPublisher};
use crate::config::{KafkaConfig, RelayConfig};
use crate::message::{DeliveryFailure, DeliveryReport, ProducerMessage};

/// How long to back off when librdkafka's own queue is full.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<SupervisorContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );
    apply_tls(&mut client_config, config);

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<SupervisorContext> =
        client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

fn headers(message: &ProducerMessage) -> Option<OwnedHeaders> {
    if message.headers.is_empty() {
        return None;
    }
    let headers = message
        .headers
        .iter()
        .fold(OwnedHeaders::new(), |headers, (key, value)| {
            headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_slice()),
            })
        });
    Some(headers)
}

fn record(message: &ProducerMessage) -> FutureRecord<'_, [u8], [u8]> {
    FutureRecord {
        topic: &message.topic,
        partition: message.partition,
        payload: message.payload.as_deref(),
        key: message.key.as_deref(),
        timestamp: None,
        headers: headers(message),
    }
}

async fn flush(
    producer: FutureProducer<SupervisorContext>,
    timeout: Duration,
) -> Result<(), PublishError> {
    // flush blocks on librdkafka, keep it off the runtime workers
    tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
        .await
        .map_err(|e| PublishError::Other(e.to_string()))?
        .map_err(PublishError::Flush)
}

/// Request/response publisher: each send waits for the broker ack.
pub struct KafkaSyncPublisher {
    producer: FutureProducer<SupervisorContext>,
    send_timeout: Duration,
    flush_timeout: Duration,
    default_buffer: usize,
}

impl KafkaSyncPublisher {
    pub fn new(
        producer: FutureProducer<SupervisorContext>,
        kafka: &KafkaConfig,
        relay: &RelayConfig,
    ) -> Self {
        Self {
            producer,
            send_timeout: relay.relay_send_timeout_ms.0,
            flush_timeout: relay.relay_flush_timeout_ms.0,
            default_buffer: kafka.kafka_channel_buffer_size,
        }
    }
}

#[async_trait]
impl SyncPublisher for KafkaSyncPublisher {
    fn default_buffer_size(&self) -> Option<usize> {
        Some(self.default_buffer)
    }

    async fn send_message(&self, message: &ProducerMessage) -> Result<(i32, i64), PublishError> {
        match self
            .producer
            .send(record(message), Timeout::After(self.send_timeout))
            .await
        {
            Ok((partition, offset)) => Ok((partition, offset)),
            Err((err, _)) => Err(PublishError::Kafka(err)),
        }
    }

    async fn close(self) -> Result<(), PublishError> {
        flush(self.producer, self.flush_timeout).await
    }
}

/// Pipelined publisher: messages go into librdkafka's queue and delivery
/// outcomes are reported on the streams it was built to populate.
pub struct KafkaAsyncPublisher {
    producer: FutureProducer<SupervisorContext>,
    deliveries: TaskTracker,
    successes_tx: Option<mpsc::UnboundedSender<DeliveryReport>>,
    successes_rx: Option<mpsc::UnboundedReceiver<DeliveryReport>>,
    errors_tx: Option<mpsc::UnboundedSender<DeliveryFailure>>,
    errors_rx: Option<mpsc::UnboundedReceiver<DeliveryFailure>>,
    flush_timeout: Duration,
    default_buffer: usize,
}

impl KafkaAsyncPublisher {
    /// Populates the success and error streams according to the
    /// `RELAY_RETURN_*` flags, matching what the relay will drain.
    pub fn new(
        producer: FutureProducer<SupervisorContext>,
        kafka: &KafkaConfig,
        relay: &RelayConfig,
    ) -> Self {
        let (successes_tx, successes_rx) = if relay.relay_return_successes {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (errors_tx, errors_rx) = if relay.relay_return_errors {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        Self {
            producer,
            deliveries: TaskTracker::new(),
            successes_tx,
            successes_rx,
            errors_tx,
            errors_rx,
            flush_timeout: relay.relay_flush_timeout_ms.0,
            default_buffer: kafka.kafka_channel_buffer_size,
        }
    }
}

#[async_trait]
impl AsyncPublisher for KafkaAsyncPublisher {
    fn default_buffer_size(&self) -> Option<usize> {
        Some(self.default_buffer)
    }

    async fn input(&self, message: ProducerMessage) {
        let delivery = loop {
            let attempt = self
                .producer
                .send_result(record(&message))
                .map_err(|(err, _)| err);
            match attempt {
                Ok(delivery) => break Ok(delivery),
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                    warn!("[asyncProducer] librdkafka queue full, backing off");
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(err) => break Err(PublishError::Kafka(err)),
            }
        };

        let successes = self.successes_tx.clone();
        let errors = self.errors_tx.clone();
        let report_failure = move |message: ProducerMessage, error: PublishError| {
            if let Some(errors) = errors {
                drop(errors.send(DeliveryFailure { message, error }));
            }
        };

        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(error) => {
                report_failure(message, error);
                return;
            }
        };

        self.deliveries.spawn(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => {
                    if let Some(successes) = successes {
                        drop(successes.send(DeliveryReport {
                            topic: message.topic,
                            partition,
                            offset,
                        }));
                    }
                }
                Ok(Err((err, _))) => report_failure(message, PublishError::Kafka(err)),
                Err(_) => report_failure(message, PublishError::Canceled),
            }
        });
    }

    fn successes(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>> {
        self.successes_rx.take()
    }

    fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryFailure>> {
        self.errors_rx.take()
    }

    /// Flushes librdkafka, waits for every outstanding delivery to be
    /// reported, then ends both streams.
    async fn close(self) -> Result<(), PublishError> {
        let Self {
            producer,
            deliveries,
            successes_tx,
            errors_tx,
            flush_timeout,
            ..
        } = self;
        let flushed = flush(producer, flush_timeout).await;
        deliveries.close();
        deliveries.wait().await;
        drop(successes_tx);
        drop(errors_tx);
        flushed
    }
}
