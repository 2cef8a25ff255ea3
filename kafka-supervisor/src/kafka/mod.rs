//! rdkafka-backed implementations of the client seams.

use rdkafka::ClientConfig;

use crate::config::KafkaConfig;

pub mod consumer;
pub mod context;
pub mod producer;

pub use consumer::{create_kafka_consumer, KafkaGroupSession, KafkaSubscription};
pub use context::{ContextStreams, SupervisorContext};
pub use producer::{create_kafka_producer, KafkaAsyncPublisher, KafkaSyncPublisher};

fn apply_tls(client_config: &mut ClientConfig, config: &KafkaConfig) {
    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
}
