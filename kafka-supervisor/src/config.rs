use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    // Relay queue size used when a relay is configured with a buffer size of 0
    #[envconfig(default = "256")]
    pub kafka_channel_buffer_size: usize,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RelayConfig {
    // 0 falls back to the client default, anything below 1 is raised to 1
    #[envconfig(default = "0")]
    pub relay_buffer_size: i64,

    // Only drain delivery streams the client was asked to populate
    #[envconfig(default = "false")]
    pub relay_return_successes: bool,

    #[envconfig(default = "true")]
    pub relay_return_errors: bool,

    #[envconfig(default = "10000")]
    pub relay_send_timeout_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub relay_flush_timeout_ms: EnvMsDuration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_buffer_size: 0,
            relay_return_successes: false,
            relay_return_errors: true,
            relay_send_timeout_ms: EnvMsDuration(Duration::from_secs(10)),
            relay_flush_timeout_ms: EnvMsDuration(Duration::from_secs(30)),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    // Comma separated, subscription order is preserved
    pub kafka_consumer_topics: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Offsets are only stored once a handler marks the message, then
    // committed on this interval
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    #[envconfig(default = "30000")]
    pub kafka_consumer_session_timeout_ms: u32,

    #[envconfig(default = "true")]
    pub kafka_consumer_return_errors: bool,

    #[envconfig(default = "true")]
    pub kafka_consumer_return_notifications: bool,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topics: &[&str]) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPICS").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPICS", consumer_topics.join(","));
        };
    }

    /// The subscribed topics, in configuration order, without blanks or duplicates.
    pub fn topics(&self) -> Vec<String> {
        parse_topics(&self.kafka_consumer_topics)
    }
}

pub fn parse_topics(raw: &str) -> Vec<String> {
    let mut topics: Vec<String> = Vec::new();
    for topic in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if !topics.iter().any(|known| known == topic) {
            topics.push(topic.to_owned());
        }
    }
    topics
}

/// Settings of the `kafka-mirror` service.
#[derive(Envconfig, Clone, Debug)]
pub struct MirrorConfig {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    pub mirror_target_topic: String,

    // Pause before building a new consumer group after a forced recreation
    #[envconfig(default = "1000")]
    pub mirror_recreate_backoff_ms: EnvMsDuration,

    #[envconfig(default = "30")]
    pub mirror_liveness_deadline_secs: u64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub relay: RelayConfig,
}

impl MirrorConfig {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_keep_order_and_drop_duplicates() {
        assert_eq!(
            parse_topics(" events, clicks,,events ,pageviews"),
            vec!["events", "clicks", "pageviews"]
        );
        assert!(parse_topics(" , ").is_empty());
    }

    #[test]
    fn ms_duration_parsing() {
        assert_eq!(
            "250".parse::<EnvMsDuration>(),
            Ok(EnvMsDuration(Duration::from_millis(250)))
        );
        assert_eq!(
            "soon".parse::<EnvMsDuration>(),
            Err(ParseEnvMsDurationError)
        );
    }

    #[test]
    fn mirror_config_from_env_map() {
        let env: std::collections::HashMap<String, String> = [
            ("MIRROR_TARGET_TOPIC", "events-mirror"),
            ("KAFKA_CONSUMER_GROUP", "mirror"),
            ("KAFKA_CONSUMER_TOPICS", "events,clicks"),
            ("RELAY_BUFFER_SIZE", "64"),
            ("BIND_PORT", "8080"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = MirrorConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(config.mirror_target_topic, "events-mirror");
        assert_eq!(config.bind(), ":::8080");
        assert_eq!(config.consumer.topics(), vec!["events", "clicks"]);
        assert_eq!(config.relay.relay_buffer_size, 64);
        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
        assert_eq!(config.kafka.kafka_channel_buffer_size, 256);
        assert_eq!(
            config.mirror_recreate_backoff_ms,
            EnvMsDuration(Duration::from_secs(1))
        );
    }

    #[test]
    fn missing_target_topic_is_an_error() {
        let env = std::collections::HashMap::new();
        assert!(MirrorConfig::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn relay_defaults_match_env_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.relay_buffer_size, 0);
        assert!(!config.relay_return_successes);
        assert!(config.relay_return_errors);
        assert_eq!(config.relay_send_timeout_ms.0, Duration::from_secs(10));
    }
}
