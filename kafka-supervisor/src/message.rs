use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};

use crate::client::PublishError;

/// A record handed to a relay. Immutable once enqueued: the relay takes
/// ownership and forwards it to the publish primitive as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerMessage {
    pub topic: String,
    #[serde(serialize_with = "lossy_utf8")]
    pub key: Option<Vec<u8>>,
    #[serde(serialize_with = "lossy_utf8")]
    pub payload: Option<Vec<u8>>,
    /// Explicit partition, `None` lets the client partitioner decide
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: None,
            partition: None,
            headers: Vec::new(),
        }
    }

    /// Builds a message whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic).with_payload(serde_json::to_vec(value)?))
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// JSON rendering used in error logs.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

fn lossy_utf8<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    match bytes {
        Some(bytes) => serializer.serialize_some(&String::from_utf8_lossy(bytes)),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Milliseconds since the epoch, when the broker provided one
    pub timestamp: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Received empty payload")]
    Empty,
}

impl ConsumedMessage {
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let Some(payload) = self.payload.as_deref() else {
            return Err(PayloadError::Empty);
        };
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: self.topic.clone(),
            partition: self.partition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

/// Broker acknowledgement for a message sent through the fire-and-forget relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub message: ProducerMessage,
    pub error: PublishError,
}

/// Partition ownership changes reported by a plain subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
}

/// One consumer-group generation: the assignment held between two rebalances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub id: u64,
    pub assignment: Vec<TopicPartition>,
}
