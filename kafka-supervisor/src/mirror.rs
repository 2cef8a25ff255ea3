use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::client::{AsyncPublisher, MessageHandler, OffsetMarker};
use crate::message::{ConsumedMessage, Generation, ProducerMessage};
use crate::producer::async_producer::AsyncProducer;

/// Republishes every consumed message to one target topic, keeping key
/// and payload. A message is marked once the relay has accepted it.
pub struct MirrorHandler<P: AsyncPublisher> {
    relay: Arc<AsyncProducer<P>>,
    target_topic: String,
}

impl<P: AsyncPublisher> MirrorHandler<P> {
    pub fn new(relay: Arc<AsyncProducer<P>>, target_topic: impl Into<String>) -> Self {
        Self {
            relay,
            target_topic: target_topic.into(),
        }
    }

    fn mirrored(&self, message: &ConsumedMessage) -> ProducerMessage {
        ProducerMessage {
            topic: self.target_topic.clone(),
            key: message.key.clone(),
            payload: message.payload.clone(),
            partition: None,
            headers: Vec::new(),
        }
    }
}

#[async_trait]
impl<P: AsyncPublisher> MessageHandler for MirrorHandler<P> {
    async fn setup(&self, generation: &Generation) -> anyhow::Result<()> {
        info!(
            generation = generation.id,
            partitions = generation.assignment.len(),
            target = %self.target_topic,
            "mirroring generation"
        );
        Ok(())
    }

    async fn handle(
        &self,
        message: &ConsumedMessage,
        marker: &dyn OffsetMarker,
    ) -> anyhow::Result<()> {
        self.relay
            .send(self.mirrored(message))
            .await
            .with_context(|| {
                format!(
                    "failed to relay {}/{}@{}",
                    message.topic, message.partition, message.offset
                )
            })?;
        marker.mark_message(message);
        Ok(())
    }
}
