//! At-most-once, fire-and-forget pub/sub (spec §4.2 "Pub/Sub"). Consumers
//! must tolerate drops and reordering unless the payload itself carries a
//! sequence number (log records do — see `engine-dispatcher`).

use fred::prelude::*;
use futures::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PubSubError {
    #[error("pub/sub backend unavailable: {0}")]
    Unavailable(String),
}

pub struct PubSub {
    client: Client,
}

impl PubSub {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), PubSubError> {
        self.client
            .publish(channel, payload)
            .await
            .map_err(|e| PubSubError::Unavailable(e.to_string()))
    }

    /// Subscribes to `channel`, returning a stream of raw payloads. Drops and
    /// reordering are possible; callers that need gap-detection rely on a
    /// sequence number carried in the payload itself.
    pub async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>, PubSubError> {
        self.client
            .subscribe(channel)
            .await
            .map_err(|e| PubSubError::Unavailable(e.to_string()))?;

        let target_channel = channel.to_string();
        let message_stream = self.client.message_rx();
        let stream = tokio_stream::wrappers::BroadcastStream::new(message_stream)
            .filter_map(move |result| {
                let target_channel = target_channel.clone();
                async move {
                    let message = result.ok()?;
                    if message.channel.as_ref() == target_channel {
                        message.value.as_bytes().map(|b| b.to_vec())
                    } else {
                        None
                    }
                }
            });

        Ok(Box::pin(stream))
    }
}
