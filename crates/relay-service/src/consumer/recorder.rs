use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use svckit_cache::CacheClient;
use svckit_mq::{Handler, Message};
use tracing::info;

use crate::repository::{MessageLog, ReceivedMessage};

#[must_use]
pub fn last_message_key(topic: &str) -> String {
    format!("last:{topic}")
}

/// Keeps consumed messages in the in-memory log and, when a cache is
/// configured, the latest message per topic in Redis.
pub struct Recorder {
    log: Arc<MessageLog>,
    cache: Option<Arc<CacheClient>>,
    cache_ttl: Duration,
}

impl Recorder {
    pub fn new(log: Arc<MessageLog>, cache: Option<Arc<CacheClient>>, cache_ttl: Duration) -> Self {
        Self {
            log,
            cache,
            cache_ttl,
        }
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        let received = ReceivedMessage::from_message(&message);

        if let Some(cache) = &self.cache {
            cache
                .set_json(
                    &last_message_key(&received.topic),
                    &received,
                    Some(self.cache_ttl),
                )
                .await?;
        }

        info!(
            id = %received.id,
            queue = %received.queue,
            topic = %received.topic,
            "Message received"
        );
        self.log.push(received);
        Ok(())
    }
}
