use std::sync::Arc;

use serde::Serialize;
use svckit_core::{Error, EncryptionCodec, config::RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    propagation::inject_current_context,
    retry::{RetryFailure, retry},
    transport::{Headers, Transport},
};

/// Sends messages to topics with a bounded retry policy.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    codec: Option<Arc<EncryptionCodec>>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            codec: None,
        }
    }

    /// Encrypt every payload before it leaves the process.
    #[must_use]
    pub fn with_encryption(mut self, codec: Arc<EncryptionCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Serializes `message` as JSON and publishes it to `topic`.
    ///
    /// # Errors
    ///
    /// - `Error::Serialization` / `Error::Encryption` before anything is sent.
    /// - `Error::Cancelled` if `cancel` fires; no attempt starts afterwards.
    /// - `Error::Publish` wrapping the last failure once retries run out.
    #[instrument(skip(self, cancel, message, policy), fields(retries = policy.retries))]
    pub async fn publish<T>(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        message: &T,
        policy: &RetryPolicy,
    ) -> Result<(), Error>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes(cancel, topic, &payload, policy).await
    }

    /// Publishes an opaque payload to `topic`.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    #[instrument(skip(self, cancel, payload, policy), fields(retries = policy.retries))]
    pub async fn publish_bytes(
        &self,
        cancel: &CancellationToken,
        topic: &str,
        payload: &[u8],
        policy: &RetryPolicy,
    ) -> Result<(), Error> {
        if topic.trim().is_empty() {
            return Err(Error::Configuration("topic must not be empty".into()));
        }

        let payload = match &self.codec {
            Some(codec) => codec.encrypt(payload)?,
            None => payload.to_vec(),
        };

        let mut headers = Headers::new();
        inject_current_context(&mut headers);

        let result = retry(policy, cancel, "publish", |_| {
            self.transport
                .send(topic, payload.clone(), headers.clone())
        })
        .await;

        match result {
            Ok(()) => {
                info!(topic, bytes = payload.len(), "Message published");
                Ok(())
            }
            Err(RetryFailure {
                error: Error::Cancelled,
                attempts,
            }) => {
                warn!(topic, attempts, "Publish cancelled");
                Err(Error::Cancelled)
            }
            Err(RetryFailure { attempts, error }) => Err(Error::Publish {
                topic: topic.to_string(),
                attempts,
                source: Box::new(error),
            }),
        }
    }
}
