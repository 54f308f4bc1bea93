//! Queue → topic → handler registrations.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use svckit_core::Error;

use crate::transport::Headers;

/// A delivery as seen by a handler, payload already decrypted.
#[derive(Debug, Clone)]
pub struct Message {
    pub queue: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

impl Message {
    /// Decodes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the payload is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Processes messages for one (queue, topic) pair.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

/// Adapter returned by [`handler_fn`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        (self.0)(message).await
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn(f)
}

pub(crate) type Routes = HashMap<String, Arc<dyn Handler>>;

/// Which handler runs for each topic of each queue.
///
/// Built once at startup and handed to [`crate::Dispatcher::listen`], after
/// which it is only read.
#[derive(Default)]
pub struct Registrations {
    queues: BTreeMap<String, Routes>,
}

impl fmt::Debug for Registrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for queue in self.queues.keys() {
            map.entry(queue, &self.topics(queue));
        }
        map.finish()
    }
}

impl Registrations {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic` on `queue`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if a name is empty or the topic already
    /// has a handler on this queue.
    pub fn register(
        &mut self,
        queue: impl Into<String>,
        topic: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Result<&mut Self, Error> {
        self.register_arc(queue, topic, Arc::new(handler))
    }

    /// Like [`Registrations::register`] for a handler shared between
    /// several registrations.
    ///
    /// # Errors
    ///
    /// See [`Registrations::register`].
    pub fn register_arc(
        &mut self,
        queue: impl Into<String>,
        topic: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<&mut Self, Error> {
        let queue = queue.into();
        let topic = topic.into();

        if queue.trim().is_empty() {
            return Err(Error::Configuration("queue name must not be empty".into()));
        }
        if topic.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "topic name on queue '{queue}' must not be empty"
            )));
        }

        let routes = self.queues.entry(queue.clone()).or_default();
        if routes.contains_key(&topic) {
            return Err(Error::Configuration(format!(
                "topic '{topic}' already has a handler on queue '{queue}'"
            )));
        }
        routes.insert(topic, handler);
        Ok(self)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    /// Registered topics of `queue`, sorted.
    #[must_use]
    pub fn topics(&self, queue: &str) -> Vec<String> {
        let mut topics: Vec<String> = self
            .queues
            .get(queue)
            .map(|routes| routes.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub(crate) fn into_queues(self) -> impl Iterator<Item = (String, Routes)> {
        self.queues.into_iter()
    }
}
