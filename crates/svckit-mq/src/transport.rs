//! The seam between svckit and a broker client.
//!
//! A transport only knows about topic strings, byte payloads, string headers
//! and an ack/nack handle. [`crate::AmqpTransport`] is the `lapin` backed
//! implementation; tests plug in fakes.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_lite::Stream;
use svckit_core::Error;

/// Message headers. Carries trace context between services.
pub type Headers = BTreeMap<String, String>;

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, Error>> + Send>>;

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), Error>;

    /// Negative acknowledgment. With `requeue == false` the broker drops the
    /// message or routes it to the queue's dead-letter exchange.
    async fn nack(&self, requeue: bool) -> Result<(), Error>;
}

/// One inbound message plus its acknowledgment handle.
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `payload` under `topic`. Returns once the broker has accepted
    /// the message.
    async fn send(&self, topic: &str, payload: Vec<u8>, headers: Headers) -> Result<(), Error>;

    /// Subscribes `queue`, bound to every topic in `topics`.
    async fn subscribe(&self, queue: &str, topics: &[String]) -> Result<DeliveryStream, Error>;

    /// Releases the underlying connection. Calls after the first are no-ops.
    async fn close(&self) -> Result<(), Error>;
}
