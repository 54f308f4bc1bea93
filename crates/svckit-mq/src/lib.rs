//! Message publishing and consumption on top of `RabbitMQ`.
//!
//! A [`BrokerConnection`] is opened once per process. Its transport is shared
//! by a [`Publisher`], which sends JSON or raw payloads under a bounded retry
//! policy, and a [`Dispatcher`], which consumes every registered queue on its
//! own task and routes each delivery to the handler registered for its topic.
//! Both optionally encrypt payloads with an [`svckit_core::EncryptionCodec`].

pub mod amqp;
pub mod connection;
pub mod dispatcher;
mod propagation;
pub mod publisher;
pub mod registry;
pub mod retry;
pub mod transport;

pub use amqp::AmqpTransport;
pub use connection::BrokerConnection;
pub use dispatcher::Dispatcher;
pub use publisher::Publisher;
pub use registry::{Handler, HandlerFn, Message, Registrations, handler_fn};
pub use transport::{Acknowledger, Delivery, DeliveryStream, Headers, Transport};

pub use tokio_util::sync::CancellationToken;
