//! `lapin` backed [`Transport`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_lite::stream::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection,
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
};
use svckit_core::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::transport::{Acknowledger, Delivery, DeliveryStream, Headers, Transport};

const CONTENT_TYPE: &str = "application/octet-stream";
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

fn transport_error(e: lapin::Error) -> Error {
    Error::Transport(e.to_string())
}

fn field_table_from_headers(headers: Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (k, v) in headers {
        table.insert(k.into(), AMQPValue::LongString(LongString::from(v)));
    }
    table
}

fn headers_from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(k, v)| {
            if let AMQPValue::LongString(s) = v {
                Some((k.to_string(), s.to_string()))
            } else {
                None
            }
        })
        .collect()
}

/// Lets a teardown run at most once, even when called concurrently.
#[derive(Debug, Default)]
struct CloseOnce(AtomicBool);

impl CloseOnce {
    fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Runs `close` on the first call and returns `Ok(true)`. Later calls
    /// return `Ok(false)` without running anything, even if the first close
    /// failed.
    async fn run<F, Fut>(&self, close: F) -> Result<bool, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        if self.0.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        close().await?;
        Ok(true)
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), Error> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(transport_error)?;
        Ok(())
    }
}

/// Publishes to a topic exchange and consumes durable queues bound to it.
///
/// Publishing goes through one confirm-mode channel. Every subscription gets
/// its own channel so a slow queue never holds back another.
pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    exchange: String,
    prefetch: u16,
    dead_letter_exchange: Option<String>,
    closed: CloseOnce,
}

impl AmqpTransport {
    pub(crate) fn new(
        connection: Connection,
        channel: Channel,
        exchange: String,
        prefetch: u16,
        dead_letter_exchange: Option<String>,
    ) -> Self {
        Self {
            connection,
            channel,
            exchange,
            prefetch,
            dead_letter_exchange,
            closed: CloseOnce::default(),
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.is_closed() && self.connection.status().connected()
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        args
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    #[instrument(skip(self, payload, headers), fields(exchange = %self.exchange))]
    async fn send(&self, topic: &str, payload: Vec<u8>, headers: Headers) -> Result<(), Error> {
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT)
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_headers(field_table_from_headers(headers));

        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                topic,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(transport_error)?
            .await
            .map_err(transport_error)?;

        if confirmation.is_nack() {
            return Err(Error::Transport(format!(
                "broker rejected message for topic '{topic}'"
            )));
        }

        debug!(topic, bytes = payload.len(), "Message confirmed by broker");
        Ok(())
    }

    #[instrument(skip(self, topics), fields(exchange = %self.exchange))]
    async fn subscribe(&self, queue: &str, topics: &[String]) -> Result<DeliveryStream, Error> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(transport_error)?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                self.queue_arguments(),
            )
            .await
            .map_err(transport_error)?;

        for topic in topics {
            channel
                .queue_bind(
                    queue,
                    &self.exchange,
                    topic,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(transport_error)?;
        }

        let consumer = channel
            .basic_consume(
                queue,
                &format!("svckit-{queue}-{}", Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        info!(queue, ?topics, "Queue subscribed");

        // The stream owns the channel so it stays open as long as the
        // subscription is consumed.
        let stream = consumer.map(move |result| {
            let _channel = &channel;
            result.map_err(transport_error).map(|delivery| Delivery {
                topic: delivery.routing_key.to_string(),
                headers: delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(headers_from_field_table)
                    .unwrap_or_default(),
                payload: delivery.data,
                acker: Box::new(AmqpAcker(delivery.acker)),
            })
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), Error> {
        let closed_now = self
            .closed
            .run(|| async {
                self.connection
                    .close(REPLY_SUCCESS, "closing")
                    .await
                    .map_err(|e| Error::Connection(e.to_string()))
            })
            .await?;

        if closed_now {
            info!(exchange = %self.exchange, "RabbitMQ connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn close_runs_only_once() {
        let guard = CloseOnce::default();
        let calls = &AtomicUsize::new(0);
        let close = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        assert!(!guard.is_closed());
        assert!(guard.run(close).await.unwrap());
        assert!(!guard.run(close).await.unwrap());
        assert!(guard.is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_closes_run_the_teardown_once() {
        let guard = CloseOnce::default();
        let calls = &AtomicUsize::new(0);
        let close = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(())
        };

        let (first, second) = tokio::join!(guard.run(close), guard.run(close));

        assert_ne!(first.unwrap(), second.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_close_is_not_retried() {
        let guard = CloseOnce::default();

        let err = guard
            .run(|| async { Err(Error::Connection("channel already gone".into())) })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connection(_)));
        assert!(!guard.run(|| async { Ok(()) }).await.unwrap());
    }

    #[test]
    fn string_headers_survive_field_table_conversion() {
        let mut headers = Headers::new();
        headers.insert("traceparent".into(), "00-1-2-01".into());
        headers.insert("x-origin".into(), "relay".into());

        let table = field_table_from_headers(headers.clone());

        assert_eq!(headers_from_field_table(&table), headers);
    }

    #[test]
    fn non_string_header_values_are_skipped() {
        let mut table = FieldTable::default();
        table.insert("retries".into(), AMQPValue::LongUInt(3));
        table.insert(
            "origin".into(),
            AMQPValue::LongString(LongString::from("relay")),
        );

        let headers = headers_from_field_table(&table);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("origin").map(String::as_str), Some("relay"));
    }
}
