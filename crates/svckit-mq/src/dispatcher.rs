use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_lite::{FutureExt, StreamExt};
use opentelemetry::trace::SpanKind;
use svckit_core::{Error, EncryptionCodec, config::FailurePolicy};
use tokio::task::JoinSet;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{
    propagation::extract_context,
    registry::{Handler, Message, Registrations, Routes},
    transport::{Acknowledger, Delivery, DeliveryStream, Transport},
};

/// Routes deliveries from subscribed queues to their registered handlers.
///
/// Every queue is consumed by its own task. Within a queue, handlers run one
/// at a time in delivery order; separate queues progress independently.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    codec: Option<Arc<EncryptionCodec>>,
    failure_policy: FailurePolicy,
    shutdown: CancellationToken,
    workers: TaskTracker,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            codec: None,
            failure_policy: FailurePolicy::default(),
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
        }
    }

    /// Decrypt every payload before it reaches a handler.
    #[must_use]
    pub fn with_encryption(mut self, codec: Arc<EncryptionCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Subscribes every registered queue and dispatches until all
    /// subscriptions end or [`Dispatcher::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if nothing is registered, or the
    /// transport error of the first subscription that fails. Handler failures
    /// never surface here.
    pub async fn listen(&self, registrations: Registrations) -> Result<(), Error> {
        if registrations.is_empty() {
            return Err(Error::Configuration("no queues registered".into()));
        }

        let mut workers = Vec::new();
        for (queue, routes) in registrations.into_queues() {
            let mut topics: Vec<String> = routes.keys().cloned().collect();
            topics.sort();
            let stream = self.transport.subscribe(&queue, &topics).await?;
            workers.push((
                QueueWorker {
                    queue,
                    routes,
                    codec: self.codec.clone(),
                    failure_policy: self.failure_policy,
                    shutdown: self.shutdown.clone(),
                },
                stream,
            ));
        }

        let mut tasks = JoinSet::new();
        for (worker, stream) in workers {
            tasks.spawn(self.workers.track_future(worker.run(stream)));
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Queue worker terminated abnormally: {:?}", e);
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }

    /// Stops every queue worker and closes the transport.
    ///
    /// Workers stop taking new deliveries at once. A handler that is already
    /// running finishes and its delivery is settled before the transport is
    /// closed. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if closing the connection fails.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.workers.close();
        self.workers.wait().await;
        self.transport.close().await
    }
}

struct QueueWorker {
    queue: String,
    routes: Routes,
    codec: Option<Arc<EncryptionCodec>>,
    failure_policy: FailurePolicy,
    shutdown: CancellationToken,
}

impl QueueWorker {
    async fn run(self, mut stream: DeliveryStream) {
        info!(queue = %self.queue, "Started consuming");

        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.dispatch(delivery).await,
                Some(Err(e)) => error!(queue = %self.queue, "Consumer error: {}", e),
                None => break,
            }
        }

        info!(queue = %self.queue, "Stopped consuming");
    }

    async fn dispatch(&self, delivery: Delivery) {
        let Delivery {
            topic,
            payload,
            headers,
            acker,
        } = delivery;

        let Some(handler) = self.routes.get(&topic) else {
            debug!(queue = %self.queue, topic = %topic, "No handler registered, dropping message");
            settle(&*acker, Settlement::Ack, &self.queue, &topic).await;
            return;
        };

        let span = info_span!(
            "handle_message",
            otel.kind = ?SpanKind::Consumer,
            messaging.system = "rabbitmq",
            messaging.destination = %self.queue,
            messaging.topic = %topic,
        );
        span.set_parent(extract_context(&headers));

        async {
            let payload = match &self.codec {
                Some(codec) => match codec.decrypt(&payload) {
                    Ok(plain) => plain,
                    Err(e) => {
                        error!(error = %e, "Failed to decrypt message, rejecting");
                        settle(&*acker, Settlement::Nack { requeue: false }, &self.queue, &topic)
                            .await;
                        return;
                    }
                },
                None => payload,
            };

            let message = Message {
                queue: self.queue.clone(),
                topic: topic.clone(),
                payload,
                headers,
            };

            match invoke(handler, message).await {
                Ok(()) => settle(&*acker, Settlement::Ack, &self.queue, &topic).await,
                Err(e) => {
                    error!(error = %e, requeue = self.failure_policy.requeue(), "Handler failed");
                    settle(
                        &*acker,
                        Settlement::Nack {
                            requeue: self.failure_policy.requeue(),
                        },
                        &self.queue,
                        &topic,
                    )
                    .await;
                }
            }
        }
        .instrument(span)
        .await;
    }
}

/// Runs one handler invocation inside its own failure boundary.
async fn invoke(handler: &Arc<dyn Handler>, message: Message) -> Result<(), Error> {
    let queue = message.queue.clone();
    let topic = message.topic.clone();

    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Handler {
            queue,
            topic,
            message: format!("{e:#}"),
        }),
        Err(panic) => Err(Error::Handler {
            queue,
            topic,
            message: format!("handler panicked: {}", panic_message(&*panic)),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

async fn settle(acker: &dyn Acknowledger, settlement: Settlement, queue: &str, topic: &str) {
    let result = match settlement {
        Settlement::Ack => acker.ack().await,
        Settlement::Nack { requeue } => acker.nack(requeue).await,
    };

    if let Err(e) = result {
        warn!(queue, topic, ?settlement, "Failed to settle message: {}", e);
    }
}
