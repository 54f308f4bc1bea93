use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use svckit_core::{Error, EncryptionCodec, config::FailurePolicy};
use svckit_mq::{
    Acknowledger, Delivery, DeliveryStream, Dispatcher, Headers, Message, Registrations,
    Transport, handler_fn,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Ack,
    Nack { requeue: bool },
}

type SettleLog = Arc<Mutex<Vec<(String, Settled)>>>;

struct FakeAcker {
    id: String,
    log: SettleLog,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.log.lock().unwrap().push((self.id.clone(), Settled::Ack));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), Error> {
        self.log
            .lock()
            .unwrap()
            .push((self.id.clone(), Settled::Nack { requeue }));
        Ok(())
    }
}

type Feed = mpsc::UnboundedSender<Result<Delivery, Error>>;

/// In-memory broker: each queue is fed through a channel; dropping the
/// sender ends that queue's subscription.
struct FakeTransport {
    feeds: Mutex<HashMap<String, mpsc::UnboundedReceiver<Result<Delivery, Error>>>>,
    subscriptions: Mutex<Vec<(String, Vec<String>)>>,
    closed: AtomicBool,
}

impl FakeTransport {
    fn with_queues(names: &[&str]) -> (Arc<Self>, HashMap<String, Feed>) {
        let mut feeds = HashMap::new();
        let mut senders = HashMap::new();
        for name in names {
            let (tx, rx) = mpsc::unbounded_channel();
            feeds.insert((*name).to_string(), rx);
            senders.insert((*name).to_string(), tx);
        }

        let transport = Arc::new(Self {
            feeds: Mutex::new(feeds),
            subscriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (transport, senders)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, _topic: &str, _payload: Vec<u8>, _headers: Headers) -> Result<(), Error> {
        Err(Error::Transport("fake transport does not publish".into()))
    }

    async fn subscribe(&self, queue: &str, topics: &[String]) -> Result<DeliveryStream, Error> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((queue.to_string(), topics.to_vec()));

        let rx = self
            .feeds
            .lock()
            .unwrap()
            .remove(queue)
            .ok_or_else(|| Error::Transport(format!("no such queue: {queue}")))?;

        Ok(Box::pin(futures_lite::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn delivery(id: &str, topic: &str, payload: &[u8], log: &SettleLog) -> Result<Delivery, Error> {
    Ok(Delivery {
        topic: topic.to_string(),
        payload: payload.to_vec(),
        headers: Headers::new(),
        acker: Box::new(FakeAcker {
            id: id.to_string(),
            log: Arc::clone(log),
        }),
    })
}

fn settled(log: &SettleLog) -> Vec<(String, Settled)> {
    log.lock().unwrap().clone()
}

fn counting_handler(calls: &Arc<AtomicUsize>) -> impl svckit_mq::Handler + 'static {
    let calls = Arc::clone(calls);
    handler_fn(move |_message: Message| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    })
}

#[tokio::test]
async fn unregistered_topic_is_acked_without_calling_a_handler() {
    let (transport, mut feeds) = FakeTransport::with_queues(&["orders"]);
    let log = SettleLog::default();
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registrations = Registrations::new();
    registrations
        .register("orders", "order.created", counting_handler(&calls))
        .unwrap();

    let feed = feeds.remove("orders").unwrap();
    feed.send(delivery("1", "order.deleted", b"{}", &log)).unwrap();
    drop(feed);

    Dispatcher::new(transport).listen(registrations).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(settled(&log), vec![("1".to_string(), Settled::Ack)]);
}

#[tokio::test]
async fn panicking_handler_is_nacked_and_queue_keeps_going() {
    let (transport, mut feeds) = FakeTransport::with_queues(&["orders"]);
    let log = SettleLog::default();
    let handled = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&handled);
    let mut registrations = Registrations::new();
    registrations
        .register(
            "orders",
            "order.created",
            handler_fn(move |message: Message| {
                let counter = Arc::clone(&counter);
                async move {
                    assert!(message.payload != b"boom", "handler blew up");
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }),
        )
        .unwrap();

    let feed = feeds.remove("orders").unwrap();
    feed.send(delivery("1", "order.created", b"boom", &log)).unwrap();
    feed.send(delivery("2", "order.created", b"{}", &log)).unwrap();
    drop(feed);

    Dispatcher::new(transport).listen(registrations).await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(
        settled(&log),
        vec![
            ("1".to_string(), Settled::Nack { requeue: true }),
            ("2".to_string(), Settled::Ack),
        ]
    );
}

#[tokio::test]
async fn handler_error_follows_dead_letter_policy() {
    let (transport, mut feeds) = FakeTransport::with_queues(&["orders"]);
    let log = SettleLog::default();

    let mut registrations = Registrations::new();
    registrations
        .register(
            "orders",
            "order.created",
            handler_fn(|_message: Message| async {
                Err::<(), _>(anyhow::anyhow!("inventory service unavailable"))
            }),
        )
        .unwrap();

    let feed = feeds.remove("orders").unwrap();
    feed.send(delivery("1", "order.created", b"{}", &log)).unwrap();
    drop(feed);

    Dispatcher::new(transport)
        .with_failure_policy(FailurePolicy::DeadLetter)
        .listen(registrations)
        .await
        .unwrap();

    assert_eq!(
        settled(&log),
        vec![("1".to_string(), Settled::Nack { requeue: false })]
    );
}

#[tokio::test]
async fn deliveries_within_a_queue_are_handled_in_order() {
    let (transport, mut feeds) = FakeTransport::with_queues(&["orders"]);
    let log = SettleLog::default();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let recorder = Arc::clone(&seen);
    let mut registrations = Registrations::new();
    registrations
        .register(
            "orders",
            "order.created",
            handler_fn(move |message: Message| {
                let recorder = Arc::clone(&recorder);
                async move {
                    // Later deliveries would overtake earlier ones if handlers overlapped.
                    let wait = 50 - u64::from(message.payload[0]) * 10;
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    recorder.lock().unwrap().push(message.payload[0]);
                    anyhow::Ok(())
                }
            }),
        )
        .unwrap();

    let feed = feeds.remove("orders").unwrap();
    for i in 0..5u8 {
        feed.send(delivery(&i.to_string(), "order.created", &[i], &log))
            .unwrap();
    }
    drop(feed);

    Dispatcher::new(transport).listen(registrations).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(settled(&log).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn queues_are_processed_concurrently() {
    let (transport, mut feeds) = FakeTransport::with_queues(&["billing", "shipping"]);
    let log = SettleLog::default();
    let sleepy = || {
        handler_fn(|_message: Message| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            anyhow::Ok(())
        })
    };

    let mut registrations = Registrations::new();
    registrations
        .register("billing", "order.created", sleepy())
        .unwrap()
        .register("shipping", "order.created", sleepy())
        .unwrap();

    for (queue, feed) in feeds.drain() {
        feed.send(delivery(&queue, "order.created", b"{}", &log))
            .unwrap();
    }

    let start = Instant::now();
    Dispatcher::new(transport).listen(registrations).await.unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
    assert_eq!(settled(&log).len(), 2);
}

#[tokio::test]
async fn encrypted_payloads_are_decrypted_before_the_handler() {
    let codec = Arc::new(EncryptionCodec::new("an-encryption-secret-of-32-bytes").unwrap());
    let (transport, mut feeds) = FakeTransport::with_queues(&["orders"]);
    let log = SettleLog::default();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&received);
    let mut registrations = Registrations::new();
    registrations
        .register(
            "orders",
            "order.created",
            handler_fn(move |message: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(message.payload);
                    anyhow::Ok(())
                }
            }),
        )
        .unwrap();

    let sealed = codec.encrypt(br#"{"id":1}"#).unwrap();
    let feed = feeds.remove("orders").unwrap();
    feed.send(delivery("good", "order.created", &sealed, &log))
        .unwrap();
    feed.send(delivery("bad", "order.created", b"plaintext", &log))
        .unwrap();
    drop(feed);

    Dispatcher::new(transport)
        .with_encryption(codec)
        .listen(registrations)
        .await
        .unwrap();

    assert_eq!(*received.lock().unwrap(), vec![br#"{"id":1}"#.to_vec()]);
    assert_eq!(
        settled(&log),
        vec![
            ("good".to_string(), Settled::Ack),
            ("bad".to_string(), Settled::Nack { requeue: false }),
        ]
    );
}

#[tokio::test]
async fn subscriptions_bind_every_registered_topic() {
    let (transport, feeds) = FakeTransport::with_queues(&["audit", "orders"]);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registrations = Registrations::new();
    registrations
        .register("orders", "order.created", counting_handler(&calls))
        .unwrap()
        .register("orders", "order.cancelled", counting_handler(&calls))
        .unwrap()
        .register("audit", "order.created", counting_handler(&calls))
        .unwrap();
    drop(feeds);

    Dispatcher::new(Arc::clone(&transport) as Arc<dyn Transport>)
        .listen(registrations)
        .await
        .unwrap();

    let mut subscriptions = transport.subscriptions.lock().unwrap().clone();
    subscriptions.sort();
    assert_eq!(
        subscriptions,
        vec![
            ("audit".to_string(), vec!["order.created".to_string()]),
            (
                "orders".to_string(),
                vec!["order.cancelled".to_string(), "order.created".to_string()]
            ),
        ]
    );
}

#[tokio::test]
async fn shutdown_stops_listening_and_closes_transport() {
    let (transport, feeds) = FakeTransport::with_queues(&["orders"]);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registrations = Registrations::new();
    registrations
        .register("orders", "order.created", counting_handler(&calls))
        .unwrap();

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&transport) as Arc<dyn Transport>));
    let listening = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.listen(registrations).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    dispatcher.shutdown().await.unwrap();
    dispatcher.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), listening)
        .await
        .expect("listen returns after shutdown")
        .unwrap();
    assert!(result.is_ok());
    assert!(transport.closed.load(Ordering::SeqCst));
    // Feeds are still open: only shutdown could have ended the workers.
    drop(feeds);
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_a_running_handler_settle_before_closing() {
    let (transport, mut feeds) = FakeTransport::with_queues(&["orders"]);
    let log = SettleLog::default();
    let started = Arc::new(tokio::sync::Notify::new());

    let mut registrations = Registrations::new();
    {
        let started = Arc::clone(&started);
        registrations
            .register(
                "orders",
                "order.created",
                handler_fn(move |_message: Message| {
                    let started = Arc::clone(&started);
                    async move {
                        started.notify_one();
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        anyhow::Ok(())
                    }
                }),
            )
            .unwrap();
    }

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&transport) as Arc<dyn Transport>));
    let listening = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.listen(registrations).await })
    };

    let feed = feeds.remove("orders").unwrap();
    feed.send(delivery("1", "order.created", b"{}", &log)).unwrap();
    started.notified().await;

    dispatcher.shutdown().await.unwrap();

    assert_eq!(settled(&log), vec![("1".to_string(), Settled::Ack)]);
    assert!(transport.closed.load(Ordering::SeqCst));
    assert!(listening.await.unwrap().is_ok());
    drop(feed);
}

#[tokio::test]
async fn listen_without_registrations_fails() {
    let (transport, _feeds) = FakeTransport::with_queues(&[]);

    let err = Dispatcher::new(transport)
        .listen(Registrations::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn failed_subscription_is_returned_to_the_caller() {
    let (transport, _feeds) = FakeTransport::with_queues(&["orders"]);
    let calls = Arc::new(AtomicUsize::new(0));

    let mut registrations = Registrations::new();
    registrations
        .register("payments", "payment.settled", counting_handler(&calls))
        .unwrap();

    let err = Dispatcher::new(transport)
        .listen(registrations)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Transport(_)));
}
