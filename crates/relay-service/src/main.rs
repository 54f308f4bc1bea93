mod config;
mod consumer;
mod repository;
mod routes;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use svckit_cache::CacheClient;
use svckit_core::{EncryptionCodec, config::RetryPolicy, telemetry};
use svckit_http::with_common_layers;
use svckit_mq::{BrokerConnection, CancellationToken, Dispatcher, Publisher, Transport};
use tracing::{error, info};

use config::Config;
use consumer::Recorder;
use repository::MessageLog;

#[derive(Clone)]
pub struct AppState {
    pub connection: Arc<BrokerConnection>,
    pub publisher: Arc<Publisher>,
    pub retry: RetryPolicy,
    pub message_log: Arc<MessageLog>,
    pub cache: Option<Arc<CacheClient>>,
    /// Cancelled on shutdown; aborts in-flight publish retries.
    pub shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let _guard = telemetry::init_tracing(&config.observability_config()?, "relay-service")?;

    let broker_config = config.broker_config()?;
    let shutdown = CancellationToken::new();

    let connection = Arc::new(
        BrokerConnection::connect_with_retry(&broker_config, &broker_config.retry, &shutdown)
            .await?,
    );
    let transport: Arc<dyn Transport> = connection.transport();

    let codec = broker_config
        .encryption_secret
        .as_ref()
        .map(|secret| EncryptionCodec::new(secret.expose()))
        .transpose()?
        .map(Arc::new);

    let mut publisher = Publisher::new(Arc::clone(&transport));
    let mut dispatcher =
        Dispatcher::new(transport).with_failure_policy(broker_config.failure_policy);
    if let Some(codec) = &codec {
        publisher = publisher.with_encryption(Arc::clone(codec));
        dispatcher = dispatcher.with_encryption(Arc::clone(codec));
    }
    let dispatcher = Arc::new(dispatcher);

    let cache = config
        .cache_config()
        .map(|cache_config| CacheClient::new(&cache_config))
        .transpose()?
        .map(Arc::new);

    let message_log = Arc::new(MessageLog::new(config.message_buffer_size));
    let recorder = Arc::new(Recorder::new(
        Arc::clone(&message_log),
        cache.clone(),
        config.cache_ttl(),
    ));
    let registrations =
        consumer::registrations(&config.rabbitmq_queue, &config.topics(), recorder)?;
    for queue in registrations.queues() {
        info!(queue, topics = ?registrations.topics(queue), "Consumer registered");
    }

    let listener_task = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.listen(registrations).await {
                error!("Dispatcher error: {:?}", e);
            }
        })
    };

    let state = AppState {
        connection,
        publisher: Arc::new(publisher),
        retry: broker_config.retry,
        message_log,
        cache,
        shutdown: shutdown.clone(),
    };

    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/api/v1/messages", get(routes::list_messages))
        .route("/api/v1/messages/{topic}", post(routes::publish_message))
        .route("/api/v1/topics/{topic}/last", get(routes::last_message))
        .with_state(state);
    let app = with_common_layers(app, config.request_timeout());

    let addr = config.server_addr();
    info!("Starting relay-service on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("HTTP server stopped, shutting down dispatcher");
    dispatcher.shutdown().await?;
    listener_task.await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
