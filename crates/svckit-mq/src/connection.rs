//! `RabbitMQ` connection setup.

use std::future::Future;
use std::sync::Arc;

use lapin::{
    Connection, ConnectionProperties, ExchangeKind,
    options::{ConfirmSelectOptions, ExchangeDeclareOptions},
    types::FieldTable,
    uri::{AMQPAuthority, AMQPScheme, AMQPUri, AMQPUserInfo},
};
use svckit_core::{
    Error,
    config::{BrokerConfig, RetryPolicy},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    amqp::AmqpTransport,
    retry::{RetryFailure, retry},
    transport::Transport,
};

fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.expose().to_string(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        ..Default::default()
    }
}

/// Validates `config` once, then runs `connect` under `policy`.
async fn retry_connect<T, F, Fut>(
    config: &BrokerConfig,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut connect: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    config.validate()?;

    retry(policy, cancel, "connect", |_| connect())
        .await
        .map_err(|RetryFailure { attempts, error }| {
            if !error.is_cancelled() {
                warn!(attempts, error = %error, "Giving up connecting to RabbitMQ");
            }
            error
        })
}

/// Owns the single connection shared by publishers and dispatchers.
///
/// Construct one per process and hand [`BrokerConnection::transport`] to
/// every component that talks to the broker.
pub struct BrokerConnection {
    transport: Arc<AmqpTransport>,
}

impl BrokerConnection {
    /// Connect to `RabbitMQ` and declare the topic exchange.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the config is invalid and
    /// `Error::Connection` if connecting, opening the channel or declaring
    /// the exchange fails.
    #[instrument(skip(config), fields(host = %config.host, port = config.port))]
    pub async fn connect(config: &BrokerConfig) -> Result<Self, Error> {
        config.validate()?;

        let conn = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        info!(exchange = %config.exchange, "RabbitMQ connection initialized");

        Ok(Self {
            transport: Arc::new(AmqpTransport::new(
                conn,
                channel,
                config.exchange.clone(),
                config.prefetch,
                config.dead_letter_exchange.clone(),
            )),
        })
    }

    /// [`BrokerConnection::connect`] under a retry policy.
    ///
    /// Reconnection is always driven by the caller through this method;
    /// nothing reconnects in the background.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if `cancel` fires, otherwise the last
    /// connection error once the policy is exhausted. Configuration errors are
    /// returned without retrying.
    pub async fn connect_with_retry(
        config: &BrokerConfig,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        retry_connect(config, policy, cancel, || Self::connect(config)).await
    }

    #[must_use]
    pub fn transport(&self) -> Arc<AmqpTransport> {
        Arc::clone(&self.transport)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Closes the connection. Only the first call has an effect.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connection` if the broker rejects the close.
    pub async fn close(&self) -> Result<(), Error> {
        self.transport.close().await
    }
}
