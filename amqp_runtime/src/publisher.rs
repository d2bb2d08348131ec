//! Exchange-bound message publisher.
//!
//! A [`Publisher`] publishes to one exchange over its own named channel
//! (`publisher.<exchange>`). The exchange is declared at most once per publisher,
//! unless it is the default exchange or auto-declaration is disabled. Publishing never
//! retries on its own: a failed send surfaces as [`Error::PublishFailed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use crate::broker::{
    BrokerChannel, ExchangeDeclaration, ExchangeKind, DEFAULT_EXCHANGE, DELAYED_EXCHANGE_TYPE,
};
use crate::connection::BrokerConnection;
use crate::error::Error;
use crate::message::{
    Body, FieldTable, FieldValue, Message, CONTENT_TYPE_BINARY, CONTENT_TYPE_JSON,
    CONTENT_TYPE_TEXT, HEADER_DELAY,
};
use crate::Result;

/// Exchange used by a publisher created without an explicit configuration.
pub const DEFAULT_PUBLISHER_EXCHANGE: &str = "runtime.default";
/// Delayed-message exchange used for delayed queue pushes.
pub const DELAYED_EXCHANGE: &str = "runtime.delayed";

/// Exchange a [`Publisher`] publishes to.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLISHER_EXCHANGE)
    }
}

impl PublisherConfig {
    /// Durable direct exchange.
    pub fn new(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_owned(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    /// Delayed-message exchange routing directly once the delay expires.
    pub fn delayed(exchange: &str) -> Result<Self> {
        let declaration = ExchangeDeclaration::delayed(exchange, &ExchangeKind::Direct)?;
        Ok(Self {
            kind: declaration.kind,
            arguments: declaration.arguments,
            ..Self::new(exchange)
        })
    }

    pub fn kind(&mut self, kind: ExchangeKind) -> &mut Self {
        self.kind = kind;
        self
    }

    pub fn durable(&mut self, durable: bool) -> &mut Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(&mut self, auto_delete: bool) -> &mut Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn internal(&mut self, internal: bool) -> &mut Self {
        self.internal = internal;
        self
    }

    pub fn arguments(&mut self, arguments: FieldTable) -> &mut Self {
        self.arguments = arguments;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    pub fn declaration(&self) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: self.exchange.clone(),
            kind: self.kind.clone(),
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            arguments: self.arguments.clone(),
        }
    }

    pub fn is_delayed(&self) -> bool {
        self.kind.as_str() == DELAYED_EXCHANGE_TYPE
    }
}

/// Handle to a publisher, cloning shares it.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    connection: BrokerConnection,
    config: PublisherConfig,
    channel_name: String,
    declared: OnceCell<()>,
    is_closed: AtomicBool,
}

impl Publisher {
    /// Create a publisher, declaring its exchange right away when auto-declaration is on.
    pub async fn new(connection: BrokerConnection, config: PublisherConfig) -> Result<Self> {
        let channel_name = format!("publisher.{}", config.exchange);
        let publisher = Self {
            inner: Arc::new(PublisherInner {
                connection,
                config,
                channel_name,
                declared: OnceCell::new(),
                is_closed: AtomicBool::new(false),
            }),
        };
        if publisher.needs_declaration() {
            let channel = publisher.acquire_channel().await?;
            publisher.ensure_exchange(&channel).await?;
        }
        Ok(publisher)
    }

    pub fn exchange(&self) -> &str {
        &self.inner.config.exchange
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.inner.config
    }

    pub async fn publish(&self, message: Message) -> Result<()> {
        if self.inner.is_closed.load(Ordering::SeqCst) {
            return Err(Error::PublishFailed(format!(
                "publisher for exchange '{}' is closed",
                self.exchange()
            )));
        }
        let channel = self.acquire_channel().await?;
        self.ensure_exchange(&channel).await?;

        let routing_key = message.routing_key.clone();
        let (body, properties) = message.encode()?;
        trace!(
            "publish {} bytes to exchange '{}' with routing key '{}'",
            body.len(),
            self.exchange(),
            routing_key
        );
        channel
            .publish(self.exchange(), &routing_key, properties, body)
            .await
            .map_err(|err| match err {
                Error::PublishFailed(_) | Error::ExchangeNotFound(_) => err,
                other => Error::PublishFailed(other.to_string()),
            })
    }

    /// Persistent JSON message.
    pub async fn publish_json<T>(&self, routing_key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(Message::json(routing_key, value)?).await
    }

    /// Persistent `text/plain` message.
    pub async fn publish_string(&self, routing_key: &str, text: &str) -> Result<()> {
        let message = Message::new(routing_key, text)
            .with_content_type(CONTENT_TYPE_TEXT)
            .with_persistence(true)
            .finish();
        self.publish(message).await
    }

    /// Persistent `application/octet-stream` message.
    pub async fn publish_bytes(&self, routing_key: &str, bytes: &[u8]) -> Result<()> {
        let message = Message::new(routing_key, bytes)
            .with_content_type(CONTENT_TYPE_BINARY)
            .with_persistence(true)
            .finish();
        self.publish(message).await
    }

    /// Persistent JSON message with custom headers.
    pub async fn publish_with_headers<T>(
        &self,
        routing_key: &str,
        value: &T,
        headers: FieldTable,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let message = Message::new(routing_key, Body::json(value)?)
            .with_content_type(CONTENT_TYPE_JSON)
            .with_headers(headers)
            .with_persistence(true)
            .finish();
        self.publish(message).await
    }

    /// Persistent JSON message held back by the broker for `delay`.
    ///
    /// Needs a delayed-message exchange, see [`PublisherConfig::delayed`].
    pub async fn publish_delayed<T>(
        &self,
        routing_key: &str,
        value: &T,
        delay: Duration,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let message = Message::new(routing_key, Body::json(value)?)
            .with_content_type(CONTENT_TYPE_JSON)
            .with_header(HEADER_DELAY, FieldValue::l(millis))?
            .with_persistence(true)
            .finish();
        self.publish(message).await
    }

    /// Release the publisher's channel, later publishes fail.
    pub async fn close(&self) -> Result<()> {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing publisher for exchange '{}'", self.exchange());
        self.inner
            .connection
            .close_channel(&self.inner.channel_name)
            .await
    }

    fn needs_declaration(&self) -> bool {
        self.exchange() != DEFAULT_EXCHANGE && self.inner.connection.config().auto_declare_exchange
    }

    async fn acquire_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.inner
            .connection
            .channel(&self.inner.channel_name)
            .await
            .map_err(|err| Error::PublishFailed(format!("failed to get channel: {}", err)))
    }

    async fn ensure_exchange(&self, channel: &Arc<dyn BrokerChannel>) -> Result<()> {
        if !self.needs_declaration() {
            return Ok(());
        }
        self.inner
            .declared
            .get_or_try_init(|| async {
                channel.declare_exchange(&self.inner.config.declaration()).await?;
                debug!(
                    "declared exchange '{}' of type {}",
                    self.exchange(),
                    self.inner.config.kind
                );
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }
}
