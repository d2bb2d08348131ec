//! Transport seam between the runtime and a message broker.
//!
//! A [`Broker`] opens physical [`Link`]s; a link multiplexes [`BrokerChannel`]s. The
//! rest of the runtime only talks to these traits:
//!
//! * [`amqp::AmqpBroker`] speaks AMQP 0-9-1 through `amqprs`.
//! * `memory::MemoryBroker` is an in-process broker with fault injection, compiled
//!   with the `test-util` feature.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::message::{string_value, FieldTable, Properties};
use crate::Result;

pub mod amqp;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

/// Name of the exchange every queue is implicitly bound to by its own name.
pub const DEFAULT_EXCHANGE: &str = "";
/// Exchange type provided by the delayed-message plugin.
pub const DELAYED_EXCHANGE_TYPE: &str = "x-delayed-message";

/// Opens physical connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Perform one handshake attempt.
    async fn connect(&self, config: &Config) -> Result<Arc<dyn Link>>;
}

/// One physical connection.
#[async_trait]
pub trait Link: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    /// Resolve once the link is closed, whichever side closed it.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

/// One channel multiplexed over a [`Link`].
///
/// Every channel carries a process-unique [`id`](BrokerChannel::id), so a channel
/// opened after a reconnect never compares equal to one opened before.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()>;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<QueueInfo>;

    /// Passive declaration, fails with `QueueNotFound` for an unknown queue.
    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Returns the number of purged messages.
    async fn purge_queue(&self, queue: &str) -> Result<u32>;

    /// Returns the number of messages deleted with the queue.
    async fn delete_queue(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> Result<()>;

    /// Bound the number of unacknowledged deliveries of this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start a consumer, deliveries arrive on the returned stream until the channel
    /// closes.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        exclusive: bool,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>>;

    /// Fetch a single message, `None` if the queue is empty.
    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Allocate a process-unique channel id.
pub(crate) fn next_channel_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/////////////////////////////////////////////////////////////////////////////
/// A message as handed over by the broker.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: Properties,
    pub body: Bytes,
}

/// Queue statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub messages: u32,
    pub consumers: u32,
}

/////////////////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
    /// Plugin provided type, such as `x-delayed-message`.
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of exchange declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl ExchangeDeclaration {
    /// Durable exchange of the given kind.
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    /// Delayed-message exchange routing like `delayed_type` once the delay expires.
    pub fn delayed(name: &str, delayed_type: &ExchangeKind) -> Result<Self> {
        let mut declaration = Self::new(name, ExchangeKind::Custom(DELAYED_EXCHANGE_TYPE.into()));
        crate::message::set_header(
            &mut declaration.arguments,
            "x-delayed-type",
            string_value(delayed_type.as_str())?,
        )?;
        Ok(declaration)
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
}

/// Arguments of queue declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    /// Durable, shared queue.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            arguments: FieldTable::new(),
        }
    }

    pub fn durable(&mut self, durable: bool) -> &mut Self {
        self.durable = durable;
        self
    }

    pub fn auto_delete(&mut self, auto_delete: bool) -> &mut Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn exclusive(&mut self, exclusive: bool) -> &mut Self {
        self.exclusive = exclusive;
        self
    }

    pub fn arguments(&mut self, arguments: FieldTable) -> &mut Self {
        self.arguments = arguments;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }
}
