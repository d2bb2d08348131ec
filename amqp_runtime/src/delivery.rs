//! Inbound message handed to handlers.
//!
//! A [`Delivery`] is cheap to clone, all clones share one settlement state: exactly one
//! of [`Delivery::ack`] / [`Delivery::nack`] reaches the broker, later attempts fail with
//! [`Error::DeliveryAlreadySettled`]. Deliveries consumed in auto-ack mode are settled
//! by the broker on delivery and both calls are no-ops.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::broker::{BrokerChannel, RawDelivery};
use crate::error::Error;
use crate::message::{
    header_int, header_str, FieldTable, Properties, HEADER_CORRELATION_ID,
    HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use crate::Result;

#[derive(Clone)]
pub struct Delivery {
    inner: Arc<Inner>,
}

struct Inner {
    raw: RawDelivery,
    queue: String,
    channel: Arc<dyn BrokerChannel>,
    auto_ack: bool,
    settled: AtomicBool,
}

impl Delivery {
    pub(crate) fn new(
        raw: RawDelivery,
        queue: &str,
        channel: Arc<dyn BrokerChannel>,
        auto_ack: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                raw,
                queue: queue.to_owned(),
                channel,
                auto_ack,
                settled: AtomicBool::new(auto_ack),
            }),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.raw.delivery_tag
    }

    /// The broker delivered this message before without an acknowledgment.
    pub fn redelivered(&self) -> bool {
        self.inner.raw.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.inner.raw.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.inner.raw.routing_key
    }

    /// Queue the message was consumed from.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn properties(&self) -> &Properties {
        &self.inner.raw.properties
    }

    pub fn body(&self) -> &Bytes {
        &self.inner.raw.body
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.inner.raw.properties.headers.as_ref()
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        header_str(self.headers(), key)
    }

    pub fn header_int(&self, key: &str) -> Option<i64> {
        header_int(self.headers(), key)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.inner.raw.properties.content_type.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.inner.raw.properties.message_id.as_deref()
    }

    pub fn message_type(&self) -> Option<&str> {
        self.inner.raw.properties.message_type.as_deref()
    }

    /// Correlation id property, else the `correlation-id` header.
    pub fn correlation_id(&self) -> Option<&str> {
        self.inner
            .raw
            .properties
            .correlation_id
            .as_deref()
            .or_else(|| self.header_str(HEADER_CORRELATION_ID))
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.inner.raw.properties.timestamp
    }

    /// Times this message went through the retry middleware.
    pub fn retry_count(&self) -> u32 {
        self.header_int(HEADER_RETRY_COUNT)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or_default()
    }

    /// Routing key the message was first published with; retried copies travel under
    /// the queue name.
    pub fn original_routing_key(&self) -> &str {
        self.header_str(HEADER_ORIGINAL_ROUTING_KEY)
            .unwrap_or_else(|| self.routing_key())
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(self.body()).map_err(|err| Error::InvalidMessage(err.to_string()))
    }

    /// Decode a JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(self.body())?)
    }

    pub fn is_auto_ack(&self) -> bool {
        self.inner.auto_ack
    }

    /// An acknowledgment or rejection has been sent, or the delivery is auto-acked.
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<()> {
        if self.begin_settle()? {
            trace!("ack delivery {} on queue {}", self.delivery_tag(), self.queue());
            self.inner.channel.ack(self.delivery_tag()).await?;
        }
        Ok(())
    }

    /// Reject the delivery, back onto the queue when `requeue`, otherwise to the
    /// queue's dead-letter exchange if it has one.
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        if self.begin_settle()? {
            trace!(
                "nack delivery {} on queue {}, requeue: {}",
                self.delivery_tag(),
                self.queue(),
                requeue
            );
            self.inner.channel.nack(self.delivery_tag(), requeue).await?;
        }
        Ok(())
    }

    /// `false` when nothing has to be sent to the broker.
    fn begin_settle(&self) -> Result<bool> {
        if self.inner.auto_ack {
            return Ok(false);
        }
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            return Err(Error::DeliveryAlreadySettled(self.delivery_tag()));
        }
        Ok(true)
    }

    /// Channel the delivery arrived on.
    pub(crate) fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.inner.channel
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag())
            .field("queue", &self.queue())
            .field("exchange", &self.exchange())
            .field("routing_key", &self.routing_key())
            .field("redelivered", &self.redelivered())
            .field("settled", &self.is_settled())
            .finish()
    }
}
