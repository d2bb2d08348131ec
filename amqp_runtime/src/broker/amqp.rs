//! [`Broker`] backed by the `amqprs` client.
//!
//! Connection arguments come from `Config::connection_arguments`. Each
//! [`BrokerChannel`] wraps one `amqprs` channel; consumer deliveries are forwarded from
//! the client's receiver into a [`RawDelivery`] stream by a small task that ends with
//! the channel.

use std::sync::Arc;

use amqprs::{
    callbacks::{DefaultChannelCallback, DefaultConnectionCallback},
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicGetArguments, BasicNackArguments,
        BasicPublishArguments, BasicQosArguments, Channel, ExchangeDeclareArguments,
        QueueBindArguments, QueueDeclareArguments, QueueDeleteArguments, QueuePurgeArguments,
        QueueUnbindArguments,
    },
    connection::Connection,
    BasicProperties,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    next_channel_id, Broker, BrokerChannel, ExchangeDeclaration, Link, QueueDeclaration,
    QueueInfo, RawDelivery,
};
use crate::config::Config;
use crate::error::Error;
use crate::message::Properties;
use crate::Result;

/// Broker reached over the network with AMQP 0-9-1.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

fn broker_error(err: amqprs::error::Error) -> Error {
    Error::Broker(err.to_string())
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, config: &Config) -> Result<Arc<dyn Link>> {
        let args = config.connection_arguments()?;
        let connection = Connection::open(&args).await.map_err(broker_error)?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await
            .map_err(broker_error)?;
        info!("opened amqp connection {}", connection.connection_name());
        Ok(Arc::new(AmqpLink { connection }))
    }
}

/////////////////////////////////////////////////////////////////////////////
struct AmqpLink {
    connection: Connection,
}

#[async_trait]
impl Link for AmqpLink {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .open_channel(None)
            .await
            .map_err(|err| Error::ChannelCreationFailed(err.to_string()))?;
        channel
            .register_callback(DefaultChannelCallback)
            .await
            .map_err(|err| Error::ChannelCreationFailed(err.to_string()))?;
        Ok(Arc::new(AmqpChannel {
            id: next_channel_id(),
            channel,
        }))
    }

    fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    async fn closed(&self) {
        // resolves on network failure as well as on a regular close
        if self.connection.listen_network_io_failure().await {
            warn!(
                "network failure on connection {}",
                self.connection.connection_name()
            );
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.connection.is_open() {
            return Ok(());
        }
        self.connection.clone().close().await.map_err(broker_error)
    }
}

/////////////////////////////////////////////////////////////////////////////
struct AmqpChannel {
    id: u64,
    channel: Channel,
}

fn to_basic_properties(properties: Properties) -> BasicProperties {
    let mut props = BasicProperties::default();
    if let Some(v) = properties.content_type.as_deref() {
        props.with_content_type(v);
    }
    if let Some(headers) = properties.headers {
        props.with_headers(headers);
    }
    if let Some(v) = properties.delivery_mode {
        props.with_delivery_mode(v);
    }
    if let Some(v) = properties.priority {
        props.with_priority(v);
    }
    if let Some(v) = properties.correlation_id.as_deref() {
        props.with_correlation_id(v);
    }
    if let Some(v) = properties.expiration.as_deref() {
        props.with_expiration(v);
    }
    if let Some(v) = properties.message_id.as_deref() {
        props.with_message_id(v);
    }
    if let Some(v) = properties.timestamp {
        props.with_timestamp(v);
    }
    if let Some(v) = properties.message_type.as_deref() {
        props.with_message_type(v);
    }
    if let Some(v) = properties.user_id.as_deref() {
        props.with_user_id(v);
    }
    if let Some(v) = properties.app_id.as_deref() {
        props.with_app_id(v);
    }
    props.finish()
}

fn from_basic_properties(props: &BasicProperties) -> Properties {
    Properties {
        content_type: props.content_type().map(|s| s.to_string()),
        headers: props.headers().cloned(),
        delivery_mode: props.delivery_mode(),
        priority: props.priority(),
        correlation_id: props.correlation_id().map(|s| s.to_string()),
        expiration: props.expiration().map(|s| s.to_string()),
        message_id: props.message_id().map(|s| s.to_string()),
        timestamp: props.timestamp(),
        message_type: props.message_type().map(|s| s.to_string()),
        user_id: props.user_id().map(|s| s.to_string()),
        app_id: props.app_id().map(|s| s.to_string()),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()> {
        let mut args =
            ExchangeDeclareArguments::new(&declaration.name, declaration.kind.as_str());
        args.durable = declaration.durable;
        args.auto_delete = declaration.auto_delete;
        args.internal = declaration.internal;
        args.arguments = declaration.arguments.clone();
        self.channel
            .exchange_declare(args)
            .await
            .map_err(|err| Error::ExchangeDeclarationFailed(err.to_string()))
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<QueueInfo> {
        let args = QueueDeclareArguments::new(&declaration.name)
            .durable(declaration.durable)
            .auto_delete(declaration.auto_delete)
            .exclusive(declaration.exclusive)
            .arguments(declaration.arguments.clone())
            .finish();
        let declared = self
            .channel
            .queue_declare(args)
            .await
            .map_err(|err| Error::QueueDeclarationFailed(err.to_string()))?;
        let (name, messages, consumers) =
            declared.unwrap_or_else(|| (declaration.name.clone(), 0, 0));
        Ok(QueueInfo {
            name,
            messages,
            consumers,
        })
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo> {
        let args = QueueDeclareArguments::new(queue).passive(true).finish();
        let declared = self
            .channel
            .queue_declare(args)
            .await
            .map_err(|_| Error::QueueNotFound(queue.to_owned()))?;
        let (name, messages, consumers) =
            declared.ok_or_else(|| Error::QueueNotFound(queue.to_owned()))?;
        Ok(QueueInfo {
            name,
            messages,
            consumers,
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(QueueBindArguments::new(queue, exchange, routing_key))
            .await
            .map_err(|err| Error::QueueBindFailed(err.to_string()))
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_unbind(QueueUnbindArguments::new(queue, exchange, routing_key))
            .await
            .map_err(|err| Error::QueueBindFailed(err.to_string()))
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        let purged = self
            .channel
            .queue_purge(QueuePurgeArguments::new(queue))
            .await
            .map_err(|err| Error::QueuePurgeFailed(err.to_string()))?;
        Ok(purged.unwrap_or_default())
    }

    async fn delete_queue(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let mut args = QueueDeleteArguments::new(queue);
        args.if_unused = if_unused;
        args.if_empty = if_empty;
        let deleted = self
            .channel
            .queue_delete(args)
            .await
            .map_err(|err| Error::QueueDeleteFailed(err.to_string()))?;
        Ok(deleted.unwrap_or_default())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> Result<()> {
        self.channel
            .basic_publish(
                to_basic_properties(properties),
                body,
                BasicPublishArguments::new(exchange, routing_key),
            )
            .await
            .map_err(|err| Error::PublishFailed(err.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(BasicQosArguments::new(0, count, false))
            .await
            .map_err(broker_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        exclusive: bool,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>> {
        let mut args = BasicConsumeArguments::new(queue, consumer_tag);
        args.manual_ack(!auto_ack);
        args.exclusive = exclusive;
        let (tag, mut messages) = self
            .channel
            .basic_consume_rx(args)
            .await
            .map_err(broker_error)?;
        debug!("consumer {} started on queue {}", tag, queue);

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let (Some(deliver), Some(props)) = (message.deliver, message.basic_properties)
                else {
                    continue;
                };
                let delivery = RawDelivery {
                    delivery_tag: deliver.delivery_tag(),
                    redelivered: deliver.redelivered(),
                    exchange: deliver.exchange().to_string(),
                    routing_key: deliver.routing_key().to_string(),
                    properties: from_basic_properties(&props),
                    body: Bytes::from(message.content.unwrap_or_default()),
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
            debug!("consumer {} stream ended", tag);
        });
        Ok(rx)
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>> {
        let mut args = BasicGetArguments::new(queue);
        args.no_ack = auto_ack;
        let message = self.channel.basic_get(args).await.map_err(broker_error)?;
        Ok(message.map(|(get_ok, props, content)| RawDelivery {
            delivery_tag: get_ok.delivery_tag(),
            redelivered: get_ok.redelivered(),
            exchange: get_ok.exchange().to_string(),
            routing_key: get_ok.routing_key().to_string(),
            properties: from_basic_properties(&props),
            body: Bytes::from(content),
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
            .map_err(broker_error)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(BasicNackArguments::new(delivery_tag, false, requeue))
            .await
            .map_err(broker_error)
    }

    async fn close(&self) -> Result<()> {
        if !self.channel.is_open() {
            return Ok(());
        }
        self.channel.clone().close().await.map_err(broker_error)
    }
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use super::{from_basic_properties, to_basic_properties};
    use crate::message::{set_header, FieldTable, FieldValue, Properties};

    #[test]
    fn test_properties_conversion() {
        let mut headers = FieldTable::new();
        set_header(&mut headers, "x-retry-count", FieldValue::l(1)).unwrap();
        let properties = Properties {
            content_type: Some("application/json".to_string()),
            headers: Some(headers),
            delivery_mode: Some(2),
            priority: Some(5),
            correlation_id: Some("c-1".to_string()),
            expiration: Some("60000".to_string()),
            message_id: Some("m-1".to_string()),
            timestamp: Some(1_700_000_000),
            message_type: Some("order".to_string()),
            user_id: Some("guest".to_string()),
            app_id: Some("billing".to_string()),
        };
        let converted = from_basic_properties(&to_basic_properties(properties.clone()));
        assert_eq!(properties, converted);
    }
}
