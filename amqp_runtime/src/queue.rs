//! Queue-centric façade.
//!
//! [`Queue`] bundles the everyday operations on one named queue: administration through
//! the channel `queue.{name}`, pushes through the default exchange, single-message
//! pops, and listening through a [`Consumer`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::broker::{BrokerChannel, QueueDeclaration, QueueInfo, DEFAULT_EXCHANGE};
use crate::connection::BrokerConnection;
use crate::consumer::{Consumer, ConsumerConfig};
use crate::delivery::Delivery;
use crate::message::FieldTable;
use crate::middleware::Handler;
use crate::publisher::{Publisher, PublisherConfig, DELAYED_EXCHANGE};
use crate::Result;

pub const DEFAULT_QUEUE: &str = "runtime.queue";

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

impl QueueConfig {
    /// Durable queue.
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

    /// Queue arguments such as `x-dead-letter-exchange` or `x-message-ttl`.
    pub fn arguments(&mut self, arguments: FieldTable) -> &mut Self {
        self.arguments = arguments;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    pub fn declaration(&self) -> QueueDeclaration {
        QueueDeclaration::new(&self.name)
            .durable(self.durable)
            .auto_delete(self.auto_delete)
            .exclusive(self.exclusive)
            .arguments(self.arguments.clone())
            .finish()
    }
}

/// Handle to a queue, cloning shares it.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    connection: BrokerConnection,
    config: QueueConfig,
    channel_name: String,
    pusher: OnceCell<Publisher>,
    delayed: OnceCell<Publisher>,
}

impl Queue {
    /// Create the handle, declaring the queue when auto-declaration is on.
    pub async fn new(connection: BrokerConnection, config: QueueConfig) -> Result<Self> {
        let queue = Self {
            inner: Arc::new(QueueInner {
                channel_name: format!("queue.{}", config.name),
                connection,
                config,
                pusher: OnceCell::new(),
                delayed: OnceCell::new(),
            }),
        };
        if queue.inner.connection.config().auto_declare_queues {
            queue.declare().await?;
        }
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub async fn declare(&self) -> Result<QueueInfo> {
        let info = self
            .channel()
            .await?
            .declare_queue(&self.inner.config.declaration())
            .await?;
        info!("declared queue '{}'", self.name());
        Ok(info)
    }

    /// Drop every ready message, returns how many were dropped.
    pub async fn purge(&self) -> Result<u32> {
        let count = self.channel().await?.purge_queue(self.name()).await?;
        info!("purged {} messages from queue '{}'", count, self.name());
        Ok(count)
    }

    /// Delete the queue, returns the number of messages it held.
    pub async fn delete(&self, if_unused: bool, if_empty: bool) -> Result<u32> {
        let count = self
            .channel()
            .await?
            .delete_queue(self.name(), if_unused, if_empty)
            .await?;
        info!("deleted queue '{}' with {} messages", self.name(), count);
        Ok(count)
    }

    pub async fn inspect(&self) -> Result<QueueInfo> {
        self.channel().await?.inspect_queue(self.name()).await
    }

    pub async fn bind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel()
            .await?
            .bind_queue(self.name(), exchange, routing_key)
            .await?;
        info!(
            "bound queue '{}' to exchange '{}' with routing key '{}'",
            self.name(),
            exchange,
            routing_key
        );
        Ok(())
    }

    pub async fn unbind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel()
            .await?
            .unbind_queue(self.name(), exchange, routing_key)
            .await?;
        info!(
            "unbound queue '{}' from exchange '{}' with routing key '{}'",
            self.name(),
            exchange,
            routing_key
        );
        Ok(())
    }

    /// Publish a persistent JSON message straight to this queue.
    pub async fn push<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.pusher().await?.publish_json(self.name(), value).await
    }

    pub async fn push_string(&self, text: &str) -> Result<()> {
        self.pusher().await?.publish_string(self.name(), text).await
    }

    /// Publish through the delayed-message exchange, the queue gets bound to it on
    /// first use.
    pub async fn push_delayed<T>(&self, value: &T, delay: Duration) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let publisher = self
            .inner
            .delayed
            .get_or_try_init(|| async {
                let config = PublisherConfig::delayed(DELAYED_EXCHANGE)?;
                let publisher = Publisher::new(self.inner.connection.clone(), config).await?;
                self.bind(DELAYED_EXCHANGE, self.name()).await?;
                Ok::<_, crate::Error>(publisher)
            })
            .await?;
        publisher.publish_delayed(self.name(), value, delay).await
    }

    /// Fetch one message, `None` when the queue is empty.
    ///
    /// Unless `auto_ack`, the caller settles the delivery.
    pub async fn pop(&self, auto_ack: bool) -> Result<Option<Delivery>> {
        let name = format!("queue.{}.pop", self.name());
        let channel = self.inner.connection.channel(&name).await?;
        let raw = channel.get(self.name(), auto_ack).await?;
        Ok(raw.map(|raw| Delivery::new(raw, self.name(), channel, auto_ack)))
    }

    /// Consume with a single worker until `shutdown` resolves.
    pub async fn listen<F>(&self, handler: Handler, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.listen_with_workers(1, handler, shutdown).await
    }

    pub async fn listen_with_workers<F>(
        &self,
        workers: usize,
        handler: Handler,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let config = ConsumerConfig::new(self.name())
            .durable(self.inner.config.durable)
            .auto_delete(self.inner.config.auto_delete)
            .exclusive(self.inner.config.exclusive)
            .arguments(self.inner.config.arguments.clone())
            .concurrency(workers)
            .finish();
        let consumer = Consumer::new(self.inner.connection.clone(), config).await?;
        consumer.handle_all(handler);
        consumer.run_until(shutdown).await
    }

    pub async fn count(&self) -> Result<u32> {
        Ok(self.inspect().await?.messages)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.count().await? == 0)
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.inner.connection.channel(&self.inner.channel_name).await
    }

    async fn pusher(&self) -> Result<&Publisher> {
        self.inner
            .pusher
            .get_or_try_init(|| async {
                debug!("creating publisher for queue '{}'", self.name());
                Publisher::new(
                    self.inner.connection.clone(),
                    PublisherConfig::new(DEFAULT_EXCHANGE),
                )
                .await
            })
            .await
    }
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use tokio::time;

    use super::{Queue, QueueConfig};
    use crate::broker::memory::MemoryBroker;
    use crate::config::Config;
    use crate::connection::BrokerConnection;
    use crate::error::Error;
    use crate::middleware::handler_fn;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
        subject: String,
    }

    async fn queue(broker: &MemoryBroker, name: &str) -> Queue {
        let connection =
            BrokerConnection::connect(Arc::new(broker.clone()), Config::new("amqp://memory"))
                .await
                .unwrap();
        Queue::new(connection, QueueConfig::new(name)).await.unwrap()
    }

    #[tokio::test]
    async fn test_push_pop_count() {
        let broker = MemoryBroker::new();
        let queue = queue(&broker, "mail").await;
        assert!(queue.is_empty().await.unwrap());

        let email = Email {
            to: "ann@example.com".to_string(),
            subject: "hi".to_string(),
        };
        queue.push(&email).await.unwrap();
        queue.push_string("plain").await.unwrap();
        assert_eq!(2, queue.count().await.unwrap());

        let first = queue.pop(false).await.unwrap().unwrap();
        assert_eq!(email, first.json::<Email>().unwrap());
        assert_eq!(Some("application/json"), first.content_type());
        first.ack().await.unwrap();

        let second = queue.pop(true).await.unwrap().unwrap();
        assert_eq!("plain", second.text().unwrap());
        assert!(queue.pop(false).await.unwrap().is_none());
        assert_eq!(0, broker.unacked("mail"));
    }

    #[tokio::test]
    async fn test_admin_operations() {
        let broker = MemoryBroker::new();
        let queue = queue(&broker, "admin").await;
        for i in 0..3 {
            queue.push(&i).await.unwrap();
        }
        let info = queue.inspect().await.unwrap();
        assert_eq!("admin", info.name);
        assert_eq!(3, info.messages);
        assert_eq!(3, queue.purge().await.unwrap());
        assert!(queue.is_empty().await.unwrap());

        queue.push(&1).await.unwrap();
        assert!(matches!(
            queue.delete(false, true).await,
            Err(Error::QueueDeleteFailed(_))
        ));
        assert_eq!(1, queue.delete(false, false).await.unwrap());
        assert!(matches!(
            queue.inspect().await,
            Err(Error::QueueNotFound(_))
        ));
        // the admin channel recovers after the broker closed it
        queue.declare().await.unwrap();
        assert_eq!(0, queue.count().await.unwrap());
    }

    #[tokio::test]
    async fn test_push_delayed() {
        let broker = MemoryBroker::new();
        let queue = queue(&broker, "later").await;
        queue
            .push_delayed(&"wake up", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(broker.has_exchange("runtime.delayed"));
        assert_eq!(Some(0), broker.queue_depth("later"));
        time::sleep(Duration::from_millis(250)).await;
        assert_eq!(Some(1), broker.queue_depth("later"));
        let delivery = queue.pop(true).await.unwrap().unwrap();
        assert_eq!("wake up", delivery.json::<String>().unwrap());
    }

    #[tokio::test]
    async fn test_listen_until_shutdown() {
        let broker = MemoryBroker::new();
        let queue = queue(&broker, "listen").await;
        for i in 0..5 {
            queue.push(&i).await.unwrap();
        }
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let handler = handler_fn(move |d| {
            let counter = counter.clone();
            async move {
                let _: u32 = d.json()?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let done = handled.clone();
        queue
            .listen_with_workers(2, handler, async move {
                while done.load(Ordering::SeqCst) < 5 {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
        assert_eq!(5, handled.load(Ordering::SeqCst));
        assert!(queue.is_empty().await.unwrap());
    }
}
