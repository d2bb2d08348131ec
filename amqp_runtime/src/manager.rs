//! Named registry of publishers, consumers and queues over one connection.
//!
//! Lookups are double-checked: a read lock serves existing entries, creation happens
//! under the write lock and the first configuration registered for a name wins.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::broker::amqp::AmqpBroker;
use crate::broker::{Broker, ExchangeDeclaration, DEFAULT_EXCHANGE};
use crate::config::Config;
use crate::connection::BrokerConnection;
use crate::consumer::{Consumer, ConsumerConfig};
use crate::error::Error;
use crate::job::JobRouter;
use crate::message::Job;
use crate::middleware::Handler;
use crate::publisher::{Publisher, PublisherConfig};
use crate::queue::{Queue, QueueConfig};
use crate::Result;

/// Point-in-time view of a [`Manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub connected: bool,
    #[serde(rename = "total_publishers")]
    pub publishers: usize,
    #[serde(rename = "total_consumers")]
    pub consumers: usize,
    #[serde(rename = "total_queues")]
    pub queues: usize,
}

/// Handle to a manager, cloning shares it.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    connection: BrokerConnection,
    publishers: RwLock<HashMap<String, Publisher>>,
    consumers: RwLock<HashMap<String, Consumer>>,
    queues: RwLock<HashMap<String, Queue>>,
}

/// Get `name` from `registry`, creating it with `create` if missing.
async fn get_or_create<T, F, Fut>(
    registry: &RwLock<HashMap<String, T>>,
    name: &str,
    create: F,
) -> Result<T>
where
    T: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Some(entry) = registry.read().await.get(name) {
        return Ok(entry.clone());
    }
    let mut entries = registry.write().await;
    if let Some(entry) = entries.get(name) {
        return Ok(entry.clone());
    }
    let entry = create().await?;
    entries.insert(name.to_owned(), entry.clone());
    Ok(entry)
}

impl Manager {
    /// Connect to an AMQP broker.
    pub async fn connect(config: Config) -> Result<Self> {
        Self::with_broker(Arc::new(AmqpBroker), config).await
    }

    pub async fn with_broker(broker: Arc<dyn Broker>, config: Config) -> Result<Self> {
        let connection = BrokerConnection::connect(broker, config).await?;
        Ok(Self::with_connection(connection))
    }

    pub fn with_connection(connection: BrokerConnection) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connection,
                publishers: RwLock::new(HashMap::new()),
                consumers: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.inner.connection
    }

    /// Publisher of `exchange`, a durable direct exchange unless `config` says
    /// otherwise.
    pub async fn publisher(
        &self,
        exchange: &str,
        config: Option<PublisherConfig>,
    ) -> Result<Publisher> {
        get_or_create(&self.inner.publishers, exchange, || async {
            let config = config.unwrap_or_else(|| PublisherConfig::new(exchange));
            Publisher::new(self.inner.connection.clone(), config).await
        })
        .await
    }

    /// Consumer of `queue`, a durable unbound queue unless `config` says otherwise.
    pub async fn consumer(&self, queue: &str, config: Option<ConsumerConfig>) -> Result<Consumer> {
        get_or_create(&self.inner.consumers, queue, || async {
            let mut config = config.unwrap_or_else(|| ConsumerConfig::new(queue));
            if config.queue.is_empty() {
                config.queue = queue.to_owned();
            }
            Consumer::new(self.inner.connection.clone(), config).await
        })
        .await
    }

    pub async fn queue(&self, name: &str, config: Option<QueueConfig>) -> Result<Queue> {
        get_or_create(&self.inner.queues, name, || async {
            let mut config = config.unwrap_or_else(|| QueueConfig::new(name));
            if config.name.is_empty() {
                config.name = name.to_owned();
            }
            Queue::new(self.inner.connection.clone(), config).await
        })
        .await
    }

    pub async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()> {
        let name = "manager.declare";
        let channel = self.inner.connection.channel(name).await?;
        let result = channel.declare_exchange(declaration).await;
        if let Err(err) = self.inner.connection.close_channel(name).await {
            debug!("failed to close channel '{}', cause: {}.", name, err);
        }
        result?;
        info!(
            "declared exchange '{}' of type {}",
            declaration.name, declaration.kind
        );
        Ok(())
    }

    /// Persistent JSON message to an exchange.
    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publisher(exchange, None)
            .await?
            .publish_json(routing_key, value)
            .await
    }

    /// Persistent JSON message straight to a queue through the default exchange.
    pub async fn publish_to_queue<T>(&self, queue: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(DEFAULT_EXCHANGE, queue, value).await
    }

    /// Run `handler` on every message of `queue` until `shutdown` resolves.
    pub async fn consume<F>(&self, queue: &str, handler: Handler, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let consumer = self.consumer(queue, None).await?;
        consumer.handle_all(handler);
        consumer.run_until(shutdown).await
    }

    pub async fn consume_with_config<F>(
        &self,
        config: ConsumerConfig,
        handler: Handler,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let queue = config.queue.clone();
        let consumer = self.consumer(&queue, Some(config)).await?;
        consumer.handle_all(handler);
        consumer.run_until(shutdown).await
    }

    /// Enqueue a job envelope `{"type": kind, "payload": payload}`.
    pub async fn publish_job<T>(&self, queue: &str, kind: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish_to_queue(queue, &Job::new(kind, payload)?).await
    }

    /// Dispatch the jobs of `queue` through `router` until `shutdown` resolves.
    pub async fn consume_jobs<F>(&self, queue: &str, router: JobRouter, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.consume(queue, router.into_handler(), shutdown).await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Fails unless connected and able to open a channel.
    pub async fn health(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        self.inner.connection.health().await
    }

    pub async fn stats(&self) -> Stats {
        Stats {
            connected: self.is_connected(),
            publishers: self.inner.publishers.read().await.len(),
            consumers: self.inner.consumers.read().await.len(),
            queues: self.inner.queues.read().await.len(),
        }
    }

    /// Stop consumers, close publishers, then the connection.
    pub async fn close(&self) -> Result<()> {
        for (queue, consumer) in self.inner.consumers.write().await.drain() {
            consumer.stop();
            debug!("stopped consumer for queue '{}'", queue);
        }
        for (exchange, publisher) in self.inner.publishers.write().await.drain() {
            if let Err(err) = publisher.close().await {
                debug!(
                    "failed to close publisher for exchange '{}', cause: {}.",
                    exchange, err
                );
            }
        }
        self.inner.queues.write().await.clear();
        self.inner.connection.close().await?;
        info!("all messaging resources closed");
        Ok(())
    }
}
