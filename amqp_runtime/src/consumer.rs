//! Worker pool consuming one queue.
//!
//! A [`Consumer`] moves through [`ConsumerState`] once: created, running, stopping,
//! stopped. Every worker owns a channel named `consumer.{queue}.{id}`, sets its prefetch
//! on it and consumes its own delivery stream, so a worker never holds more than
//! `prefetch` unacknowledged deliveries.
//!
//! Each delivery is routed by routing key, the original one for retried copies, then to
//! the wildcard handler `*`. Deliveries nobody handles are acknowledged. After the
//! handler chain returns, an unsettled delivery is acknowledged on success and requeued
//! on failure.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{join_all, FutureExt};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::broker::QueueDeclaration;
use crate::connection::{BrokerConnection, ConnectionState};
use crate::delivery::Delivery;
use crate::error::Error;
use crate::message::FieldTable;
use crate::middleware::{panic_message, Handler, Middleware, MiddlewareChain};
use crate::publisher::DEFAULT_PUBLISHER_EXCHANGE;
use crate::Result;

/// Routing key of the catch-all handler.
pub const WILDCARD: &str = "*";
pub const DEFAULT_CONSUMER_QUEUE: &str = "runtime.default_queue";
pub const DEFAULT_PREFETCH: u16 = 10;

/// Pause before a worker re-acquires its channel while the connection is up.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);

/////////////////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Exchange the queue gets bound to on declaration, none when empty.
    pub exchange: String,
    pub routing_key: String,
    /// Prefix of the per-worker consumer tags.
    pub consumer_tag: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
    /// Number of workers, 0 means one per available CPU.
    pub concurrency: usize,
    pub prefetch: u16,
    pub auto_ack: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONSUMER_QUEUE)
            .exchange(DEFAULT_PUBLISHER_EXCHANGE)
            .finish()
    }
}

impl ConsumerConfig {
    /// Durable queue, not bound to any exchange.
    pub fn new(queue: &str) -> Self {
        Self {
            queue: queue.to_owned(),
            exchange: String::new(),
            routing_key: String::new(),
            consumer_tag: String::new(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            arguments: FieldTable::new(),
            concurrency: 0,
            prefetch: DEFAULT_PREFETCH,
            auto_ack: false,
        }
    }

    pub fn exchange(&mut self, exchange: &str) -> &mut Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(&mut self, routing_key: &str) -> &mut Self {
        self.routing_key = routing_key.to_owned();
        self
    }

    pub fn consumer_tag(&mut self, consumer_tag: &str) -> &mut Self {
        self.consumer_tag = consumer_tag.to_owned();
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

    pub fn exclusive(&mut self, exclusive: bool) -> &mut Self {
        self.exclusive = exclusive;
        self
    }

    pub fn arguments(&mut self, arguments: FieldTable) -> &mut Self {
        self.arguments = arguments;
        self
    }

    pub fn concurrency(&mut self, concurrency: usize) -> &mut Self {
        self.concurrency = concurrency;
        self
    }

    pub fn prefetch(&mut self, prefetch: u16) -> &mut Self {
        self.prefetch = prefetch;
        self
    }

    pub fn auto_ack(&mut self, auto_ack: bool) -> &mut Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    /// Worker count with the CPU default applied.
    pub fn workers(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn declaration(&self) -> QueueDeclaration {
        QueueDeclaration::new(&self.queue)
            .durable(self.durable)
            .auto_delete(self.auto_delete)
            .exclusive(self.exclusive)
            .arguments(self.arguments.clone())
            .finish()
    }
}

/////////////////////////////////////////////////////////////////////////////
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Created,
            1 => ConsumerState::Running,
            2 => ConsumerState::Stopping,
            _ => ConsumerState::Stopped,
        }
    }
}

/// Handle to a consumer, cloning shares it.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    connection: BrokerConnection,
    config: ConsumerConfig,
    handlers: Mutex<HashMap<String, Handler>>,
    middleware: Mutex<MiddlewareChain>,
    state: AtomicU8,
    stop_tx: watch::Sender<bool>,
}

impl Consumer {
    /// Create a consumer, declaring and binding its queue when auto-declaration is on.
    pub async fn new(connection: BrokerConnection, config: ConsumerConfig) -> Result<Self> {
        if connection.config().auto_declare_queues {
            declare(&connection, &config).await?;
        }
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ConsumerInner {
                connection,
                config,
                handlers: Mutex::new(HashMap::new()),
                middleware: Mutex::new(MiddlewareChain::new()),
                state: AtomicU8::new(ConsumerState::Created as u8),
                stop_tx,
            }),
        })
    }

    pub fn queue(&self) -> &str {
        &self.inner.config.queue
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running
    }

    /// Register the handler for one routing key, replacing any previous one.
    ///
    /// Registrations after [`Consumer::start`] are ignored.
    pub fn handle(&self, routing_key: &str, handler: Handler) -> &Self {
        if self.state() != ConsumerState::Created {
            warn!(
                "consumer for queue '{}' already started, ignoring handler for '{}'",
                self.queue(),
                routing_key
            );
            return self;
        }
        lock(&self.inner.handlers).insert(routing_key.to_owned(), handler);
        self
    }

    /// Register the catch-all handler.
    pub fn handle_all(&self, handler: Handler) -> &Self {
        self.handle(WILDCARD, handler)
    }

    /// Append a middleware, the first registered one is the outermost.
    pub fn use_middleware<M>(&self, middleware: M) -> &Self
    where
        M: Middleware + 'static,
    {
        if self.state() != ConsumerState::Created {
            warn!(
                "consumer for queue '{}' already started, ignoring middleware",
                self.queue()
            );
            return self;
        }
        lock(&self.inner.middleware).push(Arc::new(middleware));
        self
    }

    /// Run the workers until [`Consumer::stop`] is called.
    ///
    /// Returns once every worker has finished its current delivery and released its
    /// channel.
    pub async fn start(&self) -> Result<()> {
        if let Err(current) = self.inner.state.compare_exchange(
            ConsumerState::Created as u8,
            ConsumerState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(match ConsumerState::from_u8(current) {
                ConsumerState::Stopped => Error::ConsumerClosed,
                _ => Error::ConsumerAlreadyRunning,
            });
        }

        let routes = Arc::new(self.routes());
        let workers = self.inner.config.workers();
        info!(
            "starting consumer for queue '{}' with {} workers",
            self.queue(),
            workers
        );
        let handles = (0..workers).map(|id| {
            let worker = Worker {
                id,
                channel_name: format!("consumer.{}.{}", self.queue(), id),
                consumer_tag: self.worker_tag(id),
                connection: self.inner.connection.clone(),
                config: self.inner.config.clone(),
                routes: routes.clone(),
                stop_rx: self.inner.stop_tx.subscribe(),
            };
            tokio::spawn(worker.run())
        });
        for result in join_all(handles).await {
            if let Err(err) = result {
                error!("consumer worker on queue '{}' died: {}", self.queue(), err);
            }
        }

        self.inner
            .state
            .store(ConsumerState::Stopped as u8, Ordering::SeqCst);
        info!("all workers of consumer for queue '{}' stopped", self.queue());
        Ok(())
    }

    /// Ask the workers to stop after their current delivery.
    pub fn stop(&self) {
        let state = &self.inner.state;
        let _ = state.compare_exchange(
            ConsumerState::Running as u8,
            ConsumerState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // a consumer stopped before it ever ran can not be started anymore
        let _ = state.compare_exchange(
            ConsumerState::Created as u8,
            ConsumerState::Stopped as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.inner.stop_tx.send_replace(true);
    }

    /// [`Consumer::start`], stopping once `signal` resolves.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let run = self.start();
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = signal => {
                debug!("stop signal received for consumer on queue '{}'", self.queue());
                self.stop();
                run.await
            }
        }
    }

    fn routes(&self) -> Routes {
        let chain = lock(&self.inner.middleware).clone();
        let handlers = lock(&self.inner.handlers)
            .iter()
            .map(|(key, handler)| (key.clone(), chain.then(handler.clone())))
            .collect();
        Routes { handlers }
    }

    fn worker_tag(&self, id: usize) -> String {
        if self.inner.config.consumer_tag.is_empty() {
            format!("{}.worker-{}", self.queue(), id)
        } else {
            format!("{}-{}", self.inner.config.consumer_tag, id)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn declare(connection: &BrokerConnection, config: &ConsumerConfig) -> Result<()> {
    let name = format!("consumer.{}.declare", config.queue);
    let channel = connection.channel(&name).await?;
    let result = async {
        channel.declare_queue(&config.declaration()).await?;
        if !config.exchange.is_empty() {
            channel
                .bind_queue(&config.queue, &config.exchange, &config.routing_key)
                .await?;
        }
        Ok::<(), Error>(())
    }
    .await;
    if let Err(err) = connection.close_channel(&name).await {
        debug!("failed to close channel '{}', cause: {}.", name, err);
    }
    result
}

/////////////////////////////////////////////////////////////////////////////
struct Routes {
    handlers: HashMap<String, Handler>,
}

impl Routes {
    fn resolve(&self, routing_key: &str) -> Result<&Handler> {
        self.handlers
            .get(routing_key)
            .or_else(|| self.handlers.get(WILDCARD))
            .ok_or_else(|| Error::NoHandlerFound(routing_key.to_owned()))
    }
}

struct Worker {
    id: usize,
    channel_name: String,
    consumer_tag: String,
    connection: BrokerConnection,
    config: ConsumerConfig,
    routes: Arc<Routes>,
    stop_rx: watch::Receiver<bool>,
}

/// Resolve once a stop has been requested.
async fn stop_requested(mut stop_rx: watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

impl Worker {
    async fn run(self) {
        debug!("worker {} started on queue '{}'", self.id, self.config.queue);
        loop {
            match self.consume().await {
                Ok(()) => break,
                Err(err) => warn!(
                    "worker {} on queue '{}' lost its stream, cause: {}.",
                    self.id, self.config.queue, err
                ),
            }
            if let Err(err) = self.connection.close_channel(&self.channel_name).await {
                trace!("failed to close channel '{}', cause: {}.", self.channel_name, err);
            }
            if !self.pause().await {
                break;
            }
        }
        // unacknowledged deliveries go back to the queue with the channel
        if let Err(err) = self.connection.close_channel(&self.channel_name).await {
            trace!("failed to close channel '{}', cause: {}.", self.channel_name, err);
        }
        debug!("worker {} on queue '{}' stopped", self.id, self.config.queue);
    }

    /// Consume until a stop is requested, errors when the stream ends.
    async fn consume(&self) -> Result<()> {
        if *self.stop_rx.borrow() {
            return Ok(());
        }
        let channel = self.connection.channel(&self.channel_name).await?;
        channel.set_prefetch(self.config.prefetch).await?;
        let mut deliveries = channel
            .consume(
                &self.config.queue,
                &self.consumer_tag,
                self.config.auto_ack,
                self.config.exclusive,
            )
            .await?;

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(self.stop_rx.clone()) => return Ok(()),
                next = deliveries.recv() => match next {
                    Some(raw) => {
                        let delivery = Delivery::new(
                            raw,
                            &self.config.queue,
                            channel.clone(),
                            self.config.auto_ack,
                        );
                        self.process(delivery).await;
                    }
                    None => return Err(Error::ChannelClosed),
                },
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let routing_key = delivery.original_routing_key().to_owned();
        let handler = match self.routes.resolve(&routing_key) {
            Ok(handler) => handler,
            Err(err) => {
                debug!("{} on queue '{}', acknowledging.", err, self.config.queue);
                settle(&delivery, true).await;
                return;
            }
        };

        let call = AssertUnwindSafe(async { handler(delivery.clone()).await });
        let result = match call.catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::PanicRecovered(panic_message(panic))),
        };
        match result {
            Ok(()) => settle(&delivery, true).await,
            Err(err) => {
                warn!(
                    "failed to process message {} from queue '{}', cause: {}.",
                    delivery.delivery_tag(),
                    self.config.queue,
                    err
                );
                settle(&delivery, false).await;
            }
        }
    }

    /// Wait before re-subscribing, `false` when the worker should exit instead.
    async fn pause(&self) -> bool {
        let mut state_rx = self.connection.watch_state();
        let resume = async move {
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => {
                        time::sleep(RESUBSCRIBE_BACKOFF).await;
                        return true;
                    }
                    ConnectionState::Closing | ConnectionState::Closed => return false,
                    _ => {
                        if state_rx.changed().await.is_err() {
                            return false;
                        }
                    }
                }
            }
        };
        tokio::select! {
            biased;
            _ = stop_requested(self.stop_rx.clone()) => false,
            resume = resume => resume,
        }
    }
}

/// Acknowledge or requeue a delivery nobody settled yet.
async fn settle(delivery: &Delivery, success: bool) {
    if delivery.is_settled() {
        return;
    }
    let result = if success {
        delivery.ack().await
    } else {
        delivery.nack(true).await
    };
    if let Err(err) = result {
        warn!(
            "failed to settle message {} from queue '{}', cause: {}.",
            delivery.delivery_tag(),
            delivery.queue(),
            err
        );
    }
}
