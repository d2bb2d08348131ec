//! Message handlers and the middleware that wraps them.
//!
//! A [`Handler`] processes one [`Delivery`]. A [`Middleware`] turns a handler into
//! another handler; a [`MiddlewareChain`] applies middleware in registration order, the
//! first registered being the outermost.
//!
//! Recommended order: [`Recovery`] first so it sees every panic, then [`Logging`],
//! then [`Retry`] and [`Timeout`] innermost.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use amqp_runtime::middleware::{handler_fn, Logging, MiddlewareChain, Recovery, Timeout};
//!
//! let chain = MiddlewareChain::new()
//!     .with(Recovery)
//!     .with(Logging)
//!     .with(Timeout::new(Duration::from_secs(30)));
//! let handler = chain.then(handler_fn(|delivery| async move {
//!     println!("{}", delivery.text()?);
//!     Ok(())
//! }));
//! # let _ = handler;
//! ```

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::DEFAULT_EXCHANGE;
use crate::delivery::Delivery;
use crate::error::Error;
use crate::message::{
    header_str, set_header, string_value, FieldTable, FieldValue, HEADER_ORIGINAL_ROUTING_KEY,
    HEADER_RETRY_COUNT,
};
use crate::Result;

/// Asynchronous message handler.
pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |delivery| f(delivery).boxed())
}

/// Wraps a handler with cross-cutting behaviour.
///
/// Closures `Fn(Handler) -> Handler` are middleware too.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Handler) -> Handler;
}

impl<F> Middleware for F
where
    F: Fn(Handler) -> Handler + Send + Sync,
{
    fn wrap(&self, next: Handler) -> Handler {
        self(next)
    }
}

/// Ordered list of middleware, the first one registered is the outermost.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Wrap `handler` with every middleware of the chain.
    pub fn then(&self, handler: Handler) -> Handler {
        self.middleware
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware.wrap(next))
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Trace start, end, duration and outcome of each delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

impl Middleware for Logging {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |delivery: Delivery| {
            let next = next.clone();
            async move {
                let started = Instant::now();
                let tag = delivery.delivery_tag();
                let queue = delivery.queue().to_owned();
                debug!(
                    "processing message {} [{}] from queue '{}'",
                    tag,
                    delivery.message_id().unwrap_or_default(),
                    queue
                );
                let result = next(delivery).await;
                match &result {
                    Ok(()) => info!(
                        "message {} from queue '{}' processed in {:?}",
                        tag,
                        queue,
                        started.elapsed()
                    ),
                    Err(err) => warn!(
                        "message {} from queue '{}' failed after {:?}: {}",
                        tag,
                        queue,
                        started.elapsed(),
                        err
                    ),
                }
                result
            }
            .boxed()
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Turn a panic of the inner handler into [`Error::PanicRecovered`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Recovery;

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Middleware for Recovery {
    fn wrap(&self, next: Handler) -> Handler {
        Arc::new(move |delivery: Delivery| {
            let next = next.clone();
            async move {
                // the handler may panic while building its future, or while polling it
                let future = match panic::catch_unwind(AssertUnwindSafe(|| next(delivery))) {
                    Ok(future) => future,
                    Err(panic) => {
                        let message = panic_message(panic);
                        error!("recovered from panic: {}", message);
                        return Err(Error::PanicRecovered(message));
                    }
                };
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(panic);
                        error!("recovered from panic: {}", message);
                        Err(Error::PanicRecovered(message))
                    }
                }
            }
            .boxed()
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Bound the time a caller waits for the inner handler.
///
/// The inner call runs on its own task. On expiry the task is left running and
/// [`Error::ProcessingTimeout`] is returned. A panic of the task is resumed on the
/// caller, so an outer [`Recovery`] still sees it.
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    duration: Duration,
}

impl Timeout {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Middleware for Timeout {
    fn wrap(&self, next: Handler) -> Handler {
        let duration = self.duration;
        Arc::new(move |delivery: Delivery| {
            let task = tokio::spawn(next(delivery));
            async move {
                match time::timeout(duration, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(err)) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                    Ok(Err(err)) => Err(Error::handler(err)),
                    Err(_) => {
                        warn!("message processing timeout after {:?}", duration);
                        Err(Error::ProcessingTimeout(duration))
                    }
                }
            }
            .boxed()
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Retry failed deliveries by republishing them.
///
/// The attempt count travels in the `x-retry-count` header. While it is below
/// `max_retries`, a failure waits `delay`, republishes a copy to the source queue
/// through the default exchange with the count incremented and the first routing key
/// kept in `x-original-routing-key`, and reports success so the original is
/// acknowledged. Once the budget is spent the delivery is rejected without requeue,
/// which dead-letters it when the queue has a dead-letter exchange, and
/// [`Error::RetryExhausted`] is returned.
///
/// Errors that are not [retryable](Error::is_retryable) reject the delivery right
/// away. A delivery an inner layer already settled is never republished.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    max_retries: u32,
    delay: Duration,
}

impl Retry {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }
}

impl Middleware for Retry {
    fn wrap(&self, next: Handler) -> Handler {
        let Retry { max_retries, delay } = *self;
        Arc::new(move |delivery: Delivery| {
            let next = next.clone();
            async move {
                let err = match next(delivery.clone()).await {
                    Ok(()) => return Ok(()),
                    Err(err) => err,
                };
                if delivery.is_settled() {
                    return Err(err);
                }
                if !err.is_retryable() {
                    warn!(
                        "message {} from queue '{}' can not be retried: {}",
                        delivery.delivery_tag(),
                        delivery.queue(),
                        err
                    );
                    delivery.nack(false).await?;
                    return Err(err);
                }
                let retries = delivery.retry_count();
                if retries >= max_retries {
                    warn!(
                        "message {} from queue '{}' exhausted {} retries: {}",
                        delivery.delivery_tag(),
                        delivery.queue(),
                        max_retries,
                        err
                    );
                    delivery.nack(false).await?;
                    return Err(Error::RetryExhausted {
                        attempts: retries + 1,
                        last_error: err.to_string(),
                    });
                }

                info!(
                    "retrying message {} from queue '{}' (attempt {}/{}): {}",
                    delivery.delivery_tag(),
                    delivery.queue(),
                    retries + 1,
                    max_retries,
                    err
                );
                if !delay.is_zero() {
                    time::sleep(delay).await;
                }
                republish(&delivery, retries + 1).await?;
                Ok(())
            }
            .boxed()
        })
    }
}

async fn republish(delivery: &Delivery, retry_count: u32) -> Result<()> {
    let mut properties = delivery.properties().clone();
    let headers = properties.headers.get_or_insert_with(FieldTable::new);
    set_header(headers, HEADER_RETRY_COUNT, FieldValue::l(i64::from(retry_count)))?;
    if header_str(Some(&*headers), HEADER_ORIGINAL_ROUTING_KEY).is_none() {
        set_header(
            headers,
            HEADER_ORIGINAL_ROUTING_KEY,
            string_value(delivery.routing_key())?,
        )?;
    }
    delivery
        .channel()
        .publish(
            DEFAULT_EXCHANGE,
            delivery.queue(),
            properties,
            delivery.body().to_vec(),
        )
        .await
}

/////////////////////////////////////////////////////////////////////////////
/// Admit at most `per_second` deliveries per second across every handler it wraps.
#[derive(Clone)]
pub struct RateLimit {
    period: Duration,
    ticker: Arc<tokio::sync::Mutex<Option<Interval>>>,
}

impl RateLimit {
    /// A rate of zero is treated as one per second.
    pub fn new(per_second: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / per_second.max(1),
            ticker: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Middleware for RateLimit {
    fn wrap(&self, next: Handler) -> Handler {
        let limiter = self.clone();
        Arc::new(move |delivery: Delivery| {
            let next = next.clone();
            let limiter = limiter.clone();
            async move {
                {
                    let mut ticker = limiter.ticker.lock().await;
                    ticker
                        .get_or_insert_with(|| {
                            let mut interval = time::interval(limiter.period);
                            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            interval
                        })
                        .tick()
                        .await;
                }
                next(delivery).await
            }
            .boxed()
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Outcome of [`MessageStore::try_begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller now holds the key.
    Acquired,
    /// The key was processed within the TTL.
    Processed,
    /// Another worker holds the key.
    InFlight,
}

/// Remembers which messages have been processed.
///
/// Implementations must check the processed entries and take the claim atomically,
/// and record the outcome and release the claim atomically.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn try_begin(&self, id: &str) -> Claim;

    /// Release a claim taken with [`MessageStore::try_begin`], marking the key
    /// processed when `processed`.
    async fn end(&self, id: &str, processed: bool);
}

/// Process-local [`MessageStore`] whose entries expire after a TTL.
pub struct InMemoryMessageStore {
    ttl: Duration,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    processed: HashMap<String, Instant>,
    in_flight: HashSet<String>,
}

impl InMemoryMessageStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn is_processed(&self, id: &str) -> bool {
        let ttl = self.ttl;
        self.state()
            .processed
            .get(id)
            .map_or(false, |at| at.elapsed() < ttl)
    }

    /// Live processed entries.
    pub fn len(&self) -> usize {
        let ttl = self.ttl;
        self.state()
            .processed
            .values()
            .filter(|at| at.elapsed() < ttl)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn try_begin(&self, id: &str) -> Claim {
        let ttl = self.ttl;
        let mut state = self.state();
        if state.processed.get(id).map_or(false, |at| at.elapsed() < ttl) {
            return Claim::Processed;
        }
        if state.in_flight.insert(id.to_owned()) {
            Claim::Acquired
        } else {
            Claim::InFlight
        }
    }

    async fn end(&self, id: &str, processed: bool) {
        let ttl = self.ttl;
        let mut state = self.state();
        if processed {
            state.processed.retain(|_, at| at.elapsed() < ttl);
            state.processed.insert(id.to_owned(), Instant::now());
        }
        state.in_flight.remove(id);
    }
}

/// Skip handlers for messages already processed successfully.
///
/// The key is the message id, else the correlation id, else the routing key with the
/// publish timestamp, else the routing key with the delivery tag. A message is marked
/// processed only after its handler succeeded. A copy arriving while another worker
/// still processes the same key fails with [`Error::DuplicateInFlight`], so it is
/// requeued and skipped on redelivery once the first one succeeded.
#[derive(Clone)]
pub struct Deduplication {
    store: Arc<dyn MessageStore>,
}

impl Deduplication {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Deduplicate with an [`InMemoryMessageStore`].
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(InMemoryMessageStore::new(ttl)))
    }
}

pub fn deduplication_key(delivery: &Delivery) -> String {
    if let Some(id) = delivery.message_id().filter(|id| !id.is_empty()) {
        return id.to_owned();
    }
    if let Some(id) = delivery.correlation_id().filter(|id| !id.is_empty()) {
        return id.to_owned();
    }
    match delivery.timestamp() {
        Some(timestamp) => format!("{}_{}", delivery.routing_key(), timestamp),
        None => format!("{}#{}", delivery.routing_key(), delivery.delivery_tag()),
    }
}

impl Middleware for Deduplication {
    fn wrap(&self, next: Handler) -> Handler {
        let store = self.store.clone();
        Arc::new(move |delivery: Delivery| {
            let next = next.clone();
            let store = store.clone();
            async move {
                let key = deduplication_key(&delivery);
                match store.try_begin(&key).await {
                    Claim::Acquired => {}
                    Claim::Processed => {
                        debug!("duplicate message detected, skipping: {}", key);
                        return Ok(());
                    }
                    Claim::InFlight => return Err(Error::DuplicateInFlight(key)),
                }
                let outcome = AssertUnwindSafe(next(delivery)).catch_unwind().await;
                store.end(&key, matches!(outcome, Ok(Ok(())))).await;
                match outcome {
                    Ok(result) => result,
                    Err(panic) => panic::resume_unwind(panic),
                }
            }
            .boxed()
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
type Validator = dyn Fn(&Delivery) -> std::result::Result<(), String> + Send + Sync;

/// Reject deliveries failing a predicate.
///
/// A rejected delivery is not requeued, it could never pass on redelivery, and the
/// handler fails with [`Error::ValidationFailed`].
#[derive(Clone)]
pub struct Validation {
    validator: Arc<Validator>,
}

impl Validation {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&Delivery) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
        }
    }
}

impl Middleware for Validation {
    fn wrap(&self, next: Handler) -> Handler {
        let validator = self.validator.clone();
        Arc::new(move |delivery: Delivery| {
            let next = next.clone();
            let verdict = validator(&delivery);
            async move {
                if let Err(reason) = verdict {
                    warn!(
                        "message {} from queue '{}' failed validation: {}",
                        delivery.delivery_tag(),
                        delivery.queue(),
                        reason
                    );
                    if !delivery.is_settled() {
                        delivery.nack(false).await?;
                    }
                    return Err(Error::ValidationFailed(reason));
                }
                next(delivery).await
            }
            .boxed()
        })
    }
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use futures::future::BoxFuture;

    use super::{
        deduplication_key, handler_fn, Claim, Deduplication, Handler, InMemoryMessageStore,
        Logging, MessageStore, MiddlewareChain, RateLimit, Recovery, Retry, Timeout, Validation,
    };
    use crate::broker::{memory::MemoryBroker, Broker, BrokerChannel, QueueDeclaration};
    use crate::config::Config;
    use crate::delivery::Delivery;
    use crate::error::Error;
    use crate::message::{set_header, string_value, FieldTable, Message};
    use crate::test_utils::setup_logging;
    use crate::Result;

    struct Fixture {
        broker: MemoryBroker,
        channel: Arc<dyn BrokerChannel>,
    }

    impl Fixture {
        async fn new() -> Self {
            let broker = MemoryBroker::new();
            let link = broker.connect(&Config::new("amqp://memory")).await.unwrap();
            let channel = link.open_channel().await.unwrap();
            channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
            Self { broker, channel }
        }

        async fn send(&self, message: Message) {
            let (body, properties) = message.encode().unwrap();
            self.channel.publish("", "q", properties, body).await.unwrap();
        }

        async fn next(&self) -> Delivery {
            let raw = self.channel.get("q", false).await.unwrap().unwrap();
            Delivery::new(raw, "q", self.channel.clone(), false)
        }
    }

    fn counting(counter: Arc<AtomicUsize>, fail: bool) -> Handler {
        handler_fn(move |_delivery| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::handler("boom"))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test]
    async fn test_chain_order() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let tag = |name: &'static str, trail: Arc<Mutex<Vec<String>>>| {
            move |next: Handler| -> Handler {
                let trail = trail.clone();
                handler_fn(move |delivery| {
                    let next = next.clone();
                    let trail = trail.clone();
                    async move {
                        trail.lock().unwrap().push(format!("{} in", name));
                        let result = next(delivery).await;
                        trail.lock().unwrap().push(format!("{} out", name));
                        result
                    }
                })
            }
        };
        let chain = MiddlewareChain::new()
            .with(tag("outer", trail.clone()))
            .with(tag("inner", trail.clone()));
        assert_eq!(2, chain.len());

        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "x")).await;
        let handler = chain.then(handler_fn(|_| async { Ok(()) }));
        handler(fixture.next().await).await.unwrap();
        assert_eq!(
            vec!["outer in", "inner in", "inner out", "outer out"],
            *trail.lock().unwrap()
        );
    }

    #[tokio::test]
    async fn test_recovery_catches_panics() {
        setup_logging();
        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "x")).await;
        fixture.send(Message::new("q", "y")).await;

        let sync_panic: Handler =
            Arc::new(|_delivery: Delivery| -> BoxFuture<'static, Result<()>> {
                panic!("before the future")
            });
        let handler = MiddlewareChain::new().with(Recovery).then(sync_panic);
        let result = handler(fixture.next().await).await;
        assert!(matches!(result, Err(Error::PanicRecovered(m)) if m == "before the future"));

        let async_panic = handler_fn(|_delivery| async {
            tokio::task::yield_now().await;
            panic!("inside the future {}", 42)
        });
        let handler = MiddlewareChain::new()
            .with(Recovery)
            .with(Logging)
            .then(async_panic);
        let result = handler(fixture.next().await).await;
        assert!(matches!(result, Err(Error::PanicRecovered(m)) if m == "inside the future 42"));
    }

    #[tokio::test]
    async fn test_timeout_abandons_slow_handler() {
        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "x")).await;
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let slow = handler_fn(move |_delivery| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let handler = MiddlewareChain::new()
            .with(Timeout::new(Duration::from_millis(50)))
            .then(slow);

        let started = Instant::now();
        let result = handler(fixture.next().await).await;
        assert!(matches!(result, Err(Error::ProcessingTimeout(_))));
        assert!(started.elapsed() < Duration::from_millis(250));

        // the abandoned call still runs to completion
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(1, finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_forwards_panics_to_recovery() {
        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "x")).await;
        let handler = MiddlewareChain::new()
            .with(Recovery)
            .with(Timeout::new(Duration::from_secs(1)))
            .then(handler_fn(|_delivery| async { panic!("in task") }));
        let result = handler(fixture.next().await).await;
        assert!(matches!(result, Err(Error::PanicRecovered(m)) if m == "in task"));
    }

    #[tokio::test]
    async fn test_retry_republishes_then_exhausts() {
        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "x")).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = MiddlewareChain::new()
            .with(Retry::new(2, Duration::ZERO))
            .then(counting(calls.clone(), true));

        let first = fixture.next().await;
        handler(first.clone()).await.unwrap();
        assert!(!first.is_settled());
        first.ack().await.unwrap();

        let second = fixture.next().await;
        assert_eq!(1, second.retry_count());
        assert_eq!("q", second.original_routing_key());
        handler(second.clone()).await.unwrap();
        second.ack().await.unwrap();

        let third = fixture.next().await;
        assert_eq!(2, third.retry_count());
        let result = handler(third.clone()).await;
        assert!(matches!(
            result,
            Err(Error::RetryExhausted { attempts: 3, .. })
        ));
        assert!(third.is_settled());
        assert_eq!(3, calls.load(Ordering::SeqCst));
        assert_eq!(Some(0), fixture.broker.queue_depth("q"));
        assert_eq!(0, fixture.broker.unacked("q"));
    }

    #[tokio::test]
    async fn test_retry_keeps_first_routing_key() {
        let fixture = Fixture::new().await;
        let mut headers = FieldTable::new();
        set_header(
            &mut headers,
            "x-original-routing-key",
            string_value("orders.created").unwrap(),
        )
        .unwrap();
        fixture
            .send(Message::new("q", "x").with_headers(headers).finish())
            .await;
        let handler = MiddlewareChain::new()
            .with(Retry::new(1, Duration::from_millis(10)))
            .then(counting(Arc::new(AtomicUsize::new(0)), true));
        handler(fixture.next().await).await.unwrap();
        let retried = fixture.next().await;
        assert_eq!("orders.created", retried.original_routing_key());
    }

    #[tokio::test]
    async fn test_retry_leaves_settled_deliveries_alone() {
        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "")).await;
        let checks = Arc::new(AtomicUsize::new(0));
        let counter = checks.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = MiddlewareChain::new()
            .with(Retry::new(2, Duration::ZERO))
            .with(Validation::new(move |_delivery: &Delivery| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("always invalid".to_string())
            }))
            .then(counting(calls.clone(), false));

        let delivery = fixture.next().await;
        let result = handler(delivery.clone()).await;
        assert!(matches!(result, Err(Error::ValidationFailed(_))));
        assert!(delivery.is_settled());
        assert_eq!(1, checks.load(Ordering::SeqCst));
        assert_eq!(0, calls.load(Ordering::SeqCst));
        assert_eq!(Some(0), fixture.broker.queue_depth("q"));
        assert_eq!(0, fixture.broker.unacked("q"));
    }

    #[tokio::test]
    async fn test_retry_rejects_permanent_errors() {
        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "x")).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = MiddlewareChain::new()
            .with(Retry::new(3, Duration::ZERO))
            .then(handler_fn(move |_delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::InvalidMessage("not json".to_string()))
                }
            }));

        let delivery = fixture.next().await;
        let result = handler(delivery.clone()).await;
        assert!(matches!(result, Err(Error::InvalidMessage(_))));
        assert!(delivery.is_settled());
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(Some(0), fixture.broker.queue_depth("q"));
        assert_eq!(0, fixture.broker.unacked("q"));
    }

    #[tokio::test]
    async fn test_rate_limit_spaces_calls() {
        let fixture = Fixture::new().await;
        for _ in 0..3 {
            fixture.send(Message::new("q", "x")).await;
        }
        let limit = RateLimit::new(20);
        assert_eq!(Duration::from_millis(50), limit.period());
        let handler = MiddlewareChain::new()
            .with(limit)
            .then(handler_fn(|_| async { Ok(()) }));

        let started = Instant::now();
        for _ in 0..3 {
            handler(fixture.next().await).await.unwrap();
        }
        // the first tick is immediate
        assert!(started.elapsed() >= Duration::from_millis(95));
        assert_eq!(Duration::from_secs(1), RateLimit::new(0).period());
    }

    #[tokio::test]
    async fn test_deduplication_skips_processed_ids() {
        let fixture = Fixture::new().await;
        for _ in 0..2 {
            fixture
                .send(Message::new("q", "x").with_message_id("m-1").finish())
                .await;
        }
        let store = Arc::new(InMemoryMessageStore::new(Duration::from_secs(3600)));
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = MiddlewareChain::new()
            .with(Deduplication::new(store.clone()))
            .then(counting(calls.clone(), false));

        handler(fixture.next().await).await.unwrap();
        handler(fixture.next().await).await.unwrap();
        assert_eq!(1, calls.load(Ordering::SeqCst));
        assert_eq!(1, store.len());
    }

    #[tokio::test]
    async fn test_deduplication_marks_only_successes() {
        let fixture = Fixture::new().await;
        for _ in 0..2 {
            fixture
                .send(Message::new("q", "x").with_message_id("m-2").finish())
                .await;
        }
        let store = Arc::new(InMemoryMessageStore::new(Duration::from_secs(3600)));
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = MiddlewareChain::new()
            .with(Deduplication::new(store.clone()))
            .then(counting(calls.clone(), true));
        assert!(failing(fixture.next().await).await.is_err());
        assert!(store.is_empty());
        assert!(failing(fixture.next().await).await.is_err());
        assert_eq!(2, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deduplication_in_flight_and_expiry() {
        let store = InMemoryMessageStore::new(Duration::from_millis(30));
        assert_eq!(Claim::Acquired, store.try_begin("a").await);
        assert_eq!(Claim::InFlight, store.try_begin("a").await);
        store.end("a", false).await;
        assert_eq!(Claim::Acquired, store.try_begin("a").await);

        // finishing a claim and checking for it never interleave
        assert_eq!(Claim::Acquired, store.try_begin("b").await);
        store.end("b", true).await;
        assert_eq!(Claim::Processed, store.try_begin("b").await);
        assert!(store.is_processed("b"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.is_processed("b"));
        assert_eq!(Claim::Acquired, store.try_begin("b").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_deduplication_concurrent_copies_run_once() {
        let fixture = Fixture::new().await;
        for _ in 0..8 {
            fixture
                .send(Message::new("q", "x").with_message_id("m-3").finish())
                .await;
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = MiddlewareChain::new()
            .with(Deduplication::in_memory(Duration::from_secs(3600)))
            .then(handler_fn(move |_delivery| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            }));

        let mut copies = Vec::new();
        for _ in 0..8 {
            copies.push(fixture.next().await);
        }
        let tasks: Vec<_> = copies
            .iter()
            .cloned()
            .map(|delivery| tokio::spawn(handler(delivery)))
            .collect();
        let mut in_flight = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => {}
                Err(Error::DuplicateInFlight(key)) => {
                    assert_eq!("m-3", key);
                    in_flight += 1;
                }
                Err(err) => panic!("unexpected error: {}", err),
            }
        }
        assert_eq!(1, calls.load(Ordering::SeqCst));

        // copies bounced while in flight are skipped once processed
        assert!(in_flight > 0);
        for delivery in copies {
            handler(delivery).await.unwrap();
        }
        assert_eq!(1, calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deduplication_key_fallbacks() {
        let fixture = Fixture::new().await;
        fixture
            .send(Message::new("q", "x").with_message_id("id").finish())
            .await;
        fixture
            .send(Message::new("q", "x").with_correlation_id("corr").finish())
            .await;
        fixture
            .send(Message::new("q", "x").with_timestamp(1_700_000_000).finish())
            .await;
        assert_eq!("id", deduplication_key(&fixture.next().await));
        assert_eq!("corr", deduplication_key(&fixture.next().await));
        assert_eq!("q_1700000000", deduplication_key(&fixture.next().await));
    }

    #[tokio::test]
    async fn test_validation_rejects_without_requeue() {
        let fixture = Fixture::new().await;
        fixture.send(Message::new("q", "")).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = MiddlewareChain::new()
            .with(Validation::new(|delivery: &Delivery| {
                if delivery.body().is_empty() {
                    Err("empty body".to_string())
                } else {
                    Ok(())
                }
            }))
            .then(counting(calls.clone(), false));
        let delivery = fixture.next().await;
        let result = handler(delivery.clone()).await;
        assert!(matches!(result, Err(Error::ValidationFailed(r)) if r == "empty body"));
        assert!(delivery.is_settled());
        assert_eq!(0, calls.load(Ordering::SeqCst));
        assert_eq!(Some(0), fixture.broker.queue_depth("q"));
    }
}
