//! In-process broker.
//!
//! Models the parts of an AMQP 0-9-1 broker the runtime relies on: direct, fanout,
//! topic and delayed-message exchanges, the default exchange, durable message queues
//! with round-robin consumers, per-channel prefetch, unacknowledged tracking and
//! dead-lettering. Closing a channel or a link puts its unacknowledged messages back at
//! the head of their queues with the `redelivered` flag set.
//!
//! Headers exchanges route like fanout, binding arguments are not modelled.
//!
//! The broker outlives its links, so messages survive a reconnect. Tests drive faults
//! with [`MemoryBroker::drop_connections`] and [`MemoryBroker::refuse_connections`].
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use amqp_runtime::{broker::memory::MemoryBroker, Config, Manager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> amqp_runtime::Result<()> {
//! let broker = MemoryBroker::new();
//! let manager = Manager::with_broker(Arc::new(broker.clone()), Config::new("amqp://memory")).await?;
//! manager.publish_to_queue("tasks", &"hello").await?;
//! assert_eq!(Some(1), broker.queue_depth("tasks"));
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    next_channel_id, Broker, BrokerChannel, ExchangeDeclaration, ExchangeKind, Link,
    QueueDeclaration, QueueInfo, RawDelivery, DEFAULT_EXCHANGE, DELAYED_EXCHANGE_TYPE,
};
use crate::config::Config;
use crate::error::Error;
use crate::message::{header_int, header_str, Properties, HEADER_DELAY};
use crate::Result;

/// In-process broker, cloning yields a handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    attempts: AtomicU32,
    refuse: AtomicBool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close every open link as if the network failed.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state();
        let ids: Vec<u64> = state.links.keys().copied().collect();
        for id in ids {
            state.close_link(id);
        }
        warn!("memory broker dropped all connections");
    }

    /// Fail every subsequent connection attempt until called again with `false`.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connection attempts seen so far, refused ones included.
    pub fn connection_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn open_links(&self) -> usize {
        self.inner.state().links.len()
    }

    /// Ready messages of a queue, `None` if the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.inner.state().queues.get(queue).map(|q| q.messages.len())
    }

    /// Messages of a queue delivered but not yet acknowledged.
    pub fn unacked(&self, queue: &str) -> usize {
        self.inner
            .state()
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.inner.state().exchanges.contains_key(exchange)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, config: &Config) -> Result<Arc<dyn Link>> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.refuse.load(Ordering::SeqCst) {
            debug!("memory broker refused connection attempt {}", attempt);
            return Err(Error::Broker("connection refused".to_string()));
        }
        let (closed_tx, closed_rx) = watch::channel(false);
        let id = {
            let mut state = self.inner.state();
            state.next_link += 1;
            let id = state.next_link;
            state.links.insert(id, closed_tx);
            id
        };
        info!("memory broker accepted link {} for {}", id, config.url);
        Ok(Arc::new(MemoryLink {
            id,
            inner: self.inner.clone(),
            closed_rx,
        }))
    }
}

/////////////////////////////////////////////////////////////////////////////
struct MemoryLink {
    id: u64,
    inner: Arc<Inner>,
    closed_rx: watch::Receiver<bool>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.inner.state();
        if !state.links.contains_key(&self.id) {
            return Err(Error::ConnectionClosed);
        }
        let id = next_channel_id();
        state.channels.insert(
            id,
            ChannelState {
                link: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            inner: self.inner.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        !*self.closed_rx.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.state().close_link(self.id);
        Ok(())
    }
}

/////////////////////////////////////////////////////////////////////////////
struct MemoryChannel {
    id: u64,
    inner: Arc<Inner>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.inner.state();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(Error::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.inner.state().channels.contains_key(&self.id)
    }

    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()> {
        let mut state = self.open_state()?;
        if declaration.name.is_empty() {
            return Err(Error::ExchangeDeclarationFailed(
                "the default exchange cannot be declared".to_string(),
            ));
        }
        match state.exchanges.get(&declaration.name) {
            Some(existing) if existing.declaration.kind != declaration.kind => {
                let err = Error::ExchangeDeclarationFailed(format!(
                    "exchange '{}' exists with type {}",
                    declaration.name, existing.declaration.kind
                ));
                state.close_channel(self.id);
                Err(err)
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    declaration.name.clone(),
                    Exchange {
                        declaration: declaration.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<QueueInfo> {
        let mut state = self.open_state()?;
        if declaration.name.is_empty() {
            return Err(Error::QueueDeclarationFailed(
                "server named queues are not supported".to_string(),
            ));
        }
        let queue = state
            .queues
            .entry(declaration.name.clone())
            .or_insert_with(|| QueueState::new(declaration.clone()));
        Ok(queue.info())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo> {
        let mut state = self.open_state()?;
        match state.queues.get(queue) {
            Some(q) => Ok(q.info()),
            None => {
                state.close_channel(self.id);
                Err(Error::QueueNotFound(queue.to_owned()))
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            state.close_channel(self.id);
            return Err(Error::QueueBindFailed(format!("no queue '{}'", queue)));
        }
        let Some(target) = state.exchanges.get_mut(exchange) else {
            state.close_channel(self.id);
            return Err(Error::QueueBindFailed(format!("no exchange '{}'", exchange)));
        };
        let binding = Binding {
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !target.bindings.contains(&binding) {
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(target) = state.exchanges.get_mut(exchange) {
            target
                .bindings
                .retain(|b| !(b.queue == queue && b.routing_key == routing_key));
        }
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        let mut state = self.open_state()?;
        let Some(q) = state.queues.get_mut(queue) else {
            state.close_channel(self.id);
            return Err(Error::QueuePurgeFailed(format!("no queue '{}'", queue)));
        };
        let purged = q.messages.len() as u32;
        q.messages.clear();
        Ok(purged)
    }

    async fn delete_queue(&self, queue: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        let mut state = self.open_state()?;
        let Some(q) = state.queues.get(queue) else {
            // deleting an unknown queue succeeds
            return Ok(0);
        };
        let refusal = if if_unused && !q.consumers.is_empty() {
            Some(format!("queue '{}' in use", queue))
        } else if if_empty && !q.messages.is_empty() {
            Some(format!("queue '{}' not empty", queue))
        } else {
            None
        };
        if let Some(reason) = refusal {
            state.close_channel(self.id);
            return Err(Error::QueueDeleteFailed(reason));
        }
        let deleted = state
            .queues
            .remove(queue)
            .map(|q| q.messages.len() as u32)
            .unwrap_or_default();
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != queue);
        }
        Ok(deleted)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.open_state()?;
        let stored = Stored {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            body: Bytes::from(body),
            redelivered: false,
        };
        if exchange != DEFAULT_EXCHANGE {
            let Some(target) = state.exchanges.get(exchange) else {
                state.close_channel(self.id);
                return Err(Error::ExchangeNotFound(exchange.to_owned()));
            };
            if target.declaration.kind.as_str() == DELAYED_EXCHANGE_TYPE {
                let delay = header_int(stored.properties.headers.as_ref(), HEADER_DELAY)
                    .filter(|d| *d > 0)
                    .map(|d| Duration::from_millis(d as u64));
                if let Some(delay) = delay {
                    let weak = Arc::downgrade(&self.inner);
                    tokio::spawn(deliver_later(weak, delay, stored));
                    return Ok(());
                }
            }
        }
        state.route(stored);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(ch) = state.channels.get_mut(&self.id) {
            ch.prefetch = count;
        }
        state.dispatch_all();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        exclusive: bool,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>> {
        let mut state = self.open_state()?;
        let Some(q) = state.queues.get_mut(queue) else {
            state.close_channel(self.id);
            return Err(Error::QueueNotFound(queue.to_owned()));
        };
        if (exclusive && !q.consumers.is_empty()) || q.consumers.iter().any(|c| c.exclusive) {
            return Err(Error::Broker(format!("queue '{}' in exclusive use", queue)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_owned(),
            channel: self.id,
            auto_ack,
            exclusive,
            tx,
        });
        state.dispatch(queue);
        Ok(rx)
    }

    async fn get(&self, queue: &str, auto_ack: bool) -> Result<Option<RawDelivery>> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            state.close_channel(self.id);
            return Err(Error::QueueNotFound(queue.to_owned()));
        }
        let State {
            queues, channels, ..
        } = &mut *state;
        let Some(q) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(message) = q.messages.pop_front() else {
            return Ok(None);
        };
        let Some(ch) = channels.get_mut(&self.id) else {
            q.messages.push_front(message);
            return Err(Error::ChannelClosed);
        };
        ch.next_tag += 1;
        let raw = message.to_raw(ch.next_tag);
        if !auto_ack {
            ch.unacked.insert(
                ch.next_tag,
                Unacked {
                    queue: queue.to_owned(),
                    message,
                },
            );
        }
        Ok(Some(raw))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.open_state()?;
        match state.settle(self.id, delivery_tag) {
            Some(unacked) => {
                state.dispatch(&unacked.queue);
                Ok(())
            }
            None => {
                state.close_channel(self.id);
                Err(Error::Broker(format!("unknown delivery tag {}", delivery_tag)))
            }
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.open_state()?;
        let Some(Unacked { queue, mut message }) = state.settle(self.id, delivery_tag) else {
            state.close_channel(self.id);
            return Err(Error::Broker(format!("unknown delivery tag {}", delivery_tag)));
        };
        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push_front(message);
            }
        } else {
            state.dead_letter(&queue, message);
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.state().close_channel(self.id);
        Ok(())
    }
}

async fn deliver_later(broker: Weak<Inner>, delay: Duration, message: Stored) {
    tokio::time::sleep(delay).await;
    if let Some(inner) = broker.upgrade() {
        inner.state().route(message);
    }
}

/////////////////////////////////////////////////////////////////////////////
#[derive(Default)]
struct State {
    next_link: u64,
    links: HashMap<u64, watch::Sender<bool>>,
    channels: HashMap<u64, ChannelState>,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, QueueState>,
}

struct ChannelState {
    link: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    message: Stored,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: Properties,
    body: Bytes,
    redelivered: bool,
}

impl Stored {
    fn to_raw(&self, delivery_tag: u64) -> RawDelivery {
        RawDelivery {
            delivery_tag,
            redelivered: self.redelivered,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

struct Exchange {
    declaration: ExchangeDeclaration,
    bindings: Vec<Binding>,
}

impl Exchange {
    /// Routing behaviour, a delayed exchange routes like its `x-delayed-type`.
    fn routing_kind(&self) -> ExchangeKind {
        if self.declaration.kind.as_str() == DELAYED_EXCHANGE_TYPE {
            header_str(Some(&self.declaration.arguments), "x-delayed-type")
                .map(ExchangeKind::from)
                .unwrap_or(ExchangeKind::Direct)
        } else {
            self.declaration.kind.clone()
        }
    }

    fn targets(&self, routing_key: &str) -> Vec<String> {
        let kind = self.routing_kind();
        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            let matched = match kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Direct | ExchangeKind::Custom(_) => {
                    binding.routing_key == routing_key
                }
            };
            if matched && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }
}

#[derive(PartialEq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueueState {
    declaration: QueueDeclaration,
    messages: VecDeque<Stored>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

impl QueueState {
    fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.declaration.name.clone(),
            messages: self.messages.len() as u32,
            consumers: self.consumers.len() as u32,
        }
    }
}

struct ConsumerEntry {
    tag: String,
    channel: u64,
    auto_ack: bool,
    exclusive: bool,
    tx: mpsc::UnboundedSender<RawDelivery>,
}

impl State {
    /// Enqueue a message on every queue its exchange routes it to.
    fn route(&mut self, message: Stored) {
        let targets = if message.exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                Vec::new()
            }
        } else {
            self.exchanges
                .get(&message.exchange)
                .map(|e| e.targets(&message.routing_key))
                .unwrap_or_default()
        };
        if targets.is_empty() {
            debug!(
                "unroutable message dropped: exchange '{}', routing key '{}'",
                message.exchange, message.routing_key
            );
        }
        for target in targets {
            if let Some(q) = self.queues.get_mut(&target) {
                q.messages.push_back(message.clone());
            }
            self.dispatch(&target);
        }
    }

    /// Push ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue: &str) {
        let State {
            queues, channels, ..
        } = self;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        while !q.messages.is_empty() && !q.consumers.is_empty() {
            let count = q.consumers.len();
            let chosen = (0..count)
                .map(|i| (q.next_consumer + i) % count)
                .find(|&idx| {
                    let consumer = &q.consumers[idx];
                    channels.get(&consumer.channel).map_or(false, |ch| {
                        consumer.auto_ack
                            || ch.prefetch == 0
                            || ch.unacked.len() < ch.prefetch as usize
                    })
                });
            let Some(idx) = chosen else {
                break;
            };
            let Some(ch) = channels.get_mut(&q.consumers[idx].channel) else {
                break;
            };
            let Some(message) = q.messages.pop_front() else {
                break;
            };
            ch.next_tag += 1;
            let tag = ch.next_tag;
            let auto_ack = q.consumers[idx].auto_ack;
            if q.consumers[idx].tx.send(message.to_raw(tag)).is_err() {
                // stream receiver dropped, forget the consumer
                let gone = q.consumers.remove(idx);
                debug!("consumer '{}' on queue '{}' went away", gone.tag, queue);
                q.messages.push_front(message);
                continue;
            }
            q.next_consumer = (idx + 1) % count;
            if !auto_ack {
                ch.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_owned(),
                        message,
                    },
                );
            }
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    fn settle(&mut self, channel: u64, delivery_tag: u64) -> Option<Unacked> {
        self.channels
            .get_mut(&channel)
            .and_then(|ch| ch.unacked.remove(&delivery_tag))
    }

    /// Route a rejected message to the queue's dead-letter exchange, if any.
    fn dead_letter(&mut self, queue: &str, mut message: Stored) {
        let Some(q) = self.queues.get(queue) else {
            return;
        };
        let arguments = Some(&q.declaration.arguments);
        let Some(exchange) = header_str(arguments, "x-dead-letter-exchange") else {
            debug!("message rejected from '{}' discarded", queue);
            return;
        };
        if let Some(key) = header_str(arguments, "x-dead-letter-routing-key") {
            message.routing_key = key.to_owned();
        }
        message.exchange = exchange.to_owned();
        message.redelivered = false;
        self.route(message);
    }

    /// Close a channel: cancel its consumers and requeue its unacknowledged messages.
    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        for q in self.queues.values_mut() {
            q.consumers.retain(|c| c.channel != id);
            q.next_consumer = 0;
        }
        // reverse tag order keeps the original order at the head of each queue
        for (_, Unacked { queue, mut message }) in channel.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.messages.push_front(message);
            }
        }
        self.dispatch_all();
    }

    fn close_link(&mut self, id: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.link == id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        if let Some(closed) = self.links.remove(&id) {
            closed.send_replace(true);
        }
    }
}

/// AMQP topic matching: `*` matches one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{topic_matches, MemoryBroker};
    use crate::broker::{
        Broker, BrokerChannel, ExchangeDeclaration, ExchangeKind, Link, QueueDeclaration,
    };
    use crate::config::Config;
    use crate::error::Error;
    use crate::message::{set_header, string_value, FieldTable, FieldValue, Properties};

    async fn open(broker: &MemoryBroker) -> (Arc<dyn Link>, Arc<dyn BrokerChannel>) {
        let link = broker.connect(&Config::new("amqp://memory")).await.unwrap();
        let channel = link.open_channel().await.unwrap();
        (link, channel)
    }

    async fn publish(channel: &Arc<dyn BrokerChannel>, exchange: &str, key: &str, body: &str) {
        channel
            .publish(exchange, key, Properties::default(), body.as_bytes().to_vec())
            .await
            .unwrap();
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("orders.*", "orders.created"));
        assert!(!topic_matches("orders.*", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders.created.eu"));
        assert!(topic_matches("orders.#", "orders"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.created", "users.created"));
        assert!(!topic_matches("*.created", "created"));
    }

    #[tokio::test]
    async fn test_default_exchange_and_get() {
        let broker = MemoryBroker::new();
        let (_link, channel) = open(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();

        publish(&channel, "", "q", "one").await;
        publish(&channel, "", "missing", "dropped").await;
        assert_eq!(Some(1), broker.queue_depth("q"));

        let delivery = channel.get("q", false).await.unwrap().unwrap();
        assert_eq!(&b"one"[..], &delivery.body[..]);
        assert!(!delivery.redelivered);
        assert_eq!(1, broker.unacked("q"));

        channel.nack(delivery.delivery_tag, true).await.unwrap();
        let again = channel.get("q", true).await.unwrap().unwrap();
        assert!(again.redelivered);
        assert!(channel.get("q", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exchange_routing() {
        let broker = MemoryBroker::new();
        let (_link, channel) = open(&broker).await;
        let topic = ExchangeDeclaration::new("events", ExchangeKind::Topic);
        channel.declare_exchange(&topic).await.unwrap();
        for q in ["all", "orders"] {
            channel.declare_queue(&QueueDeclaration::new(q)).await.unwrap();
        }
        channel.bind_queue("all", "events", "#").await.unwrap();
        channel.bind_queue("orders", "events", "orders.*").await.unwrap();

        publish(&channel, "events", "orders.created", "a").await;
        publish(&channel, "events", "users.created", "b").await;
        assert_eq!(Some(2), broker.queue_depth("all"));
        assert_eq!(Some(1), broker.queue_depth("orders"));

        channel.unbind_queue("all", "events", "#").await.unwrap();
        publish(&channel, "events", "orders.created", "c").await;
        assert_eq!(Some(2), broker.queue_depth("all"));
        assert_eq!(Some(2), broker.queue_depth("orders"));

        // redeclaring with another type is refused and closes the channel
        let direct = ExchangeDeclaration::new("events", ExchangeKind::Direct);
        assert!(matches!(
            channel.declare_exchange(&direct).await,
            Err(Error::ExchangeDeclarationFailed(_))
        ));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_closes_channel() {
        let broker = MemoryBroker::new();
        let (link, channel) = open(&broker).await;
        let result = channel
            .publish("nowhere", "k", Properties::default(), Vec::new())
            .await;
        assert!(matches!(result, Err(Error::ExchangeNotFound(_))));
        assert!(!channel.is_open());
        assert!(matches!(
            channel.publish("", "k", Properties::default(), Vec::new()).await,
            Err(Error::ChannelClosed)
        ));
        // the link is not affected
        assert!(link.is_open());
        assert!(link.open_channel().await.is_ok());
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked() {
        let broker = MemoryBroker::new();
        let (_link, channel) = open(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        for i in 0..5 {
            publish(&channel, "", "q", &i.to_string()).await;
        }
        channel.set_prefetch(2).await.unwrap();
        let mut rx = channel.consume("q", "ctag", false, false).await.unwrap();

        let first = rx.recv().await.unwrap();
        let _second = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(2, broker.unacked("q"));
        assert_eq!(Some(3), broker.queue_depth("q"));

        channel.ack(first.delivery_tag).await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(&b"2"[..], &third.body[..]);

        // a second ack of the same tag is a protocol error
        assert!(channel.ack(first.delivery_tag).await.is_err());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_link_drop_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (link, channel) = open(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        publish(&channel, "", "q", "first").await;
        publish(&channel, "", "q", "second").await;
        let mut rx = channel.consume("q", "ctag", false, false).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        broker.drop_connections();
        link.closed().await;
        assert!(!link.is_open());
        assert!(rx.recv().await.is_none());
        assert_eq!(Some(2), broker.queue_depth("q"));

        let (_link, channel) = open(&broker).await;
        let delivery = channel.get("q", true).await.unwrap().unwrap();
        assert_eq!(&b"first"[..], &delivery.body[..]);
        assert!(delivery.redelivered);
    }

    #[tokio::test]
    async fn test_refused_connections_are_counted() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        assert!(broker.connect(&Config::new("amqp://memory")).await.is_err());
        broker.refuse_connections(false);
        assert!(broker.connect(&Config::new("amqp://memory")).await.is_ok());
        assert_eq!(2, broker.connection_attempts());
        assert_eq!(1, broker.open_links());
    }

    #[tokio::test]
    async fn test_dead_letter_on_reject() {
        let broker = MemoryBroker::new();
        let (_link, channel) = open(&broker).await;
        let dlx = ExchangeDeclaration::new("dlx", ExchangeKind::Fanout);
        channel.declare_exchange(&dlx).await.unwrap();
        channel.declare_queue(&QueueDeclaration::new("dead")).await.unwrap();
        channel.bind_queue("dead", "dlx", "").await.unwrap();

        let mut arguments = FieldTable::new();
        set_header(&mut arguments, "x-dead-letter-exchange", string_value("dlx").unwrap())
            .unwrap();
        let work = QueueDeclaration::new("work").arguments(arguments).finish();
        channel.declare_queue(&work).await.unwrap();

        publish(&channel, "", "work", "poison").await;
        let delivery = channel.get("work", false).await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();
        assert_eq!(Some(0), broker.queue_depth("work"));
        assert_eq!(Some(1), broker.queue_depth("dead"));
    }

    #[tokio::test]
    async fn test_delayed_exchange() {
        let broker = MemoryBroker::new();
        let (_link, channel) = open(&broker).await;
        let delayed = ExchangeDeclaration::delayed("delayed", &ExchangeKind::Direct).unwrap();
        channel.declare_exchange(&delayed).await.unwrap();
        channel.declare_queue(&QueueDeclaration::new("later")).await.unwrap();
        channel.bind_queue("later", "delayed", "later").await.unwrap();

        let mut headers = FieldTable::new();
        set_header(&mut headers, "x-delay", FieldValue::l(50)).unwrap();
        let properties = Properties {
            headers: Some(headers),
            ..Default::default()
        };
        channel
            .publish("delayed", "later", properties, b"tick".to_vec())
            .await
            .unwrap();
        assert_eq!(Some(0), broker.queue_depth("later"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(Some(1), broker.queue_depth("later"));
    }

    #[tokio::test]
    async fn test_delete_queue_guards() {
        let broker = MemoryBroker::new();
        let (link, channel) = open(&broker).await;
        channel.declare_queue(&QueueDeclaration::new("q")).await.unwrap();
        publish(&channel, "", "q", "x").await;
        assert!(matches!(
            channel.delete_queue("q", false, true).await,
            Err(Error::QueueDeleteFailed(_))
        ));
        let channel = link.open_channel().await.unwrap();
        assert_eq!(1, channel.delete_queue("q", true, false).await.unwrap());
        assert_eq!(None, broker.queue_depth("q"));
        assert_eq!(0, channel.delete_queue("q", false, false).await.unwrap());
    }
}
