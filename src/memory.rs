// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local transport implementing [`ConnectionFactory`] and [`AmqpChannel`] with
//! the AMQP semantics the listener container relies on:
//!
//! - named FIFO queues, reached through the default exchange
//! - per-channel delivery tags and per-consumer prefetch limits
//! - single and multiple ack/nack, requeued deliveries flagged as redelivered
//! - unacknowledged deliveries requeued when their channel closes
//! - transactional channels deferring acknowledgments until commit
//!
//! It also offers fault injection (refusing channels, severing every open channel) and
//! inspection helpers, which makes it the reference transport for tests.

use crate::{
    channel::{AmqpChannel, ConnectionFactory, DeliveryStream},
    errors::AmqpError,
    message::{Message, MessageProperties},
    template::DEFAULT_EXCHANGE,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: Vec<Weak<ChannelInner>>,
    channel_budget: Option<usize>,
    next_channel_id: u64,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
}

impl BrokerInner {
    fn queue_notify(&self, queue: &str) -> Option<Arc<Notify>> {
        lock(&self.state).queues.get(queue).map(|q| q.notify.clone())
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        lock(&self.state)
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
    }

    /// Puts deliveries back at the head of their queues, preserving their order.
    fn requeue(&self, deliveries: Vec<Unacked>) {
        let mut state = lock(&self.state);
        for unacked in deliveries.into_iter().rev() {
            if let Some(q) = state.queues.get_mut(&unacked.queue) {
                let mut stored = unacked.stored;
                stored.redelivered = true;
                q.ready.push_front(stored);
                q.notify.notify_waiters();
            }
        }
    }
}

/// Reference in-process broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a queue; declaring an existing queue is a no-op.
    pub fn declare_queue(&self, name: &str) {
        lock(&self.inner.state)
            .queues
            .entry(name.to_owned())
            .or_default();
    }

    /// Number of messages ready for delivery on a queue.
    pub fn message_count(&self, queue: &str) -> usize {
        lock(&self.inner.state)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Number of delivered but unsettled messages across all open channels.
    pub fn unacked_count(&self) -> usize {
        self.live_channels()
            .iter()
            .map(|c| lock(&c.state).unacked.len())
            .sum()
    }

    pub fn open_channel_count(&self) -> usize {
        self.live_channels()
            .iter()
            .filter(|c| lock(&c.state).open)
            .count()
    }

    /// Allows `remaining` more channels to be opened, then refuses further ones.
    pub fn refuse_channels_after(&self, remaining: usize) {
        lock(&self.inner.state).channel_budget = Some(remaining);
    }

    /// Lifts a limit set by `refuse_channels_after`.
    pub fn accept_channels(&self) {
        lock(&self.inner.state).channel_budget = None;
    }

    /// Simulates a connection drop: every open channel is closed with an error and its
    /// unacknowledged deliveries are requeued.
    pub fn sever_connections(&self) {
        warn!("severing every open channel");
        for channel in self.live_channels() {
            channel.shutdown(Some("connection reset".to_owned()));
        }
    }

    fn live_channels(&self) -> Vec<Arc<ChannelInner>> {
        let mut state = lock(&self.inner.state);
        state.channels.retain(|c| c.strong_count() > 0);
        state.channels.iter().filter_map(Weak::upgrade).collect()
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = lock(&self.inner.state);
        match state.channel_budget {
            Some(0) => {
                error!("error to create the channel");
                return Err(AmqpError::ChannelError);
            }
            Some(remaining) => state.channel_budget = Some(remaining - 1),
            None => {}
        }

        state.next_channel_id += 1;
        let inner = Arc::new(ChannelInner {
            id: state.next_channel_id,
            broker: self.inner.clone(),
            state: Mutex::new(ChannelState {
                open: true,
                ..ChannelState::default()
            }),
            changed: Notify::new(),
        });
        state.channels.push(Arc::downgrade(&inner));
        debug!(channel = inner.id, "channel created");

        Ok(Arc::new(InMemoryChannel { inner }))
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: Option<String>,
    stored: StoredMessage,
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack { tag: u64, multiple: bool },
    Nack { tag: u64, multiple: bool, requeue: bool },
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    severed: Option<String>,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consumers: HashSet<String>,
    cancelled: HashSet<String>,
    transactional: bool,
    pending_settlements: Vec<Settlement>,
}

impl ChannelState {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open {
            return Ok(());
        }
        Err(AmqpError::ChannelClosed(
            self.severed.clone().unwrap_or_else(|| "closed".to_owned()),
        ))
    }

    fn outstanding_for(&self, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|u| u.consumer_tag.as_deref() == Some(consumer_tag))
            .count()
    }

    /// Removes the deliveries designated by a settlement.
    fn take(&mut self, tag: u64, multiple: bool) -> Option<Vec<Unacked>> {
        if multiple {
            let remaining = self.unacked.split_off(&(tag + 1));
            let taken = std::mem::replace(&mut self.unacked, remaining);
            if taken.is_empty() {
                return None;
            }
            Some(taken.into_values().collect())
        } else {
            self.unacked.remove(&tag).map(|u| vec![u])
        }
    }
}

struct ChannelInner {
    id: u64,
    broker: Arc<BrokerInner>,
    state: Mutex<ChannelState>,
    changed: Notify,
}

impl ChannelInner {
    fn settle(&self, settlement: Settlement) -> Result<(), AmqpError> {
        let requeued = {
            let mut state = lock(&self.state);
            let requeued = match settlement {
                Settlement::Ack { tag, multiple } => {
                    state.take(tag, multiple).ok_or(AmqpError::AckMessageError(tag))?;
                    vec![]
                }
                Settlement::Nack {
                    tag,
                    multiple,
                    requeue,
                } => {
                    let taken = state
                        .take(tag, multiple)
                        .ok_or(AmqpError::NackMessageError(tag))?;
                    if requeue {
                        taken
                    } else {
                        vec![]
                    }
                }
            };
            requeued
        };

        self.broker.requeue(requeued);
        self.changed.notify_waiters();
        Ok(())
    }

    fn shutdown(&self, severed: Option<String>) {
        let unacked = {
            let mut state = lock(&self.state);
            if !state.open {
                return;
            }
            state.open = false;
            state.severed = severed;
            state.pending_settlements.clear();
            std::mem::take(&mut state.unacked)
        };

        debug!(channel = self.id, requeued = unacked.len(), "channel closed");
        self.broker.requeue(unacked.into_values().collect());
        self.changed.notify_waiters();
    }

    async fn next_delivery(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Option<Result<Message, AmqpError>> {
        loop {
            let queue_notify = self.broker.queue_notify(queue)?;
            let queue_changed = queue_notify.notified();
            let channel_changed = self.changed.notified();

            {
                let mut state = lock(&self.state);
                if let Some(reason) = state.severed.take() {
                    return Some(Err(AmqpError::ChannelClosed(reason)));
                }
                if !state.open || state.cancelled.contains(consumer_tag) {
                    return None;
                }

                let saturated = !no_ack
                    && state.prefetch > 0
                    && state.outstanding_for(consumer_tag) >= state.prefetch as usize;

                if !saturated {
                    if let Some(stored) = self.broker.pop(queue) {
                        state.next_tag += 1;
                        let tag = state.next_tag;
                        let msg = Message::new(stored.body.clone(), stored.properties.clone())
                            .delivered(tag, stored.redelivered, &stored.exchange, &stored.routing_key)
                            .from_queue(queue);

                        if !no_ack {
                            state.unacked.insert(
                                tag,
                                Unacked {
                                    queue: queue.to_owned(),
                                    consumer_tag: Some(consumer_tag.to_owned()),
                                    stored,
                                },
                            );
                        }
                        return Some(Ok(msg));
                    }
                }
            }

            tokio::select! {
                _ = queue_changed => {}
                _ = channel_changed => {}
            }
        }
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.open {
            let unacked = std::mem::take(&mut state.unacked);
            self.broker.requeue(unacked.into_values().collect());
        }
    }
}

/// Channel handed out by [`InMemoryBroker`].
pub struct InMemoryChannel {
    inner: Arc<ChannelInner>,
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = lock(&self.inner.state);
        state.ensure_open()?;
        state.prefetch = prefetch_count;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        {
            let mut state = lock(&self.inner.state);
            state.ensure_open()?;
            if self.inner.broker.queue_notify(queue).is_none() {
                error!(queue = queue, "error to create the consumer, queue not found");
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            state.consumers.insert(consumer_tag.to_owned());
        }

        let seed = (
            self.inner.clone(),
            queue.to_owned(),
            consumer_tag.to_owned(),
            false,
        );
        Ok(stream::unfold(seed, move |(inner, queue, tag, done)| async move {
            if done {
                return None;
            }
            let next = inner.next_delivery(&queue, &tag, no_ack).await?;
            let done = next.is_err();
            Some((next, (inner, queue, tag, done)))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        {
            let mut state = lock(&self.inner.state);
            state.ensure_open()?;
            if !state.consumers.remove(consumer_tag) {
                return Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()));
            }
            state.cancelled.insert(consumer_tag.to_owned());
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.settle_or_defer(Settlement::Ack {
            tag: delivery_tag,
            multiple,
        })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.settle_or_defer(Settlement::Nack {
            tag: delivery_tag,
            multiple,
            requeue,
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        lock(&self.inner.state).ensure_open()?;

        if exchange != DEFAULT_EXCHANGE {
            error!(exchange = exchange, "error publishing message, unknown exchange");
            return Err(AmqpError::PublishingError);
        }

        let mut state = lock(&self.inner.broker.state);
        match state.queues.get_mut(routing_key) {
            Some(q) => {
                q.ready.push_back(StoredMessage {
                    body: body.to_vec(),
                    properties: properties.clone(),
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                });
                q.notify.notify_waiters();
            }
            None => debug!(routing_key = routing_key, "unroutable message dropped"),
        }
        Ok(())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Message>, AmqpError> {
        let mut state = lock(&self.inner.state);
        state.ensure_open()?;
        if self.inner.broker.queue_notify(queue).is_none() {
            return Err(AmqpError::GetMessageError(queue.to_owned()));
        }

        let Some(stored) = self.inner.broker.pop(queue) else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let msg = Message::new(stored.body.clone(), stored.properties.clone())
            .delivered(tag, stored.redelivered, &stored.exchange, &stored.routing_key)
            .from_queue(queue);

        if !no_ack {
            state.unacked.insert(
                tag,
                Unacked {
                    queue: queue.to_owned(),
                    consumer_tag: None,
                    stored,
                },
            );
        }
        Ok(Some(msg))
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.inner.state);
        state.ensure_open()?;
        state.transactional = true;
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        let pending = {
            let mut state = lock(&self.inner.state);
            state.ensure_open()?;
            if !state.transactional {
                return Err(AmqpError::TransactionError);
            }
            std::mem::take(&mut state.pending_settlements)
        };

        for settlement in pending {
            self.inner.settle(settlement)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.shutdown(None);
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.inner.state).open
    }
}

impl InMemoryChannel {
    fn settle_or_defer(&self, settlement: Settlement) -> Result<(), AmqpError> {
        {
            let mut state = lock(&self.inner.state);
            state.ensure_open()?;
            if state.transactional {
                state.pending_settlements.push(settlement);
                return Ok(());
            }
        }
        self.inner.settle(settlement)
    }
}
