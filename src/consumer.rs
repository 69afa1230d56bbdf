// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Consumer
//!
//! A [`Consumer`] is one concurrency slot of the listener container. It owns a channel
//! and the subscriptions opened on it, and runs the pull/dispatch/acknowledge loop:
//!
//! 1. Pulls the next delivery, or observes the stop signal
//! 2. Dispatches it to the bound listener through the `ListenerAdapter`
//! 3. On success, applies the acknowledge mode (batched acks in `Auto` mode)
//! 4. On failure, hands the failure to the `ErrorHandler` exactly once and keeps going
//!
//! Listener failures never leave the loop. Transport failures end the run and are
//! reported to the container, which decides whether to restart the slot.

use crate::{
    adapter::ListenerAdapter,
    channel::{AmqpChannel, DeliveryStream},
    config::{AcknowledgeMode, ListenerContainerConfig},
    error_handler::{ErrorHandler, ListenerExecutionFailed},
    errors::AmqpError,
    message::Message,
    otel,
};
use futures_util::{stream::select_all, FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// State shared read-only by every consumer of a container.
pub(crate) struct ConsumerSettings {
    pub(crate) config: ListenerContainerConfig,
    pub(crate) adapter: ListenerAdapter,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumerState {
    Idle,
    Pulling,
    Dispatching,
    AckPending,
    Stopped,
}

/// Why a consumer run ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConsumerExit {
    /// The container asked the consumer to stop
    Stopped,
    /// The channel or the subscription failed
    TransportFailure(AmqpError),
}

enum Pulled {
    Stop,
    Delivery(Option<Result<Message, AmqpError>>),
    Idle,
}

pub(crate) struct Consumer {
    index: usize,
    channel: Arc<dyn AmqpChannel>,
    deliveries: DeliveryStream,
    consumer_tags: Vec<String>,
    settings: Arc<ConsumerSettings>,
    tracer: BoxedTracer,
    state: ConsumerState,
    pending_acks: u16,
    last_tag: Option<u64>,
}

impl Consumer {
    /// Prepares the channel and subscribes to every configured queue.
    ///
    /// Sets the prefetch window unless acknowledgments are off, selects transactions on
    /// transacted channels and opens one subscription per queue, tagged `<queue>-<uuid>`.
    ///
    /// # Parameters
    /// * `index` - Slot of the consumer in its container, used in logs
    /// * `channel` - Channel the consumer owns from now on
    /// * `settings` - Configuration, listener and error handler shared by the container
    ///
    /// # Returns
    /// The consumer ready to run, or AmqpError if the channel could not be prepared. On
    /// error the channel is left for the caller to close.
    pub(crate) async fn start(
        index: usize,
        channel: Arc<dyn AmqpChannel>,
        settings: Arc<ConsumerSettings>,
    ) -> Result<Consumer, AmqpError> {
        let cfg = &settings.config;
        let no_ack = !cfg.ack_mode.is_acking();

        if !no_ack {
            channel.basic_qos(cfg.prefetch_count).await?;
        }
        if cfg.channel_transacted {
            channel.tx_select().await?;
        }

        let mut streams = Vec::with_capacity(cfg.queue_names.len());
        let mut consumer_tags = Vec::with_capacity(cfg.queue_names.len());
        for queue in &cfg.queue_names {
            let tag = format!("{}-{}", queue, Uuid::new_v4());
            streams.push(channel.consume(queue, &tag, no_ack).await?);
            debug!(consumer = index, queue = queue.as_str(), tag = tag.as_str(), "subscribed");
            consumer_tags.push(tag);
        }

        Ok(Consumer {
            index,
            channel,
            deliveries: select_all(streams).boxed(),
            consumer_tags,
            settings,
            tracer: global::tracer(otel::CONSUMER_TRACER),
            state: ConsumerState::Idle,
            pending_acks: 0,
            last_tag: None,
        })
    }

    pub(crate) fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel.clone()
    }

    /// Runs the consumer loop until a stop is requested or the transport fails, then
    /// releases the channel.
    ///
    /// # Parameters
    /// * `stop` - Receiver flipped to `true` when the container stops
    ///
    /// # Returns
    /// ConsumerExit::Stopped after a requested stop, with buffered deliveries dispatched
    /// and pending acks flushed, or ConsumerExit::TransportFailure when the channel or a
    /// subscription failed
    pub(crate) async fn run(mut self, mut stop: watch::Receiver<bool>) -> ConsumerExit {
        debug!(consumer = self.index, "consumer started");

        let exit = match self.consume_loop(&mut stop).await {
            ConsumerExit::Stopped => match self.drain().await {
                Ok(()) => ConsumerExit::Stopped,
                Err(err) => ConsumerExit::TransportFailure(err),
            },
            failure => failure,
        };

        if let Err(err) = self.channel.close().await {
            warn!(consumer = self.index, error = err.to_string(), "failure to close channel");
        }
        self.transition(ConsumerState::Stopped);
        debug!(consumer = self.index, exit = ?exit, "consumer stopped");

        exit
    }

    async fn consume_loop(&mut self, stop: &mut watch::Receiver<bool>) -> ConsumerExit {
        let receive_timeout = self.settings.config.receive_timeout_duration();

        loop {
            self.transition(ConsumerState::Pulling);
            let flush_due = self.pending_acks > 0;

            let pulled = tokio::select! {
                biased;
                _ = stop_requested(stop) => Pulled::Stop,
                next = self.deliveries.next() => Pulled::Delivery(next),
                _ = tokio::time::sleep(receive_timeout), if flush_due => Pulled::Idle,
            };

            let result = match pulled {
                Pulled::Stop => return ConsumerExit::Stopped,
                Pulled::Idle => self.commit_acks().await,
                Pulled::Delivery(Some(Ok(message))) => self.process(message).await,
                Pulled::Delivery(Some(Err(err))) => Err(err),
                Pulled::Delivery(None) => Err(AmqpError::ConsumerCancelled),
            };

            if let Err(err) = result {
                warn!(consumer = self.index, error = err.to_string(), "transport failure");
                return ConsumerExit::TransportFailure(err);
            }
        }
    }

    /// Cancels the subscriptions, dispatches deliveries already received and settles
    /// pending acknowledgments.
    async fn drain(&mut self) -> Result<(), AmqpError> {
        for tag in &self.consumer_tags {
            if let Err(err) = self.channel.cancel(tag).await {
                warn!(consumer = self.index, error = err.to_string(), "failure to cancel consumer");
            }
        }

        while let Some(Some(Ok(message))) = self.deliveries.next().now_or_never() {
            self.process(message).await?;
        }

        self.commit_acks().await
    }

    async fn process(&mut self, message: Message) -> Result<(), AmqpError> {
        self.transition(ConsumerState::Dispatching);

        let tag = message.delivery_tag();
        let queue = message.consumer_queue().unwrap_or_default().to_owned();
        let (_ctx, mut span) = otel::new_span(message.properties().headers(), &self.tracer, &queue);
        debug!(consumer = self.index, delivery_tag = tag, queue = queue.as_str(), "received");

        let outcome = self
            .settings
            .adapter
            .dispatch(&message, self.channel.as_ref())
            .await;

        match outcome {
            Ok(()) => {
                debug!(consumer = self.index, delivery_tag = tag, "message successfully processed");
                span.set_status(Status::Ok);
                self.on_success(tag).await
            }
            Err(cause) => {
                span.record_error(&cause);
                span.set_status(Status::error(cause.to_string()));

                let failure = ListenerExecutionFailed::new(message, cause);
                self.settings.error_handler.handle_error(&failure);
                self.on_failure(tag).await
            }
        }
    }

    async fn on_success(&mut self, tag: u64) -> Result<(), AmqpError> {
        if self.settings.config.ack_mode != AcknowledgeMode::Auto {
            return self.commit_listener_settlements().await;
        }

        self.pending_acks += 1;
        self.last_tag = Some(tag);
        self.transition(ConsumerState::AckPending);

        if self.pending_acks >= self.settings.config.commit_batch_size {
            self.commit_acks().await?;
        }
        Ok(())
    }

    /// A failed delivery closes the current batch: the successes before it are acked and
    /// the failed one is rejected, requeued or not depending on configuration.
    async fn on_failure(&mut self, tag: u64) -> Result<(), AmqpError> {
        if self.settings.config.ack_mode != AcknowledgeMode::Auto {
            return self.commit_listener_settlements().await;
        }

        self.commit_acks().await?;

        let requeue = self.settings.config.requeue_rejected;
        trace!(consumer = self.index, delivery_tag = tag, requeue, "rejecting delivery");
        self.channel.nack(tag, false, requeue).await?;
        if self.settings.config.channel_transacted {
            self.channel.tx_commit().await?;
        }
        Ok(())
    }

    async fn commit_acks(&mut self) -> Result<(), AmqpError> {
        if let Some(tag) = self.last_tag.take() {
            trace!(
                consumer = self.index,
                delivery_tag = tag,
                batch = self.pending_acks,
                "acknowledging batch"
            );
            self.channel.ack(tag, true).await?;
            if self.settings.config.channel_transacted {
                self.channel.tx_commit().await?;
            }
        }

        self.pending_acks = 0;
        self.transition(ConsumerState::Idle);
        Ok(())
    }

    /// Settlements made by the listener itself (MANUAL mode) only reach the broker once
    /// a transacted channel commits, so the commit follows every invocation.
    async fn commit_listener_settlements(&mut self) -> Result<(), AmqpError> {
        if self.settings.config.channel_transacted {
            trace!(consumer = self.index, "committing listener settlements");
            self.channel.tx_commit().await?;
        }
        self.transition(ConsumerState::Idle);
        Ok(())
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            trace!(consumer = self.index, from = ?self.state, to = ?next, "consumer state");
            self.state = next;
        }
    }
}

/// Resolves once a stop is requested or the container is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
