// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Listener Container
//!
//! [`ListenerContainer`] attaches `concurrency` consumers to the configured queues and
//! routes every delivery to a single listener. It owns the lifecycle:
//!
//! ```text
//! NEW --start()--> RUNNING --stop()--> STOPPING --> STOPPED
//! ```
//!
//! Each consumer runs on its own tokio task. Listener failures are handled inside the
//! consumer and reported to the error handler; transport failures restart the affected
//! consumer after the recovery interval, until the container is stopped.

use crate::{
    adapter::ListenerAdapter,
    channel::{AmqpChannel, ConnectionFactory},
    config::ListenerContainerConfig,
    consumer::{Consumer, ConsumerExit, ConsumerSettings},
    error_handler::{ErrorHandler, LoggingErrorHandler},
    errors::{AmqpError, ListenerContainerError},
    listener::Listener,
};
use futures_util::FutureExt;
use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    New,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerState::New => "NEW",
            ContainerState::Running => "RUNNING",
            ContainerState::Stopping => "STOPPING",
            ContainerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Channel currently used by a consumer slot; replaced when the slot recovers.
type ChannelSlot = Arc<Mutex<Arc<dyn AmqpChannel>>>;

struct ConsumerHandle {
    index: usize,
    channel: ChannelSlot,
    task: JoinHandle<()>,
}

/// Runs listener consumers against a connection factory.
pub struct ListenerContainer {
    connection_factory: Arc<dyn ConnectionFactory>,
    config: Option<ListenerContainerConfig>,
    listener: Option<Listener>,
    error_handler: Arc<dyn ErrorHandler>,
    state: ContainerState,
    shut_down: bool,
    stop_tx: Option<watch::Sender<bool>>,
    consumers: Vec<ConsumerHandle>,
}

impl ListenerContainer {
    pub fn new(connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        ListenerContainer {
            connection_factory,
            config: None,
            listener: None,
            error_handler: Arc::new(LoggingErrorHandler),
            state: ContainerState::New,
            shut_down: false,
            stop_tx: None,
            consumers: vec![],
        }
    }

    /// Binds the configuration, the listener and, optionally, the error handler.
    ///
    /// Only allowed while the container is `New`. Without an error handler, failures are
    /// logged and discarded.
    ///
    /// # Parameters
    /// * `config` - Consumer count, queues, acknowledgment and timing settings
    /// * `listener` - The listener every delivery is dispatched to
    /// * `error_handler` - Observer of dispatch failures
    ///
    /// # Returns
    /// Ok(()) once bound, ListenerContainerError::Configuration for an invalid
    /// configuration or a missing listener, ListenerContainerError::IllegalState outside
    /// the `New` state
    pub fn configure(
        &mut self,
        config: ListenerContainerConfig,
        listener: impl Into<Option<Listener>>,
        error_handler: Option<Arc<dyn ErrorHandler>>,
    ) -> Result<(), ListenerContainerError> {
        if self.state != ContainerState::New {
            return Err(ListenerContainerError::IllegalState(format!(
                "cannot configure a container in state {}",
                self.state
            )));
        }

        config.validate()?;
        let Some(listener) = listener.into() else {
            return Err(ListenerContainerError::configuration(
                "a message listener is required",
            ));
        };

        debug!(
            concurrency = config.concurrency,
            listener = listener.kind(),
            ack_mode = ?config.ack_mode,
            "listener container configured"
        );

        self.config = Some(config);
        self.listener = Some(listener);
        if let Some(error_handler) = error_handler {
            self.error_handler = error_handler;
        }
        Ok(())
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Number of consumer tasks still alive.
    pub fn active_consumer_count(&self) -> usize {
        self.consumers
            .iter()
            .filter(|c| !c.task.is_finished())
            .count()
    }

    /// Opens one channel per consumer and starts every consumer on its own task.
    ///
    /// If any consumer cannot be started, the channels opened so far are closed and the
    /// container goes back to its previous state.
    ///
    /// # Returns
    /// Ok(()) once every consumer runs, ListenerContainerError::Startup naming the slot
    /// that failed, ListenerContainerError::Configuration when not configured, or
    /// ListenerContainerError::IllegalState when running or shut down
    pub async fn start(&mut self) -> Result<(), ListenerContainerError> {
        if self.shut_down {
            return Err(ListenerContainerError::IllegalState(
                "container was shut down".to_owned(),
            ));
        }
        if !matches!(self.state, ContainerState::New | ContainerState::Stopped) {
            return Err(ListenerContainerError::IllegalState(format!(
                "cannot start a container in state {}",
                self.state
            )));
        }

        let (Some(config), Some(listener)) = (&self.config, &self.listener) else {
            return Err(ListenerContainerError::configuration(
                "container must be configured before start",
            ));
        };
        config.validate()?;

        let settings = Arc::new(ConsumerSettings {
            config: config.clone(),
            adapter: ListenerAdapter::new(listener.clone()),
            error_handler: self.error_handler.clone(),
        });

        let mut started = Vec::with_capacity(settings.config.concurrency);
        for index in 0..settings.config.concurrency {
            match open_consumer(index, &self.connection_factory, &settings).await {
                Ok(consumer) => started.push(consumer),
                Err(source) => {
                    error!(consumer = index, error = source.to_string(), "failure to start consumer");
                    for consumer in started {
                        if let Err(err) = consumer.channel().close().await {
                            warn!(error = err.to_string(), "failure to close channel on rollback");
                        }
                    }
                    return Err(ListenerContainerError::Startup {
                        consumer: index,
                        source,
                    });
                }
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        self.consumers = started
            .into_iter()
            .enumerate()
            .map(|(index, consumer)| {
                let channel: ChannelSlot = Arc::new(Mutex::new(consumer.channel()));
                let task = tokio::spawn(supervise(
                    index,
                    consumer,
                    self.connection_factory.clone(),
                    settings.clone(),
                    stop_rx.clone(),
                    channel.clone(),
                ));
                ConsumerHandle {
                    index,
                    channel,
                    task,
                }
            })
            .collect();

        self.stop_tx = Some(stop_tx);
        self.state = ContainerState::Running;
        info!(consumers = self.consumers.len(), "listener container started");
        Ok(())
    }

    /// Signals every consumer to stop and waits for them, up to the shutdown timeout.
    ///
    /// Consumers finish their in-flight dispatch first. Consumers still running when the
    /// timeout elapses are aborted and their channels closed. Calling `stop` on a
    /// container that is not running does nothing.
    ///
    /// A consumer that terminated abnormally, through a panicking error handler, is
    /// logged here; its channel was already closed when it died.
    pub async fn stop(&mut self) {
        if self.state != ContainerState::Running {
            debug!(state = %self.state, "stop ignored, container not running");
            return;
        }

        self.state = ContainerState::Stopping;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }

        let timeout = self
            .config
            .as_ref()
            .map(ListenerContainerConfig::shutdown_timeout_duration)
            .unwrap_or_default();
        let deadline = Instant::now() + timeout;

        for mut handle in self.consumers.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle.task).await {
                Ok(Ok(())) => debug!(consumer = handle.index, "consumer finished"),
                Ok(Err(err)) if err.is_panic() => {
                    error!(consumer = handle.index, "consumer terminated abnormally")
                }
                Ok(Err(_)) => debug!(consumer = handle.index, "consumer task cancelled"),
                Err(_) => {
                    warn!(
                        consumer = handle.index,
                        "consumer did not stop in time, forcing channel closure"
                    );
                    handle.task.abort();
                    let channel = handle
                        .channel
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .clone();
                    if let Err(err) = channel.close().await {
                        warn!(error = err.to_string(), "failure to force channel closure");
                    }
                }
            }
        }

        self.state = ContainerState::Stopped;
        info!("listener container stopped");
    }

    /// Stops the container and releases everything it holds; it cannot be restarted.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.consumers.clear();
        self.stop_tx = None;
        self.listener = None;
        self.shut_down = true;
        info!("listener container shut down");
    }
}

impl Drop for ListenerContainer {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
    }
}

async fn open_consumer(
    index: usize,
    factory: &Arc<dyn ConnectionFactory>,
    settings: &Arc<ConsumerSettings>,
) -> Result<Consumer, AmqpError> {
    let channel = factory.create_channel().await?;
    match Consumer::start(index, channel.clone(), settings.clone()).await {
        Ok(consumer) => Ok(consumer),
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!(error = close_err.to_string(), "failure to close channel");
            }
            Err(err)
        }
    }
}

/// Runs a consumer slot, restarting its consumer after transport failures until a stop
/// is requested.
///
/// A panic escaping the consumer closes the slot's channel, so its unsettled deliveries
/// are requeued, and is then resumed to end the task.
///
/// # Parameters
/// * `index` - Slot number, used in logs
/// * `consumer` - The consumer started for this slot
/// * `factory` - Source of replacement channels
/// * `settings` - Settings restarted consumers are built with
/// * `stop` - Stop signal shared by every slot
/// * `slot` - Channel the slot currently uses, kept current across restarts
async fn supervise(
    index: usize,
    mut consumer: Consumer,
    factory: Arc<dyn ConnectionFactory>,
    settings: Arc<ConsumerSettings>,
    mut stop: watch::Receiver<bool>,
    slot: ChannelSlot,
) {
    let recovery_interval = settings.config.recovery_interval_duration();

    loop {
        let exit = match AssertUnwindSafe(consumer.run(stop.clone()))
            .catch_unwind()
            .await
        {
            Ok(exit) => exit,
            Err(panic) => {
                // the dead consumer's deliveries go back to the queue
                let channel = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
                if let Err(err) = channel.close().await {
                    warn!(consumer = index, error = err.to_string(), "failure to close channel");
                }
                std::panic::resume_unwind(panic);
            }
        };

        match exit {
            ConsumerExit::Stopped => return,
            ConsumerExit::TransportFailure(err) => {
                warn!(consumer = index, error = err.to_string(), "consumer failed, restarting");
            }
        }

        consumer = loop {
            let stopped = tokio::select! {
                biased;
                _ = stop.wait_for(|stopping| *stopping) => true,
                _ = tokio::time::sleep(recovery_interval) => false,
            };
            if stopped {
                return;
            }

            match open_consumer(index, &factory, &settings).await {
                Ok(consumer) => {
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = consumer.channel();
                    info!(consumer = index, "consumer restarted");
                    break consumer;
                }
                Err(err) => {
                    warn!(consumer = index, error = err.to_string(), "failure to restart consumer");
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{MockAmqpChannel, MockConnectionFactory},
        config::AcknowledgeMode,
        error_handler::MockErrorHandler,
        listener::{ChannelAwareMessageListener, ListenerError, MessageListener},
        memory::InMemoryBroker,
        message::Message,
        template::RabbitMQTemplate,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const QUEUE: &str = "test.queue";

    struct ThrowingListener {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl MessageListener for ThrowingListener {
        async fn on_message(&self, message: &Message) -> Result<(), ListenerError> {
            let value = String::from_utf8_lossy(message.body()).into_owned();
            let _ = self.seen.send(value);
            Err("listener runtime exception".into())
        }
    }

    struct HangingListener {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl MessageListener for HangingListener {
        async fn on_message(&self, _message: &Message) -> Result<(), ListenerError> {
            let _ = self.seen.send("hanging".to_owned());
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct RecordingListener {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl MessageListener for RecordingListener {
        async fn on_message(&self, message: &Message) -> Result<(), ListenerError> {
            let _ = self.seen.send(String::from_utf8_lossy(message.body()).into_owned());
            Ok(())
        }
    }

    /// Acknowledges every delivery itself on the consumer's channel.
    struct ManualAckListener {
        seen: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl ChannelAwareMessageListener for ManualAckListener {
        async fn on_message(
            &self,
            message: &Message,
            channel: &dyn AmqpChannel,
        ) -> Result<(), ListenerError> {
            channel.ack(message.delivery_tag(), false).await?;
            let _ = self.seen.send(String::from_utf8_lossy(message.body()).into_owned());
            Ok(())
        }
    }

    async fn broker_with(messages: usize) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_queue(QUEUE);
        let template = RabbitMQTemplate::new(broker.create_channel().await.unwrap());
        for i in 0..messages {
            template.convert_and_send(QUEUE, format!("{i}foo")).await.unwrap();
        }
        broker
    }

    async fn wait_for(rx: &mut mpsc::UnboundedReceiver<String>, count: usize) -> Vec<String> {
        let mut seen = vec![];
        while seen.len() < count {
            let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("listener not invoked in time")
                .expect("listener dropped");
            seen.push(value);
        }
        seen
    }

    fn config() -> ListenerContainerConfig {
        ListenerContainerConfig::new()
            .queue(QUEUE)
            .ack_mode(AcknowledgeMode::None)
            .prefetch_count(3)
            .commit_batch_size(3)
    }

    #[tokio::test]
    async fn error_handler_is_invoked_once_per_failed_message() {
        let broker = broker_with(3).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut error_handler = MockErrorHandler::new();
        error_handler
            .expect_handle_error()
            .withf(|failure| failure.cause().is_listener_raised())
            .times(3)
            .return_const(());

        let mut container = ListenerContainer::new(Arc::new(broker.clone()));
        container
            .configure(
                config(),
                Listener::message(ThrowingListener { seen: tx }),
                Some(Arc::new(error_handler)),
            )
            .unwrap();
        container.start().await.unwrap();

        assert_eq!(wait_for(&mut rx, 3).await, vec!["0foo", "1foo", "2foo"]);
        container.shutdown().await;

        assert_eq!(broker.message_count(QUEUE), 0);
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected_without_opening_channels() {
        let mut factory = MockConnectionFactory::new();
        factory.expect_create_channel().never();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut container = ListenerContainer::new(Arc::new(factory));
        let err = container
            .configure(
                config().concurrency(0),
                Listener::message(ThrowingListener { seen: tx }),
                None,
            )
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(container.start().await.unwrap_err().is_configuration());
        assert_eq!(container.active_consumer_count(), 0);
    }

    #[tokio::test]
    async fn missing_listener_is_rejected() {
        let mut container = ListenerContainer::new(Arc::new(InMemoryBroker::new()));
        let err = container.configure(config(), None, None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn partial_start_is_rolled_back() {
        let mut factory = MockConnectionFactory::new();
        let mut opened = 0;
        factory.expect_create_channel().times(2).returning(move || {
            opened += 1;
            if opened == 2 {
                return Err(AmqpError::ChannelError);
            }
            let mut channel = MockAmqpChannel::new();
            channel
                .expect_consume()
                .returning(|_, _, _| Ok(futures_util::StreamExt::boxed(futures_util::stream::pending())));
            channel.expect_close().times(1).returning(|| Ok(()));
            Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut container = ListenerContainer::new(Arc::new(factory));
        container
            .configure(
                config().concurrency(3),
                Listener::message(ThrowingListener { seen: tx }),
                None,
            )
            .unwrap();

        let err = container.start().await.unwrap_err();
        assert!(matches!(
            err,
            ListenerContainerError::Startup {
                consumer: 1,
                source: AmqpError::ChannelError
            }
        ));
        assert_eq!(container.state(), ContainerState::New);
        assert_eq!(container.active_consumer_count(), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let broker = broker_with(0).await;
        let mut error_handler = MockErrorHandler::new();
        error_handler.expect_handle_error().never();

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut container = ListenerContainer::new(Arc::new(broker.clone()));
        container
            .configure(
                config().concurrency(2),
                Listener::message(ThrowingListener { seen: tx }),
                Some(Arc::new(error_handler)),
            )
            .unwrap();

        container.stop().await;
        assert_eq!(container.state(), ContainerState::New);

        container.start().await.unwrap();
        assert!(container.is_running());
        assert_eq!(broker.open_channel_count(), 2);

        container.stop().await;
        container.stop().await;
        assert_eq!(container.state(), ContainerState::Stopped);
        assert_eq!(broker.open_channel_count(), 0);
    }

    #[tokio::test]
    async fn configure_is_only_allowed_before_start() {
        let broker = broker_with(0).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut container = ListenerContainer::new(Arc::new(broker));
        container
            .configure(config(), Listener::message(ThrowingListener { seen: tx.clone() }), None)
            .unwrap();
        container.start().await.unwrap();

        let err = container
            .configure(config(), Listener::message(ThrowingListener { seen: tx }), None)
            .unwrap_err();
        assert!(matches!(err, ListenerContainerError::IllegalState(_)));
        assert!(matches!(
            container.start().await.unwrap_err(),
            ListenerContainerError::IllegalState(_)
        ));

        container.shutdown().await;
        assert!(matches!(
            container.start().await.unwrap_err(),
            ListenerContainerError::IllegalState(_)
        ));
    }

    #[tokio::test]
    async fn hung_listener_is_forced_closed_after_timeout() {
        let broker = broker_with(1).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut container = ListenerContainer::new(Arc::new(broker.clone()));
        container
            .configure(
                config()
                    .ack_mode(AcknowledgeMode::Auto)
                    .shutdown_timeout(Duration::from_millis(50)),
                Listener::message(HangingListener { seen: tx }),
                None,
            )
            .unwrap();
        container.start().await.unwrap();
        wait_for(&mut rx, 1).await;

        tokio::time::timeout(Duration::from_secs(2), container.shutdown())
            .await
            .expect("shutdown must honor its timeout");

        assert_eq!(broker.open_channel_count(), 0);
        // the unacknowledged delivery goes back to the queue
        assert_eq!(broker.message_count(QUEUE), 1);
    }

    #[tokio::test]
    async fn panicking_error_handler_terminates_its_consumer() {
        let broker = broker_with(1).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut container = ListenerContainer::new(Arc::new(broker.clone()));
        container
            .configure(
                config().ack_mode(AcknowledgeMode::Auto),
                Listener::message(ThrowingListener { seen: tx }),
                Some(Arc::new(|_: &crate::error_handler::ListenerExecutionFailed| {
                    panic!("error handler failure")
                })),
            )
            .unwrap();
        container.start().await.unwrap();
        wait_for(&mut rx, 1).await;

        let deadline = Instant::now() + Duration::from_secs(2);
        while container.active_consumer_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(container.active_consumer_count(), 0);
        // the delivery left unsettled by the dead consumer is back on the queue
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.message_count(QUEUE), 1);
        assert_eq!(broker.open_channel_count(), 0);

        container.shutdown().await;
        assert_eq!(container.state(), ContainerState::Stopped);
    }

    #[tokio::test]
    async fn consumer_recovers_after_connection_loss() {
        let broker = broker_with(1).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut container = ListenerContainer::new(Arc::new(broker.clone()));
        container
            .configure(
                config().recovery_interval(Duration::from_millis(20)),
                Listener::message(RecordingListener { seen: tx }),
                None,
            )
            .unwrap();
        container.start().await.unwrap();
        assert_eq!(wait_for(&mut rx, 1).await, vec!["0foo"]);

        broker.sever_connections();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let template = RabbitMQTemplate::new(broker.create_channel().await.unwrap());
        template.convert_and_send(QUEUE, "1foo").await.unwrap();
        assert_eq!(wait_for(&mut rx, 1).await, vec!["1foo"]);
        assert_eq!(container.active_consumer_count(), 1);

        container.shutdown().await;
        assert_eq!(broker.message_count(QUEUE), 0);
    }

    #[tokio::test]
    async fn manual_acks_on_transacted_channel_are_committed() {
        let broker = broker_with(2).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut container = ListenerContainer::new(Arc::new(broker.clone()));
        container
            .configure(
                config()
                    .ack_mode(AcknowledgeMode::Manual)
                    .channel_transacted(true),
                Listener::channel_aware(ManualAckListener { seen: tx }),
                None,
            )
            .unwrap();
        container.start().await.unwrap();
        assert_eq!(wait_for(&mut rx, 2).await, vec!["0foo", "1foo"]);

        container.shutdown().await;
        assert_eq!(broker.message_count(QUEUE), 0);
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn auto_acks_on_transacted_channel_are_committed() {
        let broker = broker_with(3).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut container = ListenerContainer::new(Arc::new(broker.clone()));
        container
            .configure(
                config()
                    .ack_mode(AcknowledgeMode::Auto)
                    .channel_transacted(true),
                Listener::message(RecordingListener { seen: tx }),
                None,
            )
            .unwrap();
        container.start().await.unwrap();
        assert_eq!(wait_for(&mut rx, 3).await, vec!["0foo", "1foo", "2foo"]);

        let deadline = Instant::now() + Duration::from_secs(2);
        while broker.unacked_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.unacked_count(), 0);

        container.shutdown().await;
        assert_eq!(broker.message_count(QUEUE), 0);
    }
}
