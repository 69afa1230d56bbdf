// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines the narrow transport seams the listener container consumes
//! (`ConnectionFactory` and `AmqpChannel`) and their production implementation on top
//! of `lapin`. The container never talks to the broker directly: every consumer gets
//! its own channel from the factory and owns it exclusively.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    message::{Message, MessageProperties},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Reply code sent when a channel is closed on purpose
const REPLY_SUCCESS: u16 = 200;

/// Stream of deliveries produced by a subscription.
///
/// An `Err` item is a transport failure; the end of the stream means the subscription
/// was cancelled.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// A channel onto the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Limits the number of unacknowledged deliveries the broker pushes to this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Subscribes to a queue.
    ///
    /// # Parameters
    /// * `queue` - Name of the queue to consume from
    /// * `consumer_tag` - Tag identifying the subscription, used to cancel it
    /// * `no_ack` - Whether the broker considers deliveries settled as soon as it sends them
    ///
    /// # Returns
    /// The stream of deliveries for the subscription, or AmqpError if the broker refused it
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Cancels a subscription. Deliveries already pushed to the client stay readable.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Acknowledges a delivery, or every delivery up to it when `multiple` is set.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    /// Rejects a delivery, or every delivery up to it when `multiple` is set. Rejected
    /// deliveries go back to their queue when `requeue` is set and are discarded otherwise.
    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Pulls a single message from a queue, if any is ready.
    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Message>, AmqpError>;

    /// Puts the channel in transactional mode: settlements and publishes take effect on
    /// `tx_commit`.
    async fn tx_select(&self) -> Result<(), AmqpError>;

    async fn tx_commit(&self) -> Result<(), AmqpError>;

    /// Closes the channel. Unacknowledged deliveries are requeued by the broker.
    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

/// Opens channels onto the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// `ConnectionFactory` backed by a single lapin connection.
pub struct LapinConnectionFactory {
    conn: Arc<Connection>,
}

impl LapinConnectionFactory {
    /// Establishes a connection to RabbitMQ using the given configuration.
    ///
    /// # Parameters
    /// * `cfg` - Broker address, credentials, virtual host and connection name
    ///
    /// # Returns
    /// A factory sharing the connection between every channel it opens, or
    /// AmqpError::ConnectionError if the broker could not be reached
    ///
    /// # Example
    /// ```no_run
    /// # async fn run() -> Result<(), rabbitmq_listener::errors::AmqpError> {
    /// use rabbitmq_listener::{channel::LapinConnectionFactory, config::RabbitMQConfigs};
    ///
    /// let factory = LapinConnectionFactory::connect(&RabbitMQConfigs::default()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Self, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let conn = match Connection::connect(&cfg.amqp_uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(LapinConnectionFactory {
            conn: Arc::new(conn),
        })
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// `AmqpChannel` over a lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    /// Wraps a channel opened on a lapin connection.
    ///
    /// # Parameters
    /// * `channel` - An open lapin channel
    ///
    /// # Returns
    /// A new LapinChannel owning the channel
    pub fn new(channel: Channel) -> Self {
        LapinChannel { channel }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(prefetch_count.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(message_from_delivery(delivery, &queue)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to cancel consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError(delivery_tag)
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<Message>, AmqpError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
        {
            Ok(msg) => Ok(msg.map(|msg| message_from_delivery(msg.delivery, queue))),
            Err(err) => {
                error!(error = err.to_string(), "failure to get message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
        }
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.channel.tx_select().await.map_err(|err| {
            error!(error = err.to_string(), "failure to select transaction");
            AmqpError::TransactionError
        })
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.channel.tx_commit().await.map_err(|err| {
            error!(error = err.to_string(), "failure to commit transaction");
            AmqpError::TransactionError
        })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closed by listener container")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close channel");
                AmqpError::ChannelClosed(err.to_string())
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

/// Maps a lapin delivery into a `Message`. Only string headers are carried over.
fn message_from_delivery(delivery: lapin::message::Delivery, queue: &str) -> Message {
    let props = &delivery.properties;
    let mut properties = MessageProperties::new();
    if let Some(value) = props.content_type() {
        properties = properties.content_type(value.as_str());
    }
    if let Some(value) = props.kind() {
        properties = properties.message_type(value.as_str());
    }
    if let Some(value) = props.message_id() {
        properties = properties.message_id(value.as_str());
    }
    if let Some(headers) = props.headers() {
        for (key, value) in headers.inner() {
            if let AMQPValue::LongString(value) = value {
                if let Ok(value) = std::str::from_utf8(value.as_bytes()) {
                    properties = properties.header(key.as_str(), value);
                }
            }
        }
    }

    Message::new(delivery.data, properties)
        .delivered(
            delivery.delivery_tag,
            delivery.redelivered,
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
        )
        .from_queue(queue)
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in properties.headers() {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut props = BasicProperties::default().with_headers(FieldTable::from(headers));
    if let Some(value) = properties.get_content_type() {
        props = props.with_content_type(ShortString::from(value));
    }
    if let Some(value) = properties.get_message_type() {
        props = props.with_type(ShortString::from(value));
    }
    if let Some(value) = properties.get_message_id() {
        props = props.with_message_id(ShortString::from(value));
    }
    props
}
