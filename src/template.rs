// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Send and Receive Helper
//!
//! [`RabbitMQTemplate`] is the synchronous counterpart of the listener container: it
//! publishes messages (propagating OpenTelemetry context through the headers) and pulls
//! single messages from queues.

use crate::{
    channel::AmqpChannel,
    converter::{self, MessageValue},
    errors::AmqpError,
    message::{Message, MessageProperties},
    otel,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Name of the default exchange, routing directly to the queue named by the routing key
pub const DEFAULT_EXCHANGE: &str = "";

/// Publishes to and receives from the broker over one channel.
pub struct RabbitMQTemplate {
    channel: Arc<dyn AmqpChannel>,
}

impl RabbitMQTemplate {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Arc<RabbitMQTemplate> {
        Arc::new(RabbitMQTemplate { channel })
    }

    /// Publishes a raw payload.
    ///
    /// A message id is generated when the properties carry none, and the current trace
    /// context is injected into the headers.
    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut properties = match properties.get_message_id() {
            Some(_) => properties,
            None => properties.message_id(&Uuid::new_v4().to_string()),
        };
        otel::inject(&Context::current(), &mut properties.headers);

        self.channel
            .publish(exchange, routing_key, body, &properties)
            .await
    }

    /// Converts a value and publishes it to the queue named `routing_key` through the
    /// default exchange.
    pub async fn convert_and_send(
        &self,
        routing_key: &str,
        value: impl Into<MessageValue>,
    ) -> Result<(), AmqpError> {
        let (body, properties) = converter::to_message(&value.into(), MessageProperties::new())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to convert payload");
                AmqpError::PublishingError
            })?;

        self.send(DEFAULT_EXCHANGE, routing_key, &body, properties)
            .await
    }

    /// Pulls the next ready message from a queue, acknowledging it on receipt.
    pub async fn receive(&self, queue: &str) -> Result<Option<Message>, AmqpError> {
        self.channel.get(queue, true).await
    }

    /// Pulls and converts the next ready message from a queue.
    pub async fn receive_and_convert(&self, queue: &str) -> Result<Option<MessageValue>, AmqpError> {
        match self.receive(queue).await? {
            Some(msg) => converter::from_message(&msg).map(Some).map_err(|err| {
                error!(error = err.to_string(), "failure to convert payload");
                AmqpError::GetMessageError(queue.to_owned())
            }),
            None => Ok(None),
        }
    }
}
