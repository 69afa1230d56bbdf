// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Listener Container
//!
//! This module provides the error types surfaced by the transport collaborators
//! (`AmqpError`) and by the listener container lifecycle (`ListenerContainerError`).
//! Failures raised by listener code during dispatch are not represented here: they
//! are recovered locally by the consumer and live in the `adapter` module.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// These are the transport-level failures: connection and channel problems that are
/// unrelated to listener logic and cannot be recovered by the consumer itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel was closed, by the broker or by a connection drop
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer subscription
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The broker cancelled the subscription
    #[error("consumer cancelled by the broker")]
    ConsumerCancelled,

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error pulling a single message from a queue
    #[error("failure to get message from queue `{0}`")]
    GetMessageError(String),

    /// Error selecting or committing a channel transaction
    #[error("failure to handle channel transaction")]
    TransactionError,
}

/// Errors surfaced synchronously by the listener container lifecycle operations.
#[derive(Error, Debug)]
pub enum ListenerContainerError {
    /// Invalid setup: bad concurrency, empty queue set, missing listener, ...
    #[error("invalid listener container configuration: {0}")]
    Configuration(String),

    /// A consumer could not be started; already started consumers were rolled back
    #[error("failure to start consumer {consumer}")]
    Startup {
        consumer: usize,
        #[source]
        source: AmqpError,
    },

    /// The operation is not allowed in the current lifecycle state
    #[error("illegal container state: {0}")]
    IllegalState(String),
}

impl ListenerContainerError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        ListenerContainerError::Configuration(reason.into())
    }

    /// Returns true when the error was raised by configuration validation.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ListenerContainerError::Configuration(_))
    }
}
