// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Listeners
//!
//! A container accepts exactly one listener, in one of three shapes:
//!
//! - [`ValueListener`]: receives the decoded payload
//! - [`MessageListener`]: receives the raw [`Message`]
//! - [`ChannelAwareMessageListener`]: receives the raw message and the consumer's channel,
//!   for manual acknowledgment or republishing
//!
//! [`Listener`] is the tagged union the container is configured with; the shape is fixed
//! once at configuration time.

use crate::{channel::AmqpChannel, converter::MessageValue, message::Message};
use async_trait::async_trait;
use std::sync::Arc;

/// Error type returned by listener code.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Listener receiving the payload converted from the message body.
#[async_trait]
pub trait ValueListener: Send + Sync {
    async fn handle_message(&self, value: MessageValue) -> Result<(), ListenerError>;
}

/// Listener receiving the raw message.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: &Message) -> Result<(), ListenerError>;
}

/// Listener receiving the raw message and the channel it was delivered on.
#[async_trait]
pub trait ChannelAwareMessageListener: Send + Sync {
    async fn on_message(
        &self,
        message: &Message,
        channel: &dyn AmqpChannel,
    ) -> Result<(), ListenerError>;
}

/// The listener bound to a container.
#[derive(Clone)]
pub enum Listener {
    Value(Arc<dyn ValueListener>),
    Message(Arc<dyn MessageListener>),
    ChannelAware(Arc<dyn ChannelAwareMessageListener>),
}

impl Listener {
    pub fn value<L: ValueListener + 'static>(listener: L) -> Self {
        Listener::Value(Arc::new(listener))
    }

    pub fn message<L: MessageListener + 'static>(listener: L) -> Self {
        Listener::Message(Arc::new(listener))
    }

    pub fn channel_aware<L: ChannelAwareMessageListener + 'static>(listener: L) -> Self {
        Listener::ChannelAware(Arc::new(listener))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Listener::Value(_) => "value",
            Listener::Message(_) => "message",
            Listener::ChannelAware(_) => "channel-aware",
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Listener").field(&self.kind()).finish()
    }
}
