// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Dispatch
//!
//! [`ListenerAdapter`] gives the consumer one way to invoke whatever listener shape is
//! bound. Every failure, whether returned by the listener, raised as a panic inside it
//! or produced while converting the payload, comes back as a single [`DispatchFailure`]
//! instead of unwinding into the consumer loop.

use crate::{
    channel::AmqpChannel,
    converter::{self, ConversionError},
    listener::{Listener, ListenerError},
    message::Message,
};
use futures_util::FutureExt;
use std::{any::Any, panic::AssertUnwindSafe};
use thiserror::Error;

/// Why a single dispatch failed.
#[derive(Error, Debug)]
pub enum DispatchFailure {
    /// The listener returned an error
    #[error("listener failed: {0}")]
    Listener(#[source] ListenerError),

    /// The listener panicked
    #[error("listener panicked: {0}")]
    Panicked(String),

    /// The payload could not be converted for a value listener
    #[error("payload conversion failed: {0}")]
    Conversion(#[source] ConversionError),
}

impl DispatchFailure {
    /// Whether the failure originated in listener code rather than in the adapter.
    pub fn is_listener_raised(&self) -> bool {
        !matches!(self, DispatchFailure::Conversion(_))
    }
}

/// Dispatches deliveries to the bound listener.
#[derive(Clone, Debug)]
pub struct ListenerAdapter {
    listener: Listener,
}

impl ListenerAdapter {
    pub fn new(listener: Listener) -> Self {
        ListenerAdapter { listener }
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Invokes the listener for one delivery.
    pub async fn dispatch(
        &self,
        message: &Message,
        channel: &dyn AmqpChannel,
    ) -> Result<(), DispatchFailure> {
        let invocation = async {
            match &self.listener {
                Listener::Value(listener) => {
                    let value =
                        converter::from_message(message).map_err(DispatchFailure::Conversion)?;
                    listener
                        .handle_message(value)
                        .await
                        .map_err(DispatchFailure::Listener)
                }
                Listener::Message(listener) => listener
                    .on_message(message)
                    .await
                    .map_err(DispatchFailure::Listener),
                Listener::ChannelAware(listener) => listener
                    .on_message(message, channel)
                    .await
                    .map_err(DispatchFailure::Listener),
            }
        };

        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(DispatchFailure::Panicked(panic_message(panic))),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}
