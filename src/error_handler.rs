// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Error Handling
//!
//! The [`ErrorHandler`] is the single seam through which dispatch failures are observed.
//! The consumer calls it exactly once per failed delivery with a
//! [`ListenerExecutionFailed`] wrapping the cause, then moves on to the next delivery.

use crate::{adapter::DispatchFailure, message::Message};
use std::fmt;
use tracing::warn;

/// A listener invocation that failed, with the message it failed on.
#[derive(Debug)]
pub struct ListenerExecutionFailed {
    failed_message: Message,
    cause: DispatchFailure,
}

impl ListenerExecutionFailed {
    pub fn new(failed_message: Message, cause: DispatchFailure) -> Self {
        ListenerExecutionFailed {
            failed_message,
            cause,
        }
    }

    pub fn failed_message(&self) -> &Message {
        &self.failed_message
    }

    pub fn cause(&self) -> &DispatchFailure {
        &self.cause
    }
}

impl fmt::Display for ListenerExecutionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listener execution failed for delivery {}",
            self.failed_message.delivery_tag()
        )
    }
}

impl std::error::Error for ListenerExecutionFailed {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Observer of dispatch failures.
///
/// Implementations perform side effects (log, alert, count) and return. A panicking
/// handler is not isolated: it terminates the consumer that invoked it.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorHandler: Send + Sync {
    fn handle_error(&self, failure: &ListenerExecutionFailed);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ListenerExecutionFailed) + Send + Sync,
{
    fn handle_error(&self, failure: &ListenerExecutionFailed) {
        self(failure)
    }
}

/// Handler used when none is configured: logs the failure and discards it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, failure: &ListenerExecutionFailed) {
        let msg = failure.failed_message();
        warn!(
            delivery_tag = msg.delivery_tag(),
            queue = msg.consumer_queue().unwrap_or_default(),
            error = failure.cause().to_string(),
            "execution of message listener failed, message discarded"
        );
    }
}
