// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages
//!
//! A [`Message`] is the immutable unit handed from the transport to a consumer: an
//! opaque payload plus the delivery metadata required to acknowledge it.

use std::collections::BTreeMap;

/// Content type for UTF-8 text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for opaque binary payloads
pub const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

/// Basic properties carried alongside a payload.
///
/// Header values are kept as strings; this is enough to carry trace context and
/// application metadata without binding callers to a wire representation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub(crate) content_type: Option<String>,
    pub(crate) message_type: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn get_content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn get_message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn get_message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

/// A message delivered to a consumer.
///
/// Once built the message is never mutated: the consumer owns it until dispatch,
/// during which listeners only get a shared reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    body: Vec<u8>,
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    consumer_queue: Option<String>,
    properties: MessageProperties,
}

impl Message {
    /// Creates a message that has not been delivered yet (delivery tag 0).
    pub fn new(body: impl Into<Vec<u8>>, properties: MessageProperties) -> Self {
        Message {
            body: body.into(),
            delivery_tag: 0,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            consumer_queue: None,
            properties,
        }
    }

    /// Stamps the delivery metadata assigned by the transport.
    ///
    /// Transport implementations call this once when turning a broker delivery into a
    /// `Message`.
    pub fn delivered(
        mut self,
        delivery_tag: u64,
        redelivered: bool,
        exchange: &str,
        routing_key: &str,
    ) -> Self {
        self.delivery_tag = delivery_tag;
        self.redelivered = redelivered;
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    /// Records the queue the delivery was consumed from.
    pub fn from_queue(mut self, queue: &str) -> Self {
        self.consumer_queue = Some(queue.to_owned());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn consumer_queue(&self) -> Option<&str> {
        self.consumer_queue.as_deref()
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }
}
