// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Conversion
//!
//! Maps between message payloads and [`MessageValue`]s, driven by the content type
//! property. `text/*` payloads become text, `application/json` payloads become JSON
//! values and everything else is handed over as raw bytes.

use crate::message::{
    Message, MessageProperties, BYTES_CONTENT_TYPE, JSON_CONTENT_TYPE, TEXT_CONTENT_TYPE,
};
use thiserror::Error;

/// A decoded message payload, as received by value listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageValue {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl MessageValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageValue::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for MessageValue {
    fn from(value: &str) -> Self {
        MessageValue::Text(value.to_owned())
    }
}

impl From<String> for MessageValue {
    fn from(value: String) -> Self {
        MessageValue::Text(value)
    }
}

impl From<serde_json::Value> for MessageValue {
    fn from(value: serde_json::Value) -> Self {
        MessageValue::Json(value)
    }
}

impl From<Vec<u8>> for MessageValue {
    fn from(value: Vec<u8>) -> Self {
        MessageValue::Bytes(value)
    }
}

/// Raised when a payload does not match its declared content type.
#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("payload is not valid utf-8 text")]
    InvalidText(#[from] std::string::FromUtf8Error),

    #[error("payload is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Decodes the payload of a delivered message.
pub fn from_message(message: &Message) -> Result<MessageValue, ConversionError> {
    let body = message.body().to_vec();

    match message.properties().get_content_type() {
        Some(content_type) if content_type.starts_with("text") => {
            Ok(MessageValue::Text(String::from_utf8(body)?))
        }
        Some(JSON_CONTENT_TYPE) => Ok(MessageValue::Json(serde_json::from_slice(&body)?)),
        _ => Ok(MessageValue::Bytes(body)),
    }
}

/// Encodes a value into a payload and the properties describing it.
pub fn to_message(
    value: &MessageValue,
    properties: MessageProperties,
) -> Result<(Vec<u8>, MessageProperties), ConversionError> {
    match value {
        MessageValue::Text(text) => Ok((
            text.as_bytes().to_vec(),
            properties.content_type(TEXT_CONTENT_TYPE),
        )),
        MessageValue::Json(json) => Ok((
            serde_json::to_vec(json)?,
            properties.content_type(JSON_CONTENT_TYPE),
        )),
        MessageValue::Bytes(bytes) => Ok((bytes.clone(), properties.content_type(BYTES_CONTENT_TYPE))),
    }
}
