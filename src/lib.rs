// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod adapter;
pub mod channel;
pub mod config;
pub mod container;
pub mod converter;
pub mod error_handler;
pub mod errors;
pub mod listener;
pub mod memory;
pub mod message;
pub mod template;
