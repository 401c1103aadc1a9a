// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitFlow
//!
//! Staged message pipelines on RabbitMQ. Each stage consumes a durable queue,
//! runs a processor and publishes the result to the success or failure
//! exchange pair of the next stage. Broker topology is provisioned
//! idempotently every time a stage is registered.

mod consumer;
mod otel;
mod publisher;

#[cfg(test)]
mod fake;

pub mod app;
pub mod broker;
pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod processor;
pub mod queue;
pub mod router;
pub mod topology;

pub use app::{Pipeline, PipelineMode, RabbitFlow};
pub use consumer::Outcome;
pub use errors::{BrokerError, FlowError};
pub use processor::{processor_fn, Json, Passthrough, Payload, ProcessResult, Processor};
