// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Bindings
//!
//! Each stage consumes from one durable queue bound to the topic half of its
//! input exchange pair.

use crate::exchange::MATCH_ALL_ROUTING_KEY;

/// Suffix of a stage's input queue.
pub const QUEUE_SUFFIX: &str = "queue";

/// A durable queue bound to an exchange with a routing key.
///
/// The binding survives broker restarts because both the queue and the
/// exchange are declared durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for the given queue with the match-all routing key.
    ///
    /// The exchange must be set with [`QueueBinding::exchange`].
    pub fn new(queue: impl Into<String>) -> QueueBinding {
        QueueBinding {
            queue_name: queue.into(),
            exchange_name: String::new(),
            routing_key: MATCH_ALL_ROUTING_KEY.to_owned(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange_name = exchange.into();
        self
    }

    /// Overrides the routing key for the binding.
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }
}

/// Name of the input queue for stage `stage` of application `app`.
pub fn queue_name(app: &str, stage: &str) -> String {
    format!("{}.{}.{}", app, stage, QUEUE_SUFFIX)
}
