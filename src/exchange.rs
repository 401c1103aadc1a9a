// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Descriptors
//!
//! Every fan-out point of a pipeline is a pair of durable exchanges: publishers
//! target the fanout half and consumers bind their queues to the topic half.
//! The names of both halves are derived from a single base name, and they must
//! stay bit-exact for interop with topology already living on the broker.

use std::fmt;

/// Suffix of the publisher-facing half of a pair.
pub const FANOUT_SUFFIX: &str = "fanout";
/// Suffix of the consumer-facing half of a pair.
pub const TOPIC_SUFFIX: &str = "topic";
/// Routing key matching every message on a topic exchange.
pub const MATCH_ALL_ROUTING_KEY: &str = "#";

/// The exchange types this crate declares.
///
/// - Fanout: Broadcasts messages to all bound destinations regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Fanout,
    Topic,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Topic => f.write_str("topic"),
        }
    }
}

/// A durable exchange identified by its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeDescriptor {
    /// Creates a durable exchange descriptor.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        ExchangeDescriptor {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// A fanout exchange bound to a topic exchange with the match-all key.
///
/// A pair is only established once both exchanges exist with their declared
/// kind and the binding between them exists; see
/// [`ExchangePairProvisioner`](crate::topology::ExchangePairProvisioner).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangePair {
    pub source: ExchangeDescriptor,
    pub destination: ExchangeDescriptor,
    pub binding_routing_key: String,
}

impl ExchangePair {
    /// Derives the `<name>.fanout` / `<name>.topic` pair.
    pub fn new(name: &str) -> Self {
        ExchangePair {
            source: ExchangeDescriptor::new(
                format!("{}.{}", name, FANOUT_SUFFIX),
                ExchangeKind::Fanout,
            ),
            destination: ExchangeDescriptor::new(
                format!("{}.{}", name, TOPIC_SUFFIX),
                ExchangeKind::Topic,
            ),
            binding_routing_key: MATCH_ALL_ROUTING_KEY.to_owned(),
        }
    }

    /// Name of the exchange publishers target.
    pub fn fanout(&self) -> &str {
        &self.source.name
    }

    /// Name of the exchange queues bind to.
    pub fn topic(&self) -> &str {
        &self.destination.name
    }
}
