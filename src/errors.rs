// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitFlow
//!
//! Two layers of errors live here. `BrokerError` is the structured result code
//! returned by the broker capability; it never carries meaning in its message
//! text. `FlowError` is what callers of the provisioner, the router and the
//! application see.

use thiserror::Error;

/// AMQP reply code for a missing resource.
pub const REPLY_NOT_FOUND: u16 = 404;
/// AMQP reply code for an inequivalent redeclaration.
pub const REPLY_PRECONDITION_FAILED: u16 = 406;

/// Errors reported by a broker channel operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The channel was closed (by the broker or locally) and can no longer be used.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// The connection is gone or could not produce a channel.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the operation with an AMQP reply code.
    #[error("broker rejected operation with code {code}: {message}")]
    Rejected { code: u16, message: String },
}

impl BrokerError {
    /// Reports whether the error left the channel unusable.
    pub fn closes_channel(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed(_))
    }
}

/// Errors surfaced by topology provisioning, stage routing and the application.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FlowError {
    /// An existing broker resource was declared with an incompatible kind or durability.
    #[error("topology conflict on `{resource}`: {detail}")]
    TopologyConflict { resource: String, detail: String },

    /// A transient channel or connection failure.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A processor raised instead of returning a result.
    #[error("processor error: {0}")]
    ProcessorError(String),

    /// Required components or settings are missing or invalid.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Failure to establish the initial connection.
    #[error("failure to connect: {0}")]
    ConnectionError(String),
}

impl From<BrokerError> for FlowError {
    fn from(err: BrokerError) -> Self {
        FlowError::BrokerUnavailable(err.to_string())
    }
}
