// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capability
//!
//! The provisioner and the router never talk to lapin directly. They use the
//! channel-scoped operations declared here, whose outcomes are structured so
//! that "not found", "conflict" and "already bound" can be told apart without
//! inspecting error text. [`crate::channel`] provides the lapin-backed
//! implementation.

use crate::{errors::BrokerError, exchange::ExchangeKind};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// Message headers carried alongside a payload (trace context, mostly).
pub type Headers = BTreeMap<String, String>;

/// Stream of deliveries for one consumer. It ends when the underlying channel closes.
pub type DeliveryStream = BoxStream<'static, Result<PendingDelivery, BrokerError>>;

/// Outcome of an exchange or queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared {
    /// The resource exists (passive) or was created/confirmed (non-passive).
    Ok,
    /// A passive declaration found nothing.
    NotFound,
    /// The resource exists with a different configuration. The actual exchange
    /// kind is reported when the broker makes it known.
    Conflict(Option<ExchangeKind>),
}

/// Outcome of a binding operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    Created,
    AlreadyBound,
}

/// A message handed to a consumer, owned until it is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl PendingDelivery {
    /// Creates a delivery without headers.
    ///
    /// # Parameters
    /// * `delivery_tag` - Channel-scoped tag used to acknowledge the delivery
    /// * `body` - Raw message body
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        PendingDelivery {
            delivery_tag,
            body: body.into(),
            headers: Headers::default(),
        }
    }
}

/// Channel-scoped broker operations.
///
/// A channel must not be used from more than one execution context at a time;
/// callers hold it through a [`ChannelHandle`] or own a dedicated one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares (or, when `passive`, checks) an exchange.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        passive: bool,
    ) -> Result<Declared, BrokerError>;

    /// Declares (or, when `passive`, checks) a queue.
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        passive: bool,
    ) -> Result<Declared, BrokerError>;

    /// Binds `destination` to `source` so that messages flow source → destination.
    async fn bind_exchanges(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<Bound, BrokerError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Bound, BrokerError>;

    /// Publishes a payload to an exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError>;

    /// Starts a manually-acknowledged consumer on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    /// Acknowledges a single delivery.
    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reports whether the channel can still be used.
    fn is_open(&self) -> bool;
}

/// A connection able to hand out fresh channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel bound to this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Closes the connection; in-flight deliveries are left unacknowledged.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Exclusive holder of a channel plus the connection it came from.
///
/// Replacing the channel goes through `&mut self`, so a replacement can never
/// happen underneath another user of the same handle.
pub struct ChannelHandle {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl ChannelHandle {
    /// Opens a channel on `connection` and wraps it.
    pub async fn open(connection: Arc<dyn BrokerConnection>) -> Result<Self, BrokerError> {
        let channel = connection.open_channel().await?;
        Ok(ChannelHandle {
            connection,
            channel,
        })
    }

    /// The channel currently held.
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    /// Replaces the held channel with a fresh one from the same connection.
    pub async fn reacquire(&mut self) -> Result<(), BrokerError> {
        debug!("reacquiring broker channel");
        self.channel = self.connection.open_channel().await?;
        Ok(())
    }

    /// Reacquires the channel if the broker closed it as a side effect of a
    /// previous operation (404/406 replies close the channel).
    pub async fn ensure_open(&mut self) -> Result<(), BrokerError> {
        if !self.channel.is_open() {
            warn!("broker channel was closed, opening a new one");
            self.reacquire().await?;
        }
        Ok(())
    }
}
