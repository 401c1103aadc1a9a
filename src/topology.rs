// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Provisioning
//!
//! Brings a named piece of broker topology to a known-good state without ever
//! deleting anything, so it can run on every process start.
//!
//! Every resource goes through the same protocol:
//! 1. passive declaration (check only)
//! 2. real durable declaration when the check reports not-found
//! 3. binding, where an existing binding is not an error
//!
//! A kind mismatch is a [`FlowError::TopologyConflict`] and is never retried.
//! A channel closed by the broker in the middle of a step is replaced once per
//! provisioning call and the failed step is resumed on the new channel.
//!
//! The main components are:
//! - `Provision` trait: Interface shared by both provisioners
//! - `ExchangePairProvisioner`: fanout/topic pair plus the binding between them
//! - `QueueBindingProvisioner`: durable queue plus its binding to an exchange

use crate::{
    broker::{Bound, BrokerChannel, ChannelHandle, Declared},
    errors::{BrokerError, FlowError},
    exchange::{ExchangeDescriptor, ExchangePair},
    queue::QueueBinding,
};
use async_trait::async_trait;
use std::{future::Future, sync::Arc};
use tracing::{debug, error, warn};

/// A piece of topology that can be brought to a known-good state.
#[async_trait]
pub trait Provision {
    /// What a successful provisioning pass returns.
    type Output;

    /// Declares whatever is missing and verifies what already exists.
    ///
    /// The channel is borrowed exclusively for the duration of the call and
    /// may be replaced if the broker closes it.
    async fn ensure(&self, handle: &mut ChannelHandle) -> Result<Self::Output, FlowError>;
}

/// Provisions the `<name>.fanout` → `<name>.topic` exchange pair.
#[derive(Debug, Clone)]
pub struct ExchangePairProvisioner {
    pair: ExchangePair,
}

impl ExchangePairProvisioner {
    /// Creates a provisioner for the pair derived from `name`.
    ///
    /// # Parameters
    /// * `name` - Base name; the exchanges are `<name>.fanout` and `<name>.topic`
    ///
    /// # Returns
    /// A provisioner ready to be run with [`Provision::ensure`]
    pub fn new(name: &str) -> Self {
        ExchangePairProvisioner {
            pair: ExchangePair::new(name),
        }
    }
}

#[async_trait]
impl Provision for ExchangePairProvisioner {
    type Output = ExchangePair;

    async fn ensure(&self, handle: &mut ChannelHandle) -> Result<ExchangePair, FlowError> {
        let mut session = Session::new(handle);

        for exchange in [&self.pair.source, &self.pair.destination] {
            ensure_exchange(&mut session, exchange).await?;
        }

        let source = self.pair.fanout();
        let destination = self.pair.topic();
        let routing_key = self.pair.binding_routing_key.as_str();

        debug!(
            "binding exchange: {} to the exchange: {} with the key: {}",
            source, destination, routing_key
        );
        let bound = session
            .step("bind exchanges", move |ch| async move {
                ch.bind_exchanges(source, destination, routing_key).await
            })
            .await?;
        if bound == Bound::AlreadyBound {
            debug!(source, destination, "exchange binding already exists");
        }

        Ok(self.pair.clone())
    }
}

/// Provisions a durable queue and its binding to an exchange.
#[derive(Debug, Clone)]
pub struct QueueBindingProvisioner {
    binding: QueueBinding,
}

impl QueueBindingProvisioner {
    /// Creates a provisioner for a queue and its binding.
    ///
    /// # Parameters
    /// * `binding` - Queue name, exchange and routing key to establish
    ///
    /// # Returns
    /// A provisioner ready to be run with [`Provision::ensure`]
    pub fn new(binding: QueueBinding) -> Self {
        QueueBindingProvisioner { binding }
    }
}

#[async_trait]
impl Provision for QueueBindingProvisioner {
    type Output = QueueBinding;

    async fn ensure(&self, handle: &mut ChannelHandle) -> Result<QueueBinding, FlowError> {
        let mut session = Session::new(handle);
        let queue = self.binding.queue_name.as_str();
        let exchange = self.binding.exchange_name.as_str();
        let routing_key = self.binding.routing_key.as_str();

        let checked = session
            .step("check queue", move |ch| async move {
                ch.declare_queue(queue, true, true).await
            })
            .await?;

        match checked {
            Declared::Ok => debug!("queue: {} already exists", queue),
            Declared::NotFound => {
                debug!("creating queue: {}", queue);
                let declared = session
                    .step("declare queue", move |ch| async move {
                        ch.declare_queue(queue, true, false).await
                    })
                    .await?;
                if let Declared::Conflict(_) = declared {
                    return Err(conflict(queue, "queue exists with a different durability"));
                }
                debug!("queue: {} was created", queue);
            }
            Declared::Conflict(_) => {
                return Err(conflict(queue, "queue exists with a different durability"));
            }
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );
        let bound = session
            .step("bind queue", move |ch| async move {
                ch.bind_queue(queue, exchange, routing_key).await
            })
            .await?;
        if bound == Bound::AlreadyBound {
            debug!(queue, exchange, "queue binding already exists");
        }

        Ok(self.binding.clone())
    }
}

/// Ensures the fanout/topic pair derived from `name` is established.
///
/// # Parameters
/// * `handle` - Provisioning channel, replaced if the broker closes it
/// * `name` - Base name of the pair
///
/// # Returns
/// The established pair, or a `TopologyConflict` / `BrokerUnavailable` error
pub async fn ensure_exchange_pair(
    handle: &mut ChannelHandle,
    name: &str,
) -> Result<ExchangePair, FlowError> {
    ExchangePairProvisioner::new(name).ensure(handle).await
}

/// Ensures a durable queue exists and is bound to `exchange_name`.
///
/// # Parameters
/// * `handle` - Provisioning channel, replaced if the broker closes it
/// * `queue_name` - Queue to declare
/// * `exchange_name` - Exchange the queue is bound to
/// * `routing_key` - Binding key
///
/// # Returns
/// The established binding, or a `TopologyConflict` / `BrokerUnavailable` error
pub async fn ensure_queue_binding(
    handle: &mut ChannelHandle,
    queue_name: &str,
    exchange_name: &str,
    routing_key: &str,
) -> Result<QueueBinding, FlowError> {
    let binding = QueueBinding::new(queue_name)
        .exchange(exchange_name)
        .routing_key(routing_key);
    QueueBindingProvisioner::new(binding).ensure(handle).await
}

async fn ensure_exchange(
    session: &mut Session<'_>,
    exchange: &ExchangeDescriptor,
) -> Result<(), FlowError> {
    let name = exchange.name.as_str();
    let kind = exchange.kind;
    let durable = exchange.durable;

    let checked = session
        .step("check exchange", move |ch| async move {
            ch.declare_exchange(name, kind, durable, true).await
        })
        .await?;

    let declared = match checked {
        Declared::NotFound => {
            debug!("creating exchange: {}", name);
            session
                .step("declare exchange", move |ch| async move {
                    ch.declare_exchange(name, kind, durable, false).await
                })
                .await?
        }
        other => other,
    };

    match declared {
        Declared::Ok => {
            debug!("exchange: {} is {}", name, kind);
            Ok(())
        }
        // A concurrent provisioner created it first with the same kind.
        Declared::Conflict(Some(actual)) if actual == kind => Ok(()),
        Declared::Conflict(actual) => {
            let detail = match actual {
                Some(actual) => format!("declared as {} but exists as {}", kind, actual),
                None => format!("declared as {} but exists with different settings", kind),
            };
            Err(conflict(name, &detail))
        }
        Declared::NotFound => Err(FlowError::BrokerUnavailable(format!(
            "exchange `{}` still missing after declaration",
            name
        ))),
    }
}

fn conflict(resource: &str, detail: &str) -> FlowError {
    error!(resource, detail, "topology conflict");
    FlowError::TopologyConflict {
        resource: resource.to_owned(),
        detail: detail.to_owned(),
    }
}

/// One provisioning call: tracks the single channel recovery it is allowed.
struct Session<'h> {
    handle: &'h mut ChannelHandle,
    recovered: bool,
}

impl<'h> Session<'h> {
    fn new(handle: &'h mut ChannelHandle) -> Self {
        Session {
            handle,
            recovered: false,
        }
    }

    /// Runs one step, resuming it once on a fresh channel if the broker
    /// closes the current one.
    async fn step<T, F, Fut>(&mut self, name: &'static str, op: F) -> Result<T, FlowError>
    where
        F: Fn(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        self.handle.ensure_open().await?;

        match op(self.handle.channel()).await {
            Err(err) if err.closes_channel() && !self.recovered => {
                warn!(step = name, error = err.to_string(), "channel closed by broker, retrying");
                self.recovered = true;
                self.handle.reacquire().await?;
                op(self.handle.channel()).await.map_err(|err| {
                    error!(step = name, error = err.to_string(), "step failed after channel recovery");
                    FlowError::from(err)
                })
            }
            Err(err) => {
                error!(step = name, error = err.to_string(), "provisioning step failed");
                Err(FlowError::from(err))
            }
            Ok(value) => Ok(value),
        }
    }
}
