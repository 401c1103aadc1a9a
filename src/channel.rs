// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channels
//!
//! The lapin-backed implementation of the broker capability. Lapin errors are
//! mapped here, once, onto [`BrokerError`] using AMQP reply codes and channel
//! state, so that nothing above this module looks at error text.

use crate::{
    broker::{
        Bound, BrokerChannel, BrokerConnection, Declared, DeliveryStream, Headers,
        PendingDelivery,
    },
    config::FlowConfigs,
    errors::{BrokerError, FlowError, REPLY_NOT_FOUND, REPLY_PRECONDITION_FAILED},
    exchange::ExchangeKind,
    publisher,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent when closing the connection normally.
const REPLY_SUCCESS: u16 = 200;

/// A lapin connection that hands out [`LapinChannel`]s.
pub struct LapinConnection {
    connection: Connection,
    prefetch: Option<u16>,
}

impl LapinConnection {
    /// Connects to RabbitMQ with the parameters in `cfg`.
    ///
    /// The connection is named after the application so it can be told apart
    /// in the broker's management UI.
    pub async fn connect(cfg: &FlowConfigs) -> Result<Arc<LapinConnection>, FlowError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app.name.clone()));

        let connection = match Connection::connect(&cfg.rabbitmq.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(FlowError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection {
            connection,
            prefetch: cfg.rabbitmq.prefetch,
        }))
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        debug!("creating amqp channel...");
        let channel = match self.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(map_error(err))
            }
        }?;

        if let Some(prefetch) = self.prefetch {
            if let Err(err) = channel.basic_qos(prefetch, BasicQosOptions::default()).await {
                error!(error = err.to_string(), prefetch, "failure to configure qos");
                return Err(map_error(err));
            }
        }

        debug!("channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(map_error)?;
        debug!("amqp connection closed");
        Ok(())
    }
}

/// One lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    async fn redeclare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<Declared, BrokerError> {
        let result = self
            .channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(()) => Ok(Declared::Ok),
            Err(err) => declared_from(map_error(err)),
        }
    }

    async fn redeclare_queue(&self, name: &str, durable: bool) -> Result<Declared, BrokerError> {
        let result = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        match result {
            Ok(_) => Ok(Declared::Ok),
            Err(err) => declared_from(map_error(err)),
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        passive: bool,
    ) -> Result<Declared, BrokerError> {
        if !passive {
            return self.redeclare_exchange(name, kind, durable).await;
        }

        let checked = self
            .channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: true,
                    durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        match checked {
            // A passive declaration does not compare the type, an equivalent
            // redeclaration does and is a no-op on the broker.
            Ok(()) => self.redeclare_exchange(name, kind, durable).await,
            Err(err) => declared_from(map_error(err)),
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        passive: bool,
    ) -> Result<Declared, BrokerError> {
        if !passive {
            return self.redeclare_queue(name, durable).await;
        }

        let checked = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await;

        match checked {
            // Same as exchanges: durability is only compared by a real declaration.
            Ok(_) => self.redeclare_queue(name, durable).await,
            Err(err) => declared_from(map_error(err)),
        }
    }

    async fn bind_exchanges(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<Bound, BrokerError> {
        // AMQP bindings are idempotent, an existing one is confirmed like a new one.
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map(|_| Bound::Created)
            .map_err(map_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Bound, BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map(|_| Bound::Created)
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                publisher::properties(headers),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(map_error(err))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(map_error(err))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(|delivery| PendingDelivery {
                        delivery_tag: delivery.delivery_tag,
                        headers: publisher::headers(&delivery.properties),
                        body: delivery.data,
                    })
                    .map_err(map_error)
            })
            .boxed())
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(map_error)
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

/// Maps a lapin error onto the structured broker error.
fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(amqp) => BrokerError::Rejected {
            code: amqp.get_id(),
            message: amqp.get_message().to_string(),
        },
        lapin::Error::InvalidChannelState(state) => {
            BrokerError::ChannelClosed(format!("channel is {:?}", state))
        }
        other => BrokerError::Unavailable(other.to_string()),
    }
}

/// Turns a declaration error into an outcome where the reply code says so.
fn declared_from(err: BrokerError) -> Result<Declared, BrokerError> {
    match err {
        BrokerError::Rejected { code, .. } if code == REPLY_NOT_FOUND => Ok(Declared::NotFound),
        BrokerError::Rejected { code, .. } if code == REPLY_PRECONDITION_FAILED => {
            Ok(Declared::Conflict(None))
        }
        other => Err(other),
    }
}
