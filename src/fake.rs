// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! It keeps exchanges, queues and bindings, closes a channel whenever a real
//! broker would (404/406 replies) and records every publish and ack. A few
//! hooks inject the faults a shared broker produces: closed channels, another
//! provisioner declaring the same exchange, consumers cancelled under a stage.

use crate::{
    broker::{
        Bound, BrokerChannel, BrokerConnection, Declared, DeliveryStream, Headers,
        PendingDelivery,
    },
    errors::BrokerError,
    exchange::ExchangeKind,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
}

#[derive(Default)]
pub(crate) struct BrokerState {
    pub exchanges: HashMap<String, ExchangeKind>,
    /// Queue name to durability.
    pub queues: HashMap<String, bool>,
    pub exchange_bindings: HashSet<(String, String, String)>,
    pub queue_bindings: HashSet<(String, String, String)>,
    pub mutations: usize,
    pub channels_opened: usize,
    pub published: Vec<Published>,
    pub acked: Vec<u64>,
    pub consumers: Vec<String>,
    pub deliveries: HashMap<String, Vec<PendingDelivery>>,
    /// Operation names that will close the channel once, on their next call.
    pub close_on: Vec<&'static str>,
    pub fail_publish: bool,
    /// Exchanges another provisioner declares, with the given kind, right
    /// after our passive check missed them.
    pub racing_exchanges: HashMap<String, ExchangeKind>,
    /// Exchanges whose next declaration reports it lost the race.
    pub lost_races: HashSet<String>,
    /// Queue name to the number of consumers that end before any delivery.
    pub ending_consumers: HashMap<String, usize>,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    state: Mutex<BrokerState>,
    acked: Notify,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeBroker::default())
    }

    pub fn connection(self: &Arc<Self>) -> Arc<dyn BrokerConnection> {
        Arc::new(FakeConnection {
            broker: self.clone(),
        })
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_exchange(&self, name: &str, kind: ExchangeKind) {
        self.with_state(|s| {
            s.exchanges.insert(name.to_owned(), kind);
        });
    }

    pub fn add_queue(&self, name: &str, durable: bool) {
        self.with_state(|s| {
            s.queues.insert(name.to_owned(), durable);
        });
    }

    pub fn race_declaration_of(&self, exchange: &str, kind: ExchangeKind) {
        self.with_state(|s| {
            s.racing_exchanges.insert(exchange.to_owned(), kind);
        });
    }

    /// The next `times` consumers on `queue` see their stream end at once,
    /// leaving the backlog queued.
    pub fn end_consumers_of(&self, queue: &str, times: usize) {
        self.with_state(|s| {
            s.ending_consumers.insert(queue.to_owned(), times);
        });
    }

    pub fn close_channel_on(&self, op: &'static str) {
        self.with_state(|s| s.close_on.push(op));
    }

    pub fn enqueue(&self, queue: &str, delivery: PendingDelivery) {
        self.with_state(|s| {
            s.deliveries
                .entry(queue.to_owned())
                .or_default()
                .push(delivery)
        });
    }

    pub fn mutations(&self) -> usize {
        self.with_state(|s| s.mutations)
    }

    pub fn published(&self) -> Vec<Published> {
        self.with_state(|s| s.published.clone())
    }

    pub fn acked(&self) -> Vec<u64> {
        self.with_state(|s| s.acked.clone())
    }

    /// Resolves once at least `count` deliveries have been acknowledged.
    pub async fn wait_for_acks(&self, count: usize) {
        loop {
            let notified = self.acked.notified();
            if self.with_state(|s| s.acked.len()) >= count {
                return;
            }
            notified.await;
        }
    }

    fn take_close(&self, op: &'static str) -> bool {
        self.with_state(|s| match s.close_on.iter().position(|o| *o == op) {
            Some(idx) => {
                s.close_on.remove(idx);
                true
            }
            None => false,
        })
    }
}

struct FakeConnection {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.broker.with_state(|s| s.channels_opened += 1);
        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct FakeChannel {
    broker: Arc<FakeBroker>,
    open: AtomicBool,
}

impl FakeChannel {
    fn guard(&self, op: &'static str) -> Result<(), BrokerError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed("channel already closed".to_owned()));
        }
        if self.broker.take_close(op) {
            self.close();
            return Err(BrokerError::ChannelClosed(format!("closed during {}", op)));
        }
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _durable: bool,
        passive: bool,
    ) -> Result<Declared, BrokerError> {
        self.guard("declare_exchange")?;
        let (existing, lost_race) = self.broker.with_state(|s| {
            let lost_race = !passive && s.lost_races.remove(name);
            (s.exchanges.get(name).copied(), lost_race)
        });
        if lost_race {
            self.close();
            return Ok(Declared::Conflict(existing));
        }

        match (existing, passive) {
            (Some(actual), _) if actual != kind => {
                self.close();
                Ok(Declared::Conflict(Some(actual)))
            }
            (Some(_), _) => Ok(Declared::Ok),
            (None, true) => {
                self.broker.with_state(|s| {
                    if let Some(winner) = s.racing_exchanges.remove(name) {
                        s.exchanges.insert(name.to_owned(), winner);
                        if winner == kind {
                            s.lost_races.insert(name.to_owned());
                        }
                    }
                });
                self.close();
                Ok(Declared::NotFound)
            }
            (None, false) => {
                self.broker.with_state(|s| {
                    s.exchanges.insert(name.to_owned(), kind);
                    s.mutations += 1;
                });
                Ok(Declared::Ok)
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        passive: bool,
    ) -> Result<Declared, BrokerError> {
        self.guard("declare_queue")?;
        let existing = self.broker.with_state(|s| s.queues.get(name).copied());
        match (existing, passive) {
            (Some(actual), _) if actual != durable => {
                self.close();
                Ok(Declared::Conflict(None))
            }
            (Some(_), _) => Ok(Declared::Ok),
            (None, true) => {
                self.close();
                Ok(Declared::NotFound)
            }
            (None, false) => {
                self.broker.with_state(|s| {
                    s.queues.insert(name.to_owned(), durable);
                    s.mutations += 1;
                });
                Ok(Declared::Ok)
            }
        }
    }

    async fn bind_exchanges(
        &self,
        source: &str,
        destination: &str,
        routing_key: &str,
    ) -> Result<Bound, BrokerError> {
        self.guard("bind_exchanges")?;
        let key = (
            source.to_owned(),
            destination.to_owned(),
            routing_key.to_owned(),
        );
        Ok(self.broker.with_state(|s| {
            if s.exchange_bindings.insert(key) {
                s.mutations += 1;
                Bound::Created
            } else {
                Bound::AlreadyBound
            }
        }))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<Bound, BrokerError> {
        self.guard("bind_queue")?;
        let key = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        Ok(self.broker.with_state(|s| {
            if s.queue_bindings.insert(key) {
                s.mutations += 1;
                Bound::Created
            } else {
                Bound::AlreadyBound
            }
        }))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &Headers,
    ) -> Result<(), BrokerError> {
        self.guard("publish")?;
        self.broker.with_state(|s| {
            if s.fail_publish {
                return Err(BrokerError::ChannelClosed("publish refused".to_owned()));
            }
            s.published.push(Published {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                body: body.to_vec(),
                headers: headers.clone(),
            });
            Ok(())
        })
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.guard("consume")?;
        let ending = self.broker.with_state(|s| {
            s.consumers.push(queue.to_owned());
            match s.ending_consumers.get_mut(queue) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        });
        if ending {
            return Ok(stream::empty::<Result<PendingDelivery, BrokerError>>().boxed());
        }

        let deliveries = self
            .broker
            .with_state(|s| s.deliveries.remove(queue).unwrap_or_default());
        // Like a real consumer, the stream stays open after the backlog is drained.
        Ok(stream::iter(deliveries.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed())
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.guard("acknowledge")?;
        self.broker.with_state(|s| s.acked.push(delivery_tag));
        self.broker.acked.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
