// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Stage Router
//!
//! Wires pipeline stages to live consumers. Registering a stage provisions its
//! input exchange pair, its durable queue and, when an output stage is named,
//! the success and failure pairs it publishes to. Running the router starts
//! the consumers and hands every delivery to [`crate::consumer`].
//!
//! Two scheduling modes are supported (see [`ConsumeMode`]):
//! - per stage: each stage has its own task and channel
//! - shared: one loop on one channel services every stage

use crate::{
    broker::{BrokerChannel, BrokerConnection, ChannelHandle, PendingDelivery},
    config::ConsumeMode,
    consumer::{consume, Outcome},
    errors::{BrokerError, FlowError},
    exchange::ExchangePair,
    processor::StageProcessor,
    queue::{queue_name, QueueBinding},
    topology::{ensure_exchange_pair, ensure_queue_binding},
};
use futures_util::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use opentelemetry::global::{self, BoxedTracer};
use std::{future::Future, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Suffix of the exchange pair receiving successful results.
pub const SUCCESS_SUFFIX: &str = "success";
/// Suffix of the exchange pair receiving failure reasons.
pub const FAILURE_SUFFIX: &str = "failure";

const TRACER_NAME: &str = "rabbitflow stage";

/// Exchange pairs a stage publishes its results to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutputs {
    pub success: ExchangePair,
    pub failure: ExchangePair,
}

/// A registered pipeline stage. Immutable once registered.
#[derive(Clone)]
pub struct Stage {
    /// Fully-qualified stage name, `<app>.<stage>`.
    pub name: String,
    pub input: ExchangePair,
    pub queue_binding: QueueBinding,
    pub processor: Arc<dyn StageProcessor>,
    pub outputs: Option<StageOutputs>,
}

/// Lifecycle of a stage inside the router. `Consuming` lasts until shutdown;
/// a provisioning error sends the stage back to `Unregistered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unregistered,
    Provisioning,
    Consuming,
}

/// Registers stages and drives their consumers.
pub struct StageRouter {
    app: String,
    connection: Arc<dyn BrokerConnection>,
    handle: ChannelHandle,
    mode: ConsumeMode,
    stages: Vec<Stage>,
}

impl StageRouter {
    /// Creates a router for application `app`, opening the channel used for
    /// provisioning.
    pub async fn new(
        app: &str,
        connection: Arc<dyn BrokerConnection>,
        mode: ConsumeMode,
    ) -> Result<StageRouter, FlowError> {
        let handle = ChannelHandle::open(connection.clone()).await?;
        Ok(StageRouter {
            app: app.to_owned(),
            connection,
            handle,
            mode,
            stages: vec![],
        })
    }

    /// Provisions the topology of a stage and records it for consumption.
    ///
    /// A provisioning error aborts the registration; nothing is recorded and
    /// whatever topology was already created stays on the broker.
    ///
    /// # Parameters
    /// * `name` - Stage name, without the application prefix
    /// * `processor` - Processor run on every delivery of the stage
    /// * `output_stage` - Stage receiving the results, if any
    ///
    /// # Returns
    /// Ok(()) once the input and output topology exist
    pub async fn register_stage(
        &mut self,
        name: &str,
        processor: Arc<dyn StageProcessor>,
        output_stage: Option<&str>,
    ) -> Result<(), FlowError> {
        let stage_name = format!("{}.{}", self.app, name);
        debug!(stage = stage_name.as_str(), state = ?StageState::Provisioning, "provisioning stage");

        let stage = match self.provision(name, stage_name, processor, output_stage).await {
            Ok(stage) => stage,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    stage = name,
                    state = ?StageState::Unregistered,
                    "stage registration aborted"
                );
                return Err(err);
            }
        };

        info!(
            stage = stage.name.as_str(),
            queue = stage.queue_binding.queue_name.as_str(),
            output = output_stage.unwrap_or("-"),
            "stage registered"
        );
        self.stages.push(stage);

        Ok(())
    }

    async fn provision(
        &mut self,
        name: &str,
        stage_name: String,
        processor: Arc<dyn StageProcessor>,
        output_stage: Option<&str>,
    ) -> Result<Stage, FlowError> {
        let input = ensure_exchange_pair(&mut self.handle, &stage_name).await?;
        let queue = queue_name(&self.app, name);
        let queue_binding = ensure_queue_binding(
            &mut self.handle,
            &queue,
            input.topic(),
            &input.binding_routing_key,
        )
        .await?;

        let outputs = match output_stage {
            Some(output) => {
                let base = format!("{}.{}", self.app, output);
                let success = ensure_exchange_pair(
                    &mut self.handle,
                    &format!("{}.{}", base, SUCCESS_SUFFIX),
                )
                .await?;
                let failure = ensure_exchange_pair(
                    &mut self.handle,
                    &format!("{}.{}", base, FAILURE_SUFFIX),
                )
                .await?;
                Some(StageOutputs { success, failure })
            }
            None => None,
        };

        Ok(Stage {
            name: stage_name,
            input,
            queue_binding,
            processor,
            outputs,
        })
    }

    /// The stages registered so far.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Consumes every registered stage until `shutdown` resolves.
    ///
    /// Shutdown is honoured between deliveries only; a delivery being handled
    /// is always finished and acknowledged first. Deliveries the broker has
    /// pushed but that were not handled yet stay unacknowledged and will be
    /// redelivered.
    ///
    /// A consumer whose channel closes is subscribed again on a new channel.
    /// If that fails, every stage is stopped and the error is returned.
    ///
    /// # Parameters
    /// * `shutdown` - Future resolving when consumption must stop
    ///
    /// # Returns
    /// Ok(()) after a graceful shutdown, or the error that stopped a stage
    pub async fn run<S>(self, shutdown: S) -> Result<(), FlowError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        if self.stages.is_empty() {
            return Err(FlowError::ConfigurationError(
                "no stage registered".to_owned(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let notify = stop_tx.clone();
        let notifier = tokio::spawn(async move {
            shutdown.await;
            notify.send_replace(true);
        });

        let result = match self.mode {
            ConsumeMode::PerStage => run_per_stage(self.connection, self.stages, &stop_tx).await,
            ConsumeMode::Shared => run_consumer(self.connection, self.stages, stop_rx).await,
        };

        notifier.abort();
        result
    }
}

/// A delivery tagged with the index of its stage; `None` marks the end of
/// that stage's consumer stream.
type Tagged = (usize, Option<Result<PendingDelivery, BrokerError>>);

/// Why a consume loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    /// A consumer stream ended after `handled` deliveries.
    StreamEnded { handled: usize },
}

/// One task per stage. The first stage that cannot be recovered stops every
/// other stage, so the run never keeps going with part of the pipeline dead.
async fn run_per_stage(
    connection: Arc<dyn BrokerConnection>,
    stages: Vec<Stage>,
    stop: &watch::Sender<bool>,
) -> Result<(), FlowError> {
    let mut pending: Vec<_> = stages
        .into_iter()
        .map(|stage| {
            let consumer = run_consumer(connection.clone(), vec![stage], stop.subscribe());
            tokio::spawn(consumer)
        })
        .collect();

    let mut result = Ok(());
    while !pending.is_empty() {
        let (finished, _, rest) = future::select_all(pending).await;
        pending = rest;

        let finished = finished.unwrap_or_else(|err| {
            error!(error = err.to_string(), "tokio process error");
            Err(FlowError::BrokerUnavailable(
                "stage consumer task failed".to_owned(),
            ))
        });

        if let Err(err) = finished {
            error!(
                error = err.to_string(),
                "stage consumer stopped, stopping the other stages"
            );
            stop.send_replace(true);
            result = result.and(Err(err));
        }
    }

    result
}

/// Consumes `stages` on one channel until shutdown.
///
/// When a consumer stream ends (its channel was closed), a new channel is
/// opened and the stages are subscribed again. Only one recovery is allowed
/// in a row: a recovered subscription that ends again before handling any
/// delivery is fatal.
async fn run_consumer(
    connection: Arc<dyn BrokerConnection>,
    stages: Vec<Stage>,
    stop: watch::Receiver<bool>,
) -> Result<(), FlowError> {
    let tracer = global::tracer(TRACER_NAME);
    let mut recovered = false;

    loop {
        let (channel, deliveries) = subscribe(connection.as_ref(), &stages).await?;

        match consume_loop(&tracer, &stages, channel, deliveries, stop.clone()).await {
            LoopExit::Shutdown => return Ok(()),
            LoopExit::StreamEnded { handled } => {
                if recovered && handled == 0 {
                    error!(stages = stages.len(), "consumer stream ended again after recovery");
                    return Err(FlowError::BrokerUnavailable(
                        "consumer stream ended".to_owned(),
                    ));
                }
                warn!(handled, "consumer stream ended, subscribing on a new channel");
                recovered = true;
            }
        }
    }
}

/// Opens a channel and starts one consumer per stage on it.
async fn subscribe(
    connection: &dyn BrokerConnection,
    stages: &[Stage],
) -> Result<(Arc<dyn BrokerChannel>, BoxStream<'static, Tagged>), FlowError> {
    let channel = connection.open_channel().await?;

    let mut streams = Vec::with_capacity(stages.len());
    for (idx, stage) in stages.iter().enumerate() {
        let deliveries = channel
            .consume(&stage.queue_binding.queue_name, &stage.name)
            .await?;
        streams.push(
            deliveries
                .map(move |d| (idx, Some(d)))
                .chain(stream::once(async move { (idx, None) }))
                .boxed(),
        );
    }

    Ok((channel, stream::select_all(streams).boxed()))
}

/// Handles deliveries one at a time until shutdown or until a consumer
/// stream ends.
async fn consume_loop(
    tracer: &BoxedTracer,
    stages: &[Stage],
    channel: Arc<dyn BrokerChannel>,
    mut deliveries: BoxStream<'static, Tagged>,
    mut stop: watch::Receiver<bool>,
) -> LoopExit {
    for stage in stages {
        info!(stage = stage.name.as_str(), state = ?StageState::Consuming, "consuming");
    }

    let mut handled = 0;
    loop {
        if *stop.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = stop.changed() => None,
            next = deliveries.next() => Some(next),
        };

        match next {
            None => break,
            Some(None) => return LoopExit::StreamEnded { handled },
            Some(Some((idx, None))) => {
                error!(
                    stage = stages[idx].name.as_str(),
                    "consumer stream ended, channel is closed"
                );
                return LoopExit::StreamEnded { handled };
            }
            Some(Some((_, Some(Err(err))))) => error!(error = err.to_string(), "errors consume msg"),
            Some(Some((idx, Some(Ok(delivery))))) => {
                let outcome: Outcome = consume(tracer, &stages[idx], channel.as_ref(), delivery).await;
                debug!(stage = stages[idx].name.as_str(), ?outcome, "delivery handled");
                handled += 1;
            }
        }
    }

    info!("consumer stopped");
    LoopExit::Shutdown
}
