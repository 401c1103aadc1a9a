// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitFlow Application
//!
//! Ties the configuration, the broker connection and the stage router
//! together, and provides the decode → validate → process pipeline preset.

use crate::{
    broker::BrokerConnection,
    channel::LapinConnection,
    config::{ConsumeMode, FlowConfigs},
    errors::FlowError,
    processor::StageProcessor,
    router::StageRouter,
};
use std::{fmt, future::Future, str::FromStr, sync::Arc};
use tracing::{error, info};

/// Stage fed by raw input messages.
pub const RAW_STAGE: &str = "raw";
/// Output stage of the decoder.
pub const DECODED_STAGE: &str = "decoded";
/// Output stage of the validator.
pub const VALIDATED_STAGE: &str = "validated";
/// Output stage of the processor.
pub const PROCESSED_STAGE: &str = "processed";

/// Which part of the preset pipeline this process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineMode {
    Decoder,
    Validator,
    Processor,
    #[default]
    All,
}

impl FromStr for PipelineMode {
    type Err = FlowError;

    fn from_str(value: &str) -> Result<Self, FlowError> {
        match value {
            "decoder" => Ok(PipelineMode::Decoder),
            "validator" => Ok(PipelineMode::Validator),
            "processor" => Ok(PipelineMode::Processor),
            "all" => Ok(PipelineMode::All),
            other => Err(FlowError::ConfigurationError(format!(
                "unknown mode `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineMode::Decoder => "decoder",
            PipelineMode::Validator => "validator",
            PipelineMode::Processor => "processor",
            PipelineMode::All => "all",
        };
        f.write_str(name)
    }
}

/// One stage to register: input stage name, processor and output stage name.
#[derive(Clone)]
pub struct StagePlan {
    pub stage: String,
    pub processor: Arc<dyn StageProcessor>,
    pub output_stage: Option<String>,
}

impl fmt::Debug for StagePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagePlan")
            .field("stage", &self.stage)
            .field("output_stage", &self.output_stage)
            .finish()
    }
}

/// Components of the decode → validate → process pipeline.
#[derive(Default, Clone)]
pub struct Pipeline {
    decoder: Option<Arc<dyn StageProcessor>>,
    validator: Option<Arc<dyn StageProcessor>>,
    processor: Option<Arc<dyn StageProcessor>>,
}

impl Pipeline {
    /// Creates a pipeline without components.
    pub fn new() -> Self {
        Pipeline::default()
    }

    /// Sets the processor consuming the raw stage.
    pub fn decoder(mut self, decoder: impl StageProcessor + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    /// Sets the processor consuming decoded messages.
    pub fn validator(mut self, validator: impl StageProcessor + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Sets the processor consuming validated messages.
    pub fn processor(mut self, processor: impl StageProcessor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    /// The stages `mode` needs, in registration order.
    ///
    /// Every component the mode needs must be present; otherwise nothing is
    /// planned and a configuration error names the missing ones.
    pub fn plan(&self, mode: PipelineMode) -> Result<Vec<StagePlan>, FlowError> {
        let decode = (
            "decoder",
            &self.decoder,
            RAW_STAGE.to_owned(),
            DECODED_STAGE,
        );
        let validate = (
            "validator",
            &self.validator,
            format!("{}.success", DECODED_STAGE),
            VALIDATED_STAGE,
        );
        let process = (
            "processor",
            &self.processor,
            format!("{}.success", VALIDATED_STAGE),
            PROCESSED_STAGE,
        );

        let wanted = match mode {
            PipelineMode::Decoder => vec![decode],
            PipelineMode::Validator => vec![validate],
            PipelineMode::Processor => vec![process],
            PipelineMode::All => vec![decode, validate, process],
        };

        let missing: Vec<&str> = wanted
            .iter()
            .filter(|(_, component, _, _)| component.is_none())
            .map(|(name, _, _, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(FlowError::ConfigurationError(format!(
                "missing pipeline components for mode {}: {}",
                mode,
                missing.join(", ")
            )));
        }

        Ok(wanted
            .into_iter()
            .filter_map(|(_, component, stage, output)| {
                component.clone().map(|processor| StagePlan {
                    stage,
                    processor,
                    output_stage: Some(output.to_owned()),
                })
            })
            .collect())
    }
}

/// A running RabbitFlow application.
pub struct RabbitFlow {
    name: String,
    connection: Arc<dyn BrokerConnection>,
    router: StageRouter,
}

impl RabbitFlow {
    /// Connects to the broker described by `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Application name, broker address and consume mode
    ///
    /// # Returns
    /// The application, or a `ConfigurationError` / `ConnectionError`
    pub async fn connect(cfg: &FlowConfigs) -> Result<RabbitFlow, FlowError> {
        cfg.validate()?;
        let connection = LapinConnection::connect(cfg).await?;
        RabbitFlow::with_connection(&cfg.app.name, connection, cfg.consume_mode).await
    }

    /// Builds an application on an existing broker connection.
    pub async fn with_connection(
        name: &str,
        connection: Arc<dyn BrokerConnection>,
        mode: ConsumeMode,
    ) -> Result<RabbitFlow, FlowError> {
        let router = StageRouter::new(name, connection.clone(), mode).await?;
        info!(app = name, ?mode, "rabbitflow application created");
        Ok(RabbitFlow {
            name: name.to_owned(),
            connection,
            router,
        })
    }

    /// Registers one stage consuming `stage` and publishing to `output_stage`.
    ///
    /// # Parameters
    /// * `stage` - Input stage name, without the application prefix
    /// * `processor` - Processor run on every delivery of the stage
    /// * `output_stage` - Stage receiving the results, if any
    ///
    /// # Returns
    /// Ok(()) once the stage topology is provisioned
    pub async fn register_processor(
        &mut self,
        stage: &str,
        processor: impl StageProcessor + 'static,
        output_stage: Option<&str>,
    ) -> Result<(), FlowError> {
        self.router
            .register_stage(stage, Arc::new(processor), output_stage)
            .await
    }

    /// Registers the stages `mode` needs from `pipeline`.
    ///
    /// Missing components are reported before anything is registered. Any
    /// error is fatal for the application: the connection is closed before
    /// the error is returned.
    ///
    /// # Parameters
    /// * `pipeline` - Processors of the preset pipeline
    /// * `mode` - Part of the pipeline this process runs
    ///
    /// # Returns
    /// Ok(()) once every stage is provisioned, or the first registration error
    pub async fn register_pipeline(
        &mut self,
        pipeline: &Pipeline,
        mode: PipelineMode,
    ) -> Result<(), FlowError> {
        let result = self.register_plan(pipeline, mode).await;

        if let Err(err) = &result {
            error!(error = err.to_string(), %mode, "pipeline not started");
            let _ = close_connection(&self.name, self.connection.as_ref()).await;
        }

        result
    }

    async fn register_plan(
        &mut self,
        pipeline: &Pipeline,
        mode: PipelineMode,
    ) -> Result<(), FlowError> {
        for step in pipeline.plan(mode)? {
            self.router
                .register_stage(&step.stage, step.processor, step.output_stage.as_deref())
                .await?;
        }

        Ok(())
    }

    /// Runs until Ctrl-C.
    pub async fn run(self) -> Result<(), FlowError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = err.to_string(), "failure to listen for shutdown signal");
            }
        })
        .await
    }

    /// Runs until `shutdown` resolves, then closes the connection.
    ///
    /// A fatal error also closes the connection before it is returned.
    pub async fn run_until<S>(self, shutdown: S) -> Result<(), FlowError>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        info!(app = self.name.as_str(), "starting message processing...");
        let result = self.router.run(shutdown).await;

        match &result {
            Ok(()) => info!(app = self.name.as_str(), "shutting down..."),
            Err(err) => error!(error = err.to_string(), app = self.name.as_str(), "fatal error"),
        }

        let _ = close_connection(&self.name, self.connection.as_ref()).await;

        result
    }

    /// Closes the broker connection without running any stage.
    ///
    /// # Returns
    /// Ok(()) once the connection is closed, or a `ConnectionError`
    pub async fn close(self) -> Result<(), FlowError> {
        close_connection(&self.name, self.connection.as_ref()).await
    }
}

async fn close_connection(app: &str, connection: &dyn BrokerConnection) -> Result<(), FlowError> {
    match connection.close().await {
        Ok(()) => {
            info!(app, "connection to rabbitmq closed");
            Ok(())
        }
        Err(err) => {
            error!(error = err.to_string(), app, "failure to close the connection");
            Err(FlowError::ConnectionError(err.to_string()))
        }
    }
}
