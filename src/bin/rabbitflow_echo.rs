// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Runs the preset decode → validate → process pipeline with pass-through
//! processors. Useful to check a broker's topology and message flow.

use anyhow::{Context, Result};
use clap::Parser;
use rabbitflow::{config::FlowConfigs, Passthrough, Pipeline, PipelineMode, RabbitFlow};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Part of the pipeline to run: decoder, validator, processor or all
    #[arg(long, default_value = "all")]
    mode: String,

    /// JSON configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let mode: PipelineMode = args.mode.parse()?;
    let cfg = match &args.config {
        Some(path) => {
            let document = std::fs::read_to_string(path)
                .with_context(|| format!("reading configuration file {}", path))?;
            FlowConfigs::from_json(&document)?
        }
        None => FlowConfigs::default(),
    }
    .with_overrides(|key| std::env::var(key).ok())?;

    info!(app = cfg.app.name.as_str(), %mode, "starting rabbitflow");

    let pipeline = Pipeline::new()
        .decoder(Passthrough)
        .validator(Passthrough)
        .processor(Passthrough);

    let mut app = RabbitFlow::connect(&cfg).await?;
    app.register_pipeline(&pipeline, mode).await?;
    app.run().await?;

    Ok(())
}
