// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Application name, broker connection parameters and the consumption mode.
//! Values come from a JSON document, from environment variables, or both
//! (environment wins).

use crate::errors::FlowError;
use serde::Deserialize;
use std::env;

pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_RABBITMQ_HOST: &str = "RABBITMQ_HOST";
pub const ENV_RABBITMQ_PORT: &str = "RABBITMQ_PORT";
pub const ENV_RABBITMQ_USER: &str = "RABBITMQ_USER";
pub const ENV_RABBITMQ_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_RABBITMQ_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_RABBITMQ_PREFETCH: &str = "RABBITMQ_PREFETCH";
pub const ENV_CONSUME_MODE: &str = "RABBITFLOW_CONSUME_MODE";

/// How registered stages are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeMode {
    /// One task and one channel per stage; a slow stage cannot starve the others.
    #[default]
    PerStage,
    /// A single loop on a single channel services every stage in turn.
    Shared,
}

impl ConsumeMode {
    fn parse(value: &str) -> Result<Self, FlowError> {
        match value {
            "per_stage" => Ok(ConsumeMode::PerStage),
            "shared" => Ok(ConsumeMode::Shared),
            other => Err(FlowError::ConfigurationError(format!(
                "unknown consume mode `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "rabbitflow".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Empty selects the broker's default vhost.
    pub vhost: String,
    pub prefetch: Option<u16>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            prefetch: None,
        }
    }
}

impl RabbitMQConfigs {
    /// The AMQP URI for these parameters.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FlowConfigs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub consume_mode: ConsumeMode,
}

impl FlowConfigs {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(document: &str) -> Result<Self, FlowError> {
        serde_json::from_str(document)
            .map_err(|err| FlowError::ConfigurationError(format!("invalid configuration: {}", err)))
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, FlowError> {
        FlowConfigs::default().with_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides looked up by environment variable name.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, FlowError> {
        if let Some(name) = lookup(ENV_APP_NAME) {
            self.app.name = name;
        }
        if let Some(host) = lookup(ENV_RABBITMQ_HOST) {
            self.rabbitmq.host = host;
        }
        if let Some(port) = lookup(ENV_RABBITMQ_PORT) {
            self.rabbitmq.port = parse_number(ENV_RABBITMQ_PORT, &port)?;
        }
        if let Some(user) = lookup(ENV_RABBITMQ_USER) {
            self.rabbitmq.user = user;
        }
        if let Some(password) = lookup(ENV_RABBITMQ_PASSWORD) {
            self.rabbitmq.password = password;
        }
        if let Some(vhost) = lookup(ENV_RABBITMQ_VHOST) {
            self.rabbitmq.vhost = vhost;
        }
        if let Some(prefetch) = lookup(ENV_RABBITMQ_PREFETCH) {
            self.rabbitmq.prefetch = Some(parse_number(ENV_RABBITMQ_PREFETCH, &prefetch)?);
        }
        if let Some(mode) = lookup(ENV_CONSUME_MODE) {
            self.consume_mode = ConsumeMode::parse(&mode)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Rejects settings that can only fail later.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.app.name.is_empty() {
            return Err(FlowError::ConfigurationError(
                "application name must not be empty".to_owned(),
            ));
        }
        if self.rabbitmq.host.is_empty() {
            return Err(FlowError::ConfigurationError(
                "rabbitmq host must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u16, FlowError> {
    value
        .parse()
        .map_err(|_| FlowError::ConfigurationError(format!("`{}` is not a valid {}", value, key)))
}
