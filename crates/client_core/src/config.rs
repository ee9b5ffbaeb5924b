use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use shared::domain::ControllerSchema;

use crate::{
    error::SyncError,
    session::SessionOptions,
    transport::{BackoffPolicy, Endpoints},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Served by the controller itself; the live channel is `/ws` on its origin.
    Production,
    #[default]
    Development,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub deployment_mode: DeploymentMode,
    pub controller_origin: String,
    pub dev_controller_url: String,
    pub debounce_ms: u64,
    pub backoff_floor_ms: u64,
    pub backoff_ceiling_ms: u64,
    pub max_consecutive_bad_frames: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            deployment_mode: DeploymentMode::Development,
            controller_origin: "http://127.0.0.1:8080".into(),
            dev_controller_url: "http://localhost:8000".into(),
            debounce_ms: 100,
            backoff_floor_ms: 250,
            backoff_ceiling_ms: 10_000,
            max_consecutive_bad_frames: 8,
        }
    }
}

impl ClientSettings {
    /// Defaults, then `lights.toml` if present, then `LIGHTS__*` variables.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(
            File::with_name("lights").required(false),
            Environment::with_prefix("LIGHTS")
                .separator("__")
                .try_parsing(true),
        )
    }

    pub(crate) fn load_from<F>(file: F, env: Environment) -> anyhow::Result<Self>
    where
        F: config::Source + Send + Sync + 'static,
    {
        let defaults = Self::default();
        let settings = Config::builder()
            .set_default("deployment_mode", "development")?
            .set_default("controller_origin", defaults.controller_origin)?
            .set_default("dev_controller_url", defaults.dev_controller_url)?
            .set_default("debounce_ms", defaults.debounce_ms as i64)?
            .set_default("backoff_floor_ms", defaults.backoff_floor_ms as i64)?
            .set_default("backoff_ceiling_ms", defaults.backoff_ceiling_ms as i64)?
            .set_default(
                "max_consecutive_bad_frames",
                i64::from(defaults.max_consecutive_bad_frames),
            )?
            .add_source(file)
            .add_source(env)
            .build()
            .context("failed to read client settings")?;
        let settings: Self = settings
            .try_deserialize()
            .context("invalid client settings")?;
        if settings.backoff_floor_ms == 0 || settings.backoff_floor_ms > settings.backoff_ceiling_ms
        {
            anyhow::bail!(
                "backoff floor {}ms must be positive and at most the ceiling {}ms",
                settings.backoff_floor_ms,
                settings.backoff_ceiling_ms
            );
        }
        Ok(settings)
    }

    pub fn active_origin(&self) -> &str {
        match self.deployment_mode {
            DeploymentMode::Production => &self.controller_origin,
            DeploymentMode::Development => &self.dev_controller_url,
        }
    }

    pub fn endpoints(&self) -> Result<Endpoints, SyncError> {
        Endpoints::from_origin(self.active_origin())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            backoff: BackoffPolicy {
                floor: Duration::from_millis(self.backoff_floor_ms),
                ceiling: Duration::from_millis(self.backoff_ceiling_ms),
            },
            max_consecutive_bad_frames: self.max_consecutive_bad_frames,
            schema: ControllerSchema::default(),
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
