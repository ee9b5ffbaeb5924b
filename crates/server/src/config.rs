use std::fs;

use anyhow::Context;
use serde::Deserialize;
use shared::domain::{ControllerSchema, Mode, ParamSpec};

#[derive(Debug)]
pub struct Settings {
    pub server_bind: String,
    pub schema: ControllerSchema,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            schema: ControllerSchema::default(),
            max_body_bytes: 16 * 1024,
        }
    }
}

/// Shape of `server.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    bind_addr: Option<String>,
    max_body_bytes: Option<usize>,
    modes: Option<Vec<String>>,
    #[serde(default)]
    params: Vec<ParamSpec>,
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let raw = fs::read_to_string("server.toml").ok();
    let mut settings = settings_from(raw.as_deref())?;

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("APP__MAX_BODY_BYTES") {
        settings.max_body_bytes = v
            .parse()
            .with_context(|| format!("APP__MAX_BODY_BYTES is not a byte count: {v}"))?;
    }

    Ok(settings)
}

fn settings_from(raw: Option<&str>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    let Some(raw) = raw else {
        return Ok(settings);
    };
    let file_cfg: FileSettings = toml::from_str(raw).context("failed to parse server.toml")?;

    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.max_body_bytes {
        settings.max_body_bytes = v;
    }
    if let Some(modes) = file_cfg.modes {
        anyhow::ensure!(!modes.is_empty(), "server.toml must list at least one mode");
        settings.schema.modes = modes.into_iter().map(Mode::new).collect();
    }
    if !file_cfg.params.is_empty() {
        for spec in &file_cfg.params {
            anyhow::ensure!(
                spec.min <= spec.max,
                "parameter {} has min {} above max {}",
                spec.name,
                spec.min,
                spec.max
            );
        }
        settings.schema.params = file_cfg.params;
    }

    Ok(settings)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
