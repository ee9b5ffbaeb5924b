use std::collections::HashMap;

use config::FileFormat;

use super::*;

fn env(vars: &[(&str, &str)]) -> Environment {
    let map = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    Environment::with_prefix("LIGHTS")
        .separator("__")
        .try_parsing(true)
        .source(Some(map))
}

fn toml(raw: &str) -> impl config::Source + Send + Sync + 'static {
    File::from_str(raw, FileFormat::Toml)
}

#[test]
fn defaults_apply_without_sources() {
    let settings = ClientSettings::load_from(toml(""), env(&[])).expect("settings");
    assert_eq!(settings.deployment_mode, DeploymentMode::Development);
    assert_eq!(settings.active_origin(), "http://localhost:8000");
    assert_eq!(settings.debounce_ms, 100);

    let options = settings.session_options();
    assert_eq!(options.backoff.floor, Duration::from_millis(250));
    assert_eq!(options.backoff.ceiling, Duration::from_secs(10));
    assert_eq!(options.max_consecutive_bad_frames, 8);
}

#[test]
fn environment_overrides_file() {
    let settings = ClientSettings::load_from(
        toml(
            "deployment_mode = \"development\"\n\
             debounce_ms = 40\n\
             controller_origin = \"http://lights.lan\"",
        ),
        env(&[
            ("LIGHTS__DEPLOYMENT_MODE", "production"),
            ("LIGHTS__DEBOUNCE_MS", "75"),
        ]),
    )
    .expect("settings");

    assert_eq!(settings.deployment_mode, DeploymentMode::Production);
    assert_eq!(settings.debounce_ms, 75);
    let endpoints = settings.endpoints().expect("endpoints");
    assert_eq!(endpoints.ws_url.as_str(), "ws://lights.lan/ws");
}

#[test]
fn development_mode_uses_explicit_controller_url() {
    let settings = ClientSettings::load_from(
        toml("dev_controller_url = \"https://localhost:8443\""),
        env(&[]),
    )
    .expect("settings");
    let endpoints = settings.endpoints().expect("endpoints");
    assert_eq!(endpoints.ws_url.as_str(), "wss://localhost:8443/ws");
    assert_eq!(endpoints.http_base.as_str(), "https://localhost:8443/");
}

#[test]
fn rejects_inverted_backoff_bounds() {
    let err = ClientSettings::load_from(
        toml("backoff_floor_ms = 5000\nbackoff_ceiling_ms = 100"),
        env(&[]),
    )
    .expect_err("floor above ceiling");
    assert!(err.to_string().contains("backoff floor"));
}

#[test]
fn rejects_unknown_deployment_mode() {
    assert!(
        ClientSettings::load_from(toml(""), env(&[("LIGHTS__DEPLOYMENT_MODE", "staging")]))
            .is_err()
    );
}
