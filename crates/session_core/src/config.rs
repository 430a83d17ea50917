use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::Role;
use tracing::warn;

use crate::transport::ReconnectPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub role: Role,
    pub request_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            role: Role::Customer,
            request_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Defaults, then `client.toml` in the working directory, then `APP__*` variables.
pub fn load_settings() -> anyhow::Result<ClientSettings> {
    load_settings_from(DEFAULT_CONFIG_PATH)
}

/// A missing file is not an error; a malformed one is.
pub fn load_settings_from(path: impl AsRef<Path>) -> anyhow::Result<ClientSettings> {
    let path = path.as_ref();
    let settings = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<ClientSettings>(&raw)
            .with_context(|| format!("failed to parse client config '{}'", path.display()))?,
        Err(_) => ClientSettings::default(),
    };
    Ok(apply_env_overrides(settings, |key| std::env::var(key).ok()))
}

pub(crate) fn apply_env_overrides(
    mut settings: ClientSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__ROLE") {
        match v.parse::<Role>() {
            Ok(role) => settings.role = role,
            Err(err) => warn!("config: ignoring APP__ROLE: {err}"),
        }
    }
    override_number(&lookup, "APP__REQUEST_TIMEOUT_MS", &mut settings.request_timeout_ms);
    override_number(
        &lookup,
        "APP__RECONNECT_MAX_ATTEMPTS",
        &mut settings.reconnect.max_attempts,
    );
    override_number(
        &lookup,
        "APP__RECONNECT_BASE_DELAY_MS",
        &mut settings.reconnect.base_delay_ms,
    );
    override_number(
        &lookup,
        "APP__RECONNECT_MAX_DELAY_MS",
        &mut settings.reconnect.max_delay_ms,
    );
    settings
}

fn override_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring non-numeric override"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
