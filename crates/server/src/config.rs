use std::fs;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedUser {
    pub id: String,
    pub email: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_bind: String,
    pub jwt_secret: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub cookie_secure: bool,
    pub users: Vec<SeedUser>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            jwt_secret: "dev-session-secret".into(),
            access_ttl_seconds: 900,
            refresh_ttl_seconds: 30 * 24 * 3600,
            cookie_secure: false,
            users: vec![SeedUser {
                id: "demo".into(),
                email: "demo@tours.example".into(),
                password: "demo".into(),
                display_name: "Demo Traveller".into(),
            }],
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        match toml::from_str::<Settings>(&raw) {
            Ok(file_cfg) => settings = file_cfg,
            Err(err) => warn!("config: ignoring malformed server.toml: {err}"),
        }
    }

    apply_env_overrides(settings, |key| std::env::var(key).ok())
}

pub(crate) fn apply_env_overrides(
    mut settings: Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    if let Some(v) = lookup("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = lookup("APP__JWT_SECRET") {
        settings.jwt_secret = v;
    }

    if let Some(v) = lookup("APP__ACCESS_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.access_ttl_seconds = parsed;
        }
    }
    if let Some(v) = lookup("APP__REFRESH_TTL_SECONDS") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.refresh_ttl_seconds = parsed;
        }
    }

    if let Some(v) = lookup("APP__COOKIE_SECURE") {
        settings.cookie_secure = matches!(v.trim(), "1" | "true" | "yes");
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
