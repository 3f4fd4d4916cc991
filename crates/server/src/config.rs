use std::path::Path;

use anyhow::Context;
use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// Hub settings. Defaults, then `server.toml`, then `APP__*` variables, then
/// the plain legacy names (`SERVER_BIND`, `DATABASE_URL`, `JWT_SECRET`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub public_url: Option<String>,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/hub.db".into(),
            public_url: None,
            jwt_secret: "dev-hub-secret".into(),
            token_ttl_seconds: 3600,
            max_upload_bytes: 12 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Base URL public object links are built from.
    pub fn public_base(&self) -> String {
        let base = self
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind_addr));
        base.trim_end_matches('/').to_string()
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new("server.toml"))
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let defaults = Settings::default();
    let raw = Config::builder()
        .set_default("bind_addr", defaults.bind_addr)?
        .set_default("database_url", defaults.database_url)?
        .set_default("jwt_secret", defaults.jwt_secret)?
        .set_default("token_ttl_seconds", defaults.token_ttl_seconds)?
        .set_default("max_upload_bytes", defaults.max_upload_bytes as u64)?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read settings from {}", path.display()))?;

    let mut settings: Settings = raw.try_deserialize().context("invalid hub settings")?;
    apply_legacy_env(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn apply_legacy_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SERVER_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("SERVER_PUBLIC_URL") {
        settings.public_url = Some(v);
    }
    if let Some(v) = var("JWT_SECRET") {
        settings.jwt_secret = v;
    }
}

/// Accepts bare file paths as well as `sqlite:` urls.
pub fn normalize_database_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return Settings::default().database_url;
    }
    if raw.starts_with("sqlite:") || raw.contains("://") {
        return raw.to_string();
    }
    format!("sqlite://{}", raw.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
