use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

/// Tunables for the realtime layer. Every field has a production default;
/// `chat.toml` and `CHAT__*` variables override individual values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeSettings {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub subscribe_timeout: Duration,
    pub health_check_timeout: Duration,
    pub stale_after: Duration,
    pub cache_ttl: Duration,
    pub subscription_event_capacity: usize,
    pub message_event_capacity: usize,
    pub max_healthy_subscriptions: usize,
    pub message_silence_warning: Duration,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(5 * 60),
            cache_ttl: Duration::from_secs(2 * 60),
            subscription_event_capacity: 50,
            message_event_capacity: 100,
            max_healthy_subscriptions: 5,
            message_silence_warning: Duration::from_secs(60),
        }
    }
}

impl RealtimeSettings {
    /// Delay before retry number `retry_count + 1`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    subscribe_timeout_ms: Option<u64>,
    health_check_timeout_ms: Option<u64>,
    stale_after_secs: Option<u64>,
    cache_ttl_secs: Option<u64>,
    subscription_event_capacity: Option<usize>,
    message_event_capacity: Option<usize>,
    max_healthy_subscriptions: Option<usize>,
    message_silence_warning_secs: Option<u64>,
}

pub fn load_settings() -> RealtimeSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> RealtimeSettings {
    let mut settings = RealtimeSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "config: ignoring unreadable settings file: {err}"),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut RealtimeSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.max_retries {
        settings.max_retries = v;
    }
    if let Some(v) = file_cfg.base_delay_ms {
        settings.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.max_delay_ms {
        settings.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.subscribe_timeout_ms {
        settings.subscribe_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.health_check_timeout_ms {
        settings.health_check_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.stale_after_secs {
        settings.stale_after = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.cache_ttl_secs {
        settings.cache_ttl = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.subscription_event_capacity {
        settings.subscription_event_capacity = v;
    }
    if let Some(v) = file_cfg.message_event_capacity {
        settings.message_event_capacity = v;
    }
    if let Some(v) = file_cfg.max_healthy_subscriptions {
        settings.max_healthy_subscriptions = v;
    }
    if let Some(v) = file_cfg.message_silence_warning_secs {
        settings.message_silence_warning = Duration::from_secs(v);
    }
}

fn apply_env_overrides(settings: &mut RealtimeSettings, lookup: impl Fn(&str) -> Option<String>) {
    let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(v) = number("CHAT__MAX_RETRIES") {
        settings.max_retries = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = number("CHAT__BASE_DELAY_MS") {
        settings.base_delay = Duration::from_millis(v);
    }
    if let Some(v) = number("CHAT__MAX_DELAY_MS") {
        settings.max_delay = Duration::from_millis(v);
    }
    if let Some(v) = number("CHAT__SUBSCRIBE_TIMEOUT_MS") {
        settings.subscribe_timeout = Duration::from_millis(v);
    }
    if let Some(v) = number("CHAT__HEALTH_CHECK_TIMEOUT_MS") {
        settings.health_check_timeout = Duration::from_millis(v);
    }
    if let Some(v) = number("CHAT__STALE_AFTER_SECS") {
        settings.stale_after = Duration::from_secs(v);
    }
    if let Some(v) = number("CHAT__CACHE_TTL_SECS") {
        settings.cache_ttl = Duration::from_secs(v);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
