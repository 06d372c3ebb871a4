use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::error::{ClientError, Result};

const DEFAULT_CONFIG_FILE: &str = "messageflow.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base_url: String,
    pub ws_base_url: Option<String>,
    pub page_size: u32,
    pub pairing_max_attempts: u32,
    pub pairing_poll_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub merge_resort_threshold: usize,
    pub directory_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api/v1".into(),
            ws_base_url: None,
            page_size: 20,
            pairing_max_attempts: 60,
            pairing_poll_interval_ms: 2_000,
            reconnect_delay_ms: 3_000,
            request_timeout_ms: 10_000,
            merge_resort_threshold: 32,
            directory_limit: 100,
        }
    }
}

impl Settings {
    pub fn pairing_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pairing_poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            return Err(ClientError::Config(format!(
                "api_base_url must start with http:// or https://, got '{}'",
                self.api_base_url
            )));
        }
        if self.page_size == 0 || self.page_size > 100 {
            return Err(ClientError::Config(format!(
                "page_size must be within 1..=100, got {}",
                self.page_size
            )));
        }
        if self.pairing_max_attempts == 0 {
            return Err(ClientError::Config(
                "pairing_max_attempts must be at least 1".into(),
            ));
        }
        if self.pairing_poll_interval_ms == 0 {
            return Err(ClientError::Config(
                "pairing_poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Optional keys accepted in the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    api_base_url: Option<String>,
    ws_base_url: Option<String>,
    page_size: Option<u32>,
    pairing_max_attempts: Option<u32>,
    pairing_poll_interval_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    merge_resort_threshold: Option<usize>,
    directory_limit: Option<u32>,
}

/// Defaults, then `messageflow.toml` (or `MF_CONFIG`), then environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    let path = std::env::var("MF_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    load_settings_from(&path)
}

/// Same layering with an explicit file. A missing file is skipped.
pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    if path.exists() {
        apply_file(&mut settings, path)?;
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn apply_file(settings: &mut Settings, path: &Path) -> anyhow::Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let file_cfg: FileSettings = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file '{}'", path.display()))?;

    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.ws_base_url {
        settings.ws_base_url = Some(v);
    }
    if let Some(v) = file_cfg.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.pairing_max_attempts {
        settings.pairing_max_attempts = v;
    }
    if let Some(v) = file_cfg.pairing_poll_interval_ms {
        settings.pairing_poll_interval_ms = v;
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = file_cfg.request_timeout_ms {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = file_cfg.merge_resort_threshold {
        settings.merge_resort_threshold = v;
    }
    if let Some(v) = file_cfg.directory_limit {
        settings.directory_limit = v;
    }
    Ok(())
}

/// Applies `MF_*` variables, then their `APP__*` aliases. Values that do not
/// parse are ignored.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |primary: &str, alias: &str| lookup(alias).or_else(|| lookup(primary));

    if let Some(v) = var("MF_API_BASE", "APP__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("MF_WS_BASE", "APP__WS_BASE_URL") {
        settings.ws_base_url = Some(v);
    }
    if let Some(v) = parsed(var("MF_PAGE_SIZE", "APP__PAGE_SIZE")) {
        settings.page_size = v;
    }
    if let Some(v) = parsed(var("MF_PAIRING_MAX_ATTEMPTS", "APP__PAIRING_MAX_ATTEMPTS")) {
        settings.pairing_max_attempts = v;
    }
    if let Some(v) = parsed(var(
        "MF_PAIRING_POLL_INTERVAL_MS",
        "APP__PAIRING_POLL_INTERVAL_MS",
    )) {
        settings.pairing_poll_interval_ms = v;
    }
    if let Some(v) = parsed(var("MF_RECONNECT_DELAY_MS", "APP__RECONNECT_DELAY_MS")) {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = parsed(var("MF_REQUEST_TIMEOUT_MS", "APP__REQUEST_TIMEOUT_MS")) {
        settings.request_timeout_ms = v;
    }
    if let Some(v) = parsed(var("MF_DIRECTORY_LIMIT", "APP__DIRECTORY_LIMIT")) {
        settings.directory_limit = v;
    }
}

fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
