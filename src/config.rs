// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration stored at `~/.tapedeck/config.json`.
//!
//! Every field has a serde default, so a partial (or empty) file is valid.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::store::{StoreLimits, DEFAULT_MAX_JOBS_PER_OWNER};
use crate::download::manager::{ManagerConfig, DEFAULT_REPORT_BUFFER};
use crate::security::TokenGrant;
use crate::server::{ServerLimits, MAX_BODY_SIZE};
use crate::transfer::{default_cache_dir, TransferSettings, DEFAULT_MEDIA_BASE_URL};

/// Name of the config directory under the home directory.
const CONFIG_DIR_NAME: &str = ".tapedeck";

/// Name of the config file inside the config directory.
const CONFIG_FILE_NAME: &str = "config.json";

/// Default state directory name inside the config directory.
const STATE_DIR_NAME: &str = "jobs";

/// Default port for the API server.
pub const DEFAULT_PORT: u16 = 8787;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Port the API listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address to bind to; 127.0.0.1 keeps the API local
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Bearer tokens and the identities they resolve to
    #[serde(default)]
    pub grants: Vec<TokenGrant>,
    #[serde(default = "default_max_jobs_per_owner")]
    pub max_jobs_per_owner: usize,
    /// Capacity of the worker report channel
    #[serde(default = "default_report_buffer")]
    pub report_buffer: usize,
    /// Keep jobs across restarts (default: true)
    #[serde(default = "default_persist_jobs")]
    pub persist_jobs: bool,
    /// Directory holding one job snapshot per user (defaults to ~/.tapedeck/jobs)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Base URL media refs are fetched from
    #[serde(default = "default_media_base_url")]
    pub media_base_url: String,
    /// Where downloaded media is stored (defaults to the platform cache dir)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// One of: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: u64,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_max_jobs_per_owner() -> usize {
    DEFAULT_MAX_JOBS_PER_OWNER
}

fn default_report_buffer() -> usize {
    DEFAULT_REPORT_BUFFER
}

fn default_persist_jobs() -> bool {
    true
}

fn default_media_base_url() -> String {
    DEFAULT_MEDIA_BASE_URL.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rate_limit_per_second() -> u64 {
    1
}

fn default_rate_limit_burst() -> u32 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            grants: Vec::new(),
            max_jobs_per_owner: default_max_jobs_per_owner(),
            report_buffer: default_report_buffer(),
            persist_jobs: default_persist_jobs(),
            state_dir: None,
            media_base_url: default_media_base_url(),
            cache_dir: None,
            log_level: default_log_level(),
            rate_limit_per_second: default_rate_limit_per_second(),
            rate_limit_burst: default_rate_limit_burst(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be between 1 and 65535");
        }
        if self.bind_address.trim().is_empty() {
            bail!("bind_address must not be empty");
        }
        if self.max_jobs_per_owner == 0 {
            bail!("max_jobs_per_owner must be at least 1");
        }
        if self.report_buffer == 0 {
            bail!("report_buffer must be at least 1");
        }
        if self.rate_limit_per_second == 0 || self.rate_limit_burst == 0 {
            bail!("rate_limit_per_second and rate_limit_burst must be at least 1");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }
        if !(self.media_base_url.starts_with("http://") || self.media_base_url.starts_with("https://")) {
            bail!("media_base_url must start with http:// or https://");
        }
        self.tracing_level()?;

        let mut seen = HashSet::new();
        for (index, grant) in self.grants.iter().enumerate() {
            if grant.token.trim().is_empty() {
                bail!("grants[{}]: token must not be empty", index);
            }
            if grant.owner_id.trim().is_empty() {
                bail!("grants[{}]: owner_id must not be empty", index);
            }
            if !seen.insert(grant.token.as_str()) {
                bail!("grants[{}]: token is configured more than once", index);
            }
        }
        Ok(())
    }

    /// Parsed `log_level`.
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        tracing::Level::from_str(self.log_level.trim())
            .map_err(|_| anyhow::anyhow!("log_level '{}' is not one of error, warn, info, debug, trace", self.log_level))
    }

    /// Snapshot directory, or `None` when jobs are kept in memory only.
    pub fn state_path(&self) -> Result<Option<PathBuf>> {
        if !self.persist_jobs {
            return Ok(None);
        }
        match &self.state_dir {
            Some(path) => Ok(Some(path.clone())),
            None => Ok(Some(get_config_dir()?.join(STATE_DIR_NAME))),
        }
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_jobs_per_owner: self.max_jobs_per_owner,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            report_buffer: self.report_buffer,
        }
    }

    pub fn server_limits(&self) -> ServerLimits {
        ServerLimits {
            rate_limit_per_second: self.rate_limit_per_second,
            rate_limit_burst: self.rate_limit_burst,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_body_size: MAX_BODY_SIZE,
        }
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            media_base_url: self.media_base_url.clone(),
            cache_dir: self.cache_dir.clone().unwrap_or_else(default_cache_dir),
            ..TransferSettings::default()
        }
    }
}

/// `~/.tapedeck`, created if missing.
pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let config_dir = home.join(CONFIG_DIR_NAME);
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory {:?}", config_dir))?;
    }
    Ok(config_dir)
}

/// Default config file location.
pub fn config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the config from the default location.
pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Load a config file; a missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config {:?}", path))?;
    Ok(config)
}

/// Save the config to the default location.
pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &config_path()?)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write config {:?}", path))?;
    Ok(())
}
