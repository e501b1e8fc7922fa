//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `VARTAP_BIND_PORT`
    pub bind_port: u16,

    /// Sample rate the synthetic audio host runs at, published to hosts in
    /// the list response.
    /// Override: `VARTAP_SAMPLE_RATE`
    pub sample_rate: f32,

    /// Frames per synthetic audio callback (one manager tick per block).
    pub block_frames: u64,

    /// Directory log files are written to. Defaults to the working
    /// directory.
    /// Override: `VARTAP_LOG_DIR`
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 49500,
            sample_rate: 44_100.0,
            block_frames: 16,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("VARTAP_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.bind_port = port;
            }
        }

        if let Ok(val) = std::env::var("VARTAP_SAMPLE_RATE") {
            if let Ok(rate) = val.parse() {
                self.sample_rate = rate;
            }
        }

        // Note: VARTAP_LOG_DIR is handled by clap via #[arg(env = ...)] in main.rs
    }

    /// Converts to vartap-core's manager configuration.
    pub fn to_watcher_config(&self) -> Result<vartap_core::WatcherConfig> {
        let log_dir = match &self.log_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("resolving the working directory")?,
        };
        Ok(vartap_core::WatcherConfig {
            sample_rate: self.sample_rate,
            log_dir,
            ..vartap_core::WatcherConfig::default()
        })
    }
}
