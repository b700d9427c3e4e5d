use anyhow::{Context, Result};
use essbms_lib::protocol::SafetyLimits;
use serde::Deserialize;
use std::path::Path;

/// Settings of the monitored battery, read from a YAML file.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BatteryConfig {
    pub safety: SafetyLimits,
}

impl BatteryConfig {
    pub const DEFAULT_CONFIG_FILE: &str = "battery.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open battery config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file).with_context(|| {
            format!("Cannot read battery config from file: {config_file_path:?}")
        })?;
        Ok(config)
    }

    /// Like [`BatteryConfig::load`], but falls back to the defaults if the file does not exist.
    pub fn load_or_default(config_file_path: &str) -> Result<Self> {
        if Path::new(config_file_path).exists() {
            Self::load(config_file_path)
        } else {
            log::info!("No config file {config_file_path:?}, using default safety limits");
            Ok(Self::default())
        }
    }
}
