//! Probe configuration, loaded from a TOML file.
//!
//! `[capture]` and `[collector]` are required, as are `capture.device`,
//! `capture.workers` and `collector.endpoint`. Every other field has a
//! default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::af_packet::{AfPacketFlags, RingLayout};
use crate::classifier::FlowMeterConfig;
use crate::errors::ConfigError;
use crate::exporter::{self, DEFAULT_SEND_HWM};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub capture: CaptureConfig,
    pub collector: CollectorConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub flows: FlowsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub device: String,
    pub workers: usize,
    #[serde(default = "default_block_size")]
    pub ring_block_size: u32,
    #[serde(default = "default_block_count")]
    pub ring_block_count: u32,
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,
    #[serde(default = "default_true")]
    pub promiscuous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    pub endpoint: String,
    #[serde(default = "default_send_hwm")]
    pub send_hwm: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentConfig {
    pub country_db: Option<PathBuf>,
    pub asn_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowsConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_active_timeout")]
    pub active_timeout_secs: u64,
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            active_timeout_secs: default_active_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn default_block_size() -> u32 {
    RingLayout::default().block_size
}

fn default_block_count() -> u32 {
    RingLayout::default().block_count
}

fn default_frame_size() -> u32 {
    RingLayout::default().frame_size
}

fn default_true() -> bool {
    true
}

fn default_send_hwm() -> usize {
    DEFAULT_SEND_HWM
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_active_timeout() -> u64 {
    120
}

fn default_level() -> String {
    "info".to_string()
}

impl Config {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.device.trim().is_empty() {
            return Err(ConfigError::Invalid("capture.device must not be empty".into()));
        }
        if capture.workers == 0 {
            return Err(ConfigError::Invalid("capture.workers must be at least 1".into()));
        }
        self.ring_layout()
            .validate()
            .map_err(|reason| ConfigError::Invalid(format!("capture ring: {reason}")))?;
        if !exporter::supports_endpoint(&self.collector.endpoint) {
            return Err(ConfigError::Invalid(format!(
                "collector.endpoint '{}' has no supported scheme",
                self.collector.endpoint
            )));
        }
        if self.collector.send_hwm == 0 {
            return Err(ConfigError::Invalid("collector.send_hwm must be at least 1".into()));
        }
        for (name, path) in [
            ("enrichment.country_db", &self.enrichment.country_db),
            ("enrichment.asn_db", &self.enrichment.asn_db),
        ] {
            if let Some(path) = path {
                if !path.is_file() {
                    return Err(ConfigError::Invalid(format!(
                        "{name} '{}' does not exist",
                        path.display()
                    )));
                }
            }
        }
        if self.flows.idle_timeout_secs == 0 || self.flows.active_timeout_secs == 0 {
            return Err(ConfigError::Invalid("flow timeouts must be at least 1s".into()));
        }
        Ok(())
    }

    pub fn ring_layout(&self) -> RingLayout {
        RingLayout {
            block_size: self.capture.ring_block_size,
            block_count: self.capture.ring_block_count,
            frame_size: self.capture.frame_size,
        }
    }

    pub fn capture_flags(&self) -> AfPacketFlags {
        AfPacketFlags {
            ring: self.ring_layout(),
            promiscuous: self.capture.promiscuous,
        }
    }

    pub fn flow_meter(&self) -> FlowMeterConfig {
        FlowMeterConfig {
            idle_timeout: Duration::from_secs(self.flows.idle_timeout_secs),
            active_timeout: Duration::from_secs(self.flows.active_timeout_secs),
            country_db: self.enrichment.country_db.clone(),
            asn_db: self.enrichment.asn_db.clone(),
            geo: None,
        }
    }
}
