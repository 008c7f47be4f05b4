//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - CLI arguments

use anyhow::{Context, Result};

pub mod types;

pub use types::{
    validate_option, EncoderConfig, EncoderPreset, LoggingConfig, PipelineSettings,
    RateControlMode, MAX_QP, OPTION_QP, OPTION_RATE_CONTROL,
};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Encoder configuration (persisted, runtime mutable)
    #[serde(default)]
    pub encoder: EncoderConfig,
    /// Pipeline runtime settings
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: PipelineConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.encoder
            .validate()
            .context("Invalid encoder configuration")?;

        if self.pipeline.codec.trim().is_empty() {
            anyhow::bail!("Pipeline codec cannot be empty");
        }

        if self.pipeline.pool_size == 0 {
            anyhow::bail!("Pipeline pool_size must be at least 1");
        }

        if self.pipeline.command_queue_depth < self.pipeline.pool_size {
            anyhow::bail!(
                "command_queue_depth ({}) must be at least pool_size ({})",
                self.pipeline.command_queue_depth,
                self.pipeline.pool_size
            );
        }

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            _ => anyhow::bail!("Invalid log format: {}", self.logging.format),
        }

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        codec: Option<String>,
        bitrate: Option<u32>,
        framerate: Option<u32>,
    ) -> Self {
        if let Some(codec) = codec {
            self.pipeline.codec = codec;
        }
        if let Some(bitrate) = bitrate {
            self.encoder.bitrate = bitrate;
            self.encoder.max_bitrate = self.encoder.max_bitrate.max(bitrate);
        }
        if let Some(framerate) = framerate {
            self.encoder.framerate = framerate;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.pipeline.pool_size, 3);
        assert_eq!(config.encoder.framerate, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_pool() {
        let mut config = PipelineConfig::default();
        config.pipeline.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = PipelineConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[encoder]
width = 1280
height = 720
framerate = 60
bitrate = 3000
max_bitrate = 4500
preset = "high-quality"
options = [["qp", "24"], ["rc_mode", "cbr"]]

[pipeline]
codec = "raw"
pool_size = 4
"#
        )
        .unwrap();

        let config = PipelineConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.encoder.resolution().to_string(), "1280x720");
        assert_eq!(config.encoder.preset, EncoderPreset::HighQuality);
        assert_eq!(config.encoder.quantization(), Some(24));
        assert_eq!(config.encoder.rate_control(), Some(RateControlMode::Cbr));
        assert_eq!(config.pipeline.codec, "raw");
        assert_eq!(config.pipeline.pool_size, 4);
        // Unset fields fall back to defaults
        assert!(config.pipeline.drain_before_capture);
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[encoder]\nwidth = 0").unwrap();
        assert!(PipelineConfig::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_with_overrides() {
        let config = PipelineConfig::default().with_overrides(
            Some("raw".to_string()),
            Some(20000),
            None,
        );
        assert_eq!(config.pipeline.codec, "raw");
        assert_eq!(config.encoder.bitrate, 20000);
        assert_eq!(config.encoder.max_bitrate, 20000);
        assert_eq!(config.encoder.framerate, 30);
    }
}
