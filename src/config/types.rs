//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::encoder::{EncodeError, EncodeResult, Resolution};

/// Tuning option carrying the quantization parameter
pub const OPTION_QP: &str = "qp";

/// Tuning option carrying the rate-control mode
pub const OPTION_RATE_CONTROL: &str = "rc_mode";

/// Highest quantization parameter accepted (H.264/HEVC range)
pub const MAX_QP: u32 = 51;

/// Encoder preset
///
/// Backends map this to their own preset/tuning constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderPreset {
    /// Minimal latency, no lookahead, short GOP
    #[default]
    LowLatency,
    /// Better compression at the cost of latency
    HighQuality,
}

impl EncoderPreset {
    /// Keyframe interval used by backends without their own GOP logic
    pub fn gop_size(&self) -> u32 {
        match self {
            Self::LowLatency => 60,
            Self::HighQuality => 30,
        }
    }
}

impl FromStr for EncoderPreset {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low-latency" | "lowlatency" | "low_latency" | "speed" => Ok(Self::LowLatency),
            "high-quality" | "highquality" | "high_quality" | "quality" => Ok(Self::HighQuality),
            _ => Err(EncodeError::InvalidConfig(format!(
                "unknown preset '{}' (valid: low-latency, high-quality)",
                s
            ))),
        }
    }
}

impl std::fmt::Display for EncoderPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowLatency => write!(f, "low-latency"),
            Self::HighQuality => write!(f, "high-quality"),
        }
    }
}

/// Rate-control mode (`rc_mode` tuning option)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateControlMode {
    /// Constant bitrate
    Cbr,
    /// Variable bitrate capped at `max_bitrate`
    Vbr,
    /// Constant quantization parameter
    Cqp,
}

impl FromStr for RateControlMode {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cbr" => Ok(Self::Cbr),
            "vbr" => Ok(Self::Vbr),
            "cqp" | "constqp" => Ok(Self::Cqp),
            _ => Err(EncodeError::InvalidConfig(format!(
                "unknown rate control mode '{}' (valid: cbr, vbr, cqp)",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RateControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cbr => write!(f, "cbr"),
            Self::Vbr => write!(f, "vbr"),
            Self::Cqp => write!(f, "cqp"),
        }
    }
}

/// Encoder configuration
///
/// Persisted settings. Setters on [`Encoder`](crate::encoder::Encoder)
/// mutate this lazily; the backend is reconciled against it before every
/// frame submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoded width in pixels
    pub width: u32,

    /// Encoded height in pixels
    pub height: u32,

    /// Target frames per second
    pub framerate: u32,

    /// Target bitrate in kbps
    pub bitrate: u32,

    /// Peak bitrate in kbps
    pub max_bitrate: u32,

    /// Latency/quality preset
    pub preset: EncoderPreset,

    /// Backend tuning options as (name, value) pairs
    ///
    /// `qp` and `rc_mode` are understood by the pipeline itself; anything
    /// else is passed to the backend verbatim.
    pub options: Vec<(String, String)>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
            bitrate: 5000,
            max_bitrate: 8000,
            preset: EncoderPreset::LowLatency,
            options: Vec::new(),
        }
    }
}

impl EncoderConfig {
    /// Configured resolution
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Look up a tuning option
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Insert or replace a tuning option
    pub fn set_option(&mut self, name: &str, value: &str) {
        match self.options.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.options.push((name.to_string(), value.to_string())),
        }
    }

    /// Quantization parameter from the `qp` option
    pub fn quantization(&self) -> Option<u32> {
        self.option(OPTION_QP).and_then(|v| v.trim().parse().ok())
    }

    /// Rate-control mode from the `rc_mode` option
    pub fn rate_control(&self) -> Option<RateControlMode> {
        self.option(OPTION_RATE_CONTROL).and_then(|v| v.parse().ok())
    }

    /// Options other than the ones the pipeline interprets itself
    pub fn custom_options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options
            .iter()
            .filter(|(key, _)| key != OPTION_QP && key != OPTION_RATE_CONTROL)
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Validate ranges and option values
    pub fn validate(&self) -> EncodeResult<()> {
        if !self.resolution().is_encodable() {
            return Err(EncodeError::InvalidConfig(format!(
                "resolution {} must be non-zero and even",
                self.resolution()
            )));
        }
        if self.framerate == 0 {
            return Err(EncodeError::InvalidConfig(
                "framerate must be non-zero".to_string(),
            ));
        }
        if self.bitrate == 0 {
            return Err(EncodeError::InvalidConfig(
                "bitrate must be non-zero".to_string(),
            ));
        }
        if self.max_bitrate < self.bitrate {
            return Err(EncodeError::InvalidConfig(format!(
                "max_bitrate ({}) cannot be lower than bitrate ({})",
                self.max_bitrate, self.bitrate
            )));
        }
        for (name, value) in &self.options {
            validate_option(name, value)?;
        }
        Ok(())
    }
}

/// Validate a single tuning option
pub fn validate_option(name: &str, value: &str) -> EncodeResult<()> {
    if name.trim().is_empty() {
        return Err(EncodeError::InvalidConfig(
            "tuning option name cannot be empty".to_string(),
        ));
    }
    match name {
        OPTION_QP => {
            let qp: u32 = value.trim().parse().map_err(|_| {
                EncodeError::InvalidConfig(format!("qp '{}' is not a number", value))
            })?;
            if qp > MAX_QP {
                return Err(EncodeError::InvalidConfig(format!(
                    "qp {} out of range (0-{})",
                    qp, MAX_QP
                )));
            }
        }
        OPTION_RATE_CONTROL => {
            value.parse::<RateControlMode>()?;
        }
        _ => {}
    }
    Ok(())
}

/// Pipeline runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Codec identifier used to pick a backend factory ("raw", "rle", "h264")
    pub codec: String,

    /// Number of frame slots (maximum frames in flight)
    pub pool_size: usize,

    /// Idle drain period for the encode thread in milliseconds (0 = only
    /// drain when asked)
    pub drain_interval_ms: u64,

    /// Run a drain step before every capture
    pub drain_before_capture: bool,

    /// Capacity of the command queue feeding the encode thread
    pub command_queue_depth: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            codec: "rle".to_string(),
            pool_size: 3,
            drain_interval_ms: 100,
            drain_before_capture: true,
            command_queue_depth: 64,
        }
    }
}

impl PipelineSettings {
    /// Idle drain period, if enabled
    pub fn drain_interval(&self) -> Option<Duration> {
        (self.drain_interval_ms > 0).then(|| Duration::from_millis(self.drain_interval_ms))
    }

    /// Settings for deterministic use: no background drains
    pub fn manual_drain(codec: &str, pool_size: usize) -> Self {
        Self {
            codec: codec.to_string(),
            pool_size,
            drain_interval_ms: 0,
            drain_before_capture: false,
            ..Default::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter ("trace", "debug", "info", "warn", "error")
    pub level: String,

    /// Output format ("pretty", "compact", "json")
    pub format: String,

    /// Directory for log files (None = stdout only)
    pub log_dir: Option<PathBuf>,

    /// Log a stats summary every N seconds (0 = only at shutdown)
    pub stats_interval_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_dir: None,
            stats_interval_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_from_str() {
        assert_eq!(
            "low-latency".parse::<EncoderPreset>().unwrap(),
            EncoderPreset::LowLatency
        );
        assert_eq!(
            "HighQuality".parse::<EncoderPreset>().unwrap(),
            EncoderPreset::HighQuality
        );
        assert!("invalid".parse::<EncoderPreset>().is_err());
        assert_eq!(EncoderPreset::HighQuality.to_string(), "high-quality");
    }

    #[test]
    fn test_option_set_replaces() {
        let mut config = EncoderConfig::default();
        config.set_option("qp", "20");
        config.set_option("qp", "28");
        config.set_option("aq", "1");
        assert_eq!(config.options.len(), 2);
        assert_eq!(config.quantization(), Some(28));
        assert_eq!(config.custom_options().collect::<Vec<_>>(), vec![("aq", "1")]);
    }

    #[test]
    fn test_rate_control_parse() {
        let mut config = EncoderConfig::default();
        assert_eq!(config.rate_control(), None);
        config.set_option(OPTION_RATE_CONTROL, "VBR");
        assert_eq!(config.rate_control(), Some(RateControlMode::Vbr));
    }

    #[test]
    fn test_validate() {
        assert!(EncoderConfig::default().validate().is_ok());

        let mut config = EncoderConfig::default();
        config.height = 1081;
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::default();
        config.max_bitrate = config.bitrate - 1;
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::default();
        config.set_option(OPTION_QP, "52");
        assert!(config.validate().is_err());

        let mut config = EncoderConfig::default();
        config.set_option(OPTION_RATE_CONTROL, "abr");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_drain_interval() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.drain_interval(), Some(Duration::from_millis(100)));
        assert_eq!(PipelineSettings::manual_drain("raw", 3).drain_interval(), None);
    }
}
