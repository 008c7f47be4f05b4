//! Encoder backend abstraction
//!
//! A backend is the device-specific component that actually compresses
//! frames. The pipeline only needs five things from it: initialize, read and
//! write configuration properties, accept a frame, and report completed
//! output when polled.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 EncoderBackend Trait                     │
//! │  get/set_property() | submit() | poll_output() | flush() │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!           ┌───────────────┼────────────────┐
//!           ▼               ▼                ▼
//!     ┌──────────┐   ┌────────────┐   ┌─────────────┐
//!     │ software │   │  openh264  │   │  external   │
//!     │ raw/rle  │   │ (h264 feat)│   │  factories  │
//!     └──────────┘   └────────────┘   └─────────────┘
//! ```
//!
//! # Ordering Contract
//!
//! Backends must complete work in submission order. Output carries no frame
//! id; the pipeline pairs each completed result with the oldest outstanding
//! submission.
//!
//! # Thread Affinity
//!
//! Backends are created by their factory on the encode thread and never
//! leave it, so they do not need to be `Send`.

mod error;
pub mod registry;
pub mod software;

#[cfg(feature = "h264")]
pub mod openh264;

pub use error::{BackendError, BackendResult, RegistryError};
pub use registry::{create_encoder, BackendFactory, BackendRegistry};

use std::time::Duration;

use bytes::BytesMut;

use crate::config::{EncoderConfig, EncoderPreset, RateControlMode};
use crate::encoder::{Resolution, VideoFrame};

/// A configurable encoder property
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Property {
    /// Target bitrate (kbps)
    Bitrate,
    /// Peak bitrate (kbps)
    MaxBitrate,
    /// Frames per second
    Framerate,
    /// Encoded dimensions
    Resolution,
    /// Latency/quality preset
    Preset,
    /// Quantization parameter
    Quantization,
    /// Rate-control mode
    RateControl,
    /// Backend-specific option passed through by name
    Custom(String),
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bitrate => write!(f, "bitrate"),
            Self::MaxBitrate => write!(f, "max_bitrate"),
            Self::Framerate => write!(f, "framerate"),
            Self::Resolution => write!(f, "resolution"),
            Self::Preset => write!(f, "preset"),
            Self::Quantization => write!(f, "qp"),
            Self::RateControl => write!(f, "rc_mode"),
            Self::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Value of a [`Property`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// Unsigned integer (bitrate, framerate, qp)
    Uint(u32),
    /// Dimensions
    Resolution(Resolution),
    /// Preset
    Preset(EncoderPreset),
    /// Rate-control mode
    RateControl(RateControlMode),
    /// Free-form text for custom options
    Text(String),
}

impl PropertyValue {
    /// Integer payload, if this is an integer value
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }
}

/// Per-frame parameters handed to [`EncoderBackend::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    /// Capture timestamp
    pub timestamp: Duration,
    /// Time until the next frame
    pub duration: Duration,
    /// Encode this frame as an IDR/intra frame
    pub force_keyframe: bool,
    /// Resolution the frame is encoded at
    pub resolution: Resolution,
}

/// Metadata for one completed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedFrame {
    /// Frame was coded as a keyframe
    pub is_keyframe: bool,
    /// Average quantization parameter the device used
    pub avg_qp: u32,
}

/// Result of a non-blocking output poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Oldest submission is still in progress; not an error
    NotReady,
    /// Oldest submission completed, its bitstream was written to the buffer
    Ready(CompletedFrame),
}

/// Device-specific encoder
///
/// Implementations are driven from a single thread. None of the methods may
/// block waiting for the device to finish a frame.
pub trait EncoderBackend {
    /// Backend identifier for logging
    fn name(&self) -> &'static str;

    /// Open the device session with the initial configuration
    fn initialize(&mut self, config: &EncoderConfig) -> BackendResult<()>;

    /// Read the live value of a property
    ///
    /// Returns `Ok(None)` if the device has no value for it yet.
    fn get_property(&self, property: &Property) -> BackendResult<Option<PropertyValue>>;

    /// Write a property; takes effect from the next submission
    fn set_property(&mut self, property: &Property, value: &PropertyValue) -> BackendResult<()>;

    /// Queue a frame for encoding
    ///
    /// An error rejects only this frame.
    fn submit(&mut self, frame: &VideoFrame, params: &SubmitParams) -> BackendResult<()>;

    /// Poll for the oldest outstanding frame
    ///
    /// On `Ready` the encoded bitstream has been appended to `output`.
    fn poll_output(&mut self, output: &mut BytesMut) -> BackendResult<PollStatus>;

    /// Ask the device to finish all outstanding work
    ///
    /// Completed frames are still collected through `poll_output`.
    fn flush(&mut self) -> BackendResult<()> {
        Ok(())
    }
}
