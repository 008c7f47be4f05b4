//! # lamco-encode-pipeline
//!
//! Real-time video encoder pipeline: turns captured frames into a compressed
//! bitstream through an asynchronous encoder backend.
//!
//! The crate is the coordination layer between a frame producer (renderer,
//! screen capture) and a device encoder:
//! - a fixed pool of frame slots that bounds in-flight work and never blocks
//! - an explicit per-slot state machine
//! - submission-ordered output from a backend that completes asynchronously
//! - per-frame failures surfaced as dropped packets, device failures as errors
//!
//! # Architecture
//!
//! ```text
//! lamco-encode-pipeline
//!   ├─> encoder   (slot pool, encode thread, drain loop, listeners)
//!   ├─> backend   (EncoderBackend trait, factory registry, built-ins)
//!   └─> config    (EncoderConfig, pipeline and logging settings)
//! ```
//!
//! # Data Flow
//!
//! **Frame Path:** capture → slot (Capturing) → encode → encode thread →
//! backend.submit → slot (Encoding) → process_output → listeners → slot freed
//!
//! **Config Path:** setters → persisted config → reconciled before each
//! submission → backend properties

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Pipeline configuration
pub mod config;

/// Encoder backends and the factory registry
///
/// Backends are selected by codec through [`backend::BackendRegistry`]; the
/// built-in software backend handles `raw` and `rle`, and the `h264` feature
/// adds OpenH264.
pub mod backend;

/// Frame slots, encode thread and packet delivery
pub mod encoder;

pub use backend::{create_encoder, BackendFactory, BackendRegistry, EncoderBackend};
pub use config::{EncoderConfig, PipelineConfig, PipelineSettings};
pub use encoder::{
    EncodeError, EncodeResult, EncodedPacket, Encoder, FrameCookie, PacketListener, SlotId,
    VideoFrame,
};
