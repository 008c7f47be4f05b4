//! Built-in software backend
//!
//! A CPU encoder that behaves like an asynchronous device: `submit` queues
//! work, results are only observed through `poll_output`, and completions
//! can be delayed by a configurable number of polls. Useful wherever no
//! hardware encoder is present (tests, CI, headless demos).
//!
//! # Codecs
//!
//! - `raw`: every frame is an intra frame of packed BGRA pixels
//! - `rle`: run-length coded intra frames at GOP boundaries or on request,
//!   XOR-delta frames against the previous reconstruction otherwise
//!
//! # Bitstream
//!
//! ```text
//! ┌──────┬───────────┬────────────┬──────────────────────────┐
//! │ type │ width LE  │ height LE  │ body                     │
//! │ 1 B  │ 4 B       │ 4 B        │ raw pixels or RLE runs   │
//! └──────┴───────────┴────────────┴──────────────────────────┘
//! ```
//!
//! An RLE run is a count byte (1-255) followed by one BGRA pixel.

use std::collections::VecDeque;

use bytes::BytesMut;
use tracing::{debug, info, trace};

use super::{
    BackendError, BackendFactory, BackendResult, CompletedFrame, EncoderBackend, PollStatus,
    Property, PropertyValue, SubmitParams,
};
use crate::config::{EncoderConfig, EncoderPreset, RateControlMode, MAX_QP};
use crate::encoder::{PixelFormat, Resolution, VideoFrame};

/// Factory name
pub const FACTORY_NAME: &str = "software";

/// Uncompressed codec identifier
pub const CODEC_RAW: &str = "raw";

/// Run-length codec identifier
pub const CODEC_RLE: &str = "rle";

/// Frame type byte for intra frames
pub const FRAME_INTRA: u8 = 0x01;

/// Frame type byte for delta frames
pub const FRAME_DELTA: u8 = 0x02;

/// Bytes before the frame body
pub const HEADER_LEN: usize = 9;

const BYTES_PER_PIXEL: usize = 4;

/// Frames the backend accepts before refusing submissions
const MAX_PENDING: usize = 16;

/// Quantization used by `rc_mode=cqp` without an explicit `qp`
const DEFAULT_CQP: u32 = 26;

/// Ceiling for the adaptive quantizer
const MAX_ADAPTIVE_QP: u32 = 48;

/// Codecs produced by the software backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftwareCodec {
    /// Packed BGRA
    Raw,
    /// Run-length coded BGRA with delta frames
    Rle,
}

impl SoftwareCodec {
    /// Parse a codec identifier
    pub fn from_name(codec: &str) -> Option<Self> {
        match codec {
            CODEC_RAW => Some(Self::Raw),
            CODEC_RLE => Some(Self::Rle),
            _ => None,
        }
    }

    /// Codec identifier
    pub fn name(&self) -> &'static str {
        match self {
            Self::Raw => CODEC_RAW,
            Self::Rle => CODEC_RLE,
        }
    }
}

/// Factory for [`SoftwareBackend`]
#[derive(Debug, Clone, Default)]
pub struct SoftwareFactory {
    latency_polls: u32,
}

impl SoftwareFactory {
    /// Factory whose backends complete frames on the first poll
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose backends report `NotReady` for `polls` polls per frame
    pub fn with_latency(polls: u32) -> Self {
        Self {
            latency_polls: polls,
        }
    }
}

impl BackendFactory for SoftwareFactory {
    fn name(&self) -> &'static str {
        FACTORY_NAME
    }

    fn supported_codecs(&self) -> &[&'static str] {
        &[CODEC_RAW, CODEC_RLE]
    }

    fn create_backend(&self, codec: &str) -> BackendResult<Box<dyn EncoderBackend>> {
        let codec = SoftwareCodec::from_name(codec).ok_or_else(|| BackendError::UnsupportedCodec {
            codec: codec.to_string(),
        })?;
        Ok(Box::new(SoftwareBackend::new(codec, self.latency_polls)))
    }
}

struct PendingFrame {
    payload: Vec<u8>,
    is_keyframe: bool,
    qp: u32,
    polls_remaining: u32,
}

/// CPU encoder for the `raw` and `rle` codecs
pub struct SoftwareBackend {
    codec: SoftwareCodec,
    latency_polls: u32,
    initialized: bool,

    resolution: Option<Resolution>,
    framerate: Option<u32>,
    bitrate: Option<u32>,
    max_bitrate: Option<u32>,
    preset: Option<EncoderPreset>,
    qp: Option<u32>,
    rate_control: Option<RateControlMode>,

    adaptive_qp: u32,
    reference: Option<Vec<u8>>,
    frames_since_keyframe: u32,
    pending: VecDeque<PendingFrame>,
    frames_submitted: u64,
}

impl SoftwareBackend {
    /// Create an uninitialized backend
    pub fn new(codec: SoftwareCodec, latency_polls: u32) -> Self {
        Self {
            codec,
            latency_polls,
            initialized: false,
            resolution: None,
            framerate: None,
            bitrate: None,
            max_bitrate: None,
            preset: None,
            qp: None,
            rate_control: None,
            adaptive_qp: 0,
            reference: None,
            frames_since_keyframe: 0,
            pending: VecDeque::new(),
            frames_submitted: 0,
        }
    }

    /// Codec this backend produces
    pub fn codec(&self) -> SoftwareCodec {
        self.codec
    }

    /// Frames submitted but not yet collected
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn supports(&self, property: &Property) -> bool {
        match property {
            Property::Quantization | Property::RateControl => self.codec == SoftwareCodec::Rle,
            Property::Custom(_) => false,
            _ => true,
        }
    }

    fn effective_qp(&self) -> u32 {
        match (self.rate_control, self.qp) {
            (Some(RateControlMode::Cqp), qp) => qp.unwrap_or(DEFAULT_CQP),
            (None, Some(qp)) => qp,
            _ => self.adaptive_qp,
        }
    }

    fn is_adaptive(&self) -> bool {
        !matches!(
            (self.rate_control, self.qp),
            (Some(RateControlMode::Cqp), _) | (None, Some(_))
        )
    }

    /// Byte budget for one frame at the current rate settings
    fn frame_budget(&self) -> Option<usize> {
        let kbps = match self.rate_control {
            Some(RateControlMode::Vbr) => self.max_bitrate.or(self.bitrate),
            _ => self.bitrate,
        }?;
        let fps = self.framerate.filter(|f| *f > 0)?;
        Some((kbps as usize * 1000 / 8) / fps as usize)
    }

    fn update_rate_control(&mut self, payload_len: usize) {
        if !self.is_adaptive() {
            return;
        }
        let Some(budget) = self.frame_budget() else {
            return;
        };
        if payload_len > budget {
            self.adaptive_qp = (self.adaptive_qp + 6).min(MAX_ADAPTIVE_QP);
        } else if payload_len < budget / 2 {
            self.adaptive_qp = self.adaptive_qp.saturating_sub(2);
        }
    }

    fn encode_raw(&self, pixels: &[u8], resolution: Resolution) -> Vec<u8> {
        let mut payload = Vec::with_capacity(HEADER_LEN + pixels.len());
        write_header(&mut payload, FRAME_INTRA, resolution);
        payload.extend_from_slice(pixels);
        payload
    }

    fn encode_rle(
        &mut self,
        mut pixels: Vec<u8>,
        resolution: Resolution,
        force_keyframe: bool,
        qp: u32,
    ) -> (Vec<u8>, bool) {
        quantize(&mut pixels, qp);

        let gop = self.preset.unwrap_or_default().gop_size();
        let reference = self
            .reference
            .as_ref()
            .filter(|reference| reference.len() == pixels.len());
        let is_keyframe =
            force_keyframe || reference.is_none() || self.frames_since_keyframe + 1 >= gop;

        let mut payload = Vec::with_capacity(HEADER_LEN + pixels.len() / 4);
        match reference {
            Some(reference) if !is_keyframe => {
                write_header(&mut payload, FRAME_DELTA, resolution);
                let delta: Vec<u8> = pixels
                    .iter()
                    .zip(reference)
                    .map(|(cur, prev)| cur ^ prev)
                    .collect();
                rle_encode(&delta, &mut payload);
                self.frames_since_keyframe += 1;
            }
            _ => {
                write_header(&mut payload, FRAME_INTRA, resolution);
                rle_encode(&pixels, &mut payload);
                self.frames_since_keyframe = 0;
            }
        }

        self.reference = Some(pixels);
        (payload, is_keyframe)
    }
}

impl EncoderBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        FACTORY_NAME
    }

    fn initialize(&mut self, config: &EncoderConfig) -> BackendResult<()> {
        let resolution = config.resolution();
        if !resolution.is_encodable() {
            return Err(BackendError::InitFailed(format!(
                "resolution {} not encodable",
                resolution
            )));
        }

        self.resolution = Some(resolution);
        self.framerate = Some(config.framerate);
        self.bitrate = Some(config.bitrate);
        self.max_bitrate = Some(config.max_bitrate);
        self.preset = Some(config.preset);
        if self.codec == SoftwareCodec::Rle {
            self.qp = config.quantization();
            self.rate_control = config.rate_control();
        }
        self.initialized = true;

        info!(
            "Software {} encoder initialized: {} @ {}fps, {} kbps, latency {} polls",
            self.codec.name(),
            resolution,
            config.framerate,
            config.bitrate,
            self.latency_polls
        );
        Ok(())
    }

    fn get_property(&self, property: &Property) -> BackendResult<Option<PropertyValue>> {
        if !self.supports(property) {
            return Err(BackendError::UnsupportedProperty(property.to_string()));
        }
        Ok(match property {
            Property::Bitrate => self.bitrate.map(PropertyValue::Uint),
            Property::MaxBitrate => self.max_bitrate.map(PropertyValue::Uint),
            Property::Framerate => self.framerate.map(PropertyValue::Uint),
            Property::Resolution => self.resolution.map(PropertyValue::Resolution),
            Property::Preset => self.preset.map(PropertyValue::Preset),
            Property::Quantization => self.qp.map(PropertyValue::Uint),
            Property::RateControl => self.rate_control.map(PropertyValue::RateControl),
            Property::Custom(_) => None,
        })
    }

    fn set_property(&mut self, property: &Property, value: &PropertyValue) -> BackendResult<()> {
        if !self.supports(property) {
            return Err(BackendError::UnsupportedProperty(property.to_string()));
        }

        let invalid = |reason: &str| BackendError::InvalidValue {
            property: property.to_string(),
            reason: reason.to_string(),
        };

        match (property, value) {
            (Property::Bitrate, PropertyValue::Uint(kbps)) => {
                if *kbps == 0 {
                    return Err(invalid("must be non-zero"));
                }
                self.bitrate = Some(*kbps);
            }
            (Property::MaxBitrate, PropertyValue::Uint(kbps)) => {
                if *kbps == 0 {
                    return Err(invalid("must be non-zero"));
                }
                self.max_bitrate = Some(*kbps);
            }
            (Property::Framerate, PropertyValue::Uint(fps)) => {
                if *fps == 0 {
                    return Err(invalid("must be non-zero"));
                }
                self.framerate = Some(*fps);
            }
            (Property::Resolution, PropertyValue::Resolution(resolution)) => {
                if !resolution.is_encodable() {
                    return Err(invalid("must be non-zero and even"));
                }
                if self.resolution != Some(*resolution) {
                    debug!("Software encoder resolution -> {}", resolution);
                    self.reference = None;
                }
                self.resolution = Some(*resolution);
            }
            (Property::Preset, PropertyValue::Preset(preset)) => {
                self.preset = Some(*preset);
            }
            (Property::Quantization, PropertyValue::Uint(qp)) => {
                if *qp > MAX_QP {
                    return Err(invalid("out of range"));
                }
                self.qp = Some(*qp);
            }
            (Property::RateControl, PropertyValue::RateControl(mode)) => {
                self.rate_control = Some(*mode);
            }
            _ => return Err(invalid("wrong value type")),
        }
        Ok(())
    }

    fn submit(&mut self, frame: &VideoFrame, params: &SubmitParams) -> BackendResult<()> {
        if !self.initialized {
            return Err(BackendError::SubmitRejected(
                "backend not initialized".to_string(),
            ));
        }
        if frame.resolution() != params.resolution {
            return Err(BackendError::SubmitRejected(format!(
                "frame is {} but encode resolution is {}",
                frame.resolution(),
                params.resolution
            )));
        }
        if !frame.is_complete() {
            return Err(BackendError::SubmitRejected(format!(
                "frame buffer holds {} bytes, {} needed",
                frame.data().len(),
                frame.expected_len()
            )));
        }
        if self.pending.len() >= MAX_PENDING {
            return Err(BackendError::SubmitRejected("encoder queue full".to_string()));
        }

        let pixels = pack_bgra(frame);
        let (payload, is_keyframe, qp) = match self.codec {
            SoftwareCodec::Raw => (self.encode_raw(&pixels, params.resolution), true, 0),
            SoftwareCodec::Rle => {
                let qp = self.effective_qp();
                let (payload, is_keyframe) =
                    self.encode_rle(pixels, params.resolution, params.force_keyframe, qp);
                (payload, is_keyframe, qp)
            }
        };
        self.update_rate_control(payload.len());
        self.frames_submitted += 1;

        trace!(
            "Software frame {} queued: {} bytes, keyframe={}, qp={}",
            self.frames_submitted,
            payload.len(),
            is_keyframe,
            qp
        );

        self.pending.push_back(PendingFrame {
            payload,
            is_keyframe,
            qp,
            polls_remaining: self.latency_polls,
        });
        Ok(())
    }

    fn poll_output(&mut self, output: &mut BytesMut) -> BackendResult<PollStatus> {
        let Some(front) = self.pending.front_mut() else {
            return Ok(PollStatus::NotReady);
        };
        if front.polls_remaining > 0 {
            front.polls_remaining -= 1;
            return Ok(PollStatus::NotReady);
        }

        let Some(done) = self.pending.pop_front() else {
            return Ok(PollStatus::NotReady);
        };
        output.extend_from_slice(&done.payload);
        Ok(PollStatus::Ready(CompletedFrame {
            is_keyframe: done.is_keyframe,
            avg_qp: done.qp,
        }))
    }

    fn flush(&mut self) -> BackendResult<()> {
        debug!("Software encoder flushing {} frames", self.pending.len());
        for frame in self.pending.iter_mut() {
            frame.polls_remaining = 0;
        }
        Ok(())
    }
}

fn write_header(payload: &mut Vec<u8>, frame_type: u8, resolution: Resolution) {
    payload.push(frame_type);
    payload.extend_from_slice(&resolution.width.to_le_bytes());
    payload.extend_from_slice(&resolution.height.to_le_bytes());
}

/// Copy visible pixels into packed BGRA
fn pack_bgra(frame: &VideoFrame) -> Vec<u8> {
    let resolution = frame.resolution();
    let mut packed = Vec::with_capacity(resolution.pixels() as usize * BYTES_PER_PIXEL);
    let format = frame.format();

    for row in frame.rows() {
        for pixel in row.chunks_exact(BYTES_PER_PIXEL) {
            let bgra = match format {
                PixelFormat::Bgra8888 => [pixel[0], pixel[1], pixel[2], pixel[3]],
                PixelFormat::Rgba8888 => [pixel[2], pixel[1], pixel[0], pixel[3]],
                PixelFormat::Bgrx8888 => [pixel[0], pixel[1], pixel[2], 255],
                PixelFormat::Rgbx8888 => [pixel[2], pixel[1], pixel[0], 255],
            };
            packed.extend_from_slice(&bgra);
        }
    }
    packed
}

/// Drop low-order bits; higher qp discards more
fn quantize(pixels: &mut [u8], qp: u32) {
    let shift = (qp / 12).min(7);
    if shift == 0 {
        return;
    }
    let mask = 0xFFu8 << shift;
    for byte in pixels.iter_mut() {
        *byte &= mask;
    }
}

/// Append RLE runs of 4-byte pixels
fn rle_encode(data: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i + BYTES_PER_PIXEL <= data.len() {
        let pixel = &data[i..i + BYTES_PER_PIXEL];

        let mut count = 1u8;
        let mut j = i + BYTES_PER_PIXEL;
        while j + BYTES_PER_PIXEL <= data.len()
            && count < 255
            && &data[j..j + BYTES_PER_PIXEL] == pixel
        {
            count += 1;
            j += BYTES_PER_PIXEL;
        }

        out.push(count);
        out.extend_from_slice(pixel);
        i = j;
    }
}
