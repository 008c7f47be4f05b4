//! OpenH264 backend
//!
//! Software H.264 through Cisco's OpenH264, compiled from source by
//! `openh264-sys2`. OpenH264 encodes synchronously, so completed frames are
//! parked in a queue and handed out by `poll_output` like a device would.
//!
//! Bitrate, framerate and preset changes require a new encoder session; the
//! session is rebuilt lazily at the next submission, which restarts the GOP.
//!
//! Output is Annex B (start-code prefixed) NAL units.

use std::collections::VecDeque;

use bytes::BytesMut;
use openh264::encoder::{Encoder, EncoderConfig as OpenH264Config, FrameType, UsageType};
use openh264::formats::{BgraSliceU8, YUVBuffer};
use tracing::{debug, info, trace, warn};

use super::{
    BackendError, BackendFactory, BackendResult, CompletedFrame, EncoderBackend, PollStatus,
    Property, PropertyValue, SubmitParams,
};
use crate::config::{EncoderConfig, EncoderPreset};
use crate::encoder::{PixelFormat, Resolution, VideoFrame};

/// Factory name
pub const FACTORY_NAME: &str = "openh264";

/// Codec identifier
pub const CODEC_H264: &str = "h264";

/// Nominal quantizer reported for OpenH264 frames (not exposed by the API)
const REPORTED_QP: u32 = 26;

/// Factory for [`OpenH264Backend`]
#[derive(Debug, Clone, Default)]
pub struct OpenH264Factory;

impl OpenH264Factory {
    /// Create the factory
    pub fn new() -> Self {
        Self
    }
}

impl BackendFactory for OpenH264Factory {
    fn name(&self) -> &'static str {
        FACTORY_NAME
    }

    fn supported_codecs(&self) -> &[&'static str] {
        &[CODEC_H264]
    }

    fn create_backend(&self, codec: &str) -> BackendResult<Box<dyn EncoderBackend>> {
        if codec != CODEC_H264 {
            return Err(BackendError::UnsupportedCodec {
                codec: codec.to_string(),
            });
        }
        Ok(Box::new(OpenH264Backend::new()))
    }
}

/// H.264 encoder session
pub struct OpenH264Backend {
    encoder: Option<Encoder>,
    needs_rebuild: bool,
    resolution: Option<Resolution>,
    framerate: Option<u32>,
    bitrate: Option<u32>,
    preset: Option<EncoderPreset>,
    completed: VecDeque<(Vec<u8>, bool)>,
    frame_count: u64,
}

impl Default for OpenH264Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenH264Backend {
    /// Create a backend; the session opens in `initialize`
    pub fn new() -> Self {
        Self {
            encoder: None,
            needs_rebuild: true,
            resolution: None,
            framerate: None,
            bitrate: None,
            preset: None,
            completed: VecDeque::new(),
            frame_count: 0,
        }
    }

    fn build_encoder(&mut self) -> BackendResult<()> {
        let bitrate = self.bitrate.unwrap_or(5000);
        let framerate = self.framerate.unwrap_or(30);
        let usage = match self.preset.unwrap_or_default() {
            EncoderPreset::LowLatency => UsageType::ScreenContentRealTime,
            EncoderPreset::HighQuality => UsageType::ScreenContentNonRealTime,
        };

        let encoder_config = OpenH264Config::new()
            .set_bitrate_bps(bitrate * 1000)
            .max_frame_rate(framerate as f32)
            .enable_skip_frame(false)
            .usage_type(usage);

        let encoder = Encoder::with_api_config(openh264::OpenH264API::from_source(), encoder_config)
            .map_err(|e| BackendError::InitFailed(format!("OpenH264 init failed: {:?}", e)))?;

        debug!(
            "OpenH264 session created: bitrate={}kbps, fps={}, preset={}",
            bitrate,
            framerate,
            self.preset.unwrap_or_default()
        );
        self.encoder = Some(encoder);
        self.needs_rebuild = false;
        Ok(())
    }

    fn mark_changed(&mut self, property: &Property) {
        if self.encoder.is_some() && !self.needs_rebuild {
            debug!("OpenH264 {} changed, session will be rebuilt", property);
        }
        self.needs_rebuild = true;
    }
}

impl EncoderBackend for OpenH264Backend {
    fn name(&self) -> &'static str {
        FACTORY_NAME
    }

    fn initialize(&mut self, config: &EncoderConfig) -> BackendResult<()> {
        if !config.resolution().is_encodable() {
            return Err(BackendError::InitFailed(format!(
                "resolution {} not encodable",
                config.resolution()
            )));
        }
        self.resolution = Some(config.resolution());
        self.framerate = Some(config.framerate);
        self.bitrate = Some(config.bitrate);
        self.preset = Some(config.preset);
        self.build_encoder()?;

        info!(
            "OpenH264 encoder initialized: {} @ {}fps, {} kbps",
            config.resolution(),
            config.framerate,
            config.bitrate
        );
        Ok(())
    }

    fn get_property(&self, property: &Property) -> BackendResult<Option<PropertyValue>> {
        match property {
            Property::Bitrate => Ok(self.bitrate.map(PropertyValue::Uint)),
            Property::Framerate => Ok(self.framerate.map(PropertyValue::Uint)),
            Property::Resolution => Ok(self.resolution.map(PropertyValue::Resolution)),
            Property::Preset => Ok(self.preset.map(PropertyValue::Preset)),
            _ => Err(BackendError::UnsupportedProperty(property.to_string())),
        }
    }

    fn set_property(&mut self, property: &Property, value: &PropertyValue) -> BackendResult<()> {
        match (property, value) {
            (Property::Bitrate, PropertyValue::Uint(kbps)) if *kbps > 0 => {
                self.bitrate = Some(*kbps);
                self.mark_changed(property);
            }
            (Property::Framerate, PropertyValue::Uint(fps)) if *fps > 0 => {
                self.framerate = Some(*fps);
                self.mark_changed(property);
            }
            (Property::Preset, PropertyValue::Preset(preset)) => {
                self.preset = Some(*preset);
                self.mark_changed(property);
            }
            (Property::Resolution, PropertyValue::Resolution(resolution))
                if resolution.is_encodable() =>
            {
                // Dimensions are taken from each input frame
                self.resolution = Some(*resolution);
            }
            (Property::Bitrate | Property::Framerate | Property::Preset | Property::Resolution, _) => {
                return Err(BackendError::InvalidValue {
                    property: property.to_string(),
                    reason: format!("{:?} not accepted", value),
                });
            }
            _ => return Err(BackendError::UnsupportedProperty(property.to_string())),
        }
        Ok(())
    }

    fn submit(&mut self, frame: &VideoFrame, params: &SubmitParams) -> BackendResult<()> {
        let resolution = frame.resolution();
        if resolution != params.resolution || !resolution.is_encodable() {
            return Err(BackendError::SubmitRejected(format!(
                "frame is {} but encode resolution is {}",
                resolution, params.resolution
            )));
        }
        if frame.format() != PixelFormat::Bgra8888 && frame.format() != PixelFormat::Bgrx8888 {
            return Err(BackendError::SubmitRejected(format!(
                "pixel format {:?} not supported",
                frame.format()
            )));
        }
        let row_len = resolution.width as usize * 4;
        if frame.stride() != row_len || !frame.is_complete() {
            return Err(BackendError::SubmitRejected(
                "frame must be tightly packed".to_string(),
            ));
        }

        if self.needs_rebuild {
            self.build_encoder()?;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(BackendError::SubmitRejected("no encoder session".to_string()));
        };

        if params.force_keyframe {
            encoder.force_intra_frame();
        }

        let bgra_source = BgraSliceU8::new(
            frame.data(),
            (resolution.width as usize, resolution.height as usize),
        );
        let yuv = YUVBuffer::from_rgb_source(bgra_source);

        let bitstream = encoder.encode(&yuv).map_err(|e| {
            BackendError::SubmitRejected(format!("OpenH264 encode failed: {:?}", e))
        })?;
        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        if data.is_empty() {
            warn!("OpenH264 produced no output for frame {}", self.frame_count + 1);
        }

        self.frame_count += 1;
        trace!(
            "OpenH264 frame {}: {} bytes, keyframe={}",
            self.frame_count,
            data.len(),
            is_keyframe
        );
        self.completed.push_back((data, is_keyframe));
        Ok(())
    }

    fn poll_output(&mut self, output: &mut BytesMut) -> BackendResult<PollStatus> {
        let Some((data, is_keyframe)) = self.completed.pop_front() else {
            return Ok(PollStatus::NotReady);
        };
        output.extend_from_slice(&data);
        Ok(PollStatus::Ready(CompletedFrame {
            is_keyframe,
            avg_qp: REPORTED_QP,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(width: u32, height: u32, shade: u8) -> VideoFrame {
        VideoFrame::new(
            vec![shade; (width * height * 4) as usize],
            Resolution::new(width, height),
            PixelFormat::Bgra8888,
        )
    }

    fn params(width: u32, height: u32, force_keyframe: bool) -> SubmitParams {
        SubmitParams {
            timestamp: Duration::ZERO,
            duration: Duration::from_millis(33),
            force_keyframe,
            resolution: Resolution::new(width, height),
        }
    }

    #[test]
    fn test_first_frame_is_keyframe() {
        let mut backend = OpenH264Backend::new();
        backend
            .initialize(&EncoderConfig {
                width: 64,
                height: 64,
                ..Default::default()
            })
            .unwrap();

        backend.submit(&frame(64, 64, 128), &params(64, 64, false)).unwrap();
        let mut out = BytesMut::new();
        let status = backend.poll_output(&mut out).unwrap();
        assert!(matches!(
            status,
            PollStatus::Ready(CompletedFrame {
                is_keyframe: true,
                ..
            })
        ));
        assert!(!out.is_empty());
        assert_eq!(backend.poll_output(&mut out).unwrap(), PollStatus::NotReady);
    }

    #[test]
    fn test_tuning_options_unsupported() {
        let backend = OpenH264Backend::new();
        assert!(matches!(
            backend.get_property(&Property::Quantization),
            Err(BackendError::UnsupportedProperty(_))
        ));
    }
}
