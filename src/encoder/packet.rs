//! Output packets and caller cookies

use std::any::Any;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::Resolution;

/// Caller-supplied context threaded through the pipeline
///
/// Moved into the frame slot by `encode` and moved out exactly once, inside
/// the packet that completes (or drops) that frame. It cannot be cloned.
///
/// Listeners only borrow it through [`EncodedPacket::cookie`]; the packet
/// and its cookie are dropped once the last listener returns. To hand
/// ownership back to the caller, wrap a channel sender or an `Arc` in the
/// cookie and forward from the listener. [`into_inner`](Self::into_inner) is
/// for cookies that never entered the pipeline.
pub struct FrameCookie(Box<dyn Any + Send>);

impl FrameCookie {
    /// Wrap any sendable value
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    /// A cookie carrying no context
    pub fn empty() -> Self {
        Self::new(())
    }

    /// Borrow the wrapped value if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Take the wrapped value back if it has type `T`
    pub fn into_inner<T: Any>(self) -> Result<T, Self> {
        self.0.downcast::<T>().map(|b| *b).map_err(Self)
    }
}

impl std::fmt::Debug for FrameCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCookie").finish_non_exhaustive()
    }
}

/// One unit of encoder output
///
/// A packet with an empty payload stands for a dropped frame, so consumers
/// that expect one packet per submitted frame see a 1:1 mapping. Dropped
/// packets are never keyframes.
#[derive(Debug)]
pub struct EncodedPacket {
    timestamp: Duration,
    duration: Duration,
    is_keyframe: bool,
    resolution: Resolution,
    framerate: u32,
    avg_qp: u32,
    encode_start: Instant,
    encode_finish: Instant,
    payload: Bytes,
    cookie: Option<FrameCookie>,
}

/// Frame timing copied from the slot into its packet
#[derive(Debug, Clone, Copy)]
pub(crate) struct PacketTiming {
    pub timestamp: Duration,
    pub duration: Duration,
    pub resolution: Resolution,
    pub framerate: u32,
    pub encode_start: Instant,
}

impl EncodedPacket {
    pub(crate) fn completed(
        timing: PacketTiming,
        is_keyframe: bool,
        avg_qp: u32,
        payload: Bytes,
        cookie: Option<FrameCookie>,
    ) -> Self {
        Self {
            timestamp: timing.timestamp,
            duration: timing.duration,
            is_keyframe: is_keyframe && !payload.is_empty(),
            resolution: timing.resolution,
            framerate: timing.framerate,
            avg_qp,
            encode_start: timing.encode_start,
            encode_finish: Instant::now(),
            payload,
            cookie,
        }
    }

    pub(crate) fn dropped(timing: PacketTiming, cookie: Option<FrameCookie>) -> Self {
        Self::completed(timing, false, 0, Bytes::new(), cookie)
    }

    /// Capture timestamp of the source frame
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Duration until the next frame
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Frame was coded as a keyframe
    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }

    /// Frame was dropped (empty payload)
    pub fn is_dropped(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encoded dimensions
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Framerate in effect when the frame was submitted
    pub fn framerate(&self) -> u32 {
        self.framerate
    }

    /// Average quantization parameter
    pub fn avg_qp(&self) -> u32 {
        self.avg_qp
    }

    /// When the encode thread started submitting this frame
    pub fn encode_start(&self) -> Instant {
        self.encode_start
    }

    /// When the completed output was retrieved
    pub fn encode_finish(&self) -> Instant {
        self.encode_finish
    }

    /// Submission-to-retrieval latency
    pub fn encode_latency(&self) -> Duration {
        self.encode_finish.saturating_duration_since(self.encode_start)
    }

    /// Encoded bitstream
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Cookie handed in with `encode`, borrowed for the notification
    pub fn cookie(&self) -> Option<&FrameCookie> {
        self.cookie.as_ref()
    }
}
