//! Encoder pipeline
//!
//! Moves captured frames through a fixed pool of slots into an encoder
//! backend and delivers the compressed output to listeners in submission
//! order.
//!
//! # Architecture
//!
//! ```text
//!  producer thread(s)                      encode-worker thread
//!  ┌──────────────────────┐   Submit    ┌──────────────────────────────┐
//!  │ capture()            │ ──────────► │ EncoderCore                  │
//!  │ encode()             │  (crossbeam)│  reconcile → backend.submit  │
//!  │ process_output() ────┼───────────► │  EncodeOrderQueue (FIFO)     │
//!  └──────────┬───────────┘  round-trip │  poll → packet → listeners   │
//!             │                         └──────────────┬───────────────┘
//!             ▼                                        ▼
//!  ┌──────────────────────────────────────────────────────────────────┐
//!  │ FrameSlotPool (N slots, atomic state per slot)                   │
//!  └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The backend is created on the encode thread and never leaves it. Every
//! producer-side operation either touches only slots it owns or goes through
//! the command queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lamco_encode_pipeline::backend::software::SoftwareFactory;
//! use lamco_encode_pipeline::config::{EncoderConfig, PipelineSettings};
//! use lamco_encode_pipeline::encoder::{
//!     EncodedPacket, Encoder, FrameCookie, PixelFormat, Resolution, VideoFrame,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EncoderConfig { width: 64, height: 64, ..Default::default() };
//! let encoder = Encoder::new(
//!     Arc::new(SoftwareFactory::new()),
//!     "rle",
//!     config,
//!     PipelineSettings::default(),
//! )?;
//! encoder.add_listener(Arc::new(|packet: &EncodedPacket| {
//!     println!("{} bytes", packet.payload().len());
//! }))?;
//!
//! let frame = VideoFrame::new(vec![0u8; 64 * 64 * 4], Resolution::new(64, 64), PixelFormat::Bgra8888);
//! let slot = encoder.capture(frame, Duration::ZERO, Duration::from_millis(33), None)?;
//! encoder.encode(slot, true, None, FrameCookie::new(0u64))?;
//! encoder.process_output()?;
//! # Ok(())
//! # }
//! ```

mod engine;
mod error;
mod frame;
mod listener;
pub mod packet;
mod queue;
pub mod reconcile;
mod slot;
pub mod stats;
mod worker;

pub use error::{EncodeError, EncodeResult};
pub use frame::{PixelFormat, Resolution, VideoFrame};
pub use listener::{ListenerRegistry, PacketListener};
pub use packet::{EncodedPacket, FrameCookie};
pub use queue::EncodeOrderQueue;
pub use reconcile::{ConfigReconciler, ReconcileReport};
pub use slot::{FrameSlotPool, SlotId, SlotState};
pub use stats::PipelineStats;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use crate::backend::BackendFactory;
use crate::config::{validate_option, EncoderConfig, EncoderPreset, PipelineSettings};

use self::slot::SlotInput;
use self::worker::{EncodeCommand, EncodeWorker};

/// State shared between the producer facade and the encode thread
#[derive(Debug)]
pub(crate) struct Shared {
    pub pool: FrameSlotPool,
    pub listeners: ListenerRegistry,
    pub config: RwLock<EncoderConfig>,
    pub stats: Mutex<PipelineStats>,
    fatal: Mutex<Option<EncodeError>>,
}

impl Shared {
    pub fn new(pool_size: usize, config: EncoderConfig) -> Self {
        let stats = PipelineStats::new("pending", config.bitrate);
        Self {
            pool: FrameSlotPool::new(pool_size),
            listeners: ListenerRegistry::new(),
            config: RwLock::new(config),
            stats: Mutex::new(stats),
            fatal: Mutex::new(None),
        }
    }

    /// Latched fatal error, if the backend has failed
    pub fn fatal(&self) -> Option<EncodeError> {
        self.fatal.lock().clone()
    }

    /// Record the first fatal error; later ones are ignored
    pub fn latch_fatal(&self, err: EncodeError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    /// Acquire a slot and store a captured frame in it
    pub fn capture(
        &self,
        frame: VideoFrame,
        timestamp: Duration,
        duration: Duration,
        resolution: Option<Resolution>,
    ) -> EncodeResult<SlotId> {
        let Some(id) = self.pool.acquire() else {
            trace!("Frame pool exhausted, dropping capture at {:?}", timestamp);
            return Err(EncodeError::PoolExhausted {
                capacity: self.pool.capacity(),
            });
        };

        let resolution = resolution.unwrap_or_else(|| self.config.read().resolution());
        self.pool.slot(id).data().input = Some(SlotInput {
            frame,
            timestamp,
            duration,
            resolution,
        });
        Ok(id)
    }

    /// Hand a `Capturing` slot to the encode role
    pub fn mark_captured(
        &self,
        id: SlotId,
        force_keyframe: bool,
        bitrate_override: Option<u32>,
        cookie: FrameCookie,
    ) {
        let slot = self.pool.slot(id);
        let state = slot.state();
        assert!(
            state == SlotState::Capturing,
            "{}: encode requires a capturing slot (slot is {:?})",
            id,
            state
        );
        {
            let mut data = slot.data();
            data.force_keyframe = force_keyframe;
            data.bitrate_override = bitrate_override;
            data.cookie = Some(cookie);
        }
        slot.transition(SlotState::Capturing, SlotState::Captured);
    }

    /// Cancel a capture before `encode`
    pub fn drop_capture(&self, id: SlotId) {
        let state = self.pool.state(id);
        assert!(
            state == SlotState::Capturing,
            "{}: drop_frame requires a capturing slot (slot is {:?})",
            id,
            state
        );
        self.pool.release(id);
    }
}

/// Video encoder pipeline
///
/// Producer-side handle. All methods take `&self` and may be called from any
/// thread; the backend itself runs on a dedicated `encode-worker` thread.
///
/// Dropping the encoder shuts the worker down. Frames still outstanding at
/// that point are flushed or delivered as dropped packets, so every cookie
/// handed to [`encode`](Self::encode) reaches the listeners exactly once.
pub struct Encoder {
    shared: Arc<Shared>,
    worker: EncodeWorker,
    settings: PipelineSettings,
    codec: String,
}

impl Encoder {
    /// Create an encoder using `factory` for `codec`
    ///
    /// Spawns the encode thread, creates the backend on it and initializes
    /// it with `config`. Initialization failure is returned here and the
    /// thread is torn down.
    pub fn new(
        factory: Arc<dyn BackendFactory>,
        codec: &str,
        config: EncoderConfig,
        settings: PipelineSettings,
    ) -> EncodeResult<Self> {
        config.validate()?;
        if settings.pool_size == 0 {
            return Err(EncodeError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if settings.command_queue_depth < settings.pool_size {
            return Err(EncodeError::InvalidConfig(format!(
                "command_queue_depth ({}) must be at least pool_size ({})",
                settings.command_queue_depth, settings.pool_size
            )));
        }
        if !factory.supported_codecs().iter().any(|c| *c == codec) {
            return Err(crate::backend::BackendError::UnsupportedCodec {
                codec: codec.to_string(),
            }
            .into());
        }

        info!(
            "Creating {} encoder via '{}': {} @ {}fps, {} kbps, {} slots",
            codec,
            factory.name(),
            config.resolution(),
            config.framerate,
            config.bitrate,
            settings.pool_size
        );

        let shared = Arc::new(Shared::new(settings.pool_size, config));
        let worker = EncodeWorker::spawn(Arc::clone(&shared), factory, codec, &settings)?;

        Ok(Self {
            shared,
            worker,
            settings,
            codec: codec.to_string(),
        })
    }

    /// Claim a slot for a captured frame
    ///
    /// `resolution` overrides the configured encode resolution for this
    /// frame. Fails with [`EncodeError::PoolExhausted`] when every slot is in
    /// flight; the caller drops the frame and tries again next cycle.
    pub fn capture(
        &self,
        frame: VideoFrame,
        timestamp: Duration,
        duration: Duration,
        resolution: Option<Resolution>,
    ) -> EncodeResult<SlotId> {
        if self.settings.drain_before_capture {
            self.process_output()?;
        } else if let Some(err) = self.shared.fatal() {
            return Err(err);
        }
        self.shared.capture(frame, timestamp, duration, resolution)
    }

    /// Abandon a captured frame before encoding it
    ///
    /// # Panics
    ///
    /// Panics if the slot is not `Capturing`.
    pub fn drop_frame(&self, id: SlotId) {
        self.shared.drop_capture(id);
        trace!("{} dropped before encode", id);
    }

    /// Queue a captured frame for encoding
    ///
    /// The cookie comes back inside the frame's packet. Submission failures
    /// do not show up here; they arrive as a dropped packet. The only error
    /// is [`EncodeError::WorkerStopped`], in which case the slot is released
    /// and the cookie discarded.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not `Capturing`.
    pub fn encode(
        &self,
        id: SlotId,
        force_keyframe: bool,
        bitrate_override: Option<u32>,
        cookie: FrameCookie,
    ) -> EncodeResult<()> {
        self.shared
            .mark_captured(id, force_keyframe, bitrate_override, cookie);

        if let Err(e) = self.worker.send(EncodeCommand::Submit(id)) {
            self.shared.pool.release(id);
            return Err(e);
        }
        Ok(())
    }

    /// Deliver every completed frame to the listeners
    ///
    /// Returns the number of packets emitted (dropped frames included). A
    /// backend poll failure is fatal: it is returned now and by every later
    /// call.
    ///
    /// # Panics
    ///
    /// Panics if called from a packet listener.
    pub fn process_output(&self) -> EncodeResult<usize> {
        self.worker
            .request(|response_tx| EncodeCommand::ProcessOutput { response_tx })
    }

    /// Ask the backend to finish all outstanding work and deliver it
    pub fn flush(&self) -> EncodeResult<usize> {
        self.worker
            .request(|response_tx| EncodeCommand::Flush { response_tx })
    }

    /// Set the target bitrate (kbps), raising the peak if needed
    pub fn set_bitrate(&self, kbps: u32) -> EncodeResult<()> {
        self.update_config(|config| {
            config.bitrate = kbps;
            config.max_bitrate = config.max_bitrate.max(kbps);
        })
    }

    /// Set the peak bitrate (kbps)
    pub fn set_max_bitrate(&self, kbps: u32) -> EncodeResult<()> {
        self.update_config(|config| config.max_bitrate = kbps)
    }

    /// Set the target framerate
    pub fn set_framerate(&self, fps: u32) -> EncodeResult<()> {
        self.update_config(|config| config.framerate = fps)
    }

    /// Set the encode resolution
    pub fn set_resolution(&self, resolution: Resolution) -> EncodeResult<()> {
        self.update_config(|config| {
            config.width = resolution.width;
            config.height = resolution.height;
        })
    }

    /// Set the preset
    pub fn set_preset(&self, preset: EncoderPreset) -> EncodeResult<()> {
        self.update_config(|config| config.preset = preset)
    }

    /// Set a tuning option (`qp`, `rc_mode`, or a backend-specific name)
    pub fn set_tuning_parameter(&self, name: &str, value: &str) -> EncodeResult<()> {
        validate_option(name, value)?;
        self.update_config(|config| config.set_option(name, value))
    }

    /// Replace the whole configuration
    pub fn reconfigure(&self, config: EncoderConfig) -> EncodeResult<()> {
        config.validate()?;
        debug!("Encoder reconfigured: {:?}", config);
        *self.shared.config.write() = config;
        Ok(())
    }

    /// Apply a change to the persisted configuration
    ///
    /// The backend picks it up at the next submission.
    fn update_config(&self, change: impl FnOnce(&mut EncoderConfig)) -> EncodeResult<()> {
        let mut config = self.shared.config.write();
        let mut updated = config.clone();
        change(&mut updated);
        updated.validate()?;
        *config = updated;
        Ok(())
    }

    /// Snapshot of the persisted configuration
    pub fn config(&self) -> EncoderConfig {
        self.shared.config.read().clone()
    }

    /// Register a packet listener
    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) -> EncodeResult<()> {
        self.shared.listeners.register(listener)
    }

    /// Unregister a packet listener
    ///
    /// Once this returns the listener is not called again.
    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) -> EncodeResult<()> {
        self.shared.listeners.unregister(listener)
    }

    /// Listener registry, for deferred removal from inside a callback
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.shared.listeners
    }

    /// Snapshot of pipeline statistics
    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.lock().clone()
    }

    /// State of every slot, in id order
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.shared.pool.states()
    }

    /// Number of frame slots
    pub fn capacity(&self) -> usize {
        self.shared.pool.capacity()
    }

    /// Codec this encoder produces
    pub fn codec(&self) -> &str {
        &self.codec
    }

    /// Backend identifier
    pub fn backend_name(&self) -> &'static str {
        self.worker.backend_name()
    }

    /// Stop the encode thread
    ///
    /// Outstanding frames are flushed and delivered before this returns.
    /// Later calls fail with [`EncodeError::WorkerStopped`].
    pub fn shutdown(&mut self) {
        if self.worker.shutdown() {
            info!("Encoder stopped: {}", self.shared.stats.lock().summary());
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        debug!("Dropping {} encoder", self.codec);
        self.shutdown();
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("codec", &self.codec)
            .field("backend", &self.backend_name())
            .field("slots", &self.shared.pool.states())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Shared {
        let config = EncoderConfig {
            width: 16,
            height: 16,
            ..Default::default()
        };
        Shared::new(2, config)
    }

    fn capture(shared: &Shared) -> SlotId {
        let frame = VideoFrame::test_pattern(Resolution::new(16, 16), 0);
        shared
            .capture(frame, Duration::ZERO, Duration::from_millis(33), None)
            .unwrap()
    }

    #[test]
    fn test_capture_uses_config_resolution() {
        let shared = shared();
        let id = capture(&shared);
        assert_eq!(shared.pool.state(id), SlotState::Capturing);

        shared.mark_captured(id, true, Some(1000), FrameCookie::new(1u64));
        assert_eq!(shared.pool.state(id), SlotState::Captured);
        let data = shared.pool.slot(id).data();
        assert!(data.force_keyframe);
        assert_eq!(data.bitrate_override, Some(1000));
        assert_eq!(
            data.input.as_ref().map(|input| input.resolution),
            Some(Resolution::new(16, 16))
        );
    }

    #[test]
    #[should_panic(expected = "encode requires a capturing slot")]
    fn test_encode_twice_panics() {
        let shared = shared();
        let id = capture(&shared);
        shared.mark_captured(id, false, None, FrameCookie::empty());
        shared.mark_captured(id, false, None, FrameCookie::empty());
    }

    #[test]
    #[should_panic(expected = "encode requires a capturing slot")]
    fn test_encode_free_slot_panics() {
        let shared = shared();
        let id = capture(&shared);
        shared.drop_capture(id);
        shared.mark_captured(id, false, None, FrameCookie::empty());
    }

    #[test]
    #[should_panic(expected = "drop_frame requires a capturing slot")]
    fn test_drop_after_encode_panics() {
        let shared = shared();
        let id = capture(&shared);
        shared.mark_captured(id, false, None, FrameCookie::empty());
        shared.drop_capture(id);
    }

    #[test]
    #[should_panic(expected = "drop_frame requires a capturing slot")]
    fn test_drop_twice_panics() {
        let shared = shared();
        let id = capture(&shared);
        shared.drop_capture(id);
        shared.drop_capture(id);
    }

    #[test]
    fn test_fatal_error_latches_first() {
        let shared = shared();
        assert!(shared.fatal().is_none());
        shared.latch_fatal(EncodeError::WorkerStopped);
        shared.latch_fatal(EncodeError::InvalidConfig("later".to_string()));
        assert_eq!(shared.fatal(), Some(EncodeError::WorkerStopped));
    }
}
