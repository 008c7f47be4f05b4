//! Encode role
//!
//! Everything here runs on the encode thread, which is the only thread that
//! touches the backend. Submissions go to the backend in the order they
//! arrive and are tracked in an [`EncodeOrderQueue`]; draining pairs each
//! completed result with the queue head.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::backend::{
    BackendError, BackendResult, EncoderBackend, PollStatus, Property, PropertyValue,
    SubmitParams,
};
use crate::config::EncoderConfig;

use super::packet::EncodedPacket;
use super::reconcile::ConfigReconciler;
use super::slot::SlotData;
use super::{EncodeError, EncodeOrderQueue, EncodeResult, Shared, SlotId, SlotState};

/// Backend owner and drain loop
pub(crate) struct EncoderCore {
    shared: Arc<Shared>,
    backend: Box<dyn EncoderBackend>,
    queue: EncodeOrderQueue,
    reconciler: ConfigReconciler,
}

impl EncoderCore {
    /// Wrap an initialized backend
    pub fn new(shared: Arc<Shared>, backend: Box<dyn EncoderBackend>) -> Self {
        let queue = EncodeOrderQueue::new(shared.pool.capacity());
        shared.stats.lock().backend = backend.name();
        Self {
            shared,
            backend,
            queue,
            reconciler: ConfigReconciler::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Submissions not yet retired
    pub fn outstanding(&self) -> usize {
        self.queue.len()
    }

    /// Submit a `Captured` slot to the backend
    ///
    /// The slot is queued whether or not the backend accepts it. A rejected
    /// frame becomes `EncoderFailed` and is retired as a dropped packet by
    /// the next drain.
    pub fn submit(&mut self, id: SlotId) {
        let shared = Arc::clone(&self.shared);
        let slot = shared.pool.slot(id);
        let result = if let Some(err) = shared.fatal() {
            Err(BackendError::SubmitRejected(format!("backend failed: {}", err)))
        } else {
            let config = shared.config.read().clone();
            let mut data = slot.data();
            data.framerate = config.framerate;
            data.encode_start = Some(Instant::now());
            self.submit_frame(&data, &config)
        };

        self.shared.stats.lock().record_submit();

        match result {
            Ok(()) => {
                trace!("{} submitted", id);
                slot.transition(SlotState::Captured, SlotState::Encoding);
            }
            Err(e) if e.is_per_frame() => {
                warn!("{} rejected by {}: {}", id, self.backend.name(), e);
                slot.transition(SlotState::Captured, SlotState::EncoderFailed);
            }
            Err(e) => {
                // Still only this frame; a dead device shows up at the next poll
                error!("{} submission to {} failed: {}", id, self.backend.name(), e);
                slot.transition(SlotState::Captured, SlotState::EncoderFailed);
            }
        }
        self.queue.push(id);
    }

    /// Reconcile the backend, apply the per-frame override and submit
    fn submit_frame(&mut self, data: &SlotData, config: &EncoderConfig) -> BackendResult<()> {
        let Some(input) = data.input.as_ref() else {
            return Err(BackendError::SubmitRejected(
                "slot holds no captured frame".to_string(),
            ));
        };

        self.reconciler
            .reconcile(self.backend.as_mut(), config, input.resolution)?;

        if let Some(kbps) = data.bitrate_override {
            match self.reconciler.apply(
                self.backend.as_mut(),
                &Property::Bitrate,
                &PropertyValue::Uint(kbps),
            ) {
                Ok(_) => {}
                Err(BackendError::UnsupportedProperty(_)) => {
                    debug!("{}: bitrate override ignored", self.backend.name());
                }
                Err(e) => return Err(e),
            }
        }

        self.shared
            .stats
            .lock()
            .set_config_writes(self.reconciler.writes(), self.reconciler.skipped());

        let params = SubmitParams {
            timestamp: input.timestamp,
            duration: input.duration,
            force_keyframe: data.force_keyframe,
            resolution: input.resolution,
        };
        self.backend.submit(&input.frame, &params)
    }

    /// Retire every frame whose outcome is known, in submission order
    ///
    /// Stops at the first submission the backend has not finished. Returns
    /// the number of packets emitted.
    pub fn process_output(&mut self) -> EncodeResult<usize> {
        if let Some(err) = self.shared.fatal() {
            return Err(err);
        }

        let mut emitted = 0;
        while let Some(id) = self.queue.front() {
            match self.shared.pool.state(id) {
                SlotState::EncoderFailed => {
                    self.queue.pop_front();
                    self.retire_dropped(id);
                    emitted += 1;
                }
                SlotState::Encoding => {
                    let status = {
                        let mut data = self.shared.pool.slot(id).data();
                        self.backend.poll_output(&mut data.output)
                    };
                    match status {
                        Ok(PollStatus::NotReady) => break,
                        Ok(PollStatus::Ready(done)) => {
                            self.queue.pop_front();
                            self.retire_completed(id, done.is_keyframe, done.avg_qp);
                            emitted += 1;
                        }
                        Err(e) => {
                            error!("{} output query failed: {}", self.backend.name(), e);
                            let err = EncodeError::Backend(e);
                            self.shared.latch_fatal(err.clone());
                            return Err(err);
                        }
                    }
                }
                state => panic!("{} queued in state {:?}", id, state),
            }
        }

        if emitted > 0 {
            trace!("Drained {} packets, {} outstanding", emitted, self.queue.len());
        }
        Ok(emitted)
    }

    /// Drain triggered by the idle timer; failures are latched, not returned
    pub fn background_drain(&mut self) {
        if self.queue.is_empty() || self.shared.fatal().is_some() {
            return;
        }
        if let Err(e) = self.process_output() {
            debug!("Background drain stopped: {}", e);
        }
    }

    /// Finish outstanding work and drain it
    pub fn flush(&mut self) -> EncodeResult<usize> {
        if let Some(err) = self.shared.fatal() {
            return Err(err);
        }
        if let Err(e) = self.backend.flush() {
            error!("{} flush failed: {}", self.backend.name(), e);
            let err = EncodeError::Backend(e);
            self.shared.latch_fatal(err.clone());
            return Err(err);
        }
        self.process_output()
    }

    /// Final drain before the encode thread exits
    ///
    /// Flushes a healthy backend, then retires whatever is still queued as
    /// dropped so no cookie is lost. Returns the number of abandoned frames.
    pub fn shutdown(&mut self) -> usize {
        if self.shared.fatal().is_none() && !self.queue.is_empty() {
            if let Err(e) = self.flush() {
                warn!("Flush during shutdown failed: {}", e);
            }
        }

        let mut abandoned = 0;
        while let Some(id) = self.queue.pop_front() {
            let slot = self.shared.pool.slot(id);
            if slot.state() == SlotState::Encoding {
                slot.transition(SlotState::Encoding, SlotState::EncoderFailed);
            }
            self.retire_dropped(id);
            abandoned += 1;
        }

        if abandoned > 0 {
            warn!("Abandoned {} frames at shutdown", abandoned);
        }
        abandoned
    }

    fn retire_completed(&mut self, id: SlotId, is_keyframe: bool, avg_qp: u32) {
        let packet = {
            let mut data = self.shared.pool.slot(id).data();
            if data.force_keyframe && !is_keyframe {
                warn!(
                    "{}: {} ignored a keyframe request",
                    id,
                    self.backend.name()
                );
            }
            let payload = data.output.split().freeze();
            let cookie = data.cookie.take();
            EncodedPacket::completed(data.packet_timing(), is_keyframe, avg_qp, payload, cookie)
        };
        self.shared.pool.retire(id);

        if packet.is_dropped() {
            self.shared.stats.lock().record_drop();
        } else {
            self.shared.stats.lock().record_frame(
                packet.encode_latency(),
                packet.payload().len(),
                packet.is_keyframe(),
            );
        }
        self.shared.listeners.notify_all(&packet);
    }

    fn retire_dropped(&mut self, id: SlotId) {
        let packet = {
            let mut data = self.shared.pool.slot(id).data();
            let cookie = data.cookie.take();
            EncodedPacket::dropped(data.packet_timing(), cookie)
        };
        self.shared.pool.release(id);
        self.shared.stats.lock().record_drop();
        trace!("{} retired as dropped", id);
        self.shared.listeners.notify_all(&packet);
    }
}
