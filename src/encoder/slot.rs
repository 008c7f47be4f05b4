//! Frame slot pool
//!
//! A fixed array of reusable frame slots. The pool is the pipeline's only
//! back-pressure mechanism: when no slot is free, `acquire` fails at once and
//! the caller drops the frame upstream. The pool never grows and never blocks.
//!
//! # Ownership
//!
//! ```text
//!            producer role                      encode role
//!   ┌──────┐ acquire ┌───────────┐ encode ┌──────────┐ submit ┌──────────┐
//!   │ Free │───────► │ Capturing │──────► │ Captured │──────► │ Encoding │
//!   └──────┘         └───────────┘        └──────────┘   │    └──────────┘
//!      ▲  ▲   drop_frame   │                             │          │
//!      │  └────────────────┘                   rejected  ▼          │
//!      │                                     ┌───────────────┐      │
//!      └─────────────── process_output ──────│ EncoderFailed │◄─────┘
//!                                            └───────────────┘
//! ```
//!
//! Each state has exactly one owning role, and ownership moves exactly once
//! per transition. The state word is atomic so the hand-off is visible
//! across threads; the slot payload sits behind a mutex that only the
//! current owner ever touches, so it is never contended.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Mutex, MutexGuard};

use super::packet::{FrameCookie, PacketTiming};
use super::{Resolution, VideoFrame};

/// Stable slot index (`0..N`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    /// Index into the pool
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Lifecycle state of a frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotState {
    /// Available for capture
    Free = 0,
    /// Owned by the producer, frame copy in progress
    Capturing = 1,
    /// Handed to the encode thread, not yet submitted
    Captured = 2,
    /// Submitted to the backend, waiting for output
    Encoding = 3,
    /// Backend rejected the submission; drained as a dropped frame
    EncoderFailed = 4,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::Capturing,
            2 => Self::Captured,
            3 => Self::Encoding,
            _ => Self::EncoderFailed,
        }
    }

    /// Counted against the pool bound
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

/// Captured input stored in a slot
#[derive(Debug)]
pub(crate) struct SlotInput {
    pub frame: VideoFrame,
    pub timestamp: Duration,
    pub duration: Duration,
    pub resolution: Resolution,
}

/// Per-slot payload, overwritten on every reuse
#[derive(Debug, Default)]
pub(crate) struct SlotData {
    pub input: Option<SlotInput>,
    pub force_keyframe: bool,
    pub bitrate_override: Option<u32>,
    pub cookie: Option<FrameCookie>,
    pub framerate: u32,
    pub encode_start: Option<Instant>,
    /// Reused output buffer for the encoded bitstream
    pub output: BytesMut,
}

impl SlotData {
    /// Timing block for the packet produced from this slot
    pub fn packet_timing(&self) -> PacketTiming {
        let (timestamp, duration, resolution) = self
            .input
            .as_ref()
            .map(|input| (input.timestamp, input.duration, input.resolution))
            .unwrap_or_default();
        PacketTiming {
            timestamp,
            duration,
            resolution,
            framerate: self.framerate,
            encode_start: self.encode_start.unwrap_or_else(Instant::now),
        }
    }

    /// Clear everything except the output buffer's allocation
    pub fn reset(&mut self) {
        self.input = None;
        self.force_keyframe = false;
        self.bitrate_override = None;
        self.cookie = None;
        self.framerate = 0;
        self.encode_start = None;
        self.output.clear();
    }
}

/// One reusable frame container
#[derive(Debug)]
pub(crate) struct FrameSlot {
    id: SlotId,
    state: AtomicU8,
    data: Mutex<SlotData>,
}

impl FrameSlot {
    fn new(index: usize) -> Self {
        Self {
            id: SlotId(index),
            state: AtomicU8::new(SlotState::Free as u8),
            data: Mutex::new(SlotData::default()),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from` → `to`; false if the slot was not in `from`
    pub fn try_transition(&self, from: SlotState, to: SlotState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move `from` → `to`, panicking on a state-machine violation
    pub fn transition(&self, from: SlotState, to: SlotState) {
        if !self.try_transition(from, to) {
            panic!(
                "{}: invalid transition {:?} -> {:?} (slot is {:?})",
                self.id,
                from,
                to,
                self.state()
            );
        }
    }

    pub fn data(&self) -> MutexGuard<'_, SlotData> {
        self.data.lock()
    }
}

/// Fixed-size pool of frame slots
#[derive(Debug)]
pub struct FrameSlotPool {
    slots: Box<[FrameSlot]>,
}

impl FrameSlotPool {
    /// Create a pool with `capacity` slots
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame slot pool needs at least one slot");
        Self {
            slots: (0..capacity).map(FrameSlot::new).collect(),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim a free slot, moving it to `Capturing`
    ///
    /// Returns `None` when every slot is in flight. Never mutates a slot on
    /// failure.
    pub fn acquire(&self) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|slot| slot.try_transition(SlotState::Free, SlotState::Capturing))
            .map(FrameSlot::id)
    }

    /// Return a slot to `Free`
    ///
    /// # Panics
    ///
    /// Panics if the slot is `Encoding` (the backend still owns it) or
    /// already `Free` (double release).
    pub fn release(&self, id: SlotId) {
        let slot = self.slot(id);
        let state = slot.state();
        match state {
            SlotState::Free => panic!("{}: double release", id),
            SlotState::Encoding => panic!("{}: released while the backend owns it", id),
            _ => {}
        }
        slot.data().reset();
        slot.transition(state, SlotState::Free);
    }

    /// Return an `Encoding` slot whose output has been collected
    pub(crate) fn retire(&self, id: SlotId) {
        let slot = self.slot(id);
        slot.data().reset();
        slot.transition(SlotState::Encoding, SlotState::Free);
    }

    /// Current state of a slot
    pub fn state(&self, id: SlotId) -> SlotState {
        self.slot(id).state()
    }

    /// Snapshot of every slot's state, in id order
    pub fn states(&self) -> Vec<SlotState> {
        self.slots.iter().map(FrameSlot::state).collect()
    }

    /// Number of slots not in `Free`
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state().is_in_flight())
            .count()
    }

    /// Slot id for an index, if the index is in range
    pub fn id(&self, index: usize) -> Option<SlotId> {
        (index < self.slots.len()).then_some(SlotId(index))
    }

    pub(crate) fn slot(&self, id: SlotId) -> &FrameSlot {
        match self.slots.get(id.0) {
            Some(slot) => slot,
            None => panic!("{} does not belong to a pool of {}", id, self.slots.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = FrameSlotPool::new(3);
        let ids: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(
            ids.iter().map(SlotId::index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(pool.in_flight(), 3);

        let before = pool.states();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.states(), before);
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let pool = FrameSlotPool::new(2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        pool.release(a);
        assert_eq!(pool.state(a), SlotState::Free);
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn test_release_clears_payload_keeps_buffer() {
        let pool = FrameSlotPool::new(1);
        let id = pool.acquire().unwrap();
        {
            let mut data = pool.slot(id).data();
            data.cookie = Some(FrameCookie::new(1u8));
            data.output.extend_from_slice(&[0u8; 256]);
        }
        pool.release(id);
        let data = pool.slot(id).data();
        assert!(data.cookie.is_none());
        assert!(data.output.is_empty());
        assert!(data.output.capacity() >= 256);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_panics() {
        let pool = FrameSlotPool::new(1);
        let id = pool.acquire().unwrap();
        pool.release(id);
        pool.release(id);
    }

    #[test]
    #[should_panic(expected = "backend owns it")]
    fn test_release_while_encoding_panics() {
        let pool = FrameSlotPool::new(1);
        let id = pool.acquire().unwrap();
        pool.slot(id).transition(SlotState::Capturing, SlotState::Captured);
        pool.slot(id).transition(SlotState::Captured, SlotState::Encoding);
        pool.release(id);
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_capacity() {
        use std::sync::Arc;

        let pool = Arc::new(FrameSlotPool::new(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.acquire())
            })
            .collect();
        let granted = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(granted, 3);
        assert_eq!(pool.in_flight(), 3);
    }
}
