//! Property tests for the slot pool, order queue and cookie delivery

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;

use lamco_encode_pipeline::backend::software::SoftwareFactory;
use lamco_encode_pipeline::config::{EncoderConfig, PipelineSettings};
use lamco_encode_pipeline::encoder::{
    EncodeError, EncodeOrderQueue, EncodedPacket, Encoder, FrameCookie, FrameSlotPool,
    Resolution, SlotState, VideoFrame,
};

#[derive(Debug, Clone, Copy)]
enum PoolOp {
    Acquire,
    Release(usize),
}

fn pool_op() -> impl Strategy<Value = PoolOp> {
    prop_oneof![Just(PoolOp::Acquire), any::<usize>().prop_map(PoolOp::Release)]
}

#[derive(Debug, Clone, Copy)]
enum FrameOp {
    Encode { reject: bool, force_keyframe: bool },
    Cancel,
    Drain,
}

fn frame_op() -> impl Strategy<Value = FrameOp> {
    prop_oneof![
        4 => (any::<bool>(), any::<bool>()).prop_map(|(reject, force_keyframe)| FrameOp::Encode {
            reject,
            force_keyframe
        }),
        1 => Just(FrameOp::Cancel),
        2 => Just(FrameOp::Drain),
    ]
}

proptest! {
    #[test]
    fn pool_never_exceeds_capacity(
        capacity in 1usize..8,
        ops in prop::collection::vec(pool_op(), 1..64),
    ) {
        let pool = FrameSlotPool::new(capacity);
        let mut held = Vec::new();

        for op in ops {
            match op {
                PoolOp::Acquire => {
                    let before = pool.states();
                    match pool.acquire() {
                        Some(id) => {
                            prop_assert!(held.len() < capacity);
                            prop_assert!(!held.contains(&id));
                            prop_assert_eq!(pool.state(id), SlotState::Capturing);
                            held.push(id);
                        }
                        None => {
                            // Exhaustion changes nothing
                            prop_assert_eq!(held.len(), capacity);
                            prop_assert_eq!(pool.states(), before);
                        }
                    }
                }
                PoolOp::Release(pick) if !held.is_empty() => {
                    let id = held.remove(pick % held.len());
                    pool.release(id);
                    prop_assert_eq!(pool.state(id), SlotState::Free);
                }
                PoolOp::Release(_) => {}
            }
            prop_assert_eq!(pool.in_flight(), held.len());
        }
    }

    #[test]
    fn order_queue_is_fifo(capacity in 1usize..16, rounds in 1usize..4) {
        let pool = FrameSlotPool::new(capacity);
        let mut queue = EncodeOrderQueue::new(capacity);

        for round in 0..rounds {
            let ids: Vec<_> = (0..capacity)
                .map(|i| pool.id((i + round) % capacity).unwrap())
                .collect();
            for id in &ids {
                queue.push(*id);
            }
            prop_assert_eq!(queue.len(), capacity);
            prop_assert_eq!(queue.iter().collect::<Vec<_>>(), ids.clone());

            let drained: Vec<_> = std::iter::from_fn(|| queue.pop_front()).collect();
            prop_assert_eq!(drained, ids);
            prop_assert!(queue.is_empty());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Delivered {
    frame: u32,
    dropped: bool,
    keyframe: bool,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_cookie_delivered_once_in_order(
        latency in 0u32..3,
        ops in prop::collection::vec(frame_op(), 1..40),
    ) {
        let resolution = Resolution::new(16, 8);
        let config = EncoderConfig {
            width: resolution.width,
            height: resolution.height,
            ..Default::default()
        };
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut expected = Vec::new();

        {
            let encoder = Encoder::new(
                Arc::new(SoftwareFactory::with_latency(latency)),
                "rle",
                config,
                PipelineSettings::manual_drain("rle", 3),
            )
            .unwrap();

            let sink = Arc::clone(&delivered);
            encoder
                .add_listener(Arc::new(move |packet: &EncodedPacket| {
                    let frame = packet
                        .cookie()
                        .and_then(|c| c.downcast_ref::<u32>())
                        .copied()
                        .unwrap_or(u32::MAX);
                    sink.lock().push(Delivered {
                        frame,
                        dropped: packet.is_dropped(),
                        keyframe: packet.is_keyframe(),
                    });
                }))
                .unwrap();

            for (n, op) in ops.into_iter().enumerate() {
                let n = n as u32;
                match op {
                    FrameOp::Encode { reject, force_keyframe } => {
                        // Undersized frames are refused by the backend
                        let frame_res = if reject { Resolution::new(8, 8) } else { resolution };
                        let frame = VideoFrame::test_pattern(frame_res, n);
                        match encoder.capture(frame, Duration::from_millis(n as u64), Duration::ZERO, None) {
                            Ok(slot) => {
                                encoder.encode(slot, force_keyframe, None, FrameCookie::new(n)).unwrap();
                                expected.push((n, reject, force_keyframe));
                            }
                            Err(EncodeError::PoolExhausted { capacity }) => {
                                prop_assert_eq!(capacity, 3);
                            }
                            Err(e) => return Err(TestCaseError::fail(e.to_string())),
                        }
                    }
                    FrameOp::Cancel => {
                        if let Ok(slot) = encoder.capture(
                            VideoFrame::test_pattern(resolution, n),
                            Duration::ZERO,
                            Duration::ZERO,
                            None,
                        ) {
                            encoder.drop_frame(slot);
                        }
                    }
                    FrameOp::Drain => {
                        encoder.process_output().unwrap();
                    }
                }
                let in_flight = encoder
                    .slot_states()
                    .iter()
                    .filter(|s| **s != SlotState::Free)
                    .count();
                prop_assert!(in_flight <= 3);
            }
        }

        let delivered = delivered.lock().clone();
        prop_assert_eq!(
            delivered.iter().map(|d| d.frame).collect::<Vec<_>>(),
            expected.iter().map(|(n, _, _)| *n).collect::<Vec<_>>()
        );
        for (packet, (_, reject, force_keyframe)) in delivered.iter().zip(&expected) {
            prop_assert_eq!(packet.dropped, *reject);
            if packet.dropped {
                prop_assert!(!packet.keyframe);
            } else if *force_keyframe {
                prop_assert!(packet.keyframe);
            }
        }
    }
}
