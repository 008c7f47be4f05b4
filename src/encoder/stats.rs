//! Pipeline statistics
//!
//! Updated by the encode thread as packets are retired, readable from any
//! thread through [`Encoder::stats`](super::Encoder::stats).

use std::time::{Duration, Instant};

/// Cumulative pipeline statistics
#[derive(Debug, Clone)]
pub struct PipelineStats {
    /// Backend identifier
    pub backend: &'static str,

    /// Frames submitted to the backend (accepted or rejected)
    pub frames_submitted: u64,

    /// Frames that produced a payload
    pub frames_encoded: u64,

    /// Frames retired as zero-payload packets
    pub frames_dropped: u64,

    /// Total bytes of encoded output
    pub bytes_encoded: u64,

    /// Number of keyframes emitted
    pub keyframes_encoded: u64,

    /// Average submit-to-retrieve latency (ms, exponential moving average)
    pub avg_encode_time_ms: f32,

    /// Minimum latency observed (ms)
    pub min_encode_time_ms: f32,

    /// Maximum latency observed (ms)
    pub max_encode_time_ms: f32,

    /// Output bitrate since creation (kbps)
    pub bitrate_kbps: u32,

    /// Target bitrate from configuration (kbps)
    pub target_bitrate_kbps: u32,

    /// Backend property writes issued by reconciliation
    pub config_writes: u64,

    /// Property writes skipped because the live value matched
    pub config_writes_skipped: u64,

    /// Time since the pipeline was created
    pub uptime: Duration,

    /// Creation time
    pub created_at: Instant,
}

impl PipelineStats {
    /// Create new stats for a backend
    pub fn new(backend: &'static str, target_bitrate_kbps: u32) -> Self {
        Self {
            backend,
            frames_submitted: 0,
            frames_encoded: 0,
            frames_dropped: 0,
            bytes_encoded: 0,
            keyframes_encoded: 0,
            avg_encode_time_ms: 0.0,
            min_encode_time_ms: f32::MAX,
            max_encode_time_ms: 0.0,
            bitrate_kbps: 0,
            target_bitrate_kbps,
            config_writes: 0,
            config_writes_skipped: 0,
            uptime: Duration::ZERO,
            created_at: Instant::now(),
        }
    }

    /// Record a retired frame with payload
    pub fn record_frame(&mut self, encode_time: Duration, bytes: usize, is_keyframe: bool) {
        let encode_time_ms = encode_time.as_secs_f32() * 1000.0;
        self.frames_encoded += 1;
        self.bytes_encoded += bytes as u64;

        if self.frames_encoded == 1 {
            self.avg_encode_time_ms = encode_time_ms;
        } else {
            // Exponential moving average (α = 0.1)
            self.avg_encode_time_ms = self.avg_encode_time_ms * 0.9 + encode_time_ms * 0.1;
        }

        self.min_encode_time_ms = self.min_encode_time_ms.min(encode_time_ms);
        self.max_encode_time_ms = self.max_encode_time_ms.max(encode_time_ms);

        if is_keyframe {
            self.keyframes_encoded += 1;
        }

        self.uptime = self.created_at.elapsed();
        self.update_bitrate_estimate();
    }

    /// Record a frame retired as a drop
    pub fn record_drop(&mut self) {
        self.frames_dropped += 1;
        self.uptime = self.created_at.elapsed();
    }

    /// Record a submission attempt
    pub fn record_submit(&mut self) {
        self.frames_submitted += 1;
    }

    /// Copy reconciliation counters
    pub fn set_config_writes(&mut self, writes: u64, skipped: u64) {
        self.config_writes = writes;
        self.config_writes_skipped = skipped;
    }

    fn update_bitrate_estimate(&mut self) {
        let elapsed_secs = self.uptime.as_secs_f32();
        if elapsed_secs > 0.5 {
            // bits per second / 1000 = kbps
            self.bitrate_kbps = ((self.bytes_encoded * 8) as f32 / elapsed_secs / 1000.0) as u32;
        }
    }

    /// Frames retired (encoded + dropped)
    pub fn frames_retired(&self) -> u64 {
        self.frames_encoded + self.frames_dropped
    }

    /// Encoded frames per second since creation
    pub fn fps(&self) -> f32 {
        let elapsed_secs = self.uptime.as_secs_f32();
        if elapsed_secs > 0.0 {
            self.frames_encoded as f32 / elapsed_secs
        } else {
            0.0
        }
    }

    /// Share of retired frames that were dropped
    pub fn drop_percentage(&self) -> f32 {
        let total = self.frames_retired();
        if total > 0 {
            (self.frames_dropped as f32 / total as f32) * 100.0
        } else {
            0.0
        }
    }

    /// Format stats for logging
    pub fn summary(&self) -> String {
        format!(
            "{}: {} frames ({} dropped), {:.1} fps, {} kbps (target {}), avg {:.2}ms/frame, {} config writes",
            self.backend,
            self.frames_encoded,
            self.frames_dropped,
            self.fps(),
            self.bitrate_kbps,
            self.target_bitrate_kbps,
            self.avg_encode_time_ms,
            self.config_writes
        )
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new("unknown", 5000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = PipelineStats::new("software", 5000);
        assert_eq!(stats.backend, "software");
        assert_eq!(stats.frames_encoded, 0);
        assert_eq!(stats.target_bitrate_kbps, 5000);
    }

    #[test]
    fn test_stats_record_frame() {
        let mut stats = PipelineStats::new("software", 5000);

        stats.record_frame(Duration::from_micros(2500), 10000, true);
        assert_eq!(stats.frames_encoded, 1);
        assert_eq!(stats.keyframes_encoded, 1);
        assert_eq!(stats.bytes_encoded, 10000);
        assert!((stats.avg_encode_time_ms - 2.5).abs() < 0.01);

        stats.record_frame(Duration::from_millis(3), 5000, false);
        assert_eq!(stats.frames_encoded, 2);
        assert_eq!(stats.keyframes_encoded, 1);
        assert_eq!(stats.bytes_encoded, 15000);
        assert!((stats.min_encode_time_ms - 2.5).abs() < 0.01);
        assert!((stats.max_encode_time_ms - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_stats_record_drop() {
        let mut stats = PipelineStats::new("software", 5000);
        stats.record_frame(Duration::from_millis(2), 5000, false);
        stats.record_drop();
        stats.record_drop();

        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.frames_retired(), 3);
        assert!((stats.drop_percentage() - 66.666).abs() < 1.0);
    }

    #[test]
    fn test_stats_summary() {
        let stats = PipelineStats::new("openh264", 8000);
        let summary = stats.summary();
        assert!(summary.contains("openh264"));
        assert!(summary.contains("8000"));
    }
}
