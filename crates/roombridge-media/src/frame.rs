use bytes::Bytes;
use std::time::{Duration, SystemTime};
use webrtc::media::Sample;

/// A reassembled, decode-ready video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Depacketized payload (Annex-B for H.264)
    pub data: Bytes,
    /// RTP timestamp shared by every packet of the frame
    pub timestamp: u32,
    /// Time since the previously emitted frame, zero for the first one
    pub duration: Duration,
    pub first_sequence: u16,
    pub last_sequence: u16,
    pub packet_count: usize,
}

impl Frame {
    /// Convert into a sample ready for `TrackLocalStaticSample::write_sample`
    pub fn to_sample(&self) -> Sample {
        Sample {
            data: self.data.clone(),
            timestamp: SystemTime::now(),
            duration: self.duration,
            packet_timestamp: self.timestamp,
            ..Default::default()
        }
    }
}

/// Convert an RTP timestamp delta into wall-clock time
pub(crate) fn timestamp_delta(delta: u32, clock_rate: u32) -> Duration {
    // Deltas in the upper half of the range mean the clock went backwards
    if clock_rate == 0 || delta >= 0x8000_0000 {
        return Duration::ZERO;
    }
    Duration::from_nanos(delta as u64 * 1_000_000_000 / clock_rate as u64)
}
