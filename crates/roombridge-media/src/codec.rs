//! Video codec support
//!
//! Only H.264 is relayed. Anything else offered by a room is skipped.

use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

/// Video codec type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
}

impl VideoCodec {
    /// Look up a codec by MIME type. Matching is case-insensitive.
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        if mime_type.eq_ignore_ascii_case(MIME_TYPE_H264) {
            Some(VideoCodec::H264)
        } else {
            None
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => MIME_TYPE_H264,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            VideoCodec::H264 => 90000,
        }
    }

    /// Capability used when registering the codec and creating local tracks.
    ///
    /// Baseline profile, level 3.1, packetization-mode=1 (FU-A/STAP-A allowed).
    pub fn capability(&self) -> RTCRtpCodecCapability {
        match self {
            VideoCodec::H264 => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: self.clock_rate(),
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_string(),
                rtcp_feedback: vec![],
            },
        }
    }

    /// Fresh depacketizer for one inbound track
    pub fn depacketizer(&self) -> H264Packet {
        match self {
            VideoCodec::H264 => H264Packet::default(),
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mime_type())
    }
}
