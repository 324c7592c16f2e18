//! Adapters for tracks received from the source room

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

use crate::error::ReadError;
use crate::track::{FeedbackSink, PacketSource};

/// Reads RTP packets from a subscribed remote track
pub struct RemoteTrackSource {
    track: Arc<TrackRemote>,
}

impl RemoteTrackSource {
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl PacketSource for RemoteTrackSource {
    async fn read_packet(&mut self) -> Result<Packet, ReadError> {
        loop {
            match self.track.read_rtp().await {
                Ok((packet, _attributes)) => return Ok(packet),
                Err(e) => {
                    let error_msg = e.to_string();

                    if is_end_of_stream(&error_msg) {
                        return Err(ReadError::EndOfStream);
                    }

                    // Receiver not attached yet, happens around renegotiation
                    if error_msg.contains("RTPReceiver must not be nil") {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }

                    return Err(ReadError::Transport(error_msg));
                }
            }
        }
    }
}

fn is_end_of_stream(error_msg: &str) -> bool {
    error_msg.contains("EOF") || error_msg.contains("closed")
}

/// Sends keyframe requests on the subscriber peer connection
pub struct RtcpFeedback {
    peer_connection: Weak<RTCPeerConnection>,
}

impl RtcpFeedback {
    pub fn new(peer_connection: Weak<RTCPeerConnection>) -> Self {
        Self { peer_connection }
    }
}

#[async_trait]
impl FeedbackSink for RtcpFeedback {
    async fn request_keyframe(&self, media_ssrc: u32) -> anyhow::Result<()> {
        let pc = self
            .peer_connection
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("peer connection closed"))?;

        let pli: Box<dyn webrtc::rtcp::packet::Packet + Send + Sync> =
            Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            });
        pc.write_rtcp(&[pli]).await?;

        Ok(())
    }
}
