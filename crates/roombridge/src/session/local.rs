//! Tracks published into the destination room

use async_trait::async_trait;
use std::sync::Arc;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::track::{FrameSink, LossNotifier, LossReport};
use roombridge_media::Frame;

pub struct LocalVideoTrack {
    track: Arc<TrackLocalStaticSample>,
}

impl LocalVideoTrack {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl FrameSink for LocalVideoTrack {
    async fn write_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        self.track.write_sample(&frame.to_sample()).await?;
        Ok(())
    }
}

/// Read RTCP from a sender and pass loss indications to the relay.
/// Ends when the sender closes or the relay is gone.
pub async fn forward_loss_reports(sender: Arc<RTCRtpSender>, loss: LossNotifier, track: String) {
    while let Ok((packets, _attributes)) = sender.read_rtcp().await {
        for packet in packets {
            let any = packet.as_any();
            let report = if any.downcast_ref::<PictureLossIndication>().is_some() {
                LossReport::PictureLoss
            } else if any.downcast_ref::<FullIntraRequest>().is_some() {
                LossReport::FullIntraRequest
            } else {
                continue;
            };

            if !loss.notify(report) {
                tracing::debug!("Relay for {} gone, stopping RTCP reader", track);
                return;
            }
        }
    }

    tracing::debug!("RTCP reader for {} stopped", track);
}
