//! Interfaces between the relay and the room sessions
//!
//! The relay only sees these traits. `session` implements them on top of
//! webrtc-rs peer connections; tests implement them in memory.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::rtp::packet::Packet;

use crate::error::ReadError;
use roombridge_media::{Frame, VideoCodec};

/// Blocking packet reader of one inbound track
#[async_trait]
pub trait PacketSource: Send {
    async fn read_packet(&mut self) -> Result<Packet, ReadError>;
}

/// Upstream keyframe request path of one inbound track
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn request_keyframe(&self, media_ssrc: u32) -> anyhow::Result<()>;
}

/// Outbound track accepting reassembled frames
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, frame: &Frame) -> anyhow::Result<()>;
}

/// Destination side able to create outbound tracks. Must tolerate concurrent calls.
#[async_trait]
pub trait TrackPublisher: Send + Sync {
    async fn publish_track(
        &self,
        spec: OutboundTrackSpec,
        loss: LossNotifier,
    ) -> anyhow::Result<Arc<dyn FrameSink>>;
}

/// A room connection that can be left
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn label(&self) -> &str;

    /// Leave the room. Returns false if the session was already disconnected.
    async fn disconnect(&self) -> bool;
}

#[async_trait]
impl<T: SessionHandle + ?Sized> SessionHandle for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn disconnect(&self) -> bool {
        (**self).disconnect().await
    }
}

/// A track offered by the source room
pub struct InboundTrack {
    /// Publication name, propagated to the outbound track
    pub name: String,
    pub ssrc: u32,
    pub mime_type: String,
    /// RTP clock rate, 0 if the room did not say
    pub clock_rate: u32,
    pub packets: Box<dyn PacketSource>,
    pub feedback: Arc<dyn FeedbackSink>,
}

impl std::fmt::Debug for InboundTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundTrack")
            .field("name", &self.name)
            .field("ssrc", &self.ssrc)
            .field("mime_type", &self.mime_type)
            .field("clock_rate", &self.clock_rate)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTrackSpec {
    pub name: String,
    pub codec: VideoCodec,
}

/// Loss indication raised by receivers of an outbound track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReport {
    PictureLoss,
    FullIntraRequest,
}

/// Hook handed to the publisher so downstream loss reaches the relay
#[derive(Debug, Clone)]
pub struct LossNotifier {
    tx: mpsc::UnboundedSender<LossReport>,
}

impl LossNotifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LossReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the relay is gone
    pub fn notify(&self, report: LossReport) -> bool {
        self.tx.send(report).is_ok()
    }
}
