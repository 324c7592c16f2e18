//! Per-track relay worker
//!
//! Reads RTP packets from one inbound track, reassembles them into frames and
//! writes the frames to a newly published outbound track. Loss is never
//! repaired packet by packet: every reassembly drop and every downstream loss
//! report turns into one keyframe request to the original sender.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use webrtc::rtp::packet::Packet;

use crate::error::{ReadError, RelayError};
use crate::track::{
    FeedbackSink, FrameSink, InboundTrack, LossNotifier, LossReport, OutboundTrackSpec,
    PacketSource, TrackPublisher,
};
use roombridge_media::{FrameReassembler, VideoCodec};

/// Packets the reader may run ahead of the relay loop
const READ_AHEAD: usize = 64;

/// Lifecycle of one relay worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Active,
    Draining,
    Failed,
    Closed,
}

impl RelayState {
    pub fn can_transition_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Idle, Active)
                | (Idle, Draining)
                | (Idle, Failed)
                | (Active, Draining)
                | (Active, Failed)
                | (Draining, Closed)
                | (Draining, Failed)
                | (Failed, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    EndOfStream,
    Shutdown,
}

/// What a worker did before it closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub track: String,
    pub ssrc: u32,
    pub end_reason: EndReason,
    pub packets: u64,
    pub frames: u64,
    pub dropped_frames: u64,
    pub keyframe_requests: u64,
}

enum Event {
    Packet(Result<Packet, ReadError>),
    DownstreamLoss(LossReport),
    Shutdown,
}

pub struct TrackRelay {
    source: Box<dyn PacketSource>,
    worker: Worker,
}

/// Everything of a relay except its packet source, which lives in the reader task
struct Worker {
    name: String,
    ssrc: u32,
    clock_rate: u32,
    feedback: Arc<dyn FeedbackSink>,
    codec: VideoCodec,
    publisher: Arc<dyn TrackPublisher>,
    reassembly_window: usize,
    shutdown: watch::Receiver<bool>,
    state: RelayState,
    packets: u64,
    frames: u64,
    dropped_frames: u64,
    keyframe_requests: u64,
}

impl TrackRelay {
    pub fn new(
        inbound: InboundTrack,
        codec: VideoCodec,
        publisher: Arc<dyn TrackPublisher>,
        reassembly_window: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let InboundTrack {
            name,
            ssrc,
            clock_rate,
            packets,
            feedback,
            ..
        } = inbound;

        Self {
            source: packets,
            worker: Worker {
                name,
                ssrc,
                clock_rate,
                feedback,
                codec,
                publisher,
                reassembly_window,
                shutdown,
                state: RelayState::Idle,
                packets: 0,
                frames: 0,
                dropped_frames: 0,
                keyframe_requests: 0,
            },
        }
    }

    /// Run until end of stream, failure or shutdown
    pub async fn run(self) -> Result<RelaySummary, RelayError> {
        let TrackRelay { source, worker } = self;

        // Reads are not cancel-safe, so they never race other events directly
        let (packet_tx, packet_rx) = mpsc::channel(READ_AHEAD);
        let reader = tokio::spawn(read_packets(source, packet_tx));

        let result = worker.run(packet_rx).await;
        reader.abort();
        result
    }
}

/// Forward every read to the relay loop until the stream ends or the loop is gone
async fn read_packets(
    mut source: Box<dyn PacketSource>,
    packets: mpsc::Sender<Result<Packet, ReadError>>,
) {
    loop {
        let result = source.read_packet().await;
        let last = result.is_err();
        if packets.send(result).await.is_err() || last {
            return;
        }
    }
}

impl Worker {
    async fn run(
        mut self,
        mut packet_rx: mpsc::Receiver<Result<Packet, ReadError>>,
    ) -> Result<RelaySummary, RelayError> {
        let clock_rate = match self.clock_rate {
            0 => self.codec.clock_rate(),
            rate => rate,
        };
        let mut reassembler =
            FrameReassembler::new(self.codec.depacketizer(), self.reassembly_window, clock_rate)?;

        let (loss, mut loss_rx) = LossNotifier::channel();
        let spec = OutboundTrackSpec {
            name: self.name.clone(),
            codec: self.codec,
        };
        let outbound = match self.publisher.publish_track(spec, loss).await {
            Ok(outbound) => outbound,
            Err(e) => {
                self.fail();
                return Err(RelayError::Publish {
                    track: self.name.clone(),
                    codec: self.codec,
                    source: e,
                });
            }
        };

        tracing::info!(
            "Relaying track {} (ssrc={}, codec={}, window={})",
            self.name,
            self.ssrc,
            self.codec,
            self.reassembly_window
        );

        loop {
            let event = self.next_event(&mut packet_rx, &mut loss_rx).await;

            match event {
                Event::Packet(Ok(packet)) => {
                    if self.state == RelayState::Idle {
                        self.transition(RelayState::Active);
                    }
                    self.packets += 1;

                    for dropped in reassembler.push(packet) {
                        self.dropped_frames += 1;
                        tracing::debug!(
                            "Track {} dropped frame seq={}..={} ({} positions)",
                            self.name,
                            dropped.first_sequence,
                            dropped.last_sequence,
                            dropped.sequence_count()
                        );
                        self.request_keyframe("reassembly drop").await;
                    }

                    while let Some(frame) = reassembler.pop() {
                        self.forward(outbound.as_ref(), &frame).await?;
                    }
                }
                Event::Packet(Err(ReadError::EndOfStream)) => {
                    self.transition(RelayState::Draining);
                    for frame in reassembler.flush() {
                        self.forward(outbound.as_ref(), &frame).await?;
                    }
                    self.transition(RelayState::Closed);
                    return Ok(self.summary(EndReason::EndOfStream));
                }
                Event::Packet(Err(ReadError::Transport(reason))) => {
                    self.fail();
                    return Err(RelayError::Read {
                        track: self.name.clone(),
                        codec: self.codec,
                        reason,
                    });
                }
                Event::DownstreamLoss(report) => {
                    tracing::debug!("Track {} downstream reported {:?}", self.name, report);
                    self.request_keyframe("downstream loss").await;
                }
                Event::Shutdown => {
                    self.transition(RelayState::Draining);
                    self.transition(RelayState::Closed);
                    return Ok(self.summary(EndReason::Shutdown));
                }
            }
        }
    }

    async fn next_event(
        &mut self,
        packet_rx: &mut mpsc::Receiver<Result<Packet, ReadError>>,
        loss_rx: &mut mpsc::UnboundedReceiver<LossReport>,
    ) -> Event {
        loop {
            if *self.shutdown.borrow_and_update() {
                return Event::Shutdown;
            }

            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    // Sender gone means the supervisor is gone too
                    if changed.is_err() {
                        return Event::Shutdown;
                    }
                }
                Some(report) = loss_rx.recv() => return Event::DownstreamLoss(report),
                result = packet_rx.recv() => {
                    // Reader gone without reporting why
                    let result = result.unwrap_or_else(|| {
                        Err(ReadError::Transport("packet reader stopped".to_string()))
                    });
                    return Event::Packet(result);
                }
            }
        }
    }

    async fn forward(
        &mut self,
        outbound: &dyn FrameSink,
        frame: &roombridge_media::Frame,
    ) -> Result<(), RelayError> {
        if let Err(e) = outbound.write_frame(frame).await {
            self.fail();
            return Err(RelayError::Write {
                track: self.name.clone(),
                codec: self.codec,
                source: e,
            });
        }
        self.frames += 1;
        Ok(())
    }

    async fn request_keyframe(&mut self, cause: &str) {
        self.keyframe_requests += 1;
        tracing::debug!(
            "Requesting keyframe for track {} (ssrc={}) after {}",
            self.name,
            self.ssrc,
            cause
        );
        if let Err(e) = self.feedback.request_keyframe(self.ssrc).await {
            tracing::warn!(
                "Failed to request keyframe for track {}: {}",
                self.name,
                e
            );
        }
    }

    fn fail(&mut self) {
        self.transition(RelayState::Failed);
        self.transition(RelayState::Closed);
    }

    fn transition(&mut self, next: RelayState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid relay transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!("Track {} {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
    }

    fn summary(&self, end_reason: EndReason) -> RelaySummary {
        RelaySummary {
            track: self.name.clone(),
            ssrc: self.ssrc,
            end_reason,
            packets: self.packets,
            frames: self.frames,
            dropped_frames: self.dropped_frames,
            keyframe_requests: self.keyframe_requests,
        }
    }
}
