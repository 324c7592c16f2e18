//! Subscription dispatch and worker supervision
//!
//! The source session hands every inbound track to [`TrackDispatcher::offer`].
//! Supported tracks get their own [`TrackRelay`] task; the [`Supervisor`]
//! collects what each worker reports and drains them on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::relay::{RelaySummary, TrackRelay};
use crate::track::{InboundTrack, TrackPublisher};
use roombridge_media::VideoCodec;

/// Outcome of offering a track to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A relay worker was spawned
    Accepted,
    /// Encoding not supported, track ignored
    Rejected,
    /// Shutdown already started, track ignored
    ShuttingDown,
}

/// Final result of one relay worker
#[derive(Debug)]
pub struct WorkerReport {
    pub track: String,
    pub codec: VideoCodec,
    pub result: Result<RelaySummary, RelayError>,
}

enum WorkerEvent {
    Started { track: String },
    Finished(WorkerReport),
}

/// Entry point for newly available inbound tracks. Cheap to clone.
#[derive(Clone)]
pub struct TrackDispatcher {
    publisher: Arc<dyn TrackPublisher>,
    reassembly_window: usize,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl TrackDispatcher {
    /// Validate the track and hand it to a new worker. Never blocks.
    pub fn offer(&self, inbound: InboundTrack) -> Dispatch {
        let Some(codec) = VideoCodec::from_mime_type(&inbound.mime_type) else {
            tracing::info!(
                "Skipping track {} (ssrc={}): codec {} not supported",
                inbound.name,
                inbound.ssrc,
                inbound.mime_type
            );
            return Dispatch::Rejected;
        };

        if *self.shutdown.borrow() {
            tracing::info!("Skipping track {}: shutting down", inbound.name);
            return Dispatch::ShuttingDown;
        }

        let track = inbound.name.clone();
        tracing::info!("Proxying track {} (ssrc={}, codec={})", track, inbound.ssrc, codec);

        let relay = TrackRelay::new(
            inbound,
            codec,
            self.publisher.clone(),
            self.reassembly_window,
            self.shutdown.clone(),
        );

        let _ = self.events.send(WorkerEvent::Started {
            track: track.clone(),
        });

        let events = self.events.clone();
        tokio::spawn(async move {
            // Inner task so a panicking worker still produces a report
            let result = match tokio::spawn(relay.run()).await {
                Ok(result) => result,
                Err(e) => Err(RelayError::Aborted {
                    track: track.clone(),
                    reason: e.to_string(),
                }),
            };

            let _ = events.send(WorkerEvent::Finished(WorkerReport {
                track,
                codec,
                result,
            }));
        });

        Dispatch::Accepted
    }
}

/// Worker counts at the end of a supervisor run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorSummary {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    /// Workers still running when the drain timeout expired
    pub abandoned: usize,
}

pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    drain_timeout: Duration,
    live: usize,
    summary: SupervisorSummary,
}

impl Supervisor {
    pub fn new(
        publisher: Arc<dyn TrackPublisher>,
        config: &RelayConfig,
    ) -> (Self, TrackDispatcher) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            shutdown: shutdown_tx,
            events: events_rx,
            drain_timeout: config.drain_timeout(),
            live: 0,
            summary: SupervisorSummary::default(),
        };

        let dispatcher = TrackDispatcher {
            publisher,
            reassembly_window: config.reassembly_window,
            shutdown: shutdown_rx,
            events: events_tx,
        };

        (supervisor, dispatcher)
    }

    /// Collect worker reports until `shutdown` resolves, then drain
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> SupervisorSummary {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events.recv() => self.handle(event),
            }
        }

        tracing::info!("Stopping dispatcher, {} relay worker(s) running", self.live);
        self.shutdown.send_replace(true);

        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
        }

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        while self.live > 0 {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.handle(event),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "{} relay worker(s) still running after {:?}, giving up",
                        self.live,
                        self.drain_timeout
                    );
                    self.summary.abandoned = self.live;
                    break;
                }
            }
        }

        self.summary
    }

    fn handle(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { track } => {
                self.live += 1;
                self.summary.started += 1;
                tracing::debug!("Relay worker for {} started ({} live)", track, self.live);
            }
            WorkerEvent::Finished(report) => {
                self.live = self.live.saturating_sub(1);
                match report.result {
                    Ok(summary) => {
                        self.summary.completed += 1;
                        tracing::info!(
                            "Track {} ({}) finished after {:?}: {} packets, {} frames, {} dropped, {} keyframe requests",
                            report.track,
                            report.codec,
                            summary.end_reason,
                            summary.packets,
                            summary.frames,
                            summary.dropped_frames,
                            summary.keyframe_requests
                        );
                    }
                    Err(e) => {
                        self.summary.failed += 1;
                        tracing::error!("Relay worker for {} failed: {}", report.track, e);
                    }
                }
            }
        }
    }
}
