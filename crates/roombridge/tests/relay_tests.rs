//! Relay, dispatcher and shutdown behaviour against in-memory rooms
//!
//! Run with: cargo test -p roombridge --test relay_tests

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use roombridge::bridge;
use roombridge::config::RelayConfig;
use roombridge::relay::{EndReason, TrackRelay};
use roombridge::track::{
    FeedbackSink, FrameSink, InboundTrack, LossNotifier, LossReport, OutboundTrackSpec,
    PacketSource, SessionHandle, TrackPublisher,
};
use roombridge::{Dispatch, ReadError, RelayError, SessionError, Supervisor};
use roombridge_media::{Frame, VideoCodec};

const SSRC: u32 = 0x1234_5678;

/// Single-NAL H.264 packet that forms a complete frame on its own
fn h264(sequence: u16) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type: 102,
            sequence_number: sequence,
            timestamp: sequence as u32 * 3000,
            marker: true,
            ssrc: SSRC,
            ..Default::default()
        },
        payload: Bytes::from(vec![0x41, sequence as u8, 0xAA]),
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<Packet, ReadError>>,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl PacketSource for ChannelSource {
    async fn read_packet(&mut self) -> Result<Packet, ReadError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.rx.recv().await.unwrap_or(Err(ReadError::EndOfStream))
    }
}

#[derive(Default)]
struct RecordingFeedback {
    requests: Mutex<Vec<u32>>,
}

impl RecordingFeedback {
    fn requests(&self) -> Vec<u32> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedbackSink for RecordingFeedback {
    async fn request_keyframe(&self, media_ssrc: u32) -> anyhow::Result<()> {
        self.requests.lock().unwrap().push(media_ssrc);
        Ok(())
    }
}

/// Inbound track fed by the returned sender. Dropping the sender ends the stream.
struct TestTrack {
    packets: mpsc::UnboundedSender<Result<Packet, ReadError>>,
    reads: Arc<AtomicUsize>,
    feedback: Arc<RecordingFeedback>,
}

fn inbound(name: &str, mime_type: &str) -> (InboundTrack, TestTrack) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reads = Arc::new(AtomicUsize::new(0));
    let feedback = Arc::new(RecordingFeedback::default());

    let track = InboundTrack {
        name: name.to_string(),
        ssrc: SSRC,
        mime_type: mime_type.to_string(),
        clock_rate: 90000,
        packets: Box::new(ChannelSource {
            rx,
            reads: reads.clone(),
        }),
        feedback: feedback.clone(),
    };

    (
        track,
        TestTrack {
            packets: tx,
            reads,
            feedback,
        },
    )
}

struct RecordingSink {
    frames: Mutex<Vec<Frame>>,
    fail: bool,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn write_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("outbound track closed");
        }
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// Destination room that keeps everything published into it
#[derive(Default)]
struct FakeRoom {
    failing_writes: HashSet<String>,
    published: Mutex<Vec<OutboundTrackSpec>>,
    sinks: Mutex<HashMap<String, Arc<RecordingSink>>>,
    notifiers: Mutex<HashMap<String, LossNotifier>>,
    disconnects: AtomicUsize,
}

impl FakeRoom {
    fn failing(track: &str) -> Self {
        Self {
            failing_writes: HashSet::from([track.to_string()]),
            ..Default::default()
        }
    }

    fn published(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|spec| spec.name.clone())
            .collect()
    }

    fn frames(&self, track: &str) -> Vec<u16> {
        self.sinks
            .lock()
            .unwrap()
            .get(track)
            .map(|sink| {
                sink.frames
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|f| f.first_sequence)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notifier(&self, track: &str) -> Option<LossNotifier> {
        self.notifiers.lock().unwrap().get(track).cloned()
    }
}

#[async_trait]
impl TrackPublisher for FakeRoom {
    async fn publish_track(
        &self,
        spec: OutboundTrackSpec,
        loss: LossNotifier,
    ) -> anyhow::Result<Arc<dyn FrameSink>> {
        let sink = Arc::new(RecordingSink {
            frames: Mutex::new(Vec::new()),
            fail: self.failing_writes.contains(&spec.name),
        });
        self.sinks
            .lock()
            .unwrap()
            .insert(spec.name.clone(), sink.clone());
        self.notifiers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), loss);
        self.published.lock().unwrap().push(spec);
        Ok(sink)
    }
}

#[async_trait]
impl SessionHandle for FakeRoom {
    fn label(&self) -> &str {
        "destination"
    }

    async fn disconnect(&self) -> bool {
        self.disconnects.fetch_add(1, Ordering::SeqCst) == 0
    }
}

struct FakeSession {
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl SessionHandle for FakeSession {
    fn label(&self) -> &str {
        "source"
    }

    async fn disconnect(&self) -> bool {
        self.disconnects.fetch_add(1, Ordering::SeqCst) == 0
    }
}

fn relay_config(window: usize) -> RelayConfig {
    RelayConfig {
        reassembly_window: window,
        drain_timeout_ms: 1000,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn test_gap_fires_one_keyframe_request() {
    let room = Arc::new(FakeRoom::default());
    let (track, test) = inbound("camera", "video/H264");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    for sequence in [1, 2, 3, 5, 6] {
        test.packets.send(Ok(h264(sequence))).unwrap();
    }
    drop(test.packets);

    let relay = TrackRelay::new(track, VideoCodec::H264, room.clone(), 2, shutdown_rx);
    let summary = assert_ok!(relay.run().await);

    assert_eq!(summary.end_reason, EndReason::EndOfStream);
    assert_eq!(summary.packets, 5);
    assert_eq!(summary.dropped_frames, 1);
    assert_eq!(test.feedback.requests(), vec![SSRC]);
    assert_eq!(room.published(), vec!["camera"]);
    assert_eq!(room.frames("camera"), vec![1, 2, 3, 5, 6]);
}

#[tokio::test]
async fn test_frames_keep_payload_and_duration() {
    let room = Arc::new(FakeRoom::default());
    let (track, test) = inbound("camera", "video/h264");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    test.packets.send(Ok(h264(10))).unwrap();
    test.packets.send(Ok(h264(11))).unwrap();
    drop(test.packets);

    let relay = TrackRelay::new(track, VideoCodec::H264, room.clone(), 16, shutdown_rx);
    assert_ok!(relay.run().await);

    let sinks = room.sinks.lock().unwrap();
    let frames = sinks["camera"].frames.lock().unwrap();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].data.starts_with(&[0, 0, 0, 1, 0x41]));
    assert_eq!(frames[0].duration, Duration::ZERO);
    assert_eq!(frames[1].duration, Duration::from_nanos(33_333_333));
}

#[tokio::test]
async fn test_downstream_loss_requests_keyframe() {
    let room = Arc::new(FakeRoom::default());
    let (track, test) = inbound("camera", "video/H264");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = TrackRelay::new(track, VideoCodec::H264, room.clone(), 16, shutdown_rx);
    let handle = tokio::spawn(relay.run());

    wait_for(|| room.notifier("camera").is_some()).await;
    let notifier = room.notifier("camera").unwrap();
    assert!(notifier.notify(LossReport::PictureLoss));
    assert!(notifier.notify(LossReport::FullIntraRequest));

    let feedback = test.feedback.clone();
    wait_for(|| feedback.requests().len() == 2).await;
    assert_eq!(feedback.requests(), vec![SSRC, SSRC]);

    drop(test.packets);
    let summary = assert_ok!(handle.await.unwrap());
    assert_eq!(summary.keyframe_requests, 2);
    assert_eq!(summary.dropped_frames, 0);
}

/// Takes a packet off its channel, then keeps working before handing it out
struct SlowSource {
    rx: mpsc::UnboundedReceiver<Packet>,
}

#[async_trait]
impl PacketSource for SlowSource {
    async fn read_packet(&mut self) -> Result<Packet, ReadError> {
        let packet = self.rx.recv().await.ok_or(ReadError::EndOfStream)?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(packet)
    }
}

#[tokio::test]
async fn test_loss_report_during_read_keeps_packet() {
    let room = Arc::new(FakeRoom::default());
    let (packets, rx) = mpsc::unbounded_channel();
    let feedback = Arc::new(RecordingFeedback::default());
    let track = InboundTrack {
        name: "camera".to_string(),
        ssrc: SSRC,
        mime_type: "video/H264".to_string(),
        clock_rate: 90000,
        packets: Box::new(SlowSource { rx }),
        feedback: feedback.clone(),
    };
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = TrackRelay::new(track, VideoCodec::H264, room.clone(), 16, shutdown_rx);
    let handle = tokio::spawn(relay.run());
    wait_for(|| room.notifier("camera").is_some()).await;

    packets.send(h264(1)).unwrap();
    // Let the read take the packet, then report loss while it is still in flight
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(room.notifier("camera").unwrap().notify(LossReport::PictureLoss));
    wait_for(|| feedback.requests().len() == 1).await;

    packets.send(h264(2)).unwrap();
    drop(packets);

    let summary = assert_ok!(handle.await.unwrap());
    assert_eq!(summary.packets, 2);
    assert_eq!(summary.dropped_frames, 0);
    assert_eq!(summary.keyframe_requests, 1);
    assert_eq!(room.frames("camera"), vec![1, 2]);
}

#[tokio::test]
async fn test_read_error_fails_worker() {
    let room = Arc::new(FakeRoom::default());
    let (track, test) = inbound("camera", "video/H264");
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    test.packets.send(Ok(h264(1))).unwrap();
    test.packets
        .send(Err(ReadError::Transport("srtp failure".to_string())))
        .unwrap();

    let relay = TrackRelay::new(track, VideoCodec::H264, room.clone(), 16, shutdown_rx);
    let err = assert_err!(relay.run().await);
    assert!(matches!(err, RelayError::Read { ref track, .. } if track == "camera"));
    assert_eq!(room.frames("camera"), vec![1]);
}

#[tokio::test]
async fn test_shutdown_stops_idle_worker() {
    let room = Arc::new(FakeRoom::default());
    let (track, test) = inbound("camera", "video/H264");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = TrackRelay::new(track, VideoCodec::H264, room.clone(), 16, shutdown_rx);
    let handle = tokio::spawn(relay.run());

    wait_for(|| !room.published().is_empty()).await;
    shutdown_tx.send_replace(true);

    let summary = assert_ok!(handle.await.unwrap());
    assert_eq!(summary.end_reason, EndReason::Shutdown);
    assert_eq!(summary.packets, 0);
    drop(test);
}

#[tokio::test]
async fn test_unsupported_codec_is_rejected() {
    let room = Arc::new(FakeRoom::default());
    let (supervisor, dispatcher) = Supervisor::new(room.clone(), &relay_config(16));

    let (track, test) = inbound("screen", "video/VP8");
    assert_eq!(dispatcher.offer(track), Dispatch::Rejected);

    let summary = supervisor.run(async {}).await;
    assert_eq!(summary.started, 0);
    assert!(room.published().is_empty());
    assert_eq!(test.reads.load(Ordering::SeqCst), 0);
    assert!(test.packets.is_closed());
}

#[tokio::test]
async fn test_one_supported_one_unsupported_track() {
    let room = Arc::new(FakeRoom::default());
    let (supervisor, dispatcher) = Supervisor::new(room.clone(), &relay_config(16));

    let (camera, camera_test) = inbound("camera", "video/H264");
    let (mic, mic_test) = inbound("microphone", "audio/opus");

    assert_eq!(dispatcher.offer(camera), Dispatch::Accepted);
    assert_eq!(dispatcher.offer(mic), Dispatch::Rejected);

    let summary = supervisor
        .run(async {
            camera_test.packets.send(Ok(h264(1))).unwrap();
            wait_for(|| room.frames("camera") == vec![1]).await;
        })
        .await;

    assert_eq!(summary.started, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(room.published(), vec!["camera"]);
    assert_eq!(mic_test.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_end_of_stream_leaves_sibling_running() {
    let room = Arc::new(FakeRoom::default());
    let (supervisor, dispatcher) = Supervisor::new(room.clone(), &relay_config(16));

    let (first, first_test) = inbound("first", "video/H264");
    let (second, second_test) = inbound("second", "video/H264");
    dispatcher.offer(first);
    dispatcher.offer(second);

    let summary = supervisor
        .run(async {
            first_test.packets.send(Ok(h264(1))).unwrap();
            wait_for(|| room.frames("first") == vec![1]).await;
            drop(first_test.packets);

            second_test.packets.send(Ok(h264(7))).unwrap();
            second_test.packets.send(Ok(h264(8))).unwrap();
            wait_for(|| room.frames("second") == vec![7, 8]).await;
        })
        .await;

    assert_eq!(summary.started, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_write_failure_is_isolated() {
    let room = Arc::new(FakeRoom::failing("broken"));
    let (supervisor, dispatcher) = Supervisor::new(room.clone(), &relay_config(16));

    let (broken, broken_test) = inbound("broken", "video/H264");
    let (healthy, healthy_test) = inbound("healthy", "video/H264");
    dispatcher.offer(broken);
    dispatcher.offer(healthy);

    let summary = supervisor
        .run(async {
            broken_test.packets.send(Ok(h264(1))).unwrap();
            wait_for(|| broken_test.packets.is_closed()).await;

            healthy_test.packets.send(Ok(h264(1))).unwrap();
            healthy_test.packets.send(Ok(h264(2))).unwrap();
            wait_for(|| room.frames("healthy") == vec![1, 2]).await;
        })
        .await;

    assert_eq!(summary.started, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);
    assert!(room.frames("broken").is_empty());
}

#[tokio::test]
async fn test_offers_after_shutdown_are_refused() {
    let room = Arc::new(FakeRoom::default());
    let (supervisor, dispatcher) = Supervisor::new(room.clone(), &relay_config(16));

    supervisor.run(async {}).await;

    let (track, test) = inbound("late", "video/H264");
    assert_eq!(dispatcher.offer(track), Dispatch::ShuttingDown);
    assert!(room.published().is_empty());
    assert_eq!(test.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_disconnects_each_session_once() {
    let destination = Arc::new(FakeRoom::default());
    let source_disconnects = Arc::new(AtomicUsize::new(0));
    let (track, test) = inbound("camera", "video/H264");

    let summary = bridge::run(
        destination.clone(),
        |dispatcher| {
            let disconnects = source_disconnects.clone();
            async move {
                assert_eq!(dispatcher.offer(track), Dispatch::Accepted);
                Ok::<_, SessionError>(FakeSession { disconnects })
            }
        },
        &relay_config(16),
        async {
            test.packets.send(Ok(h264(1))).unwrap();
            wait_for(|| destination.frames("camera") == vec![1]).await;
        },
    )
    .await;

    let summary = assert_ok!(summary);
    assert_eq!(summary.started, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(source_disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(destination.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_source_connect_failure_disconnects_destination() {
    let destination = Arc::new(FakeRoom::default());

    let result = bridge::run(
        destination.clone(),
        |_dispatcher| async {
            Err::<FakeSession, _>(SessionError::Rejected("invalid api key".to_string()))
        },
        &relay_config(16),
        std::future::pending::<()>(),
    )
    .await;

    assert!(matches!(result, Err(SessionError::Rejected(_))));
    assert_eq!(destination.disconnects.load(Ordering::SeqCst), 1);
}
