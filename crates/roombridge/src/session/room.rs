//! A webrtc-rs peer connection joined to one room

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::local::{forward_loss_reports, LocalVideoTrack};
use super::remote::{RemoteTrackSource, RtcpFeedback};
use super::signaling::SignalingClient;
use super::token::access_token;
use crate::config::{Config, EndpointConfig};
use crate::dispatcher::TrackDispatcher;
use crate::error::SessionError;
use crate::track::{
    FeedbackSink, FrameSink, InboundTrack, LossNotifier, OutboundTrackSpec, SessionHandle,
    TrackPublisher,
};
use roombridge_media::VideoCodec;
use roombridge_protocol::{participant_identity, ClientMessage, ServerMessage, VideoGrant};

/// Payload type H.264 is registered under on the publishing side
const H264_PAYLOAD_TYPE: u8 = 102;
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

type PendingAnswer = Arc<Mutex<Option<oneshot::Sender<String>>>>;
type TrackNames = Arc<RwLock<HashMap<String, String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Publishes relayed tracks into the destination room
    Publisher,
    /// Subscribes to every track of the source room
    Subscriber,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }

    fn grant(self, room: &str) -> VideoGrant {
        VideoGrant {
            room: room.to_string(),
            room_join: true,
            can_publish: self == Role::Publisher,
            can_subscribe: self == Role::Subscriber,
        }
    }
}

pub struct RoomSession {
    label: String,
    peer_connection: Arc<RTCPeerConnection>,
    signaling: SignalingClient,
    /// Serializes offer/answer rounds between concurrent publishes
    negotiation: Mutex<()>,
    pending_answer: PendingAnswer,
    disconnected: AtomicBool,
}

impl RoomSession {
    /// Join the destination room as a publisher
    pub async fn connect_publisher(config: &Config) -> Result<Arc<Self>, SessionError> {
        Self::connect(
            config,
            &config.destination,
            config.destination_identity_prefix(),
            Role::Publisher,
            None,
        )
        .await
    }

    /// Join the source room as a subscriber, offering every track to `dispatcher`
    pub async fn connect_subscriber(
        config: &Config,
        dispatcher: TrackDispatcher,
    ) -> Result<Arc<Self>, SessionError> {
        Self::connect(
            config,
            &config.source,
            config.source_identity_prefix(),
            Role::Subscriber,
            Some(dispatcher),
        )
        .await
    }

    async fn connect(
        config: &Config,
        endpoint: &EndpointConfig,
        identity_prefix: &str,
        role: Role,
        dispatcher: Option<TrackDispatcher>,
    ) -> Result<Arc<Self>, SessionError> {
        let identity = participant_identity(identity_prefix);
        let label = format!("{} {} as {}", role.name(), endpoint.url, identity);

        let token = access_token(
            &endpoint.api_key,
            &endpoint.api_secret,
            &identity,
            role.name(),
            role.grant(&config.room),
        )?;

        let join = ClientMessage::Join {
            room: config.room.clone(),
            identity: identity.clone(),
            name: role.name().to_string(),
        };
        let (signaling, events) = SignalingClient::connect(&endpoint.url, &token, join).await?;

        let api = new_api(role)?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        // Set up ICE candidate handler
        let ice_signaling = signaling.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let signaling = ice_signaling.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let candidate_json = match candidate.to_json() {
                        Ok(c) => c,
                        Err(e) => {
                            tracing::error!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };

                    let _ = signaling
                        .send(ClientMessage::IceCandidate {
                            candidate: candidate_json.candidate,
                            sdp_mid: candidate_json.sdp_mid,
                            sdp_mline_index: candidate_json.sdp_mline_index,
                        })
                        .await;
                }
            })
        }));

        let track_names: TrackNames = Arc::new(RwLock::new(HashMap::new()));

        if let Some(dispatcher) = dispatcher {
            let names = track_names.clone();
            // Weak: the handler is owned by the peer connection itself
            let feedback: Arc<dyn FeedbackSink> =
                Arc::new(RtcpFeedback::new(Arc::downgrade(&peer_connection)));

            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let dispatcher = dispatcher.clone();
                let names = names.clone();
                let feedback = feedback.clone();

                Box::pin(async move {
                    let track_id = track.id();
                    let name = names
                        .read()
                        .await
                        .get(&track_id)
                        .cloned()
                        .unwrap_or(track_id);
                    let codec = track.codec();

                    dispatcher.offer(InboundTrack {
                        name,
                        ssrc: track.ssrc(),
                        mime_type: codec.capability.mime_type,
                        clock_rate: codec.capability.clock_rate,
                        packets: Box::new(RemoteTrackSource::new(track)),
                        feedback,
                    });
                })
            }));
        }

        let pending_answer: PendingAnswer = Arc::new(Mutex::new(None));

        tokio::spawn(handle_events(
            events,
            peer_connection.clone(),
            signaling.clone(),
            pending_answer.clone(),
            track_names,
            label.clone(),
        ));

        tracing::info!(
            "Connected to {} (sid {})",
            label,
            signaling.participant_sid()
        );

        Ok(Arc::new(Self {
            label,
            peer_connection,
            signaling,
            negotiation: Mutex::new(()),
            pending_answer,
            disconnected: AtomicBool::new(false),
        }))
    }

    /// Offer the current local tracks and wait for the room's answer
    async fn renegotiate(&self) -> Result<(), SessionError> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;

        let (tx, rx) = oneshot::channel();
        *self.pending_answer.lock().await = Some(tx);
        self.signaling
            .send(ClientMessage::Offer { sdp: offer.sdp })
            .await?;

        let sdp = tokio::time::timeout(NEGOTIATION_TIMEOUT, rx)
            .await
            .map_err(|_| SessionError::Timeout("publish answer"))?
            .map_err(|_| SessionError::Closed)?;

        let answer = RTCSessionDescription::answer(sdp)?;
        self.peer_connection.set_remote_description(answer).await?;

        Ok(())
    }
}

#[async_trait]
impl TrackPublisher for RoomSession {
    async fn publish_track(
        &self,
        spec: OutboundTrackSpec,
        loss: LossNotifier,
    ) -> anyhow::Result<Arc<dyn FrameSink>> {
        let _guard = self.negotiation.lock().await;

        let track_id = format!("{}-{}", spec.name, Uuid::new_v4());
        let track = Arc::new(TrackLocalStaticSample::new(
            spec.codec.capability(),
            track_id.clone(),
            format!("roombridge-{}", spec.name),
        ));

        let sender = self.peer_connection.add_track(track.clone()).await?;
        tokio::spawn(forward_loss_reports(sender, loss, spec.name.clone()));

        self.signaling
            .send(ClientMessage::AddTrack {
                track_id,
                name: spec.name.clone(),
                mime_type: spec.codec.mime_type().to_string(),
            })
            .await?;
        self.renegotiate().await?;

        tracing::info!("Published track {} ({}) to {}", spec.name, spec.codec, self.label);

        Ok(Arc::new(LocalVideoTrack::new(track)))
    }
}

#[async_trait]
impl SessionHandle for RoomSession {
    fn label(&self) -> &str {
        &self.label
    }

    async fn disconnect(&self) -> bool {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return false;
        }

        let _ = self.signaling.send(ClientMessage::Leave).await;
        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!("Error closing peer connection to {}: {}", self.label, e);
        }

        true
    }
}

fn new_api(role: Role) -> Result<API, SessionError> {
    let mut media_engine = MediaEngine::default();

    match role {
        // Accept whatever the source room sends; the dispatcher filters codecs
        Role::Subscriber => media_engine.register_default_codecs()?,
        Role::Publisher => media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: VideoCodec::H264.capability(),
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?,
    }

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

async fn handle_events(
    mut events: mpsc::Receiver<ServerMessage>,
    peer_connection: Arc<RTCPeerConnection>,
    signaling: SignalingClient,
    pending_answer: PendingAnswer,
    track_names: TrackNames,
    label: String,
) {
    while let Some(message) = events.recv().await {
        match message {
            ServerMessage::Offer { sdp } => {
                tracing::debug!("Received offer from {}", label);
                if let Err(e) = answer_offer(&peer_connection, &signaling, sdp).await {
                    tracing::error!("Failed to answer offer from {}: {}", label, e);
                }
            }
            ServerMessage::Answer { sdp } => match pending_answer.lock().await.take() {
                Some(tx) => {
                    let _ = tx.send(sdp);
                }
                None => tracing::warn!("Unexpected answer from {}", label),
            },
            ServerMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let ice_candidate = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    ..Default::default()
                };
                if let Err(e) = peer_connection.add_ice_candidate(ice_candidate).await {
                    tracing::warn!("Failed to add ICE candidate from {}: {}", label, e);
                }
            }
            ServerMessage::TrackPublished { track } => {
                tracing::debug!(
                    "Track {} ({}) published by {}",
                    track.name,
                    track.mime_type,
                    track.participant
                );
                track_names.write().await.insert(track.track_id, track.name);
            }
            ServerMessage::Error { message } => {
                tracing::error!("Error from {}: {}", label, message);
            }
            ServerMessage::Leave { reason } => {
                tracing::warn!(
                    "{} asked us to leave: {}",
                    label,
                    reason.as_deref().unwrap_or("no reason given")
                );
                break;
            }
            ServerMessage::Joined { .. } | ServerMessage::Pong => {}
        }
    }

    tracing::debug!("Signaling event loop for {} ended", label);
}

async fn answer_offer(
    peer_connection: &RTCPeerConnection,
    signaling: &SignalingClient,
    sdp: String,
) -> Result<(), SessionError> {
    let offer = RTCSessionDescription::offer(sdp)?;
    peer_connection.set_remote_description(offer).await?;

    let answer = peer_connection.create_answer(None).await?;
    peer_connection.set_local_description(answer.clone()).await?;

    signaling.send(ClientMessage::Answer { sdp: answer.sdp }).await
}
