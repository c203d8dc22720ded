//! Peer connection transport layer
//!
//! Wraps one webrtc-rs peer connection behind the [`PeerTransport`]
//! seam and funnels its callbacks (candidates, inbound tracks,
//! connectivity state) into an explicit [`PeerEvent`] stream consumed
//! by the orchestrator event loop.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::{AppError, Result};
use crate::ice::IceServerSet;
use crate::media::{LocalTrackSet, MediaStreamHandle};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Peer connection connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Notifications emitted by the transport layer
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A locally generated ICE candidate is ready
    CandidateReady(IceCandidate),
    /// Local candidate generation finished
    GatheringComplete,
    /// First packet of an inbound remote track arrived
    RemoteStream(MediaStreamHandle),
    /// Connectivity state changed
    StateChanged(ConnectionState),
    /// Transport-level failure detail
    TransportError(String),
}

/// Seam over one peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach the shared local track set (read-only) to the connection
    async fn attach_local_tracks(&self, tracks: &LocalTrackSet) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Local description as currently set, including any candidates the
    /// ICE layer has folded into it
    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<()>;
}

/// Builds peer transports for new sessions
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport configured with the run's ICE server set.
    /// Transport notifications are delivered through `events` in
    /// generation order.
    async fn create(
        &self,
        ice: &IceServerSet,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>>;
}

fn to_rtc_description(description: &SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    };
    rtc.map_err(|e| AppError::WebRtc(format!("Invalid session description: {}", e)))
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SessionDescription> {
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp.clone())),
        RTCSdpType::Answer | RTCSdpType::Pranswer => {
            Ok(SessionDescription::answer(description.sdp.clone()))
        }
        other => Err(AppError::WebRtc(format!(
            "Unsupported SDP type: {}",
            other
        ))),
    }
}

fn candidate_from_rtc(candidate: &RTCIceCandidate) -> Option<IceCandidate> {
    match candidate.to_json() {
        Ok(init) => Some(IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }),
        Err(e) => {
            warn!("Failed to serialize ICE candidate: {}", e);
            None
        }
    }
}

/// webrtc-rs backed transport
pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerTransport {
    /// Create a peer connection with the built ICE server set and wire
    /// its callbacks into `events`.
    pub async fn new(ice: &IceServerSet, events: mpsc::Sender<PeerEvent>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice.servers.clone(),
            ice_transport_policy: ice.transport_policy,
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))?;
        let pc = Arc::new(pc);

        let transport = Self { pc };
        transport.setup_event_handlers(events);

        Ok(transport)
    }

    fn setup_event_handlers(&self, events: mpsc::Sender<PeerEvent>) {
        // Connection state change handler
        let state_events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let events = state_events.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };
                    let _ = events.send(PeerEvent::StateChanged(new_state)).await;
                })
            }));

        // ICE candidate handler; None marks end of gathering
        let candidate_events = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = candidate_events.clone();

                Box::pin(async move {
                    match candidate {
                        Some(c) => {
                            if let Some(candidate) = candidate_from_rtc(&c) {
                                debug!("ICE candidate: {}", candidate.candidate);
                                let _ = events.send(PeerEvent::CandidateReady(candidate)).await;
                            }
                        }
                        None => {
                            let _ = events.send(PeerEvent::GatheringComplete).await;
                        }
                    }
                })
            }));

        // Inbound remote track handler
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();

                Box::pin(async move {
                    info!(
                        "Remote track received: kind={}, stream={}",
                        track.kind(),
                        track.stream_id()
                    );
                    let _ = events
                        .send(PeerEvent::RemoteStream(MediaStreamHandle::remote(track)))
                        .await;
                })
            }));
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn attach_local_tracks(&self, tracks: &LocalTrackSet) -> Result<()> {
        for track in tracks.tracks() {
            self.pc
                .add_track(track.clone())
                .await
                .map_err(|e| AppError::WebRtc(format!("Failed to add local track: {}", e)))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let rtc = to_rtc_description(&description)?;
        self.pc
            .set_local_description(rtc)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let rtc = to_rtc_description(&description)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to set remote description: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let rtc = self.pc.local_description().await?;
        from_rtc_description(&rtc).ok()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))
    }
}

/// Default factory producing webrtc-rs transports
#[derive(Default)]
pub struct RtcTransportFactory;

impl RtcTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice: &IceServerSet,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = RtcPeerTransport::new(ice, events).await?;
        Ok(Arc::new(transport))
    }
}
