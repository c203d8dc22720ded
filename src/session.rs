//! Peer session state machine
//!
//! One `PeerSession` owns one peer transport and carries the
//! candidate/description send policy for one negotiation round:
//!
//! ```text
//! Idle -> AwaitingLocalDescription -> GatheringCandidates -> Negotiating
//!                                                               |
//!                                                               v
//!                                     Closed  <-----------  Connected
//! ```
//!
//! `Failed` is reachable from any non-terminal state. With trickle ICE
//! on, the local description goes out as soon as it is set and every
//! candidate is sent individually as generated; with trickle off,
//! candidates are buffered and exactly one description send happens on
//! gathering completion, carrying the candidates folded into the SDP.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::media::{LocalTrackSet, MediaStreamHandle, RenderSink};
use crate::signaling::{IceCandidate, SessionDescription, SignalingBridge};
use crate::transport::{ConnectionState, PeerEvent, PeerTransport};

/// Negotiation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport constructed, no description set yet
    Idle,
    /// Local description creation in progress
    AwaitingLocalDescription,
    /// Local description set, candidate generation running
    GatheringCandidates,
    /// Description exchange done on our side, connectivity checks pending
    Negotiating,
    /// Media-transport layer reports connectivity
    Connected,
    /// Torn down by explicit stop
    Closed,
    /// Transport error or unrecoverable protocol violation
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::AwaitingLocalDescription => write!(f, "awaiting-local-description"),
            SessionState::GatheringCandidates => write!(f, "gathering-candidates"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// One peer connection plus its send policy
pub struct PeerSession {
    /// Remote client identity; present on the master side only
    remote_client_id: Option<String>,
    trickle_ice: bool,
    transport: Arc<dyn PeerTransport>,
    bridge: Arc<dyn SignalingBridge>,
    remote_sink: Arc<dyn RenderSink>,
    state: SessionState,
    /// Candidates buffered while trickle is off
    pending_candidates: Vec<IceCandidate>,
    /// Latch: the outbound description goes out at most once per round
    description_sent: bool,
    /// Latch: a remote description is applied at most once per round
    remote_description_applied: bool,
}

impl PeerSession {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        bridge: Arc<dyn SignalingBridge>,
        remote_sink: Arc<dyn RenderSink>,
        remote_client_id: Option<String>,
        trickle_ice: bool,
    ) -> Self {
        Self {
            remote_client_id,
            trickle_ice,
            transport,
            bridge,
            remote_sink,
            state: SessionState::Idle,
            pending_candidates: vec![],
            description_sent: false,
            remote_description_applied: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_client_id(&self) -> Option<&str> {
        self.remote_client_id.as_deref()
    }

    fn peer_label(&self) -> &str {
        self.remote_client_id.as_deref().unwrap_or("master")
    }

    /// Viewer-side negotiation start, triggered by the signaling `open`
    /// event: attach local tracks, create an offer, set it locally.
    pub async fn start_as_viewer(&mut self, local_tracks: Option<&LocalTrackSet>) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(AppError::Protocol(format!(
                "Negotiation already started (state: {})",
                self.state
            )));
        }
        self.state = SessionState::AwaitingLocalDescription;

        if let Some(tracks) = local_tracks {
            self.transport.attach_local_tracks(tracks).await?;
        }

        info!("[VIEWER] Creating SDP offer");
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer).await?;

        self.enter_gathering().await
    }

    /// Master-side negotiation start, triggered by an inbound offer:
    /// attach local tracks, apply the offer, answer it.
    pub async fn start_as_master(
        &mut self,
        offer: SessionDescription,
        local_tracks: Option<&LocalTrackSet>,
    ) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(AppError::Protocol(format!(
                "Negotiation already started (state: {})",
                self.state
            )));
        }
        self.state = SessionState::AwaitingLocalDescription;

        if let Some(tracks) = local_tracks {
            self.transport.attach_local_tracks(tracks).await?;
        }

        self.transport.set_remote_description(offer).await?;
        self.remote_description_applied = true;

        info!("[MASTER] Creating SDP answer for client: {}", self.peer_label());
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer).await?;

        self.enter_gathering().await
    }

    /// Local description is set; candidate generation begins. In
    /// trickle mode the description goes out right away.
    async fn enter_gathering(&mut self) -> Result<()> {
        self.state = SessionState::GatheringCandidates;

        if self.trickle_ice {
            self.send_local_description().await?;
            self.state = SessionState::Negotiating;
        }
        debug!(
            "Generating ICE candidates for peer: {} (trickle: {})",
            self.peer_label(),
            self.trickle_ice
        );
        Ok(())
    }

    /// Send the local description through the bridge, at most once per
    /// negotiation round and never before it is set.
    async fn send_local_description(&mut self) -> Result<()> {
        if self.description_sent {
            debug!("Local description already sent for peer: {}", self.peer_label());
            return Ok(());
        }

        let description = self.transport.local_description().await.ok_or_else(|| {
            AppError::Protocol("Local description not set before send".to_string())
        })?;

        match &self.remote_client_id {
            Some(client_id) => {
                info!("[MASTER] Sending SDP answer to client: {}", client_id);
                self.bridge.send_sdp_answer(description, client_id).await?;
            }
            None => {
                info!("[VIEWER] Sending SDP offer");
                self.bridge.send_sdp_offer(description).await?;
            }
        }
        self.description_sent = true;
        Ok(())
    }

    /// Apply a remote answer (viewer side)
    pub async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        if self.state == SessionState::Idle || self.state.is_terminal() {
            return Err(AppError::Protocol(format!(
                "Remote description in state {}",
                self.state
            )));
        }
        if self.remote_description_applied {
            // Renegotiation is not a thing here; a second answer is a
            // sequencing violation.
            return Err(AppError::Protocol(
                "Duplicate remote description for this negotiation round".to_string(),
            ));
        }

        self.transport.set_remote_description(description).await?;
        self.remote_description_applied = true;
        Ok(())
    }

    /// Apply a remote candidate received through the bridge
    pub async fn apply_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if self.state == SessionState::Idle || self.state.is_terminal() {
            return Err(AppError::Protocol(format!(
                "Remote candidate in state {}",
                self.state
            )));
        }
        self.transport.add_remote_candidate(candidate).await
    }

    /// Dispatch a transport notification into the state machine
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<()> {
        if self.state.is_terminal() {
            debug!("Ignoring peer event in state {}", self.state);
            return Ok(());
        }

        match event {
            PeerEvent::CandidateReady(candidate) => self.handle_local_candidate(candidate).await,
            PeerEvent::GatheringComplete => self.handle_gathering_complete().await,
            PeerEvent::RemoteStream(stream) => {
                self.attach_remote_stream(stream);
                Ok(())
            }
            PeerEvent::StateChanged(state) => {
                self.handle_connection_state(state);
                Ok(())
            }
            PeerEvent::TransportError(detail) => {
                warn!("Transport error for peer {}: {}", self.peer_label(), detail);
                self.state = SessionState::Failed;
                Ok(())
            }
        }
    }

    async fn handle_local_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        debug!("Generated ICE candidate for peer: {}", self.peer_label());

        if self.trickle_ice {
            self.bridge
                .send_ice_candidate(candidate, self.remote_client_id.as_deref())
                .await
        } else {
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    async fn handle_gathering_complete(&mut self) -> Result<()> {
        debug!("All ICE candidates generated for peer: {}", self.peer_label());

        if !self.trickle_ice {
            // Buffered candidates ride along inside the description's
            // SDP; they are never sent individually in this mode.
            self.send_local_description().await?;
        }
        if self.state == SessionState::GatheringCandidates {
            self.state = SessionState::Negotiating;
        }
        Ok(())
    }

    /// First inbound stream wins; later streams never replace it
    fn attach_remote_stream(&mut self, stream: MediaStreamHandle) {
        if self.remote_sink.is_attached() {
            debug!(
                "Render sink already attached, ignoring stream {} from peer {}",
                stream.stream_id,
                self.peer_label()
            );
            return;
        }
        info!("Received remote stream from peer: {}", self.peer_label());
        self.remote_sink.attach(stream);
    }

    fn handle_connection_state(&mut self, state: ConnectionState) {
        debug!("Peer {} connection state: {}", self.peer_label(), state);
        match state {
            ConnectionState::Connected => {
                if !self.state.is_terminal() {
                    self.state = SessionState::Connected;
                }
            }
            ConnectionState::Failed => {
                warn!("Peer connection failed for peer: {}", self.peer_label());
                self.state = SessionState::Failed;
            }
            ConnectionState::Closed => {
                if self.state != SessionState::Failed {
                    self.state = SessionState::Closed;
                }
            }
            _ => {}
        }
    }

    /// Release the transport. Safe to call in any state, more than once.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.pending_candidates.clear();
        self.transport.close().await
    }
}
