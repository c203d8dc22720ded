//! Signaling bridge contract and message types
//!
//! The signaling transport itself (websocket framing, authentication,
//! reconnect) lives outside this crate. Orchestrators only consume the
//! narrow event/send surface defined here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Credentials;
use crate::directory::SignalingEndpoints;
use crate::error::Result;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// SDP session description carried over signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type (offer or answer)
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Role of an endpoint on a signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Master => write!(f, "MASTER"),
            Role::Viewer => write!(f, "VIEWER"),
        }
    }
}

/// Inbound events delivered by the signaling bridge
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Bridge connected and ready
    Open,
    /// SDP offer from a viewer (master side only)
    SdpOffer {
        description: SessionDescription,
        remote_client_id: String,
    },
    /// SDP answer from the master (viewer side only)
    SdpAnswer { description: SessionDescription },
    /// ICE candidate from the remote peer; client id present on the
    /// master side, absent on the viewer side
    IceCandidate {
        candidate: IceCandidate,
        remote_client_id: Option<String>,
    },
    /// Bridge disconnected
    Close,
    /// Bridge-level error
    Error { detail: String },
}

/// Outbound half of the signaling bridge
#[async_trait]
pub trait SignalingBridge: Send + Sync {
    /// Send an SDP offer to the master (viewer side)
    async fn send_sdp_offer(&self, description: SessionDescription) -> Result<()>;

    /// Send an SDP answer to a specific viewer (master side)
    async fn send_sdp_answer(
        &self,
        description: SessionDescription,
        remote_client_id: &str,
    ) -> Result<()>;

    /// Send an ICE candidate; `remote_client_id` is required on the
    /// master side and absent on the viewer side
    async fn send_ice_candidate(
        &self,
        candidate: IceCandidate,
        remote_client_id: Option<&str>,
    ) -> Result<()>;

    /// Close the bridge connection
    async fn close(&self) -> Result<()>;
}

/// Parameters for opening a signaling bridge connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Resolved channel identity
    pub channel_id: String,
    /// Resolved endpoint pair
    pub endpoints: SignalingEndpoints,
    /// Role to register as
    pub role: Role,
    /// Client id (viewer only)
    pub client_id: Option<String>,
    /// Region the channel lives in
    pub region: String,
    /// Credentials for the signaling service
    pub credentials: Credentials,
}

/// Opened bridge: the send half plus the inbound event stream
pub type BridgeHandle = (
    std::sync::Arc<dyn SignalingBridge>,
    mpsc::Receiver<SignalingEvent>,
);

/// Builds signaling bridge connections from resolved endpoints
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a bridge connection. The returned receiver yields events in
    /// arrival order; `SignalingEvent::Open` is delivered once the
    /// connection is live.
    async fn connect(&self, request: ConnectRequest) -> Result<BridgeHandle>;
}
