//! Orchestrator configuration types

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ice::NatTraversalPolicy;
use crate::media::RenderSink;

/// Credentials for the signaling-channel directory service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }
}

/// Requested local video capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl VideoConstraints {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// What local media to acquire for a run
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaRequest {
    /// Video constraints; `None` disables video capture
    pub video: Option<VideoConstraints>,
    /// Enable audio capture
    pub audio: bool,
}

impl MediaRequest {
    /// True when neither video nor audio is requested; no local capture
    /// is attempted in that case.
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && !self.audio
    }
}

/// Master orchestrator run configuration
#[derive(Clone)]
pub struct MasterConfig {
    /// Region identifier for directory resolution and STUN derivation
    pub region: String,
    /// Directory-service credentials
    pub credentials: Credentials,
    /// Signaling channel name
    pub channel_name: String,
    /// Local media to acquire
    pub media: MediaRequest,
    /// NAT traversal policy
    pub nat_traversal: NatTraversalPolicy,
    /// Send candidates as generated (trickle) vs batched with the description
    pub trickle_ice: bool,
    /// Sink for the local capture stream
    pub local_sink: Arc<dyn RenderSink>,
    /// Sink for the first inbound remote stream
    pub remote_sink: Arc<dyn RenderSink>,
}

/// Viewer orchestrator run configuration
#[derive(Clone)]
pub struct ViewerConfig {
    /// Region identifier for directory resolution and STUN derivation
    pub region: String,
    /// Directory-service credentials
    pub credentials: Credentials,
    /// Signaling channel name
    pub channel_name: String,
    /// Client identity announced to the master; generated when `None`
    pub client_id: Option<String>,
    /// Local media to acquire
    pub media: MediaRequest,
    /// NAT traversal policy
    pub nat_traversal: NatTraversalPolicy,
    /// Send candidates as generated (trickle) vs batched with the description
    pub trickle_ice: bool,
    /// Sink for the local capture stream
    pub local_sink: Arc<dyn RenderSink>,
    /// Sink for the first inbound remote stream
    pub remote_sink: Arc<dyn RenderSink>,
}

impl ViewerConfig {
    /// Client id to announce, generating one when the caller did not
    /// supply any.
    pub fn effective_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("viewer-{}", uuid::Uuid::new_v4()))
    }
}
