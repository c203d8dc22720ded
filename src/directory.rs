//! Channel directory and ICE-config collaborator contract
//!
//! Resolving a channel name to signaling endpoints and TURN credentials
//! is a one-shot call made at orchestrator start. The directory service
//! itself (HTTP client, request signing) lives outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Credentials;
use crate::error::Result;
use crate::signaling::Role;

/// Resolved signaling endpoint pair for one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEndpoints {
    /// Session-control endpoint (offer/answer/candidate exchange)
    pub control: String,
    /// ICE configuration endpoint (TURN credential retrieval)
    pub ice_config: String,
}

/// TURN credential tuple handed back by the ICE-config service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnCredential {
    /// TURN server URIs (UDP/TCP transport variants of one server)
    pub uris: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnCredential {
    pub fn new(
        uris: Vec<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            uris,
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// Result of resolving a channel against the directory service
#[derive(Debug, Clone)]
pub struct ChannelResolution {
    /// Directory-assigned channel identity
    pub channel_id: String,
    /// Endpoint pair for this channel and role
    pub endpoints: SignalingEndpoints,
    /// TURN credentials for this channel
    pub turn_credentials: Vec<TurnCredential>,
}

/// Channel directory collaborator
///
/// A failed resolution aborts `start()` before any signaling or media
/// side effects.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// Resolve a channel name to its identity, endpoints, and TURN
    /// credential list for the given role.
    async fn resolve(
        &self,
        region: &str,
        credentials: &Credentials,
        channel_name: &str,
        role: Role,
    ) -> Result<ChannelResolution>;
}
