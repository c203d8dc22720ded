//! ICE server set construction
//!
//! Turns a NAT traversal policy plus the TURN credentials returned by
//! the ICE-config service into the concrete server list and transport
//! policy handed to every peer connection of a run.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::directory::TurnCredential;

/// NAT traversal policy for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatTraversalPolicy {
    /// No STUN/TURN; direct connectivity only
    Disabled,
    /// TURN relay only; host/server-reflexive candidates are excluded
    TurnOnly,
    /// STUN plus TURN; all candidate types allowed
    StunTurn,
}

impl std::fmt::Display for NatTraversalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NatTraversalPolicy::Disabled => write!(f, "disabled"),
            NatTraversalPolicy::TurnOnly => write!(f, "turn-only"),
            NatTraversalPolicy::StunTurn => write!(f, "stun-turn"),
        }
    }
}

/// ICE servers plus the transport policy applied to a peer connection
#[derive(Debug, Clone)]
pub struct IceServerSet {
    /// Ordered server list; STUN (when present) precedes TURN entries
    pub servers: Vec<RTCIceServer>,
    /// Candidate transport policy (`Relay` iff the policy is TurnOnly)
    pub transport_policy: RTCIceTransportPolicy,
}

impl IceServerSet {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Region-derived STUN server URL
pub fn stun_url_for_region(region: &str) -> String {
    format!("stun:stun.kinesisvideo.{}.amazonaws.com:443", region)
}

/// Build the ICE server set for a run.
///
/// No error path: absent TURN credentials simply yield a shorter list
/// and connection establishment then depends on direct connectivity.
pub fn build_ice_server_set(
    policy: NatTraversalPolicy,
    region: &str,
    turn_credentials: &[TurnCredential],
) -> IceServerSet {
    let mut servers = vec![];

    if policy == NatTraversalPolicy::StunTurn {
        servers.push(RTCIceServer {
            urls: vec![stun_url_for_region(region)],
            ..Default::default()
        });
    }

    if matches!(
        policy,
        NatTraversalPolicy::StunTurn | NatTraversalPolicy::TurnOnly
    ) {
        for turn in turn_credentials {
            // webrtc-rs rejects credential-less TURN entries
            if turn.username.is_empty() || turn.credential.is_empty() {
                warn!("Skipping TURN server {:?} - credentials required but missing", turn.uris);
                continue;
            }
            servers.push(RTCIceServer {
                urls: turn.uris.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
    }

    let transport_policy = if policy == NatTraversalPolicy::TurnOnly {
        RTCIceTransportPolicy::Relay
    } else {
        RTCIceTransportPolicy::All
    };

    debug!(
        "Built ICE server set: {} servers, policy {:?}",
        servers.len(),
        transport_policy
    );

    IceServerSet {
        servers,
        transport_policy,
    }
}
