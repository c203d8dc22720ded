//! peerlink - WebRTC master/viewer session negotiation
//!
//! This crate drives peer-to-peer audio/video session setup over a
//! signaling channel: channel resolution, ICE server selection,
//! SDP offer/answer exchange and candidate routing for a one-to-many
//! master or a single-session viewer.

pub mod config;
pub mod directory;
pub mod error;
pub mod ice;
pub mod master;
pub mod media;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod viewer;

#[cfg(test)]
mod testing;

pub use config::{Credentials, MasterConfig, MediaRequest, VideoConstraints, ViewerConfig};
pub use error::{AppError, Result};
pub use ice::NatTraversalPolicy;
pub use master::MasterOrchestrator;
pub use viewer::ViewerOrchestrator;
