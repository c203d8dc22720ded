use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<webrtc::Error> for AppError {
    fn from(e: webrtc::Error) -> Self {
        AppError::WebRtc(e.to_string())
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, AppError>;
