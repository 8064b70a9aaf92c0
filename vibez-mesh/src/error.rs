use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Channel not connected: {0}")]
    NotConnected(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Roster error: {0}")]
    Roster(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
