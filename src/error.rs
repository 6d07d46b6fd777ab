use std::fmt;
use anyhow::Error as AnyhowError;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug)]
pub enum AppError {
    /// Microphone or speaker could not be opened.
    Media(String),
    Join { strategy: String, reason: String },
    Timeout { strategy: String },
    AllStrategiesFailed,
    AlreadyActive,
    Signaling(String),
    Tls(String),
    WebRTC(WebRTCError),
    Ws(WsError),
    Json(serde_json::Error),
    Io(std::io::Error),
    Other(AnyhowError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Media(e) => write!(f, "Media error: {}", e),
            AppError::Join { strategy, reason } => write!(f, "{} join failed: {}", strategy, reason),
            AppError::Timeout { .. } => write!(f, "Timeout"),
            AppError::AllStrategiesFailed => write!(f, "All connection strategies failed"),
            AppError::AlreadyActive => write!(f, "A session is already active"),
            AppError::Signaling(e) => write!(f, "Signaling error: {}", e),
            AppError::Tls(e) => write!(f, "TLS error: {}", e),
            AppError::WebRTC(e) => write!(f, "WebRTC error: {}", e),
            AppError::Ws(e) => write!(f, "WebSocket error: {}", e),
            AppError::Json(e) => write!(f, "JSON error: {}", e),
            AppError::Io(e) => write!(f, "IO error: {}", e),
            AppError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for AppError {}

impl From<WebRTCError> for AppError {
    fn from(err: WebRTCError) -> Self {
        AppError::WebRTC(err)
    }
}

impl From<WsError> for AppError {
    fn from(err: WsError) -> Self {
        AppError::Ws(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Json(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<AnyhowError> for AppError {
    fn from(err: AnyhowError) -> Self {
        AppError::Other(err)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
