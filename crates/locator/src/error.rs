use thiserror::Error;
use tracing::error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("Spatial ranging is not supported on this device")]
    UnsupportedDevice,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Invalid discovery token: {0}")]
    TokenDeserialization(String),

    #[error("Incompatible protocol version: expected {expected}, found {found}")]
    ProtocolVersion { expected: u8, found: u8 },

    #[error("Ranging invalidated: {0}")]
    RangingInvalidated(String),

    #[error("Ranging session not ready: {0}")]
    RangingNotReady(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Coordinator is shut down")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<serde_json::Error> for LocatorError {
    fn from(err: serde_json::Error) -> Self {
        LocatorError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for LocatorError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => LocatorError::PermissionDenied(err.to_string()),
            std::io::ErrorKind::TimedOut => LocatorError::ConnectionTimeout(err.to_string()),
            _ => LocatorError::NetworkError(err.to_string()),
        }
    }
}

impl From<mdns_sd::Error> for LocatorError {
    fn from(err: mdns_sd::Error) -> Self {
        LocatorError::TransportFailure(format!("mDNS: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, LocatorError>;

/// Context for error logging
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub peer: Option<String>,
    pub session_id: Option<Uuid>,
    pub epoch: Option<u64>,
    pub additional_info: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }
}

impl LocatorError {
    /// Log error with structured context
    pub fn log_with_context(&self, context: &ErrorContext) {
        error!(
            error = %self,
            error_type = ?self,
            category = %self.category(),
            peer = ?context.peer,
            session_id = ?context.session_id,
            epoch = ?context.epoch,
            additional_info = ?context.additional_info,
            timestamp = %chrono::Utc::now(),
            "Locator error occurred"
        );
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            LocatorError::UnsupportedDevice => {
                "This device does not support spatial ranging.".to_string()
            }
            LocatorError::PermissionDenied(details) => {
                format!("Permission denied: {}. Please allow local network access in your device settings.", details)
            }
            LocatorError::TransportFailure(details) => {
                format!("Could not search for nearby devices: {}. Please restart the session.", details)
            }
            LocatorError::ConnectionTimeout(peer) => {
                format!("The device '{}' did not respond in time.", peer)
            }
            LocatorError::ConnectionFailed(details) => {
                format!("Connection failed: {}. Please restart the session.", details)
            }
            LocatorError::PeerNotFound(peer) => {
                format!("The device '{}' could not be found. It may have moved out of range.", peer)
            }
            LocatorError::TokenDeserialization(details) => {
                format!("Received an unreadable discovery token: {}.", details)
            }
            LocatorError::ProtocolVersion { expected, found } => {
                format!("The nearby device runs an incompatible version ({} instead of {}).", found, expected)
            }
            LocatorError::RangingInvalidated(details) => {
                format!("Ranging stopped: {}. Please restart the session.", details)
            }
            LocatorError::RangingNotReady(details) => {
                format!("Ranging is not ready: {}.", details)
            }
            LocatorError::Encryption(details) => {
                format!("Secure link could not be established: {}.", details)
            }
            LocatorError::NetworkError(details) => {
                format!("Network error: {}. Please check your connection and try again.", details)
            }
            LocatorError::SerializationError(details) => {
                format!("Data processing error: {}.", details)
            }
            LocatorError::ChannelClosed => {
                "The locator session has shut down.".to_string()
            }
            LocatorError::InternalError(details) => {
                format!("An internal error occurred: {}.", details)
            }
        }
    }

    /// Get error category for metrics and monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            LocatorError::UnsupportedDevice => ErrorCategory::Device,
            LocatorError::PermissionDenied(_) => ErrorCategory::Permission,
            LocatorError::TransportFailure(_) => ErrorCategory::Transport,
            LocatorError::ConnectionTimeout(_) => ErrorCategory::Timeout,
            LocatorError::ConnectionFailed(_) => ErrorCategory::Transport,
            LocatorError::PeerNotFound(_) => ErrorCategory::Transport,
            LocatorError::TokenDeserialization(_) => ErrorCategory::Protocol,
            LocatorError::ProtocolVersion { .. } => ErrorCategory::Protocol,
            LocatorError::RangingInvalidated(_) => ErrorCategory::Ranging,
            LocatorError::RangingNotReady(_) => ErrorCategory::Ranging,
            LocatorError::Encryption(_) => ErrorCategory::Security,
            LocatorError::NetworkError(_) => ErrorCategory::Transport,
            LocatorError::SerializationError(_) => ErrorCategory::Protocol,
            LocatorError::ChannelClosed => ErrorCategory::Internal,
            LocatorError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Whether a fresh `start()` can be expected to succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LocatorError::UnsupportedDevice)
    }
}

/// Error categories for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Device,
    Permission,
    Transport,
    Timeout,
    Protocol,
    Ranging,
    Security,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Device => write!(f, "device"),
            ErrorCategory::Permission => write!(f, "permission"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Ranging => write!(f, "ranging"),
            ErrorCategory::Security => write!(f, "security"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}
