use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors surfaced by the connection engine.
///
/// # Error Categories
///
/// - **I/O and transport**: `Io`, `ConnectionError`, `ChannelClosed`
/// - **Protocol**: `ProtocolError`, `UnsupportedProtocolVersion`
/// - **Validation**: `InvalidTopicName`, `InvalidTopicFilter`, `InvalidClientId`
/// - **Handshake**: `BadUsernameOrPassword`, `ClientIdentifierRejected`,
///   `SessionCorrupted`
/// - **Lifecycle**: `NotConnected`, `KeepAliveTimeout`, `ClientClosed`
#[derive(Error, Debug, Clone)]
pub enum MqttError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),

    #[error("Bad username or password")]
    BadUsernameOrPassword,

    #[error("Client identifier rejected")]
    ClientIdentifierRejected,

    #[error("Session corrupted")]
    SessionCorrupted,

    #[error("Not connected")]
    NotConnected,

    #[error("Keep alive timeout")]
    KeepAliveTimeout,

    #[error("Client closed connection")]
    ClientClosed,

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<std::io::Error> for MqttError {
    fn from(err: std::io::Error) -> Self {
        MqttError::Io(err.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MqttError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MqttError::ConnectionError(format!("Channel send error: {err}"))
    }
}
