//! Engine error types and the fixed result-code namespace
//!
//! Every failure surfaced by the engine is an [`MqttError`]. Each variant maps
//! onto exactly one [`ResultCode`], a stable numeric namespace that language
//! bindings can rely on instead of matching on message strings.

use crate::config::ConfigError;
use crate::engine::ConnectionState;
use crate::protocol::codec::CodecError;
use crate::protocol::topic::TopicError;
use crate::transport::TransportError;
use serde::Serialize;
use thiserror::Error;

/// First value of the engine's result-code range.
pub const RESULT_CODE_BASE: u32 = 0x0200;

/// Stable result codes surfaced to callers and bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Error = 1,
    BadArg = 2,
    NoMem = 3,
    NotConnected = 4,
    AlreadyConnected = 5,
    ConnectFail = 6,
    HandshakeFailed = 7,
    InvalidCredentials = 8,
    ProtocolNotSupported = 9,
    PublishFail = 10,
    SubscribeFail = 11,
    UnsubscribeFail = 12,
    HandleNotFound = 13,
    InvalidHandle = 14,
    Closed = 15,
    NotInitialized = 16,
    DeleteFail = 17,
}

impl ResultCode {
    /// Numeric value of this code within the engine's range
    pub fn value(self) -> u32 {
        RESULT_CODE_BASE + self as u32
    }
}

/// Main error type for engine operations
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid argument: {message}")]
    BadArg { message: String },

    #[error("Resource table exhausted: {resource}")]
    NoMem { resource: &'static str },

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Handle is already connected or connecting")]
    AlreadyConnected,

    #[error("Handle must be disconnected first - current state: {state:?}")]
    NotDisconnected { state: ConnectionState },

    #[error("Connection failed: {reason}")]
    ConnectFail { reason: String },

    #[error("MQTT handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Broker rejected the supplied credentials")]
    InvalidCredentials,

    #[error("Broker does not support the requested protocol level")]
    ProtocolNotSupported,

    #[error("Publish failed: {reason}")]
    PublishFail { reason: String },

    #[error("Subscribe failed: {reason}")]
    SubscribeFail { reason: String },

    #[error("Unsubscribe failed: {reason}")]
    UnsubscribeFail { reason: String },

    #[error("Handle not found")]
    HandleNotFound,

    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Handle has been closed")]
    Closed,

    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unclassified error: {reason}")]
    Other { reason: String },
}

impl MqttError {
    /// Map this error onto the fixed result-code namespace
    pub fn code(&self) -> ResultCode {
        match self {
            MqttError::BadArg { .. } | MqttError::Config(_) => ResultCode::BadArg,
            MqttError::NoMem { .. } => ResultCode::NoMem,
            MqttError::NotConnected { .. } => ResultCode::NotConnected,
            MqttError::AlreadyConnected => ResultCode::AlreadyConnected,
            MqttError::NotDisconnected { .. } => ResultCode::DeleteFail,
            MqttError::ConnectFail { .. } => ResultCode::ConnectFail,
            MqttError::HandshakeFailed { .. } => ResultCode::HandshakeFailed,
            MqttError::InvalidCredentials => ResultCode::InvalidCredentials,
            MqttError::ProtocolNotSupported => ResultCode::ProtocolNotSupported,
            MqttError::PublishFail { .. } => ResultCode::PublishFail,
            MqttError::SubscribeFail { .. } => ResultCode::SubscribeFail,
            MqttError::UnsubscribeFail { .. } => ResultCode::UnsubscribeFail,
            MqttError::HandleNotFound => ResultCode::HandleNotFound,
            MqttError::InvalidHandle => ResultCode::InvalidHandle,
            MqttError::Closed => ResultCode::Closed,
            MqttError::NotInitialized => ResultCode::NotInitialized,
            MqttError::Transport(_) | MqttError::Codec(_) | MqttError::Other { .. } => {
                ResultCode::Error
            }
        }
    }

    /// Create invalid argument error
    pub fn bad_arg<S: Into<String>>(message: S) -> Self {
        Self::BadArg {
            message: message.into(),
        }
    }

    /// Create connection failure error
    pub fn connect_fail<S: Into<String>>(reason: S) -> Self {
        Self::ConnectFail {
            reason: reason.into(),
        }
    }

    /// Create handshake failure error
    pub fn handshake_failed<S: Into<String>>(reason: S) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Create publish failure error
    pub fn publish_fail<S: Into<String>>(reason: S) -> Self {
        Self::PublishFail {
            reason: reason.into(),
        }
    }

    /// Create subscribe failure error
    pub fn subscribe_fail<S: Into<String>>(reason: S) -> Self {
        Self::SubscribeFail {
            reason: reason.into(),
        }
    }

    /// Create unsubscribe failure error
    pub fn unsubscribe_fail<S: Into<String>>(reason: S) -> Self {
        Self::UnsubscribeFail {
            reason: reason.into(),
        }
    }
}

impl From<TopicError> for MqttError {
    fn from(error: TopicError) -> Self {
        MqttError::bad_arg(error.to_string())
    }
}

/// Result type for engine operations
pub type MqttResult<T> = Result<T, MqttError>;
