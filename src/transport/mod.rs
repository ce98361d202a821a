//! Transport layer between the engine and a broker
//!
//! The engine never touches sockets directly. A [`Connector`] opens a
//! [`Transport`] to the broker described by a [`BrokerInfo`], and the engine
//! drives that transport with timed byte-level send and receive calls. This
//! keeps the protocol logic testable against in-memory transports; the
//! stock [`TcpConnector`] adds a rustls handshake for `mqtts://` brokers.

use crate::config::BrokerInfo;
use std::time::Duration;
use thiserror::Error;

pub mod tcp;
pub mod tls;

pub use tcp::{StreamTransport, TcpConnector, TcpTransport};

/// Failures reported by a transport implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::AddrNotAvailable
            | ErrorKind::NotFound => TransportError::Unreachable(error.to_string()),
            _ => TransportError::Io(error.to_string()),
        }
    }
}

/// An established, bidirectional byte stream to a broker
///
/// All methods take `&self` so that a receive can be outstanding while other
/// tasks send; implementations serialize each direction internally.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Write all of `data`, failing with [`TransportError::Timeout`] if that
    /// takes longer than `timeout`
    async fn send(&self, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read whatever is available into `buf`.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed the
    /// stream. Returns [`TransportError::Timeout`] if nothing arrived within
    /// `timeout`.
    async fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Close the stream. Later sends and receives fail with
    /// [`TransportError::Closed`].
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for transports, one per connect attempt
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        broker: &BrokerInfo,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;
}
