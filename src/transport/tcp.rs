//! TCP transport, optionally wrapped in TLS

use super::tls::{build_tls_connector, server_name};
use super::{Connector, Transport, TransportError};
use crate::config::BrokerInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Opens TCP connections to brokers, with a TLS handshake when the broker
/// carries TLS settings
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        broker: &BrokerInfo,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        // bad certificate material fails before any socket is opened
        let tls = match &broker.tls {
            Some(settings) => Some((build_tls_connector(settings)?, server_name(broker, settings)?)),
            None => None,
        };

        let connect = async {
            let address = (broker.host.as_str(), broker.port);
            let stream = TcpStream::connect(address)
                .await
                .map_err(|e| TransportError::Unreachable(format!("{broker}: {e}")))?;
            stream.set_nodelay(self.nodelay)?;

            let transport: Box<dyn Transport> = match tls {
                Some((connector, domain)) => {
                    let stream = connector
                        .connect(domain, stream)
                        .await
                        .map_err(|e| TransportError::Tls(format!("handshake with {broker}: {e}")))?;
                    debug!(broker = %broker, "TLS session established");
                    Box::new(StreamTransport::new(stream))
                }
                None => {
                    debug!(broker = %broker, "TCP connection established");
                    Box::new(TcpTransport::new(stream))
                }
            };
            Ok::<_, TransportError>(transport)
        };

        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportError::Unreachable(format!("connect to {broker} timed out")))?
    }
}

/// Byte stream split into independently locked halves
pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: AtomicBool,
}

/// Plain TCP transport
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S: AsyncRead + AsyncWrite> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    async fn receive(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.ensure_open()?;
        let mut reader = self.reader.lock().await;
        tokio::time::timeout(timeout, reader.read(buf))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::from)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(TransportError::from)
    }
}
