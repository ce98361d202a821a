//! TLS client configuration for `mqtts://` brokers

use super::TransportError;
use crate::config::{BrokerInfo, TlsSettings};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Build a rustls connector from broker TLS settings.
///
/// The web PKI roots are always trusted; `ca_cert_path` adds private CAs on
/// top. A client identity is presented only when both cert and key are set.
pub fn build_tls_connector(settings: &TlsSettings) -> Result<TlsConnector, TransportError> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    if let Some(ca_path) = &settings.ca_cert_path {
        let (added, ignored) = roots.add_parsable_certificates(load_certs(ca_path)?);
        if added == 0 {
            return Err(TransportError::Tls(format!(
                "no usable CA certificates in {} ({ignored} ignored)",
                ca_path.display()
            )));
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let mut config = match (&settings.client_cert_path, &settings.client_key_path) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .map_err(|e| TransportError::Tls(format!("client identity: {e}")))?,
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = settings
        .alpn
        .iter()
        .map(|protocol| protocol.as_bytes().to_vec())
        .collect();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Name presented for SNI and certificate verification
pub fn server_name(broker: &BrokerInfo, settings: &TlsSettings) -> Result<ServerName<'static>, TransportError> {
    let name = settings
        .server_name
        .clone()
        .unwrap_or_else(|| broker.host.clone());
    ServerName::try_from(name.clone())
        .map_err(|e| TransportError::Tls(format!("invalid server name '{name}': {e}")))
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| TransportError::Tls(format!("no private key found in {}", path.display())))
}
