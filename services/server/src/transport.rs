//! Transport layer: TCP bind/accept and the optional TLS upgrade.
//!
//! Sessions see a plain byte stream (`IoStream`); whether it is raw TCP or
//! TLS is decided here, per listener. Client-auth (mTLS) verifies the peer
//! chain against the configured trust roots. Nothing below TLS 1.2 is
//! offered.

use crate::config::{ListenerConfig, TlsConfig};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("TLS setup: {0}")]
    Tls(String),
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

/// Object-safe byte stream handed to the session runtime.
pub trait SessionIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionIo for T {}

pub type IoStream = Box<dyn SessionIo>;

/// Bind the listener socket, mapping AddrInUse to a distinct error so the
/// supervisor can report PORT_IN_USE.
pub async fn bind(config: &ListenerConfig) -> Result<TcpListener, TransportError> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(TransportError::PortInUse(config.port))
        }
        Err(e) => Err(TransportError::Bind { addr, source: e }),
    }
}

/// Per-listener acceptor: plain TCP, or TLS when configured.
#[derive(Clone)]
pub struct Upgrader {
    tls: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Upgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgrader")
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Upgrader {
    pub fn from_config(config: &ListenerConfig) -> Result<Self, TransportError> {
        let tls = match &config.tls {
            Some(tls_config) => Some(build_acceptor(tls_config)?),
            None => None,
        };
        Ok(Upgrader { tls })
    }

    pub fn plain() -> Self {
        Upgrader { tls: None }
    }

    /// Upgrade an accepted socket into the session byte stream.
    pub async fn upgrade(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<IoStream, TransportError> {
        stream.set_nodelay(true)?;
        match &self.tls {
            None => Ok(Box::new(stream)),
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => Ok(Box::new(tls_stream)),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS handshake failed");
                    Err(TransportError::Handshake(e))
                }
            },
        }
    }
}

fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certs(&config.cert_file)?;
    let key = load_key(&config.key_file)?;

    let builder = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ]);

    let server_config = if config.require_client_auth {
        let ca_file = config
            .ca_file
            .as_ref()
            .ok_or_else(|| TransportError::Tls("client auth requires a ca_file".to_owned()))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("bad CA certificate: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TransportError::Tls(format!("client verifier: {e}")))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?
    } else {
        builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(e.to_string()))?
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let pem = std::fs::read(path)
        .map_err(|e| TransportError::Tls(format!("reading {}: {}", path.display(), e)))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    let certs = certs.map_err(|e| TransportError::Tls(format!("parsing {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "{} holds no certificates",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let pem = std::fs::read(path)
        .map_err(|e| TransportError::Tls(format!("reading {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TransportError::Tls(format!("parsing {}: {}", path.display(), e)))?
        .ok_or_else(|| TransportError::Tls(format!("{} holds no private key", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn listener_on(port: u16) -> ListenerConfig {
        let toml = format!(
            r#"
            schema_version = 1
            node_id = "n"

            [[listeners]]
            server_id = "SRV1"
            port = {port}
            bind_address = "127.0.0.1"
            receive_directory = "/tmp/in"
            send_directory = "/tmp/out"
        "#
        );
        load_config_from_str(&toml).unwrap().listeners.remove(0)
    }

    #[tokio::test]
    async fn bind_conflict_is_port_in_use() {
        // Grab an ephemeral port, then try to bind it again.
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind(&listener_on(port)).await.unwrap_err();
        assert!(matches!(err, TransportError::PortInUse(p) if p == port));
    }

    #[tokio::test]
    async fn plain_upgrade_passes_bytes_through() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upgrader = Upgrader::plain();

        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            let mut io = upgrader.upgrade(sock, peer).await.unwrap();
            let mut buf = [0u8; 4];
            io.read_exact(&mut buf).await.unwrap();
            io.write_all(&buf).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[test]
    fn missing_cert_file_is_a_tls_error() {
        let mut config = listener_on(1);
        config.tls = Some(crate::config::TlsConfig {
            cert_file: "/nonexistent/cert.pem".into(),
            key_file: "/nonexistent/key.pem".into(),
            require_client_auth: false,
            ca_file: None,
        });
        assert!(matches!(
            Upgrader::from_config(&config).unwrap_err(),
            TransportError::Tls(_)
        ));
    }
}
