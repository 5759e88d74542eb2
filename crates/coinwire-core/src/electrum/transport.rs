//! Byte-stream transports for the protocol session.
//!
//! The session only needs an ordered, bidirectional byte stream. A
//! [`Connector`] produces a fresh one on every (re)connect.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::CoreError;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to the server.
    async fn connect(&self) -> Result<BoxedStream, CoreError>;

    /// Human-readable endpoint, used in logs.
    fn endpoint(&self) -> String;
}

/// Plain TCP, `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, CoreError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| CoreError::ConnectionLost(format!("connect {}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %self.addr, "tcp connected");
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Split `host:port`, rejecting a missing or non-numeric port.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), CoreError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| CoreError::Protocol(format!("endpoint `{addr}` must be host:port")))?;
    let port = port
        .parse()
        .map_err(|e| CoreError::Protocol(format!("endpoint `{addr}` has an invalid port: {e}")))?;
    if host.is_empty() {
        return Err(CoreError::Protocol(format!("endpoint `{addr}` has no host")));
    }
    Ok((host, port))
}

#[cfg(feature = "tls")]
pub use tls::TlsConnector;

#[cfg(feature = "tls")]
mod tls {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::net::TcpStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tracing::debug;

    use super::{split_host_port, BoxedStream, Connector};
    use crate::error::CoreError;

    /// TLS over TCP, verified against the webpki root set.
    #[derive(Clone)]
    pub struct TlsConnector {
        addr: String,
        server_name: ServerName<'static>,
        inner: tokio_rustls::TlsConnector,
    }

    impl TlsConnector {
        pub fn new(addr: impl Into<String>) -> Result<Self, CoreError> {
            let addr = addr.into();
            let (host, _) = split_host_port(&addr)?;
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|e| CoreError::Protocol(format!("invalid tls server name `{host}`: {e}")))?;

            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();

            Ok(Self {
                addr,
                server_name,
                inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
            })
        }
    }

    #[async_trait]
    impl Connector for TlsConnector {
        async fn connect(&self) -> Result<BoxedStream, CoreError> {
            let tcp = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| CoreError::ConnectionLost(format!("connect {}: {e}", self.addr)))?;
            tcp.set_nodelay(true)?;
            let stream = self
                .inner
                .connect(self.server_name.clone(), tcp)
                .await
                .map_err(|e| CoreError::ConnectionLost(format!("tls handshake {}: {e}", self.addr)))?;
            debug!(endpoint = %self.addr, "tls connected");
            Ok(Box::new(stream))
        }

        fn endpoint(&self) -> String {
            format!("ssl://{}", self.addr)
        }
    }
}
