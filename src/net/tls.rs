//! TLS layer over any Networker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use super::{Conn, ConnStream, Listener, Networker, StreamNetConn};
use crate::common::Addr;
use crate::error::{Error, Result};

/// Wraps an underlying [`Networker`] with TLS.
///
/// Dialed connections run the client handshake, accepted connections the
/// server handshake. The reported network name is `"<inner>+tls"`.
pub struct NetTls {
    inner: Arc<dyn Networker>,
    client: Option<TlsConnector>,
    server: Option<TlsAcceptor>,
    server_name: Option<String>,
}

impl NetTls {
    /// TLS in both directions.
    pub fn new(
        inner: Arc<dyn Networker>,
        client: Arc<ClientConfig>,
        server: Arc<ServerConfig>,
    ) -> NetTls {
        NetTls {
            inner,
            client: Some(TlsConnector::from(client)),
            server: Some(TlsAcceptor::from(server)),
            server_name: None,
        }
    }

    /// Dial-only wrapper; listen fails.
    pub fn client(inner: Arc<dyn Networker>, config: Arc<ClientConfig>) -> NetTls {
        NetTls {
            inner,
            client: Some(TlsConnector::from(config)),
            server: None,
            server_name: None,
        }
    }

    /// Listen-only wrapper; dial fails.
    pub fn server(inner: Arc<dyn Networker>, config: Arc<ServerConfig>) -> NetTls {
        NetTls {
            inner,
            client: None,
            server: Some(TlsAcceptor::from(config)),
            server_name: None,
        }
    }

    /// Fixed SNI name to present instead of the dialed host. Virtual
    /// host names are not always valid DNS names; this gives the caller
    /// an out.
    pub fn with_server_name(mut self, name: impl Into<String>) -> NetTls {
        self.server_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Networker for NetTls {
    fn network(&self) -> String {
        format!("{}+tls", self.inner.network())
    }

    fn name(&self) -> String {
        self.inner.name()
    }

    async fn dial(&self, ctx: &CancellationToken, addr: &str) -> Result<Box<dyn Conn>> {
        let connector = self
            .client
            .as_ref()
            .ok_or_else(|| Error::Other("no TLS client configuration".to_string()))?;

        let conn = self.inner.dial(ctx, addr).await?;
        let (local, peer) = (conn.local_addr(), conn.remote_addr());

        let sni = match &self.server_name {
            Some(name) => name.clone(),
            None => peer.host.clone(),
        };
        let name = ServerName::try_from(sni)
            .map_err(|_| Error::Other("invalid TLS server name".to_string()))?;

        let stream = ConnStream::new(Arc::from(conn));
        let tls = connector.connect(name, stream).await.map_err(Error::Io)?;
        Ok(Box::new(StreamNetConn::new(tls, local, peer)))
    }

    async fn listen(&self, ctx: &CancellationToken, laddr: &str) -> Result<Box<dyn Listener>> {
        let acceptor = self
            .server
            .clone()
            .ok_or_else(|| Error::Other("no TLS server configuration".to_string()))?;
        let inner = self.inner.listen(ctx, laddr).await?;
        Ok(Box::new(TlsListener { inner, acceptor }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct TlsListener {
    inner: Box<dyn Listener>,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl Listener for TlsListener {
    async fn accept(&self, ctx: &CancellationToken) -> Result<Box<dyn Conn>> {
        let conn = self.inner.accept(ctx).await?;
        let (local, peer) = (conn.local_addr(), conn.remote_addr());

        let stream = ConnStream::new(Arc::from(conn));
        let tls = self.acceptor.accept(stream).await.map_err(Error::Io)?;
        Ok(Box::new(StreamNetConn::new(tls, local, peer)))
    }

    fn addr(&self) -> Addr {
        self.inner.addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipenet;
    use tokio_rustls::rustls::RootCertStore;

    #[tokio::test]
    async fn test_network_name_and_direction_checks() {
        let net = pipenet::Network::new("tls");
        let host = net.host("α").await;

        let config = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth(),
        );
        let wrapped = NetTls::client(Arc::new(host), config).with_server_name("localhost");
        assert_eq!(wrapped.network(), "pipetls+tls");
        assert_eq!(wrapped.name(), "α");

        // listening needs a server configuration
        let ctx = CancellationToken::new();
        assert!(wrapped.listen(&ctx, "").await.is_err());

        net.close().await.unwrap();
    }
}
