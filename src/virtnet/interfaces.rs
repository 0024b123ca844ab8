//! Pluggable pieces a virtual network realization provides.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::common::Addr;
use crate::error::Result;
use crate::io::RawConn;

/// Transport backend of one subnetwork.
///
/// It must be safe to use an engine from multiple tasks simultaneously.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create resources for a new host and announce it to the registry.
    ///
    /// The hostdata announced must encode whatever [`Engine::dial`] —
    /// potentially running on another subnetwork — needs in order to
    /// reach this host.
    async fn new_host(
        &self,
        ctx: &CancellationToken,
        hostname: &str,
        registry: &dyn Registry,
    ) -> Result<()>;

    /// Establish an outbound connection to `dst`, letting the remote
    /// side know its peer address is `src`.
    ///
    /// On success returns the transport channel that will carry the data
    /// and the address the remote listener accepted with.
    async fn dial(
        &self,
        ctx: &CancellationToken,
        src: &Addr,
        dst: &Addr,
        dst_hostdata: &str,
    ) -> Result<(Arc<dyn RawConn>, Addr)>;

    /// Release engine resources. There is no need to interrupt other
    /// engine operations here: their tokens are always cancelled before
    /// close is called.
    async fn close(&self) -> Result<()>;
}

/// Directory of hosts available on the whole network.
///
/// When a host joins the network it announces itself here; whenever host
/// α dials an address on host β, it queries this directory for β. It must
/// be safe to use a registry from multiple tasks simultaneously.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Announce a host.
    ///
    /// Errors come wrapped as [`crate::error::RegistryError`] with cause
    /// `RegistryDown`, `HostDup`, or an underlying IO/database error.
    async fn announce(
        &self,
        ctx: &CancellationToken,
        hostname: &str,
        hostdata: &str,
    ) -> Result<()>;

    /// Query a host's data.
    ///
    /// Errors come wrapped as [`crate::error::RegistryError`] with cause
    /// `RegistryDown`, `NoHost`, or an underlying IO/database error.
    async fn query(&self, ctx: &CancellationToken, hostname: &str) -> Result<String>;

    /// Close access to the registry.
    async fn close(&self) -> Result<()>;
}

/// Successful acceptance decision for one incoming connection.
///
/// The engine completes the rendezvous by sending the handshake outcome
/// on `ack`: Ok commits the connection to the waiting listener, Err makes
/// the listener free the pre-allocated socket and keep waiting.
pub struct Accept {
    /// Address the listener accepts with.
    pub addr: Addr,
    pub ack: oneshot::Sender<Result<()>>,
}
