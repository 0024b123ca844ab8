//! Access-point layer.
//!
//! [`Networker`] is the generic face of a streaming network: a named
//! access point on a named network that can dial peers and listen for
//! them. Virtual hosts implement it, and the wrappers in this layer (TLS,
//! tracing) stack on top of any implementation.

mod stream;
mod tls;
mod trace;

pub use stream::{ConnStream, StreamNetConn};
pub use tls::NetTls;
pub use trace::{TraceConnect, TraceDial, TraceListen, TraceReceiver, TraceTx, Tracer};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::common::Addr;
use crate::error::Result;

/// Access-point to a streaming network.
#[async_trait]
pub trait Networker: Send + Sync {
    /// Name of the network.
    fn network(&self) -> String;

    /// Name of this access-point on the network.
    fn name(&self) -> String;

    /// Connect to `addr` on the network.
    async fn dial(&self, ctx: &CancellationToken, addr: &str) -> Result<Box<dyn Conn>>;

    /// Start listening on local address `laddr`.
    async fn listen(&self, ctx: &CancellationToken, laddr: &str) -> Result<Box<dyn Listener>>;

    /// Release the access-point. In-progress and future operations
    /// originated via it return with an error.
    async fn close(&self) -> Result<()>;
}

/// Listener on one access-point address.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self, ctx: &CancellationToken) -> Result<Box<dyn Conn>>;

    /// Address the listener is accepting connections on.
    fn addr(&self) -> Addr;

    async fn close(&self) -> Result<()>;
}

/// Established bidirectional byte stream between two access-points.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Read into `buf`; `Ok(0)` is end of stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write from `buf`, returning how many bytes were accepted.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    fn local_addr(&self) -> Addr;

    fn remote_addr(&self) -> Addr;

    /// Close the connection; in-flight blocked I/O is interrupted.
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("local_addr", &self.local_addr())
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

impl std::fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("addr", &self.addr()).finish()
    }
}
