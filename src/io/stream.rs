//! RawConn adapter over ordinary async byte streams.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{closed_pipe, CancelRead, CancelWrite, RawConn};
use crate::error::{Error, Result};

/// [`RawConn`] over any tokio byte stream (a TCP socket, a TLS stream).
///
/// The halves live behind async mutexes, which serializes concurrent
/// reads and concurrent writes. Closing interrupts in-flight operations
/// and shuts the write side down so the peer observes EOF.
pub struct StreamConn<S> {
    rd: Mutex<ReadHalf<S>>,
    wr: Mutex<WriteHalf<S>>,
    closed: CancellationToken,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamConn<S> {
    pub fn new(stream: S) -> StreamConn<S> {
        let (rd, wr) = tokio::io::split(stream);
        StreamConn {
            rd: Mutex::new(rd),
            wr: Mutex::new(wr),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> CancelRead for StreamConn<S> {
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_pipe());
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_pipe()),
            _ = ctx.cancelled() => Err(Error::Canceled),
            r = async { self.rd.lock().await.read(buf).await } => r.map_err(Error::Io),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> CancelWrite for StreamConn<S> {
    async fn write(&self, ctx: &CancellationToken, buf: &[u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_pipe());
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(closed_pipe()),
            _ = ctx.cancelled() => Err(Error::Canceled),
            r = async { self.wr.lock().await.write(buf).await } => r.map_err(Error::Io),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> RawConn for StreamConn<S> {
    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        // in-flight operations are interrupted by the token; deliver EOF
        // to the peer
        let mut wr = self.wr.lock().await;
        match wr.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
