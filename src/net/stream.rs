//! Adapters between [`Conn`] objects and ordinary tokio byte streams.
//!
//! Session layers such as TLS operate on `AsyncRead + AsyncWrite`;
//! [`ConnStream`] presents a [`Conn`] that way, and [`StreamNetConn`]
//! turns the wrapped stream back into a [`Conn`] with fixed endpoint
//! addresses.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::Conn;
use crate::common::Addr;
use crate::error::{Error, Result};

const READ_CHUNK: usize = 16 * 1024;

type ReadFut = Pin<Box<dyn Future<Output = (Result<usize>, Vec<u8>)> + Send>>;
type WriteFut = Pin<Box<dyn Future<Output = Result<usize>> + Send>>;
type CloseFut = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Presents a [`Conn`] as a tokio `AsyncRead + AsyncWrite` stream.
pub struct ConnStream {
    conn: Arc<dyn Conn>,
    rd: Option<ReadFut>,
    wr: Option<WriteFut>,
    shut: Option<CloseFut>,
}

impl ConnStream {
    pub fn new(conn: Arc<dyn Conn>) -> ConnStream {
        ConnStream {
            conn,
            rd: None,
            wr: None,
            shut: None,
        }
    }
}

fn into_io_err(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

impl AsyncRead for ConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.rd.is_none() {
            let conn = this.conn.clone();
            let cap = buf.remaining().min(READ_CHUNK);
            this.rd = Some(Box::pin(async move {
                let mut chunk = vec![0u8; cap];
                let r = conn.read(&mut chunk).await;
                (r, chunk)
            }));
        }
        match this.rd.as_mut().unwrap().as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready((r, chunk)) => {
                this.rd = None;
                match r {
                    Ok(n) => {
                        buf.put_slice(&chunk[..n]);
                        Poll::Ready(Ok(()))
                    }
                    Err(e) => Poll::Ready(Err(into_io_err(e))),
                }
            }
        }
    }
}

impl AsyncWrite for ConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // poll contract: the caller keeps `buf` stable across Pending, so
        // the stored submission matches what it offers now
        if this.wr.is_none() {
            let conn = this.conn.clone();
            let data = buf.to_vec();
            this.wr = Some(Box::pin(async move { conn.write(&data).await }));
        }
        match this.wr.as_mut().unwrap().as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(r) => {
                this.wr = None;
                Poll::Ready(r.map_err(into_io_err))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shut.is_none() {
            let conn = this.conn.clone();
            this.shut = Some(Box::pin(async move { conn.close().await }));
        }
        match this.shut.as_mut().unwrap().as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(r) => {
                this.shut = None;
                Poll::Ready(r.map_err(into_io_err))
            }
        }
    }
}

/// [`Conn`] over an ordinary tokio byte stream with fixed endpoint
/// addresses.
pub struct StreamNetConn<S> {
    local: Addr,
    peer: Addr,
    rd: Mutex<ReadHalf<S>>,
    wr: Mutex<WriteHalf<S>>,
    closed: CancellationToken,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamNetConn<S> {
    pub fn new(stream: S, local: Addr, peer: Addr) -> StreamNetConn<S> {
        let (rd, wr) = tokio::io::split(stream);
        StreamNetConn {
            local,
            peer,
            rd: Mutex::new(rd),
            wr: Mutex::new(wr),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> Conn for StreamNetConn<S> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Error::SockDown);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::SockDown),
            r = async { self.rd.lock().await.read(buf).await } => r.map_err(Error::Io),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Error::SockDown);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::SockDown),
            r = async { self.wr.lock().await.write(buf).await } => r.map_err(Error::Io),
        }
    }

    fn local_addr(&self) -> Addr {
        self.local.clone()
    }

    fn remote_addr(&self) -> Addr {
        self.peer.clone()
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        let mut wr = self.wr.lock().await;
        let _ = wr.shutdown().await;
        Ok(())
    }
}
