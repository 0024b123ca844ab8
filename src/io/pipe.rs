//! Synchronous in-memory pipe.
//!
//! Each write blocks until reads on the other side have consumed all of
//! its bytes; there is no internal buffer. Both directions of a
//! [`PipeConn`] pair are built from two such pipes, which makes the pair
//! behave like a connected socket whose transmissions are rendezvous.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{closed_pipe, CancelRead, CancelWrite, RawConn};
use crate::error::{Error, Result};

/// State shared between the two halves of one pipe direction.
struct Shared {
    done: CancellationToken,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
}

impl Shared {
    /// What a read returns once the pipe is done: EOF if only the write
    /// side closed, an error if the read side closed itself.
    fn read_close_result(&self) -> Result<usize> {
        if self.read_closed.load(Ordering::SeqCst) {
            Err(closed_pipe())
        } else {
            Ok(0)
        }
    }
}

/// Read half of one pipe direction.
pub struct PipeReader {
    sh: Arc<Shared>,
    // taking the receiver gates concurrent reads sequentially
    data: Mutex<mpsc::Receiver<Vec<u8>>>,
    ack: mpsc::Sender<usize>,
}

/// Write half of one pipe direction.
pub struct PipeWriter {
    sh: Arc<Shared>,
    data: mpsc::Sender<Vec<u8>>,
    // taking the ack receiver gates concurrent writes sequentially
    ack: Mutex<mpsc::Receiver<usize>>,
}

/// Create one synchronous pipe direction.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let (data_tx, data_rx) = mpsc::channel(1);
    let (ack_tx, ack_rx) = mpsc::channel(1);
    let sh = Arc::new(Shared {
        done: CancellationToken::new(),
        read_closed: AtomicBool::new(false),
        write_closed: AtomicBool::new(false),
    });
    (
        PipeReader {
            sh: sh.clone(),
            data: Mutex::new(data_rx),
            ack: ack_tx,
        },
        PipeWriter {
            sh,
            data: data_tx,
            ack: Mutex::new(ack_rx),
        },
    )
}

impl PipeReader {
    /// Close the read half: pending operations on both ends wake up and
    /// fail with a closed-pipe error.
    pub fn close(&self) {
        self.sh.read_closed.store(true, Ordering::SeqCst);
        self.sh.done.cancel();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl CancelRead for PipeReader {
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8]) -> Result<usize> {
        if self.sh.done.is_cancelled() {
            return self.sh.read_close_result();
        }
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }

        let mut data = self.data.lock().await;
        tokio::select! {
            chunk = data.recv() => {
                let Some(chunk) = chunk else {
                    return self.sh.read_close_result();
                };
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                let _ = self.ack.try_send(n);
                Ok(n)
            }
            _ = self.sh.done.cancelled() => self.sh.read_close_result(),
            _ = ctx.cancelled() => Err(Error::Canceled),
        }
    }
}

impl PipeWriter {
    /// Close the write half: further reads on the peer return EOF once
    /// in-flight bytes are consumed, pending operations wake up.
    pub fn close(&self) {
        self.sh.write_closed.store(true, Ordering::SeqCst);
        self.sh.done.cancel();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl CancelWrite for PipeWriter {
    async fn write(&self, ctx: &CancellationToken, buf: &[u8]) -> Result<usize> {
        if self.sh.done.is_cancelled() {
            return Err(closed_pipe());
        }
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }

        let mut ack = self.ack.lock().await;
        // an interrupted earlier write may have left its ack behind
        while ack.try_recv().is_ok() {}

        let mut sent = 0;
        loop {
            // reader consumes what fits and acks the count; the rest is
            // resent from our copy
            tokio::select! {
                r = self.data.send(buf[sent..].to_vec()) => {
                    if r.is_err() {
                        return Err(closed_pipe());
                    }
                }
                _ = self.sh.done.cancelled() => return Err(closed_pipe()),
                _ = ctx.cancelled() => return Err(Error::Canceled),
            }
            tokio::select! {
                n = ack.recv() => match n {
                    Some(n) => sent += n,
                    None => return Err(closed_pipe()),
                },
                _ = self.sh.done.cancelled() => return Err(closed_pipe()),
                _ = ctx.cancelled() => return Err(Error::Canceled),
            }
            if sent >= buf.len() {
                return Ok(sent);
            }
        }
    }
}

/// One endpoint of a bidirectional in-memory connection.
pub struct PipeConn {
    rd: PipeReader,
    wr: PipeWriter,
}

/// Create a pair of directly connected endpoints.
///
/// Bytes written to one endpoint are read from the other, write-to-read
/// rendezvous in both directions.
pub fn pipe_pair() -> (PipeConn, PipeConn) {
    let (r1, w1) = pipe();
    let (r2, w2) = pipe();
    (PipeConn { rd: r1, wr: w2 }, PipeConn { rd: r2, wr: w1 })
}

#[async_trait]
impl CancelRead for PipeConn {
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8]) -> Result<usize> {
        self.rd.read(ctx, buf).await
    }
}

#[async_trait]
impl CancelWrite for PipeConn {
    async fn write(&self, ctx: &CancellationToken, buf: &[u8]) -> Result<usize> {
        self.wr.write(ctx, buf).await
    }
}

#[async_trait]
impl RawConn for PipeConn {
    async fn close(&self) -> Result<()> {
        // peer reads see EOF; peer writes and our own reads fail
        self.wr.close();
        self.rd.close();
        Ok(())
    }
}
