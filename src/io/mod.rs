//! Cancellable I/O primitives.
//!
//! Everything that can block in this crate takes a [`CancellationToken`]:
//! cancelling it makes the in-flight call return promptly with
//! [`Error::Canceled`]. This module provides the reader/writer traits,
//! a synchronous in-memory pipe, an adapter putting the traits over
//! ordinary tokio byte streams, and a cancellable accept wrapper for
//! OS-level listeners.

mod listener;
mod pipe;
mod stream;

pub use listener::CtxListener;
pub use pipe::{pipe, pipe_pair, PipeConn, PipeReader, PipeWriter};
pub use stream::StreamConn;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Reader whose blocking reads can be interrupted through a token.
#[async_trait]
pub trait CancelRead: Send + Sync {
    /// Read into `buf`. `Ok(0)` means end of stream.
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8]) -> Result<usize>;
}

/// Writer whose blocking writes can be interrupted through a token.
#[async_trait]
pub trait CancelWrite: Send + Sync {
    /// Write from `buf`, returning how many bytes were accepted.
    async fn write(&self, ctx: &CancellationToken, buf: &[u8]) -> Result<usize>;
}

/// Bidirectional byte channel, as handed around by network engines.
#[async_trait]
pub trait RawConn: CancelRead + CancelWrite {
    /// Shut the channel down. Idempotent; wakes pending reads and writes
    /// on both ends.
    async fn close(&self) -> Result<()>;
}

/// Write all of `buf`, retrying partial writes.
pub async fn write_all(w: &dyn CancelWrite, ctx: &CancellationToken, buf: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        done += w.write(ctx, &buf[done..]).await?;
    }
    Ok(())
}

/// Read a single `\n`-terminated line of at most `maxlen` bytes.
///
/// The bound protects against unbounded memory use on a hostile peer.
/// End of stream before the terminator is reported as UnexpectedEof.
pub async fn read_line(r: &dyn CancelRead, ctx: &CancellationToken, maxlen: usize) -> Result<String> {
    let mut line = Vec::new();
    let mut b = [0u8; 1];
    while line.len() < maxlen {
        let n = r.read(ctx, &mut b).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF before line terminator",
            )));
        }
        line.push(b[0]);
        if b[0] == b'\n' {
            break;
        }
    }
    String::from_utf8(line).map_err(|_| Error::Protocol("line is not valid UTF-8".to_string()))
}

/// Error used for operations on a locally closed channel.
pub(crate) fn closed_pipe() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "read/write on closed pipe",
    ))
}
