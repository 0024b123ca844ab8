//! Cancellable accept wrapper for OS-level listeners.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

type Accepted = io::Result<(TcpStream, SocketAddr)>;

/// Converts a plain [`TcpListener`] into one whose accept takes a
/// cancellation token.
///
/// One internal task calls the raw accept and hands results over a
/// single-slot rendezvous channel; [`CtxListener::accept`] races that
/// channel against the tokens. [`CtxListener::close`] stops the task,
/// which closes the raw listener it owns, and disposes of a connection
/// accepted in the meantime.
pub struct CtxListener {
    laddr: SocketAddr,
    cancel: CancellationToken,
    acceptq: Mutex<mpsc::Receiver<Accepted>>,
    serve: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CtxListener {
    pub fn new(raw: TcpListener) -> io::Result<CtxListener> {
        let laddr = raw.local_addr()?;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        let serve = tokio::spawn(serve(raw, tx, cancel.clone()));
        Ok(CtxListener {
            laddr,
            cancel,
            acceptq: Mutex::new(rx),
            serve: std::sync::Mutex::new(Some(serve)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.laddr
    }

    pub async fn accept(&self, ctx: &CancellationToken) -> Result<(TcpStream, SocketAddr)> {
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }
        let mut q = self.acceptq.lock().await;
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            _ = self.cancel.cancelled() => Err(listener_closed()),
            r = q.recv() => match r {
                Some(Ok(pair)) => Ok(pair),
                Some(Err(e)) => Err(Error::Io(e)),
                None => Err(listener_closed()),
            },
        }
    }

    /// Stop accepting. Idempotent; joins the internal task (its panics
    /// are not re-raised).
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = { self.serve.lock().unwrap().take() };
        if let Some(h) = handle {
            let _ = h.await;
        }
        let mut q = self.acceptq.lock().await;
        while q.try_recv().is_ok() {}
    }
}

fn listener_closed() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::Other,
        "use of closed listener",
    ))
}

async fn serve(raw: TcpListener, tx: mpsc::Sender<Accepted>, cancel: CancellationToken) {
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => return, // drops raw, closing it
            r = raw.accept() => r,
        };
        tokio::select! {
            _ = cancel.cancelled() => return, // drops an unclaimed conn
            s = tx.send(res) => {
                if s.is_err() {
                    return;
                }
            }
        }
    }
}
