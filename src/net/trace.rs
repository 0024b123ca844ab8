//! Network event tracing.
//!
//! Only initiating events are reported: writes but not reads, dials but
//! not accepts. One side of each exchange is enough to reconstruct the
//! whole picture, and on synchronous transports tracing both would
//! double every event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Conn, Listener, Networker};
use crate::common::Addr;
use crate::error::Result;

/// Receiver of network trace events.
///
/// Events are delivered synchronously on the task performing the traced
/// operation; a receiver that needs cross-task ordering brings its own
/// synchronization.
pub trait TraceReceiver: Send + Sync {
    fn trace_dial(&self, ev: TraceDial);
    fn trace_connect(&self, ev: TraceConnect);
    fn trace_listen(&self, ev: TraceListen);
    fn trace_tx(&self, ev: TraceTx);
}

/// A dial was initiated.
#[derive(Debug, Clone)]
pub struct TraceDial {
    pub dialer: String,
    pub addr: String,
}

/// A connection was established.
#[derive(Debug, Clone)]
pub struct TraceConnect {
    pub src: Addr,
    pub dst: Addr,
    pub dialed: String,
}

/// A listener was started.
#[derive(Debug, Clone)]
pub struct TraceListen {
    pub laddr: Addr,
}

/// Data was transmitted (one event per successful write).
#[derive(Debug, Clone)]
pub struct TraceTx {
    pub src: Addr,
    pub dst: Addr,
    pub pkt: Vec<u8>,
}

struct TraceState {
    rx: Arc<dyn TraceReceiver>,
    on: AtomicBool,
}

impl TraceState {
    fn enabled(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

/// Wraps an underlying [`Networker`] with an event tracing layer.
///
/// Tracing starts enabled and can be switched at runtime.
pub struct Tracer {
    inner: Arc<dyn Networker>,
    state: Arc<TraceState>,
}

impl Tracer {
    pub fn new(inner: Arc<dyn Networker>, rx: Arc<dyn TraceReceiver>) -> Tracer {
        Tracer {
            inner,
            state: Arc::new(TraceState {
                rx,
                on: AtomicBool::new(true),
            }),
        }
    }

    /// (Re)enable delivery of trace events.
    pub fn trace_on(&self) {
        self.state.on.store(true, Ordering::SeqCst);
    }

    /// Disable delivery of trace events.
    pub fn trace_off(&self) {
        self.state.on.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Networker for Tracer {
    fn network(&self) -> String {
        self.inner.network()
    }

    fn name(&self) -> String {
        self.inner.name()
    }

    async fn dial(&self, ctx: &CancellationToken, addr: &str) -> Result<Box<dyn Conn>> {
        if self.state.enabled() {
            self.state.rx.trace_dial(TraceDial {
                dialer: self.inner.name(),
                addr: addr.to_string(),
            });
        }
        let conn = self.inner.dial(ctx, addr).await?;
        if self.state.enabled() {
            self.state.rx.trace_connect(TraceConnect {
                src: conn.local_addr(),
                dst: conn.remote_addr(),
                dialed: addr.to_string(),
            });
        }
        Ok(Box::new(TraceConn {
            state: self.state.clone(),
            inner: conn,
        }))
    }

    async fn listen(&self, ctx: &CancellationToken, laddr: &str) -> Result<Box<dyn Listener>> {
        let l = self.inner.listen(ctx, laddr).await?;
        if self.state.enabled() {
            self.state.rx.trace_listen(TraceListen { laddr: l.addr() });
        }
        Ok(Box::new(TraceListener {
            state: self.state.clone(),
            inner: l,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Wraps accepted connections so their writes are traced too.
struct TraceListener {
    state: Arc<TraceState>,
    inner: Box<dyn Listener>,
}

#[async_trait]
impl Listener for TraceListener {
    async fn accept(&self, ctx: &CancellationToken) -> Result<Box<dyn Conn>> {
        let conn = self.inner.accept(ctx).await?;
        Ok(Box::new(TraceConn {
            state: self.state.clone(),
            inner: conn,
        }))
    }

    fn addr(&self) -> Addr {
        self.inner.addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct TraceConn {
    state: Arc<TraceState>,
    inner: Box<dyn Conn>,
}

#[async_trait]
impl Conn for TraceConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf).await?;
        if self.state.enabled() {
            self.state.rx.trace_tx(TraceTx {
                src: self.inner.local_addr(),
                dst: self.inner.remote_addr(),
                pkt: buf[..n].to_vec(),
            });
        }
        Ok(n)
    }

    fn local_addr(&self) -> Addr {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> Addr {
        self.inner.remote_addr()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipenet;
    use std::sync::Mutex;

    /// Records a compact line per event.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock().unwrap())
        }

        fn push(&self, line: String) {
            self.events.lock().unwrap().push(line);
        }
    }

    impl TraceReceiver for Recorder {
        fn trace_dial(&self, ev: TraceDial) {
            self.push(format!("dial {} -> {}", ev.dialer, ev.addr));
        }

        fn trace_connect(&self, ev: TraceConnect) {
            self.push(format!("connect {} -> {}", ev.src, ev.dst));
        }

        fn trace_listen(&self, ev: TraceListen) {
            self.push(format!("listen {}", ev.laddr));
        }

        fn trace_tx(&self, ev: TraceTx) {
            self.push(format!(
                "tx {} -> {} {:?}",
                ev.src,
                ev.dst,
                String::from_utf8_lossy(&ev.pkt)
            ));
        }
    }

    fn bg() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_events() {
        let net = pipenet::Network::new("trace");
        let ha = net.host("α").await;
        let hb = net.host("β").await;

        let rx = Arc::new(Recorder::default());
        let ta = Tracer::new(Arc::new(ha), rx.clone());
        let tb = Tracer::new(Arc::new(hb), rx.clone());

        let l = ta.listen(&bg(), "").await.unwrap();
        assert_eq!(rx.take(), vec!["listen α:1"]);

        let srv = tokio::spawn(async move {
            let c = l.accept(&bg()).await.unwrap();
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < 4 {
                let n = c.read(&mut buf[got..]).await.unwrap();
                got += n;
            }
            (l, c)
        });

        let c = tb.dial(&bg(), "α:1").await.unwrap();
        c.write(b"ping").await.unwrap();
        let (_l, _cs) = srv.await.unwrap();

        assert_eq!(
            rx.take(),
            vec![
                "dial β -> α:1",
                "connect β:1 -> α:2",
                "tx β:1 -> α:2 \"ping\"",
            ]
        );

        // disabled tracing reports nothing
        tb.trace_off();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < 4 {
                got += _cs.read(&mut buf[got..]).await.unwrap();
            }
        });
        let mut done = 0;
        while done < 4 {
            done += c.write(&b"more"[done..]).await.unwrap();
        }
        reader.await.unwrap();
        assert!(rx.take().is_empty());

        net.close().await.unwrap();
    }
}
