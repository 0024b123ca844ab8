//! TCP-like virtual network state machine.
//!
//! A virtual network consists of [`SubNetwork`]s, each home to named
//! [`Host`]s. A host is a [`Networker`] and is used like a regular TCP
//! access point with dial/listen/accept, but its port allocation is
//! predictable: ports of a host are a contiguous integer sequence
//! starting from 1, all initially free, and autobind always takes the
//! first free one. That lets tests assert on exact network events. Host
//! names are unique through the whole network.
//!
//! A realization plugs an [`Engine`] (transport) and a [`Registry`]
//! (host directory) into [`SubNetwork::new`] and receives a [`Notifier`]
//! to route incoming connections and fatal transport errors back into
//! the subnetwork. See the `pipenet` (in-process) and `lonet`
//! (cross-process) realizations.

mod interfaces;
#[cfg(test)]
pub(crate) mod testsuite;

pub use interfaces::{Accept, Engine, Registry};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{parse_addr, Addr};
use crate::error::{Error, Result};
use crate::io::RawConn;
use crate::net::{Conn, Listener, Networker};

// ============================================================================
// SubNetwork
// ============================================================================

/// One subnetwork of a virtual network. Cheap to clone.
#[derive(Clone)]
pub struct SubNetwork {
    state: Arc<NetState>,
}

struct NetState {
    network: String,
    engine: Box<dyn Engine>,
    registry: Box<dyn Registry>,
    hosts: Mutex<HashMap<String, Host>>,
    down: CancellationToken,
    down_err: Mutex<Option<Arc<Error>>>,
    shut: OnceCell<()>,
}

impl SubNetwork {
    /// Create a subnetwork from realization parts.
    ///
    /// Returns the subnetwork together with the [`Notifier`] the
    /// realization must use to deliver events into it.
    pub fn new(
        network: impl Into<String>,
        engine: Box<dyn Engine>,
        registry: Box<dyn Registry>,
    ) -> (SubNetwork, Notifier) {
        let state = Arc::new(NetState {
            network: network.into(),
            engine,
            registry,
            hosts: Mutex::new(HashMap::new()),
            down: CancellationToken::new(),
            down_err: Mutex::new(None),
            shut: OnceCell::new(),
        });
        let notifier = Notifier {
            subnet: Arc::downgrade(&state),
        };
        (SubNetwork { state }, notifier)
    }

    /// Full name of the network this subnetwork is part of.
    pub fn network(&self) -> String {
        self.state.network.clone()
    }

    /// Create a new host on the subnetwork.
    ///
    /// Host names are unique through the whole network; announcing a
    /// duplicate fails with a `HostDup` cause.
    pub async fn new_host(&self, ctx: &CancellationToken, name: &str) -> Result<Host> {
        let st = &self.state;
        if st.down.is_cancelled() {
            return Err(Error::NetDown);
        }

        tokio::select! {
            biased;
            _ = st.down.cancelled() => return Err(Error::NetDown),
            _ = ctx.cancelled() => return Err(Error::Canceled),
            r = st.engine.new_host(ctx, name, st.registry.as_ref()) => {
                r.map_err(|e| {
                    if st.down.is_cancelled() && !ctx.is_cancelled() {
                        Error::NetDown
                    } else {
                        e
                    }
                })?;
            }
        }

        // announced ok -> the host can be created
        let host = Host {
            state: Arc::new(HostState {
                subnet: Arc::downgrade(st),
                network: st.network.clone(),
                name: name.to_string(),
                socks: Mutex::new(Vec::new()),
                down: CancellationToken::new(),
                shut: OnceCell::new(),
            }),
        };

        let mut hosts = st.hosts.lock().unwrap();
        if hosts.contains_key(name) {
            panic!("virtnet: host {:?} announced ok but already present", name);
        }
        hosts.insert(name.to_string(), host.clone());
        Ok(host)
    }

    /// Look up a host on the subnetwork by name.
    pub fn host(&self, name: &str) -> Option<Host> {
        self.state.hosts.lock().unwrap().get(name).cloned()
    }

    /// Shut the subnetwork down.
    ///
    /// Recursively interrupts all blocking operations and closes every
    /// host, then the engine and the registry. Idempotent; repeated calls
    /// return the same error.
    pub async fn close(&self) -> Result<()> {
        net_shutdown(&self.state, None).await
    }
}

/// Shutdown worker shared by close and `Notifier::vnet_down`.
async fn net_shutdown(st: &Arc<NetState>, cause: Option<Error>) -> Result<()> {
    st.shut
        .get_or_init(|| async {
            st.down.cancel();
            debug!(network = %st.network, "virtnet: shutting down");

            let hosts: Vec<Host> = st.hosts.lock().unwrap().values().cloned().collect();
            for host in hosts {
                host.shutdown().await;
            }

            let mut errv = Vec::new();
            if let Some(err) = cause {
                errv.push(err);
            }
            if let Err(err) = st.engine.close().await {
                errv.push(err);
            }
            if let Err(err) = st.registry.close().await {
                errv.push(err);
            }
            *st.down_err.lock().unwrap() = Error::merge(errv).map(Arc::new);
        })
        .await;

    match &*st.down_err.lock().unwrap() {
        Some(err) => Err(Error::Shared(err.clone())),
        None => Ok(()),
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Event surface a realization uses to notify its subnetwork.
#[derive(Clone)]
pub struct Notifier {
    subnet: Weak<NetState>,
}

impl Notifier {
    /// Route an incoming connection to the listener at `dst`.
    ///
    /// On success the connection is pre-accepted; the engine completes
    /// the rendezvous through [`Accept::ack`]. The error comes without
    /// any "accept" wrapping — that context belongs to the realization
    /// using it.
    pub async fn vnet_accept(
        &self,
        ctx: &CancellationToken,
        src: Addr,
        dst: Addr,
        raw: Arc<dyn RawConn>,
    ) -> Result<Accept> {
        let Some(st) = self.subnet.upgrade() else {
            return Err(Error::NetDown);
        };

        let host = st.hosts.lock().unwrap().get(&dst.host).cloned();
        let Some(host) = host else {
            return Err(Error::NoHost);
        };

        let listener = {
            let socks = host.state.socks.lock().unwrap();
            socks
                .get(dst.port as usize)
                .and_then(|slot| slot.as_ref())
                .and_then(|slot| slot.listener.clone())
        };
        let Some(listener) = listener else {
            return Err(Error::ConnRefused);
        };

        let (resp_tx, mut resp_rx) = oneshot::channel();
        let req = DialReq {
            from: src,
            raw,
            resp: resp_tx,
        };
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Canceled),
            _ = listener.state.down.cancelled() => return Err(Error::ConnRefused),
            r = listener.state.dialq_tx.send(req) => {
                if r.is_err() {
                    return Err(Error::ConnRefused);
                }
            }
        }

        // the request may still sit in the queue when the listener goes
        // down, so the reply must not be awaited unconditionally; an
        // abandoned reply channel makes the listener drop the request
        tokio::select! {
            biased;
            r = &mut resp_rx => match r {
                Ok(accept) => Ok(accept),
                Err(_) => Err(Error::ConnRefused),
            },
            _ = listener.state.down.cancelled() => Err(Error::ConnRefused),
            _ = ctx.cancelled() => Err(Error::Canceled),
        }
    }

    /// Shut the subnetwork down because the underlying network failed.
    pub async fn vnet_down(&self, err: Error) {
        if let Some(st) = self.subnet.upgrade() {
            let _ = net_shutdown(&st, Some(err)).await;
        }
    }
}

// ============================================================================
// Host
// ============================================================================

/// Named access point on a virtual network. Cheap to clone.
///
/// A host belongs to a [`SubNetwork`], has a name and an array of
/// sockets indexed by port, and implements [`Networker`]. It is safe to
/// use from multiple tasks simultaneously.
#[derive(Clone)]
pub struct Host {
    state: Arc<HostState>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("network", &self.state.network)
            .field("name", &self.state.name)
            .finish()
    }
}

struct HostState {
    subnet: Weak<NetState>,
    network: String,
    name: String,
    // port -> socket slot; index 0 is always free
    socks: Mutex<Vec<Option<Slot>>>,
    down: CancellationToken,
    shut: OnceCell<()>,
}

/// Socket slot at (host, port): at most one listener and one conn, both
/// briefly non-empty during accept. The slot is reclaimed when both are
/// gone.
#[derive(Default)]
struct Slot {
    conn: Option<VConn>,
    listener: Option<VListener>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.conn.is_none() && self.listener.is_none()
    }
}

/// Allocate the first free port, growing the slot array as needed.
fn alloc_port(socks: &mut Vec<Option<Slot>>) -> u32 {
    if socks.is_empty() {
        socks.push(None); // port 0 is reserved for autobind requests
    }
    let mut port = 1;
    while port < socks.len() && socks[port].is_some() {
        port += 1;
    }
    while port >= socks.len() {
        socks.push(None);
    }
    socks[port] = Some(Slot::default());
    port as u32
}

fn alloc_socket(host: &HostState) -> u32 {
    alloc_port(&mut host.socks.lock().unwrap())
}

fn free_socket(host: &HostState, port: u32) {
    let mut socks = host.socks.lock().unwrap();
    if let Some(slot) = socks.get_mut(port as usize) {
        *slot = None;
    }
}

impl Host {
    pub fn network(&self) -> String {
        self.state.network.clone()
    }

    pub fn name(&self) -> String {
        self.state.name.clone()
    }

    /// Appropriate cause when this host's down signal is found ready.
    fn err_down(&self) -> Error {
        host_err_down(&self.state)
    }

    async fn shutdown(&self) {
        let st = &self.state;
        st.shut
            .get_or_init(|| async {
                st.down.cancel();

                let (conns, listeners) = {
                    let socks = st.socks.lock().unwrap();
                    let mut conns = Vec::new();
                    let mut listeners = Vec::new();
                    for slot in socks.iter().flatten() {
                        if let Some(conn) = &slot.conn {
                            conns.push(conn.clone());
                        }
                        if let Some(listener) = &slot.listener {
                            listeners.push(listener.clone());
                        }
                    }
                    (conns, listeners)
                };
                for listener in listeners {
                    listener.state.down.cancel();
                }
                for conn in conns {
                    conn.shutdown().await;
                }
            })
            .await;
    }

    /// Parse `addr` from this host's point of view: an empty host
    /// component, as in ":0", resolves to the host itself.
    fn parse_addr(&self, addr: &str) -> Result<Addr> {
        let mut a = parse_addr(&self.state.network, addr)?;
        if a.host.is_empty() {
            a.host = self.state.name.clone();
        }
        Ok(a)
    }

    async fn do_listen(&self, ctx: &CancellationToken, a: &Addr) -> Result<VListener> {
        let st = &self.state;

        // cannot listen on other hosts
        if a.host != st.name {
            return Err(Error::AddrNoListen);
        }
        if st.down.is_cancelled() {
            return Err(self.err_down());
        }
        if ctx.is_cancelled() {
            return Err(Error::Canceled);
        }

        let mut socks = st.socks.lock().unwrap();
        let port = if a.port == 0 {
            alloc_port(&mut socks)
        } else {
            let p = a.port as usize;
            while p >= socks.len() {
                socks.push(None);
            }
            if socks[p].is_some() {
                return Err(Error::AddrAlreadyUsed);
            }
            socks[p] = Some(Slot::default());
            a.port
        };

        let (dialq_tx, dialq_rx) = mpsc::channel(1);
        let listener = VListener {
            state: Arc::new(ListenerState {
                host: Arc::downgrade(st),
                port,
                addr: Addr::new(st.network.clone(), st.name.clone(), port),
                dialq_tx,
                dialq_rx: tokio::sync::Mutex::new(dialq_rx),
                down: CancellationToken::new(),
                unregistered: AtomicBool::new(false),
            }),
        };
        socks[port as usize].as_mut().unwrap().listener = Some(listener.clone());
        Ok(listener)
    }

    async fn do_dial(&self, ctx: &CancellationToken, addr: &str) -> Result<Box<dyn Conn>> {
        let st = &self.state;

        // allocate the local socket first, so even a failed dial reports
        // who was dialing
        let port = alloc_socket(st);
        let src = Addr::new(st.network.clone(), st.name.clone(), port);

        match self.dial_from(ctx, &src, addr).await {
            Ok(conn) => Ok(conn),
            Err((dst, err)) => {
                free_socket(st, port);
                Err(Error::op("dial", st.network.clone(), Some(src), dst, err))
            }
        }
    }

    async fn dial_from(
        &self,
        ctx: &CancellationToken,
        src: &Addr,
        addr: &str,
    ) -> std::result::Result<Box<dyn Conn>, (Option<Addr>, Error)> {
        let st = &self.state;

        let dst = self.parse_addr(addr).map_err(|e| (None, e))?;

        let subnet = match st.subnet.upgrade() {
            Some(n) => n,
            None => return Err((Some(dst), Error::NetDown)),
        };

        let down_err = || {
            if subnet.down.is_cancelled() {
                Error::NetDown
            } else {
                Error::HostDown
            }
        };
        // shutdown must dominate a cancellation it itself caused
        let shutdown_or = |err: Error| {
            if (st.down.is_cancelled() || subnet.down.is_cancelled()) && !ctx.is_cancelled() {
                down_err()
            } else {
                err
            }
        };

        let hostdata = tokio::select! {
            biased;
            _ = st.down.cancelled() => Err(down_err()),
            _ = ctx.cancelled() => Err(Error::Canceled),
            r = subnet.registry.query(ctx, &dst.host) => r.map_err(shutdown_or),
        }
        .map_err(|e| (Some(dst.clone()), e))?;

        let (raw, accept_addr) = tokio::select! {
            biased;
            _ = st.down.cancelled() => Err(down_err()),
            _ = ctx.cancelled() => Err(Error::Canceled),
            r = subnet.engine.dial(ctx, src, &dst, &hostdata) => r.map_err(shutdown_or),
        }
        .map_err(|e| (Some(dst.clone()), e))?;

        // handshake performed ok - bind the connection
        let conn = VConn::bind(st, src.port, src.clone(), accept_addr, raw);
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl Networker for Host {
    fn network(&self) -> String {
        Host::network(self)
    }

    fn name(&self) -> String {
        Host::name(self)
    }

    /// Dial an address on the network: connects to an accept pending on
    /// the listener bound at `addr`.
    async fn dial(&self, ctx: &CancellationToken, addr: &str) -> Result<Box<dyn Conn>> {
        self.do_dial(ctx, addr).await
    }

    /// Start a new listener, autobinding the first free port when `laddr`
    /// is empty or has port 0.
    async fn listen(&self, ctx: &CancellationToken, laddr: &str) -> Result<Box<dyn Listener>> {
        let laddr = if laddr.is_empty() { ":0" } else { laddr };
        let st = &self.state;

        let a = match self.parse_addr(laddr) {
            Ok(a) => a,
            Err(err) => return Err(Error::op("listen", st.network.clone(), None, None, err)),
        };
        match self.do_listen(ctx, &a).await {
            Ok(l) => Ok(Box::new(l)),
            Err(err) => Err(Error::op("listen", st.network.clone(), None, Some(a), err)),
        }
    }

    /// Shut the host down: no new connections can be established to or
    /// from it and all currently established ones are shut down.
    async fn close(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }
}

fn host_err_down(host: &HostState) -> Error {
    let net_down = match host.subnet.upgrade() {
        Some(n) => n.down.is_cancelled(),
        None => true,
    };
    if net_down {
        Error::NetDown
    } else if host.down.is_cancelled() {
        Error::HostDown
    } else {
        Error::SockDown
    }
}

// ============================================================================
// listener
// ============================================================================

/// One dial request conveyed from the engine to a listener.
struct DialReq {
    from: Addr,
    raw: Arc<dyn RawConn>,
    resp: oneshot::Sender<Accept>,
}

#[derive(Clone)]
struct VListener {
    state: Arc<ListenerState>,
}

struct ListenerState {
    host: Weak<HostState>,
    port: u32,
    addr: Addr,
    dialq_tx: mpsc::Sender<DialReq>,
    dialq_rx: tokio::sync::Mutex<mpsc::Receiver<DialReq>>,
    down: CancellationToken,
    unregistered: AtomicBool,
}

impl VListener {
    fn err_down(&self) -> Error {
        match self.state.host.upgrade() {
            Some(host) => host_err_down(&host),
            None => Error::NetDown,
        }
    }

    async fn accept_one(&self, ctx: &CancellationToken) -> Result<Box<dyn Conn>> {
        let st = &self.state;
        loop {
            let req = {
                let mut dialq = st.dialq_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = st.down.cancelled() => return Err(self.err_down()),
                    _ = ctx.cancelled() => return Err(Error::Canceled),
                    r = dialq.recv() => match r {
                        Some(req) => req,
                        None => return Err(self.err_down()),
                    },
                }
            };

            let host = match st.host.upgrade() {
                Some(h) => h,
                None => return Err(Error::NetDown),
            };

            // the dialer is here - allocate an empty socket so the accept
            // address is known
            let port = alloc_socket(&host);
            let addr = Addr::new(st.addr.net.clone(), host.name.clone(), port);

            let (ack_tx, mut ack_rx) = oneshot::channel();
            if req
                .resp
                .send(Accept {
                    addr: addr.clone(),
                    ack: ack_tx,
                })
                .is_err()
            {
                // the dialer gave up
                free_socket(&host, port);
                continue;
            }

            tokio::select! {
                biased;
                _ = st.down.cancelled() => {
                    // the engine was slow and we have to go down: it may
                    // still convey the connection, so keep receiving on
                    // ack in the background, dispose of the conveyed
                    // connection and free the socket
                    let raw = req.raw;
                    let host_ref = st.host.clone();
                    tokio::spawn(async move {
                        if let Ok(Ok(())) = ack_rx.await {
                            let _ = raw.close().await;
                        }
                        if let Some(host) = host_ref.upgrade() {
                            free_socket(&host, port);
                        }
                    });
                    return Err(self.err_down());
                }
                r = &mut ack_rx => {
                    match r {
                        Ok(Ok(())) => {
                            let conn = VConn::bind(&host, port, addr, req.from, req.raw);
                            return Ok(Box::new(conn));
                        }
                        // handshake failed - unallocate and keep waiting
                        _ => {
                            free_socket(&host, port);
                            continue;
                        }
                    }
                }
            }
        }
    }

    fn unregister(&self) {
        let st = &self.state;
        st.down.cancel();
        if !st.unregistered.swap(true, Ordering::SeqCst) {
            if let Some(host) = st.host.upgrade() {
                let mut socks = host.socks.lock().unwrap();
                if let Some(Some(slot)) = socks.get_mut(st.port as usize) {
                    slot.listener = None;
                    if slot.is_empty() {
                        socks[st.port as usize] = None;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Listener for VListener {
    async fn accept(&self, ctx: &CancellationToken) -> Result<Box<dyn Conn>> {
        match self.accept_one(ctx).await {
            Ok(conn) => Ok(conn),
            Err(err) => Err(Error::op(
                "accept",
                self.state.addr.net.clone(),
                None,
                Some(self.state.addr.clone()),
                err,
            )),
        }
    }

    fn addr(&self) -> Addr {
        self.state.addr.clone()
    }

    async fn close(&self) -> Result<()> {
        self.unregister();
        Ok(())
    }
}

// ============================================================================
// conn
// ============================================================================

#[derive(Clone)]
struct VConn {
    state: Arc<ConnState>,
}

struct ConnState {
    host: Weak<HostState>,
    port: u32,
    local: Addr,
    peer: Addr,
    raw: Arc<dyn RawConn>,
    // cancelled on shutdown; doubles as the raw IO interrupt
    down: CancellationToken,
    shut: OnceCell<Option<Arc<Error>>>,
    unregistered: AtomicBool,
}

impl VConn {
    /// Create a conn over `raw` and attach it to the pre-allocated slot.
    fn bind(host: &Arc<HostState>, port: u32, local: Addr, peer: Addr, raw: Arc<dyn RawConn>) -> VConn {
        let conn = VConn {
            state: Arc::new(ConnState {
                host: Arc::downgrade(host),
                port,
                local,
                peer,
                raw,
                down: CancellationToken::new(),
                shut: OnceCell::new(),
                unregistered: AtomicBool::new(false),
            }),
        };
        let mut socks = host.socks.lock().unwrap();
        if let Some(Some(slot)) = socks.get_mut(port as usize) {
            slot.conn = Some(conn.clone());
        }
        conn
    }

    /// Close the underlying channel, once; remembers its close error.
    async fn shutdown(&self) -> Option<Arc<Error>> {
        let st = &self.state;
        st.shut
            .get_or_init(|| async {
                st.down.cancel();
                st.raw.close().await.err().map(Arc::new)
            })
            .await
            .clone()
    }

    /// Translate `err` into the shutdown cause if this conn was shut
    /// down, with subnet > host > socket precedence.
    fn err_or_down(&self, err: Error) -> Error {
        let st = &self.state;
        if !st.down.is_cancelled() {
            return err;
        }
        match st.host.upgrade() {
            Some(host) => host_err_down(&host),
            None => Error::NetDown,
        }
    }
}

#[async_trait]
impl Conn for VConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let st = &self.state;
        match st.raw.read(&st.down, buf).await {
            // EOF passes through untouched
            Ok(n) => Ok(n),
            Err(err) => {
                let err = if err.is_timeout() {
                    err
                } else {
                    self.err_or_down(err)
                };
                Err(Error::op(
                    "read",
                    st.local.net.clone(),
                    Some(st.peer.clone()),
                    Some(st.local.clone()),
                    err,
                ))
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let st = &self.state;
        match st.raw.write(&st.down, buf).await {
            Ok(n) => Ok(n),
            Err(err) => {
                let err = if err.is_timeout() {
                    err
                } else {
                    self.err_or_down(err)
                };
                Err(Error::op(
                    "write",
                    st.local.net.clone(),
                    Some(st.local.clone()),
                    Some(st.peer.clone()),
                    err,
                ))
            }
        }
    }

    fn local_addr(&self) -> Addr {
        self.state.local.clone()
    }

    fn remote_addr(&self) -> Addr {
        self.state.peer.clone()
    }

    async fn close(&self) -> Result<()> {
        let err = self.shutdown().await;
        let st = &self.state;
        if !st.unregistered.swap(true, Ordering::SeqCst) {
            if let Some(host) = st.host.upgrade() {
                let mut socks = host.socks.lock().unwrap();
                if let Some(Some(slot)) = socks.get_mut(st.port as usize) {
                    slot.conn = None;
                    if slot.is_empty() {
                        socks[st.port as usize] = None;
                    }
                }
            }
        }
        match err {
            Some(err) => Err(Error::Shared(err)),
            None => Ok(()),
        }
    }
}
