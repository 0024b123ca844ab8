//! TCP network simulated on top of localhost loopback.
//!
//! Like `pipenet`, addresses are host:port pairs with predictable port
//! allocation, but the system under test may span several OS-level
//! processes: every subnetwork keeps one OS listener on `127.0.0.1` and
//! a shared on-disk registry resolves virtual host names to those
//! OS-level addresses, e.g. α:1 and β:1 to 127.0.0.1:4567 and
//! 127.0.0.1:8765. Established connections are served by ordinary
//! loopback TCP.
//!
//! ```no_run
//! # async fn demo() -> virtnet::Result<()> {
//! use tokio_util::sync::CancellationToken;
//! use virtnet::net::{Listener, Networker};
//!
//! let ctx = CancellationToken::new();
//! let net = virtnet::lonet::join(&ctx, "mynet").await?;
//! let ha = net.new_host(&ctx, "α").await?;
//! let hb = net.new_host(&ctx, "β").await?;
//!
//! let l = ha.listen(&ctx, ":10").await?; // listens on "α:10"
//! let _srv = tokio::spawn(async move {
//!     let ctx = CancellationToken::new();
//!     l.accept(&ctx).await // local address "α:1"
//! });
//! let _c = hb.dial(&ctx, "α:10").await?; // "β:1" <-> "α:1"
//! # Ok(())
//! # }
//! ```
//!
//! # Wire exchange
//!
//! After the dialer opens an OS-level connection to the acceptor's main
//! address it asks to establish a virtual connection on top of it:
//!
//! ```text
//! > lonet "<network>" dial "<α:portα>" "<β:portβ>"
//! ```
//!
//! The acceptor either routes the connection to the listener bound at
//! that port and confirms with the freshly accepted address:
//!
//! ```text
//! < lonet "<network>" connected "<β:portβ'>"
//! ```
//!
//! or rejects:
//!
//! ```text
//! < lonet "<network>" E "<reason>"
//! ```
//!
//! From `connected` on, the OS connection carries the payload directly.

mod registry;
mod wire;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{parse_addr, Addr};
use crate::error::{Error, Result};
use crate::io::{read_line, write_all, CtxListener, RawConn, StreamConn};
use crate::virtnet::{Engine, Notifier, Registry, SubNetwork};

use self::registry::SqliteRegistry;
use self::wire::{dial_line, parse_dial, parse_reply, reply_line, MAX_LINE};

const NET_PREFIX: &str = "lonet"; // this module creates only "lonet*" networks

/// Join or create the lonet network `network`.
///
/// The name lives under the "lonet" namespace: "α" gives the full
/// network name "lonetα". An empty name creates a fresh network with a
/// random unique name. The registry database lives at
/// `<tmp>/lonet/<network>/registry.db`, so subnetworks of other OS
/// processes joining the same name end up on the same network.
pub async fn join(ctx: &CancellationToken, network: &str) -> Result<SubNetwork> {
    if ctx.is_cancelled() {
        return Err(Error::Canceled);
    }

    let root = std::env::temp_dir().join(NET_PREFIX);
    std::fs::create_dir_all(&root)?;

    let (network, netdir) = if network.is_empty() {
        fresh_netdir(&root)?
    } else {
        let dir = root.join(network);
        std::fs::create_dir_all(&dir)?;
        (network.to_string(), dir)
    };

    let dbpath = netdir.join("registry.db");
    let dbpath = dbpath
        .to_str()
        .ok_or_else(|| Error::Other("registry path is not valid UTF-8".to_string()))?;
    let registry = SqliteRegistry::open(dbpath, &network).await?;

    let oslistener = match tokio::net::TcpListener::bind("127.0.0.1:0").await {
        Ok(l) => l,
        Err(err) => {
            let _ = registry.close().await;
            return Err(Error::Io(err));
        }
    };

    let engine = LonetEngine::new(oslistener)?;
    let (subnet, notifier) = SubNetwork::new(
        format!("{NET_PREFIX}{network}"),
        Box::new(engine.clone()),
        Box::new(registry),
    );
    engine.start(notifier, subnet.network());

    debug!(network = %subnet.network(), addr = %engine.osaddr(), "lonet: joined");
    Ok(subnet)
}

/// Pick a fresh uniquely-named network directory under `root`.
fn fresh_netdir(root: &Path) -> Result<(String, PathBuf)> {
    loop {
        let name = format!("{:08x}", rand::random::<u32>());
        let dir = root.join(&name);
        match std::fs::create_dir(&dir) {
            Ok(()) => return Ok((name, dir)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

// ============================================================================
// engine
// ============================================================================

/// Engine serving one subnetwork over an OS-level loopback listener.
#[derive(Clone)]
struct LonetEngine {
    state: Arc<EngineState>,
}

struct EngineState {
    oslistener: Arc<CtxListener>,
    osaddr: std::net::SocketAddr,
    serve_cancel: CancellationToken,
    serve: Mutex<Option<JoinHandle<()>>>,
    // bound right after the subnetwork is created
    notifier: OnceLock<Notifier>,
    network: OnceLock<String>,
}

impl LonetEngine {
    fn new(raw: tokio::net::TcpListener) -> Result<LonetEngine> {
        let oslistener = CtxListener::new(raw)?;
        Ok(LonetEngine {
            state: Arc::new(EngineState {
                osaddr: oslistener.local_addr(),
                oslistener: Arc::new(oslistener),
                serve_cancel: CancellationToken::new(),
                serve: Mutex::new(None),
                notifier: OnceLock::new(),
                network: OnceLock::new(),
            }),
        })
    }

    fn osaddr(&self) -> std::net::SocketAddr {
        self.state.osaddr
    }

    fn network(&self) -> String {
        self.state.network.get().cloned().unwrap_or_default()
    }

    fn start(&self, notifier: Notifier, network: String) {
        let state = &self.state;
        let _ = state.notifier.set(notifier);
        let _ = state.network.set(network);
        let handle = tokio::spawn(serve(self.state.clone()));
        *state.serve.lock().unwrap() = Some(handle);
    }
}

/// Accept OS-level connections of this subnetwork and handshake on them.
async fn serve(state: Arc<EngineState>) {
    let notifier = state
        .notifier
        .get()
        .cloned()
        .expect("lonet engine started without notifier");
    let network = state.network.get().cloned().unwrap_or_default();
    let mut handshakes = JoinSet::new();

    loop {
        let (osconn, os_peer) = match state.oslistener.accept(&state.serve_cancel).await {
            Ok(pair) => pair,
            Err(err) => {
                if !state.serve_cancel.is_cancelled() {
                    // transport failure: take the subnetwork down. Done
                    // from a fresh task - the shutdown joins this one.
                    let notifier = notifier.clone();
                    tokio::spawn(async move { notifier.vnet_down(err).await });
                }
                break;
            }
        };

        let ctx = state.serve_cancel.clone();
        let notifier = notifier.clone();
        let network = network.clone();
        handshakes.spawn(async move {
            let raw = Arc::new(StreamConn::new(osconn));
            if let Err(err) = accept_handshake(&notifier, &network, &ctx, &raw).await {
                let _ = raw.close().await;
                match err.cause() {
                    // routine rejections are not worth logging
                    Error::ConnRefused | Error::Canceled => {}
                    _ => warn!(network = %network, peer = %os_peer, "lonet: handshake failed: {err}"),
                }
            }
        });
    }

    // handshakes watch the serve token; collect them before leaving
    while handshakes.join_next().await.is_some() {}
}

/// Acceptor side of the handshake on one freshly accepted OS connection.
///
/// On success the connection has been conveyed to a listener's accept;
/// on error the caller closes it.
async fn accept_handshake(
    notifier: &Notifier,
    network: &str,
    ctx: &CancellationToken,
    raw: &Arc<StreamConn<TcpStream>>,
) -> Result<()> {
    let line = read_line(raw.as_ref(), ctx, MAX_LINE).await?;

    let (peer_net, src, dst) = match parse_dial(&line) {
        Ok(fields) => fields,
        Err(err) => {
            let _ = send_reply(raw, ctx, network, "E", "invalid dial request").await;
            return Err(err);
        }
    };

    if peer_net != network {
        let _ = send_reply(raw, ctx, network, "E", "network mismatch").await;
        return Err(Error::Protocol(format!("network mismatch: {peer_net:?}")));
    }

    let asrc = match parse_addr(network, &src) {
        Ok(a) => a,
        Err(_) => {
            let _ = send_reply(raw, ctx, network, "E", "src address invalid").await;
            return Err(Error::Protocol(format!("src address invalid: {src:?}")));
        }
    };
    let adst = match parse_addr(network, &dst) {
        Ok(a) => a,
        Err(_) => {
            let _ = send_reply(raw, ctx, network, "E", "dst address invalid").await;
            return Err(Error::Protocol(format!("dst address invalid: {dst:?}")));
        }
    };

    let raw_conn: Arc<dyn RawConn> = raw.clone();
    let accept = match notifier.vnet_accept(ctx, asrc, adst, raw_conn).await {
        Ok(accept) => accept,
        Err(err) => {
            let _ = send_reply(raw, ctx, network, "E", &err.to_string()).await;
            return Err(err);
        }
    };

    // commit: confirm to the dialer and convey the outcome of that
    // write to the waiting accept
    match send_reply(raw, ctx, network, "connected", &accept.addr.to_string()).await {
        Ok(()) => {
            let _ = accept.ack.send(Ok(()));
            Ok(())
        }
        Err(err) => {
            let msg = err.to_string();
            let _ = accept.ack.send(Err(err));
            Err(Error::Other(msg))
        }
    }
}

async fn send_reply(
    raw: &StreamConn<TcpStream>,
    ctx: &CancellationToken,
    network: &str,
    verb: &str,
    arg: &str,
) -> Result<()> {
    write_all(raw, ctx, reply_line(network, verb, arg).as_bytes()).await
}

/// Dialer side of the handshake; returns the address the remote listener
/// accepted with.
async fn connect_handshake(
    network: &str,
    ctx: &CancellationToken,
    raw: &StreamConn<TcpStream>,
    src: &Addr,
    dst: &Addr,
) -> Result<Addr> {
    let line = dial_line(network, &src.to_string(), &dst.to_string());
    write_all(raw, ctx, line.as_bytes()).await?;

    let line = read_line(raw, ctx, MAX_LINE).await?;
    let (peer_net, verb, arg) = parse_reply(&line)?;

    match verb.as_str() {
        "E" => Err(match arg.as_str() {
            // canonical errors travel as their literal reason
            "connection refused" => Error::ConnRefused,
            other => Error::Other(other.to_string()),
        }),
        "connected" => {
            if peer_net != network {
                return Err(Error::Protocol(format!(
                    "connected, but network mismatch: {peer_net:?}"
                )));
            }
            let accept_addr = parse_addr(network, &arg).map_err(|_| {
                Error::Protocol(format!("connected, but accept address invalid: {arg:?}"))
            })?;
            if accept_addr.host != dst.host {
                return Err(Error::Protocol(format!(
                    "connected, but accept address is for different host: {:?}",
                    accept_addr.host
                )));
            }
            Ok(accept_addr)
        }
        other => Err(Error::Protocol(format!("invalid reply verb: {other:?}"))),
    }
}

#[async_trait]
impl Engine for LonetEngine {
    async fn new_host(
        &self,
        ctx: &CancellationToken,
        hostname: &str,
        registry: &dyn Registry,
    ) -> Result<()> {
        // all hosts of this subnetwork accept on the one OS listener
        registry
            .announce(ctx, hostname, &self.state.osaddr.to_string())
            .await
    }

    async fn dial(
        &self,
        ctx: &CancellationToken,
        src: &Addr,
        dst: &Addr,
        dst_hostdata: &str,
    ) -> Result<(Arc<dyn RawConn>, Addr)> {
        let osaddr: std::net::SocketAddr = dst_hostdata
            .parse()
            .map_err(|_| Error::Protocol(format!("invalid host OS address: {dst_hostdata:?}")))?;

        let stream = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Error::Canceled),
            r = TcpStream::connect(osaddr) => r.map_err(Error::Io)?,
        };

        let raw = Arc::new(StreamConn::new(stream));
        match connect_handshake(&self.network(), ctx, raw.as_ref(), src, dst).await {
            Ok(accept_addr) => Ok((raw, accept_addr)),
            Err(err) => {
                let _ = raw.close().await;
                Err(err)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let state = &self.state;
        state.serve_cancel.cancel();
        state.oslistener.close().await;
        let handle = { state.serve.lock().unwrap().take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Networker;
    use crate::virtnet::testsuite;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn bg() -> CancellationToken {
        CancellationToken::new()
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    /// join + keep the engine visible for OS-level poking.
    async fn join_engine(network: &str) -> (SubNetwork, LonetEngine) {
        let root = std::env::temp_dir().join(NET_PREFIX);
        std::fs::create_dir_all(&root).unwrap();
        let (network, netdir) = if network.is_empty() {
            fresh_netdir(&root).unwrap()
        } else {
            let dir = root.join(network);
            std::fs::create_dir_all(&dir).unwrap();
            (network.to_string(), dir)
        };

        let dbpath = netdir.join("registry.db");
        let registry = SqliteRegistry::open(dbpath.to_str().unwrap(), &network)
            .await
            .unwrap();
        let oslistener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let engine = LonetEngine::new(oslistener).unwrap();
        let (subnet, notifier) = SubNetwork::new(
            format!("{NET_PREFIX}{network}"),
            Box::new(engine.clone()),
            Box::new(registry),
        );
        engine.start(notifier, subnet.network());
        (subnet, engine)
    }

    #[tokio::test]
    async fn test_basic() {
        init_logging();
        let subnet = join(&bg(), "").await.unwrap();
        testsuite::test_basic(subnet).await;
    }

    #[tokio::test]
    async fn test_autobind_reuse() {
        let subnet = join(&bg(), "").await.unwrap();
        testsuite::test_autobind_reuse(subnet).await;
    }

    #[tokio::test]
    async fn test_byte_order() {
        let subnet = join(&bg(), "").await.unwrap();
        testsuite::test_byte_order(subnet).await;
    }

    #[tokio::test]
    async fn test_shutdown_cascade() {
        let subnet = join(&bg(), "").await.unwrap();
        testsuite::test_shutdown_cascade(subnet).await;
    }

    #[tokio::test]
    async fn test_network_mismatch_over_loopback() {
        init_logging();
        let (subnet, engine) = join_engine("").await;
        let network = subnet.network();

        // a raw client claiming another network must be turned away
        let mut client = TcpStream::connect(engine.osaddr()).await.unwrap();
        client
            .write_all(dial_line("lonet-other", "x:1", "y:1").as_bytes())
            .await
            .unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, reply_line(&network, "E", "network mismatch"));
        // read_to_string returning means the acceptor closed the conn

        subnet.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_dial_request_over_loopback() {
        let (subnet, engine) = join_engine("").await;
        let network = subnet.network();

        let mut client = TcpStream::connect(engine.osaddr()).await.unwrap();
        client.write_all(b"what is this\n").await.unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert_eq!(reply, reply_line(&network, "E", "invalid dial request"));

        subnet.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_dup_and_on_disk_state() {
        let (network, _) = fresh_netdir(&{
            let root = std::env::temp_dir().join(NET_PREFIX);
            std::fs::create_dir_all(&root).unwrap();
            root
        })
        .unwrap();

        let subnet = join(&bg(), &network).await.unwrap();
        subnet.new_host(&bg(), "α").await.unwrap();

        let err = subnet.new_host(&bg(), "α").await.unwrap_err();
        assert!(matches!(err.cause(), Error::HostDup));

        // exactly one row for α on disk
        let dbpath = std::env::temp_dir()
            .join(NET_PREFIX)
            .join(&network)
            .join("registry.db");
        let count: i64 = {
            let conn = rusqlite::Connection::open(&dbpath).unwrap();
            conn.query_row(
                "SELECT COUNT(*) FROM hosts WHERE name = 'α'",
                [],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert_eq!(count, 1);

        subnet.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cross_subnetwork_dial() {
        init_logging();
        // two subnetworks joined to the same named network
        let root = std::env::temp_dir().join(NET_PREFIX);
        std::fs::create_dir_all(&root).unwrap();
        let (network, _) = fresh_netdir(&root).unwrap();

        let sn1 = join(&bg(), &network).await.unwrap();
        let sn2 = join(&bg(), &network).await.unwrap();

        let ha = sn1.new_host(&bg(), "α").await.unwrap();
        let hb = sn2.new_host(&bg(), "β").await.unwrap();

        let l = ha.listen(&bg(), "").await.unwrap();
        let srv = tokio::spawn(async move {
            let c = l.accept(&bg()).await.unwrap();
            let mut buf = [0u8; 4];
            let mut got = 0;
            while got < 4 {
                let n = c.read(&mut buf[got..]).await.unwrap();
                assert!(n > 0);
                got += n;
            }
            assert_eq!(&buf, b"ping");
            (l, c)
        });

        // resolved through the shared registry, carried over loopback
        let c = hb.dial(&bg(), "α:1").await.unwrap();
        assert_eq!(c.local_addr(), Addr::new(sn2.network(), "β", 1));
        assert_eq!(c.remote_addr(), Addr::new(sn1.network(), "α", 2));

        let mut done = 0;
        while done < 4 {
            done += c.write(&b"ping"[done..]).await.unwrap();
        }

        let (_l, _cs) = srv.await.unwrap();
        sn1.close().await.unwrap();
        sn2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_host_across_subnetworks() {
        let root = std::env::temp_dir().join(NET_PREFIX);
        std::fs::create_dir_all(&root).unwrap();
        let (network, _) = fresh_netdir(&root).unwrap();

        let sn1 = join(&bg(), &network).await.unwrap();
        let sn2 = join(&bg(), &network).await.unwrap();

        sn1.new_host(&bg(), "α").await.unwrap();
        let err = sn2.new_host(&bg(), "α").await.unwrap_err();
        assert!(matches!(err.cause(), Error::HostDup));

        sn1.close().await.unwrap();
        sn2.close().await.unwrap();
    }
}
