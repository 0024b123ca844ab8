//! Synchronous in-memory network of pipes.
//!
//! Addresses are host:port pairs; hosts are [`Networker`]s and are used
//! like regular TCP access points with dial/listen/accept:
//!
//! ```no_run
//! # async fn demo() -> virtnet::Result<()> {
//! use tokio_util::sync::CancellationToken;
//! use virtnet::net::{Listener, Networker};
//!
//! let net = virtnet::pipenet::Network::new("");
//! let h1 = net.host("abc").await;
//! let h2 = net.host("def").await;
//!
//! let ctx = CancellationToken::new();
//! let l = h1.listen(&ctx, ":10").await?; // listens on "abc:10"
//! let _srv = tokio::spawn(async move {
//!     let ctx = CancellationToken::new();
//!     l.accept(&ctx).await // local address "abc:1"
//! });
//! let _c = h2.dial(&ctx, "abc:10").await?; // "def:1" <-> "abc:1"
//! # Ok(())
//! # }
//! ```
//!
//! Handy for testing how networked code interacts within one process
//! without touching the OS networking stack. See the `lonet` module for
//! a similar network that spans several OS-level processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::common::Addr;
use crate::error::{Error, RegistryError, Result};
use crate::io::{pipe_pair, RawConn};
use crate::virtnet::{Engine, Host, Notifier, Registry, SubNetwork};

const NET_PREFIX: &str = "pipe"; // this module creates only "pipe*" networks

/// Synchronous in-memory TCP-like network.
pub struct Network {
    subnet: SubNetwork,
}

impl Network {
    /// Create a new network named under the "pipe" namespace: "α" gives
    /// the full network name "pipeα". Uniqueness of the name is not
    /// checked.
    pub fn new(name: &str) -> Network {
        let netname = format!("{NET_PREFIX}{name}");
        let engine = PipeEngine::default();
        let registry = RamRegistry::new(format!("ram({netname})"));
        let (subnet, notifier) =
            SubNetwork::new(netname, Box::new(engine.clone()), Box::new(registry));
        engine.bind_notifier(notifier);
        Network { subnet }
    }

    /// Name of the network.
    pub fn network(&self) -> String {
        self.subnet.network()
    }

    /// Access point by name, created on first use.
    ///
    /// Working entirely in RAM, host creation here cannot fail for
    /// external reasons; this panics if the subnetwork was shut down or
    /// the registry reports an impossible state.
    pub async fn host(&self, name: &str) -> Host {
        if let Some(host) = self.subnet.host(name) {
            return host;
        }

        let bg = CancellationToken::new();
        match self.subnet.new_host(&bg, name).await {
            Ok(host) => host,
            Err(err) => match err.cause() {
                // lost a race against a concurrent creator; the loser can
                // still look the host up - even a closed host stays in
                // the subnetwork's map
                Error::HostDup => self
                    .subnet
                    .host(name)
                    .expect("host reported as duplicate but not found"),
                Error::NetDown => panic!("pipenet: new host {name:?}: network is down"),
                _ => panic!("pipenet: new host failed not due to dup or shutdown: {err}"),
            },
        }
    }

    /// The underlying virtnet subnetwork.
    pub fn as_subnet(&self) -> &SubNetwork {
        &self.subnet
    }

    /// Shut the network down.
    pub async fn close(&self) -> Result<()> {
        self.subnet.close().await
    }
}

// ============================================================================
// engine
// ============================================================================

/// Engine creating one pipe pair per connection.
#[derive(Clone, Default)]
struct PipeEngine {
    // the notifier only exists once the subnetwork does; bound right
    // after construction
    notifier: Arc<OnceLock<Notifier>>,
}

impl PipeEngine {
    fn bind_notifier(&self, notifier: Notifier) {
        let _ = self.notifier.set(notifier);
    }

    fn notifier(&self) -> &Notifier {
        self.notifier.get().expect("pipenet engine not wired")
    }
}

#[async_trait]
impl Engine for PipeEngine {
    async fn new_host(
        &self,
        ctx: &CancellationToken,
        hostname: &str,
        registry: &dyn Registry,
    ) -> Result<()> {
        // neither per-host resources nor hostdata are needed
        registry.announce(ctx, hostname, "").await
    }

    async fn dial(
        &self,
        ctx: &CancellationToken,
        src: &Addr,
        dst: &Addr,
        _dst_hostdata: &str,
    ) -> Result<(Arc<dyn RawConn>, Addr)> {
        let (pc, ps) = pipe_pair();
        let pc: Arc<dyn RawConn> = Arc::new(pc);
        let ps: Arc<dyn RawConn> = Arc::new(ps);

        match self
            .notifier()
            .vnet_accept(ctx, src.clone(), dst.clone(), ps.clone())
            .await
        {
            Ok(accept) => {
                let _ = accept.ack.send(Ok(()));
                Ok((pc, accept.addr))
            }
            Err(err) => {
                let _ = pc.close().await;
                let _ = ps.close().await;
                Err(err)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(()) // no underlying resources to release
    }
}

// ============================================================================
// registry
// ============================================================================

/// In-RAM registry: a name → hostdata map behind a mutex.
struct RamRegistry {
    name: String,
    state: Mutex<RamState>,
}

struct RamState {
    hosts: HashMap<String, String>,
    closed: bool,
}

impl RamRegistry {
    fn new(name: String) -> RamRegistry {
        RamRegistry {
            name,
            state: Mutex::new(RamState {
                hosts: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn regerr(&self, op: &'static str, args: String, err: Error) -> Error {
        Error::Registry(Box::new(RegistryError {
            registry: self.name.clone(),
            op,
            args,
            err,
        }))
    }
}

#[async_trait]
impl Registry for RamRegistry {
    async fn announce(
        &self,
        _ctx: &CancellationToken,
        hostname: &str,
        hostdata: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let err = if state.closed {
            Error::RegistryDown
        } else if state.hosts.contains_key(hostname) {
            Error::HostDup
        } else {
            state.hosts.insert(hostname.to_string(), hostdata.to_string());
            return Ok(());
        };
        Err(self.regerr("announce", format!("{hostname:?} {hostdata:?}"), err))
    }

    async fn query(&self, _ctx: &CancellationToken, hostname: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        let err = if state.closed {
            Error::RegistryDown
        } else {
            match state.hosts.get(hostname) {
                Some(data) => return Ok(data.clone()),
                None => Error::NoHost,
            }
        };
        Err(self.regerr("query", format!("{hostname:?}"), err))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}
