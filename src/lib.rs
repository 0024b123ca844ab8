//! TCP-like virtual networks for testing distributed systems.
//!
//! When testing distributed code it is handy to imitate a network of
//! several TCP hosts inside the test, and handier still when the ports
//! allocated on dial/listen/accept are predictable, so the test can
//! assert on the exact sequence of network events. This crate provides
//! such networks:
//!
//! ```text
//! net          Networker/Listener/Conn traits + TLS and tracing wrappers
//! └── virtnet  SubNetwork/Host state machine over pluggable
//!     │        Engine (transport) and Registry (host directory)
//!     ├── pipenet   in-process realization over synchronous pipes
//!     └── lonet     cross-process realization over OS loopback + an
//!                   SQLite registry
//! ```
//!
//! Addresses are `host:port` pairs on a named network. Ports of every
//! host are a contiguous integer sequence starting from 1, all initially
//! free; autobind takes the first free port. Host names are unique
//! through the whole network.
//!
//! ## Core principles
//!
//! - Every blocking operation takes a cancellation token
//! - Hosts are ordinary [`net::Networker`]s; code under test needs no
//!   virtnet-specific types
//! - Realizations supply transport and directory, `virtnet` owns all
//!   connection state

pub mod common;
pub mod error;
pub mod io;
pub mod lonet;
pub mod net;
pub mod pipenet;
pub mod virtnet;

// Re-exports for convenience
pub use common::{parse_addr, Addr};
pub use error::{Error, OpError, RegistryError, Result};
pub use net::{Conn, Listener, NetTls, Networker, TraceReceiver, Tracer};
pub use virtnet::{Host, SubNetwork};
