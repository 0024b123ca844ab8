//! Error types for the virtual network stack.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::common::Addr;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
///
/// The bare variants are the canonical causes a caller can match on via
/// [`Error::cause`]; wrapped variants carry the operation context added
/// by the layer that observed the failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("network is down")]
    NetDown,

    #[error("host is down")]
    HostDown,

    #[error("socket is down")]
    SockDown,

    #[error("address already in use")]
    AddrAlreadyUsed,

    #[error("cannot listen on requested address")]
    AddrNoListen,

    #[error("connection refused")]
    ConnRefused,

    #[error("registry is down")]
    RegistryDown,

    #[error("no such host")]
    NoHost,

    #[error("host already registered")]
    HostDup,

    #[error("operation canceled")]
    Canceled,

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddr { addr: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Free-form reason, e.g. an error text received over the wire.
    #[error("{0}")]
    Other(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Network operation wrapper, see [`OpError`].
    #[error("{0}")]
    Op(#[source] Box<OpError>),

    /// Registry operation wrapper, see [`RegistryError`].
    #[error("{0}")]
    Registry(#[source] Box<RegistryError>),

    /// Shared view of an error that has to be reported more than once,
    /// e.g. from repeated Close calls.
    #[error("{0}")]
    Shared(Arc<Error>),

    /// Several errors merged into one.
    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Many(Vec<Error>),
}

impl Error {
    /// Walks wrapping layers down to the underlying cause.
    pub fn cause(&self) -> &Error {
        match self {
            Error::Op(e) => e.err.cause(),
            Error::Registry(e) => e.err.cause(),
            Error::Shared(e) => e.cause(),
            other => other,
        }
    }

    /// Whether the error is due to an I/O timeout. Wrapping layers
    /// preserve this predicate.
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause(), Error::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    /// Merge several errors into one: None when all are absent, the
    /// error itself when there is exactly one, a combined error otherwise.
    pub fn merge(errv: Vec<Error>) -> Option<Error> {
        let mut errv = errv;
        match errv.len() {
            0 => None,
            1 => Some(errv.remove(0)),
            _ => Some(Error::Many(errv)),
        }
    }

    /// Wrap `err` into a network operation error.
    pub(crate) fn op(
        op: &'static str,
        net: impl Into<String>,
        source: Option<Addr>,
        addr: Option<Addr>,
        err: Error,
    ) -> Error {
        Error::Op(Box::new(OpError {
            op,
            net: net.into(),
            source,
            addr,
            err,
        }))
    }
}

/// Error of one network operation, carrying both endpoints.
#[derive(Debug)]
pub struct OpError {
    /// Operation that failed: "dial", "listen", "accept", "read", "write".
    pub op: &'static str,
    /// Full network name.
    pub net: String,
    /// Local address involved, if known.
    pub source: Option<Addr>,
    /// Remote address involved, if known.
    pub addr: Option<Addr>,
    /// Underlying cause.
    pub err: Error,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.net)?;
        if let Some(source) = &self.source {
            write!(f, " {}", source)?;
        }
        if let Some(addr) = &self.addr {
            if self.source.is_some() {
                write!(f, " -> {}", addr)?;
            } else {
                write!(f, " {}", addr)?;
            }
        }
        write!(f, ": {}", self.err)
    }
}

impl std::error::Error for OpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

/// Error of one registry operation.
#[derive(Debug)]
pub struct RegistryError {
    /// Name of the registry, e.g. "ram(pipeα)" or a database path.
    pub registry: String,
    /// Operation that failed: "announce", "query", "open".
    pub op: &'static str,
    /// Operation arguments, preformatted.
    pub args: String,
    /// Underlying cause.
    pub err: Error,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.registry, self.op)?;
        if !self.args.is_empty() {
            write!(f, " {}", self.args)?;
        }
        write!(f, ": {}", self.err)
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str, port: u32) -> Addr {
        Addr {
            net: "pipeα".to_string(),
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_op_error_display() {
        let err = Error::op(
            "dial",
            "pipeα",
            Some(addr("β", 1)),
            Some(addr("α", 2)),
            Error::ConnRefused,
        );
        assert_eq!(err.to_string(), "dial pipeα β:1 -> α:2: connection refused");
        assert!(matches!(err.cause(), Error::ConnRefused));
    }

    #[test]
    fn test_op_error_display_no_source() {
        let err = Error::op(
            "listen",
            "pipeα",
            None,
            Some(addr("α", 1)),
            Error::AddrAlreadyUsed,
        );
        assert_eq!(err.to_string(), "listen pipeα α:1: address already in use");
    }

    #[test]
    fn test_registry_error_display() {
        let err = Error::Registry(Box::new(RegistryError {
            registry: "ram(pipeα)".to_string(),
            op: "announce",
            args: "\"α\" \"\"".to_string(),
            err: Error::HostDup,
        }));
        assert_eq!(
            err.to_string(),
            "ram(pipeα): announce \"α\" \"\": host already registered"
        );
        assert!(matches!(err.cause(), Error::HostDup));
    }

    #[test]
    fn test_merge() {
        assert!(Error::merge(vec![]).is_none());

        let one = Error::merge(vec![Error::NetDown]).unwrap();
        assert!(matches!(one, Error::NetDown));

        let many = Error::merge(vec![Error::NetDown, Error::RegistryDown]).unwrap();
        assert_eq!(many.to_string(), "network is down; registry is down");
    }

    #[test]
    fn test_timeout_preserved_across_wrapping() {
        let timeout = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(timeout.is_timeout());

        let wrapped = Error::op("read", "pipeα", None, None, timeout);
        assert!(wrapped.is_timeout());

        assert!(!Error::ConnRefused.is_timeout());
    }
}
