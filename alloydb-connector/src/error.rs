//! The connector error taxonomy.
//!
//! Every caller-facing failure carries one of the [`ErrorKind`]s so drivers
//! can distinguish "retry the whole connection" from "give up". Variants hold
//! pre-formatted messages rather than source errors so that [`Error`] stays
//! [`Clone`], which lets every waiter on a coalesced refresh observe the same
//! outcome.

use thiserror::Error;

/// All errors surfaced by the connector.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Malformed instance URI, unknown `ip_type`, or a missing required
    /// option. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The injected token provider failed to produce a usable OAuth2 token.
    /// Never retried by the connector.
    #[error("credentials error: {0}")]
    Auth(String),

    /// Non-2xx response from the AlloyDB Admin API. 5xx responses are retried
    /// with backoff before this surfaces; 4xx responses surface immediately.
    #[error("AlloyDB Admin API error (HTTP {status}): {msg}")]
    ControlPlane {
        /// The HTTP status code returned by the API.
        status: u16,
        /// The server-provided error message, if any.
        msg: String,
    },

    /// TCP connect, DNS resolution, or TLS handshake failure, either against
    /// the instance or the Admin API transport.
    #[error("network error: {0}")]
    Network(String),

    /// The server proxy rejected the metadata exchange, or its framing was
    /// malformed.
    #[error("metadata exchange error: {0}")]
    Protocol(String),

    /// The returned client certificate was expired or malformed, the server
    /// presented the wrong identity, or key material could not be produced.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The connector was closed while the operation was pending.
    #[error("connector is closed")]
    Closed,
}

/// The coarse category of an [`Error`], one per taxonomy entry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    Config,
    Auth,
    ControlPlane,
    Network,
    Protocol,
    Certificate,
    Closed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Auth(_) => ErrorKind::Auth,
            Self::ControlPlane { .. } => ErrorKind::ControlPlane,
            Self::Network(_) => ErrorKind::Network,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Certificate(_) => ErrorKind::Certificate,
            Self::Closed => ErrorKind::Closed,
        }
    }

    /// Whether a refresh-internal retry may plausibly succeed.
    ///
    /// Transport failures and server-side (5xx) API errors are transient;
    /// config, auth, and client-side (4xx) API errors are not.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::ControlPlane { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        let err = Error::ControlPlane {
            status: 503,
            msg: "unavailable".to_owned(),
        };
        assert_eq!(err.kind(), ErrorKind::ControlPlane);
        assert!(err.is_transient());

        let err = Error::ControlPlane {
            status: 403,
            msg: "forbidden".to_owned(),
        };
        assert!(!err.is_transient());

        assert!(Error::Network("reset".to_owned()).is_transient());
        assert!(!Error::Closed.is_transient());
        assert!(!Error::Auth("expired".to_owned()).is_transient());
    }

    /// Waiters on a coalesced refresh clone the outcome; ensure this stays
    /// possible.
    #[test]
    fn errors_are_cloneable() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<Error>();
    }
}
