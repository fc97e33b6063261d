//! Connect securely to AlloyDB instances without managing certificates.
//!
//! The connector resolves an instance URI through the AlloyDB Admin API,
//! keeps a short-lived mTLS client certificate fresh in the background, and
//! hands your database driver a TCP socket that has already completed the
//! TLS handshake (pinned to the instance's server identity) and the
//! proprietary metadata exchange.
//!
//! ```no_run
//! # async fn example() -> Result<(), alloydb_connector::Error> {
//! use std::sync::Arc;
//!
//! use alloydb_connector::{Connector, StaticTokenProvider};
//!
//! let connector = Connector::builder()
//!     .credentials(Arc::new(StaticTokenProvider::new("ya29...")))
//!     .build()?;
//!
//! let stream = connector
//!     .connect(
//!         "projects/my-project/locations/us-central1\
//!          /clusters/my-cluster/instances/my-instance",
//!     )
//!     .await?;
//! // Drive the PostgreSQL protocol over `stream`.
//! # drop(stream);
//! # connector.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! What the connector does *not* do: pool database sessions, speak SQL, or
//! source OAuth2 credentials (inject a [`TokenProvider`]).

/// The AlloyDB Admin API client and its wire models.
pub mod api;
/// Configuration enums and per-connect overrides.
pub mod config;
/// The connector facade, builder, and dialer.
pub mod connector;
/// The error taxonomy.
pub mod error;
/// The shared RSA client key pair.
pub mod keys;
/// Refresh results and their assembly.
pub mod refresh;
/// OAuth2 token sources.
pub mod token;
/// Instance URI parsing.
pub mod uri;

mod backoff;
mod exchange;
mod instance;
mod shutdown;
mod task;
mod tls;

/// Test-only mocks and fixtures. Enabled by the `test-utils` feature; never
/// compile this into production builds.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::{
    config::{ConnectOptions, IpType, RefreshStrategy},
    connector::{Connector, ConnectorBuilder, SERVER_PROXY_PORT},
    error::{Error, ErrorKind},
    refresh::REFRESH_BUFFER,
    token::{StaticTokenProvider, TokenProvider},
    uri::InstanceUri,
};
