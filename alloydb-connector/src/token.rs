//! OAuth2 token sources.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::Error;

/// Produces bearer OAuth2 access tokens for the AlloyDB Admin API and for
/// automatic IAM database authentication.
///
/// The connector fetches a token immediately before each pair of control
/// plane calls and again immediately before each metadata exchange, so that
/// signed certificates and exchanged tokens carry their full remaining
/// lifetime. It never caches tokens itself; implementations should cache and
/// refresh according to their own TTLs.
///
/// Sourcing credentials (application default credentials, service account
/// keys, workload identity, ...) is deliberately out of scope; adapt your
/// auth stack of choice behind this trait.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Returns a currently-valid access token, without the `Bearer ` prefix.
    async fn token(&self) -> Result<SecretString, Error>;
}

/// A [`TokenProvider`] that always returns the same token.
///
/// Useful for tests and for environments where a sidecar already manages
/// token rotation. Note that certificates are signed with the token presented
/// at refresh time, so a token that expires mid-process will start failing
/// refreshes with [`Error::ControlPlane`].
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::new(token.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<SecretString, Error> {
        Ok(self.token.clone())
    }
}
