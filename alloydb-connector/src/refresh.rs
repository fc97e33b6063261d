//! Refresh results and their assembly.

use std::{sync::Arc, time::Duration};

use rustls::ClientConfig;
use time::OffsetDateTime;
use tracing::debug;

use crate::{
    api::AdminApi, config::IpType, error::Error, keys::ClientKeyPair, tls,
    token::TokenProvider, uri::InstanceUri,
};

/// How long before certificate expiry a replacement is scheduled (background
/// strategy) or required (lazy strategy).
pub const REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60);

/// An immutable bundle produced by one successful refresh: the instance's
/// addresses and identity, the mTLS config built from the ephemeral client
/// certificate, and that certificate's expiry.
#[derive(Debug)]
pub struct RefreshResult {
    instance_uid: String,
    ip_address: Option<String>,
    public_ip_address: Option<String>,
    psc_dns_name: Option<String>,
    expiry: OffsetDateTime,
    tls_config: Arc<ClientConfig>,
}

impl RefreshResult {
    /// The server-assigned identity the TLS handshake verifies as the peer's
    /// SAN.
    pub fn instance_uid(&self) -> &str {
        &self.instance_uid
    }

    /// When the client certificate inside [`Self::tls_config`] stops being
    /// valid.
    pub fn expiry(&self) -> OffsetDateTime {
        self.expiry
    }

    pub(crate) fn tls_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.tls_config)
    }

    /// Selects the address to dial for `ip_type`. All returned addresses are
    /// retained so per-connect overrides can pick a different one than the
    /// connector default.
    pub fn endpoint(&self, ip_type: IpType) -> Result<&str, Error> {
        let endpoint = match ip_type {
            IpType::Private => self.ip_address.as_deref(),
            IpType::Public => self.public_ip_address.as_deref(),
            IpType::Psc => self.psc_dns_name.as_deref(),
        };
        endpoint.ok_or_else(|| {
            let msg = match ip_type {
                IpType::Private => "instance has no private IP address",
                IpType::Public => "instance has no public IP address",
                IpType::Psc => "PSC is not enabled on this instance",
            };
            Error::Config(msg.to_owned())
        })
    }

    pub(crate) fn expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expiry
    }

    /// Whether the result expires within `buffer` from `now`.
    pub(crate) fn expires_within(
        &self,
        buffer: Duration,
        now: OffsetDateTime,
    ) -> bool {
        now + buffer >= self.expiry
    }

    /// Time until expiry, saturating at zero.
    pub(crate) fn ttl(&self, now: OffsetDateTime) -> Duration {
        let ttl = self.expiry - now;
        ttl.try_into().unwrap_or(Duration::ZERO)
    }
}

/// Delay until the proactive refresh for a certificate with `ttl` lifetime
/// remaining: half the remaining lifetime, less [`REFRESH_BUFFER`], floored
/// at "immediately". Certificates living less than the buffer refresh
/// immediately.
pub(crate) fn refresh_delay(ttl: Duration) -> Duration {
    (ttl / 2).saturating_sub(REFRESH_BUFFER)
}

/// One full refresh: token fetch, then the two Admin API calls concurrently,
/// then leaf validation and TLS config assembly.
pub(crate) async fn perform_refresh(
    api: &dyn AdminApi,
    token_provider: &dyn TokenProvider,
    keys: &ClientKeyPair,
    uri: &InstanceUri,
) -> Result<RefreshResult, Error> {
    let started = std::time::Instant::now();

    // Fetch the token immediately before the RPCs, not earlier, so the
    // certificate is signed under a token with its full remaining lifetime.
    let token = token_provider.token().await?;

    let (info, certs) = tokio::try_join!(
        api.connection_info(uri, &token),
        api.generate_client_certificate(uri, &token, keys.public_key_pem()),
    )?;

    let chain = certs
        .pem_certificate_chain
        .iter()
        .map(|pem| tls::cert_der_from_pem(pem, "client certificate"))
        .collect::<Result<Vec<_>, _>>()?;
    let leaf = chain.first().ok_or_else(|| {
        Error::Certificate("empty client certificate chain".to_owned())
    })?;

    let now = OffsetDateTime::now_utc();
    let expiry = tls::validate_leaf(leaf, now)?;

    let tls_config =
        tls::instance_client_config(&certs.ca_cert, chain, keys.client_key_der())?;

    debug!(
        %uri,
        uid = %info.instance_uid,
        %expiry,
        elapsed = ?started.elapsed(),
        "Refreshed instance connection info",
    );

    Ok(RefreshResult {
        instance_uid: info.instance_uid,
        ip_address: info.ip_address,
        public_ip_address: info.public_ip_address,
        psc_dns_name: info.psc_dns_name,
        expiry,
        tls_config: Arc::new(tls_config),
    })
}
