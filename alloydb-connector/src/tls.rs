//! TLS presets and per-refresh mTLS config assembly.

use std::sync::{Arc, LazyLock};

use rustls::{
    ClientConfig, RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
};
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;

use crate::error::Error;

/// Instance connections and Admin API connections are TLS 1.3 only.
static TLS_PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13];

/// The process-wide [`rustls::crypto::CryptoProvider`] (ring).
/// Use this instead of [`rustls::crypto::ring::default_provider`].
pub(crate) static CRYPTO_PROVIDER: LazyLock<
    Arc<rustls::crypto::CryptoProvider>,
> = LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Tolerated clock skew when checking a fresh leaf's validity window.
const VALIDITY_SKEW: time::Duration = time::Duration::seconds(60);

/// Helper to get a builder for a [`ClientConfig`] with our presets.
pub(crate) fn client_config_builder()
-> rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier> {
    ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(TLS_PROTOCOL_VERSIONS)
        .expect("Checked in tests")
}

/// Mozilla's webpki roots as a lazily-initialized [`RootCertStore`].
///
/// The Admin API client trusts these manually instead of enabling reqwest's
/// `rustls-tls-webpki-roots` feature, which would propagate to dependents via
/// feature unification.
static WEBPKI_ROOT_CERTS: LazyLock<Arc<RootCertStore>> = LazyLock::new(|| {
    let roots = webpki_roots::TLS_SERVER_ROOTS.to_vec();
    Arc::new(RootCertStore { roots })
});

/// TLS config for talking to the Admin API itself (standard webpki, no
/// client auth).
pub(crate) fn admin_api_client_config() -> ClientConfig {
    client_config_builder()
        .with_root_certificates(WEBPKI_ROOT_CERTS.clone())
        .with_no_client_auth()
}

/// Parses one PEM certificate into DER.
pub(crate) fn cert_der_from_pem(
    pem: &str,
    what: &str,
) -> Result<CertificateDer<'static>, Error> {
    CertificateDer::from_pem_slice(pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("invalid {what} PEM: {e}")))
}

/// Builds the mTLS config for one refresh: trust root = the CA returned by
/// the Admin API, client identity = the ephemeral chain (leaf first) plus our
/// RSA key.
///
/// The *server* identity is not encoded here; the dialer verifies it by
/// handshaking with the instance UID as the expected server name, so the
/// webpki SAN check runs against the UID rather than the dialed address.
pub(crate) fn instance_client_config(
    ca_cert_pem: &str,
    chain: Vec<CertificateDer<'static>>,
    key_der: PrivateKeyDer<'static>,
) -> Result<ClientConfig, Error> {
    let ca_der = cert_der_from_pem(ca_cert_pem, "CA certificate")?;
    let mut roots = RootCertStore::empty();
    roots.add(ca_der).map_err(|e| {
        Error::Certificate(format!("unusable CA certificate: {e}"))
    })?;

    client_config_builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key_der)
        .map_err(|e| {
            Error::Certificate(format!(
                "client certificate rejected by TLS stack: {e}"
            ))
        })
}

/// Checks that the freshly-issued leaf is currently within its validity
/// window (with [`VALIDITY_SKEW`] tolerance on both bounds) and returns its
/// `notAfter` as the refresh result's expiry.
pub(crate) fn validate_leaf(
    leaf_der: &CertificateDer<'_>,
    now: OffsetDateTime,
) -> Result<OffsetDateTime, Error> {
    use x509_parser::prelude::FromDer;

    let (trailing, cert) = X509Certificate::from_der(leaf_der.as_ref())
        .map_err(|e| {
            Error::Certificate(format!("unparseable client certificate: {e}"))
        })?;
    if !trailing.is_empty() {
        return Err(Error::Certificate(
            "client certificate has trailing DER data".to_owned(),
        ));
    }

    let validity = cert.validity();
    let not_before = validity.not_before.to_datetime();
    let not_after = validity.not_after.to_datetime();

    if now + VALIDITY_SKEW < not_before {
        return Err(Error::Certificate(format!(
            "client certificate not valid until {not_before}"
        )));
    }
    if now - VALIDITY_SKEW > not_after {
        return Err(Error::Certificate(format!(
            "client certificate expired at {not_after}"
        )));
    }

    Ok(not_after)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::CertAuthority;

    #[test]
    fn config_builder_presets_dont_panic() {
        let config = admin_api_client_config();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn validate_leaf_window() {
        let authority = CertAuthority::new();
        let keys = crate::test_utils::test_key_pair();

        // A cert valid for an hour starting now passes and reports expiry.
        let now = OffsetDateTime::now_utc();
        let chain = authority.issue_client_cert(
            keys.public_key_pem(),
            time::Duration::hours(1),
        );
        let leaf = cert_der_from_pem(&chain[0], "leaf").unwrap();
        let expiry = validate_leaf(&leaf, now).unwrap();
        let ttl = expiry - now;
        assert!(ttl > time::Duration::minutes(55), "{ttl}");
        assert!(ttl <= time::Duration::hours(1) + VALIDITY_SKEW, "{ttl}");

        // The same cert viewed from the far future is expired.
        let err = validate_leaf(&leaf, now + time::Duration::hours(2))
            .unwrap_err();
        assert!(matches!(err, Error::Certificate(_)), "{err:?}");

        // And from the distant past, not yet valid.
        let err = validate_leaf(&leaf, now - time::Duration::hours(2))
            .unwrap_err();
        assert!(matches!(err, Error::Certificate(_)), "{err:?}");
    }

    #[test]
    fn assemble_instance_config() {
        let authority = CertAuthority::new();
        let keys = crate::test_utils::test_key_pair();

        let chain_pem = authority.issue_client_cert(
            keys.public_key_pem(),
            time::Duration::hours(1),
        );
        let chain = chain_pem
            .iter()
            .map(|pem| cert_der_from_pem(pem, "client certificate"))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        let config = instance_client_config(
            &authority.ca_cert_pem(),
            chain,
            keys.client_key_der(),
        )
        .unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn reject_garbage_pem() {
        let err = cert_der_from_pem("not a pem", "CA certificate").unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }
}
