//! The AlloyDB Admin API client.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{backoff, error::Error, uri::InstanceUri};

/// Base URL of the production AlloyDB Admin API.
pub const DEFAULT_API_ENDPOINT: &str = "https://alloydb.googleapis.com/v1beta";

/// Default per-attempt deadline for Admin API requests.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default requested lifetime for ephemeral client certificates.
pub const DEFAULT_CERT_DURATION: Duration = Duration::from_secs(3600);

// Transient failures (transport errors and 5xx) are retried up to
// RETRY_ATTEMPTS total attempts with jittered exponential backoff.
const RETRY_ATTEMPTS: usize = 5;
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

/// Header naming the project billed for API quota.
const GOOG_USER_PROJECT: &str = "x-goog-user-project";

/// Connection metadata for one instance, as returned by `connectionInfo`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// The instance's private (VPC) IP address, if reachable that way.
    #[serde(default)]
    pub ip_address: Option<String>,
    /// The instance's public IP address, if one is assigned.
    #[serde(default)]
    pub public_ip_address: Option<String>,
    /// The instance's PSC DNS name, if PSC is enabled.
    #[serde(default)]
    pub psc_dns_name: Option<String>,
    /// Opaque server-assigned identity; the SAN the server proxy's TLS
    /// certificate is bound to.
    pub instance_uid: String,
}

/// A freshly-signed ephemeral client certificate, as returned by
/// `generateClientCertificate`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBundle {
    /// PEM certs, leaf first, then any intermediates.
    pub pem_certificate_chain: Vec<String>,
    /// The PEM CA cert the server proxy's certificate chains to.
    pub ca_cert: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateCertificateRequest<'a> {
    public_key: &'a str,
    /// Wire format is a whole-second duration string, e.g. `"3600s"`.
    cert_duration: String,
    use_metadata_exchange: bool,
}

/// Error body shape shared by Google APIs: `{"error": {"message": ...}}`.
#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

/// The two control-plane RPCs the refresh engine needs.
///
/// This is the seam tests mock; [`AdminApiClient`] is the production
/// implementation. Both calls are idempotent and safe to retry.
#[async_trait]
pub trait AdminApi: Send + Sync + 'static {
    /// `GET <endpoint>/<instance path>/connectionInfo`
    async fn connection_info(
        &self,
        uri: &InstanceUri,
        token: &SecretString,
    ) -> Result<ConnectionInfo, Error>;

    /// `POST <endpoint>/<cluster path>:generateClientCertificate`
    async fn generate_client_certificate(
        &self,
        uri: &InstanceUri,
        token: &SecretString,
        public_key_pem: &str,
    ) -> Result<CertificateBundle, Error>;
}

/// JSON-over-HTTPS [`AdminApi`] implementation with retries.
pub struct AdminApiClient {
    client: reqwest::Client,
    /// Base URL, no trailing slash.
    endpoint: String,
    quota_project: Option<String>,
    cert_duration: Duration,
}

impl AdminApiClient {
    /// `client` should already carry the process user agent and a
    /// per-request timeout; see the connector builder.
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        quota_project: Option<String>,
        cert_duration: Duration,
    ) -> Self {
        let mut endpoint = endpoint.into();
        while endpoint.ends_with('/') {
            endpoint.pop();
        }
        Self {
            client,
            endpoint,
            quota_project,
            cert_duration,
        }
    }

    /// Sends `build()` up to [`RETRY_ATTEMPTS`] times, backing off after
    /// transport errors and 5xx responses, then deserializes the 2xx body.
    async fn send_with_retries<T: DeserializeOwned>(
        &self,
        rpc: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<T, Error> {
        let mut delays = backoff::iter_with(RETRY_INITIAL_DELAY, RETRY_MAX_DELAY);

        for attempt in 1..=RETRY_ATTEMPTS {
            let last_attempt = attempt == RETRY_ATTEMPTS;

            let response = match build().send().await {
                Ok(response) => response,
                Err(e) if last_attempt =>
                    return Err(Error::Network(format!(
                        "{rpc} request failed: {e}"
                    ))),
                Err(e) => {
                    warn!("{rpc} request failed (attempt {attempt}): {e:#}");
                    tokio::time::sleep(delays.next().expect("infinite")).await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let bytes = response.bytes().await.map_err(|e| {
                    Error::Network(format!(
                        "{rpc} response body failed: {e}"
                    ))
                })?;
                return serde_json::from_slice::<T>(&bytes).map_err(|e| {
                    Error::ControlPlane {
                        status: status.as_u16(),
                        msg: format!("undeserializable response: {e}"),
                    }
                });
            }

            let msg = Self::error_message(response).await;
            if status.is_server_error() && !last_attempt {
                warn!(
                    %status,
                    "{rpc} returned server error (attempt {attempt}): {msg}"
                );
                tokio::time::sleep(delays.next().expect("infinite")).await;
                continue;
            }
            return Err(Error::ControlPlane {
                status: status.as_u16(),
                msg,
            });
        }

        unreachable!("the final attempt always returns")
    }

    /// Best-effort extraction of the server's error message.
    async fn error_message(response: reqwest::Response) -> String {
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return format!("(unreadable error body: {e})"),
        };
        if let Ok(body) = serde_json::from_slice::<ApiErrorBody>(&bytes) {
            if !body.error.message.is_empty() {
                return body.error.message;
            }
        }
        String::from_utf8_lossy(&bytes).chars().take(256).collect()
    }

    fn apply_headers(
        &self,
        request: reqwest::RequestBuilder,
        token: &SecretString,
    ) -> reqwest::RequestBuilder {
        let request = request.bearer_auth(token.expose_secret());
        match &self.quota_project {
            Some(project) => request.header(GOOG_USER_PROJECT, project),
            None => request,
        }
    }
}

#[async_trait]
impl AdminApi for AdminApiClient {
    async fn connection_info(
        &self,
        uri: &InstanceUri,
        token: &SecretString,
    ) -> Result<ConnectionInfo, Error> {
        let url = format!(
            "{endpoint}/{path}/connectionInfo",
            endpoint = self.endpoint,
            path = uri.instance_path(),
        );
        debug!(%uri, "Fetching connection info");
        self.send_with_retries("connectionInfo", || {
            self.apply_headers(self.client.get(&url), token)
        })
        .await
    }

    async fn generate_client_certificate(
        &self,
        uri: &InstanceUri,
        token: &SecretString,
        public_key_pem: &str,
    ) -> Result<CertificateBundle, Error> {
        let url = format!(
            "{endpoint}/{cluster}:generateClientCertificate",
            endpoint = self.endpoint,
            cluster = uri.cluster_path(),
        );
        let body = GenerateCertificateRequest {
            public_key: public_key_pem,
            cert_duration: format!("{}s", self.cert_duration.as_secs()),
            use_metadata_exchange: true,
        };
        debug!(%uri, "Requesting ephemeral client certificate");
        self.send_with_retries("generateClientCertificate", || {
            self.apply_headers(self.client.post(&url), token).json(&body)
        })
        .await
    }
}
