//! Test-only infrastructure: an in-memory control plane, an HTTP facade for
//! it, a certificate authority standing in for the AlloyDB CA, and a mock
//! server proxy speaking the metadata exchange.

use std::sync::{
    Arc, LazyLock, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use alloydb_proto::{MetadataExchangeRequest, MetadataExchangeResponse};
use anyhow::Context;
use async_trait::async_trait;
use prost::Message;
use rsa::{pkcs1::EncodeRsaPublicKey, pkcs8::DecodePublicKey};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, pem::PemObject};
use secrecy::SecretString;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
};
use tracing::debug;

use crate::{
    api::{AdminApi, CertificateBundle, ConnectionInfo},
    error::Error,
    keys::ClientKeyPair,
    task::Task,
    tls,
    uri::InstanceUri,
};

/// Use this to initialize the global logger in tests. Does nothing unless
/// `RUST_LOG` is set; never panics if another test got there first.
pub fn init_logger() {
    use tracing_subscriber::{
        filter::Targets,
        layer::{Layer, SubscriberExt},
        util::SubscriberInitExt,
    };

    let Some(rust_log) = std::env::var_os("RUST_LOG") else {
        return;
    };
    let filter = rust_log
        .to_str()
        .and_then(|s| s.parse::<Targets>().ok())
        .unwrap_or_else(|| {
            Targets::new().with_default(tracing::Level::INFO)
        });

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_test_writer()
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(stdout_log).try_init();
}

/// The instance URI used throughout the tests.
pub fn test_uri() -> InstanceUri {
    "projects/proj/locations/us-central1/clusters/clus/instances/inst"
        .parse()
        .expect("test URI is well-formed")
}

/// A process-wide RSA key pair so each test doesn't pay for generation.
pub fn test_key_pair() -> Arc<ClientKeyPair> {
    static TEST_KEY_PAIR: LazyLock<Arc<ClientKeyPair>> = LazyLock::new(|| {
        Arc::new(ClientKeyPair::generate().expect("test RSA keygen failed"))
    });
    Arc::clone(&TEST_KEY_PAIR)
}

// --- CertAuthority --- //

/// rcgen adapter for a subject public key we only hold the public half of:
/// the RSA key whose PEM the connector submits for signing.
struct RsaSubjectKey {
    pkcs1_der: Vec<u8>,
}

impl rcgen::PublicKeyData for RsaSubjectKey {
    fn der_bytes(&self) -> &[u8] {
        &self.pkcs1_der
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_RSA_SHA256
    }
}

/// Stands in for the control plane's CA: issues ephemeral client certs for
/// submitted public keys and server certs bound to an instance UID.
pub struct CertAuthority {
    ca_key: rcgen::KeyPair,
    ca_params: rcgen::CertificateParams,
    ca_cert_pem: String,
}

impl CertAuthority {
    pub fn new() -> Self {
        let ca_key =
            rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                .expect("CA keygen failed");
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new())
            .expect("empty SANs are valid");
        ca_params.is_ca =
            rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name = distinguished_name("AlloyDB test CA");
        let ca_cert =
            ca_params.self_signed(&ca_key).expect("CA self-sign failed");

        Self {
            ca_key,
            ca_params,
            ca_cert_pem: ca_cert.pem(),
        }
    }

    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }

    fn ca_cert_der(&self) -> CertificateDer<'static> {
        CertificateDer::from_pem_slice(self.ca_cert_pem.as_bytes())
            .expect("CA PEM is valid")
    }

    /// Signs a leaf binding the submitted RSA public key, valid for `ttl`
    /// from now. Returns the PEM chain, leaf first.
    pub fn issue_client_cert(
        &self,
        public_key_pem: &str,
        ttl: time::Duration,
    ) -> Vec<String> {
        let public_key = rsa::RsaPublicKey::from_public_key_pem(public_key_pem)
            .expect("submitted public key is valid SPKI PEM");
        let subject_key = RsaSubjectKey {
            pkcs1_der: public_key
                .to_pkcs1_der()
                .expect("RSA keys encode to PKCS#1")
                .as_bytes()
                .to_vec(),
        };

        let mut params =
            rcgen::CertificateParams::new(vec!["alloydb-client".to_owned()])
                .expect("SANs are valid");
        params.distinguished_name =
            distinguished_name("AlloyDB ephemeral client");
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + ttl;

        let issuer = rcgen::Issuer::from_params(&self.ca_params, &self.ca_key);
        let leaf = params
            .signed_by(&subject_key, &issuer)
            .expect("client cert signing failed");
        vec![leaf.pem()]
    }

    /// A TLS server config presenting a cert with `uid` as its SAN and
    /// requiring client certs signed by this authority, like the real server
    /// proxy.
    pub fn server_config(&self, uid: &str) -> Arc<rustls::ServerConfig> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .expect("server keygen failed");
        let mut params = rcgen::CertificateParams::new(vec![uid.to_owned()])
            .expect("the UID is a valid SAN");
        params.distinguished_name =
            distinguished_name("AlloyDB server proxy");
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(5);
        params.not_after = now + time::Duration::hours(24);
        let issuer = rcgen::Issuer::from_params(&self.ca_params, &self.ca_key);
        let cert = params
            .signed_by(&key, &issuer)
            .expect("server cert signing failed");

        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.ca_cert_der()).expect("CA cert is addable");
        let client_verifier =
            rustls::server::WebPkiClientVerifier::builder_with_provider(
                Arc::new(roots),
                tls::CRYPTO_PROVIDER.clone(),
            )
            .build()
            .expect("client verifier builds");

        let config = rustls::ServerConfig::builder_with_provider(
            tls::CRYPTO_PROVIDER.clone(),
        )
        .with_protocol_versions(&[&rustls::version::TLS13])
        .expect("TLS 1.3 is supported")
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(
            vec![cert.der().clone()],
            PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        )
        .expect("server config builds");
        Arc::new(config)
    }
}

impl Default for CertAuthority {
    fn default() -> Self {
        Self::new()
    }
}

fn distinguished_name(common_name: &str) -> rcgen::DistinguishedName {
    let mut name = rcgen::DistinguishedName::new();
    name.push(rcgen::DnType::OrganizationName, "alloydb-test");
    name.push(rcgen::DnType::CommonName, common_name);
    name
}

// --- MockAdminApi --- //

/// Blocks refreshes issued while it exists until [`Gate::release`].
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn release(self) {
        let _ = self.tx.send(true);
    }
}

/// In-memory [`AdminApi`] with scripted failures, a holdable gate, and call
/// accounting. Issues real certificates through a [`CertAuthority`] so the
/// full refresh pipeline (leaf validation, TLS config assembly) runs.
pub struct MockAdminApi {
    pub authority: CertAuthority,
    pub connection_info_calls: AtomicUsize,
    pub generate_cert_calls: AtomicUsize,
    instance_uid: Mutex<String>,
    private_ip: Mutex<Option<String>>,
    public_ip: Mutex<Option<String>>,
    psc_dns: Mutex<Option<String>>,
    cert_ttl: Mutex<time::Duration>,
    fail_budget: AtomicUsize,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    /// Count of `generateClientCertificate` calls, for awaiting.
    refresh_count_tx: watch::Sender<usize>,
    refresh_instants: Mutex<Vec<tokio::time::Instant>>,
}

impl MockAdminApi {
    /// Defaults: private IP `127.0.0.1`, no public IP, no PSC, 1h certs.
    pub fn new(instance_uid: &str) -> Self {
        Self {
            authority: CertAuthority::new(),
            connection_info_calls: AtomicUsize::new(0),
            generate_cert_calls: AtomicUsize::new(0),
            instance_uid: Mutex::new(instance_uid.to_owned()),
            private_ip: Mutex::new(Some("127.0.0.1".to_owned())),
            public_ip: Mutex::new(None),
            psc_dns: Mutex::new(None),
            cert_ttl: Mutex::new(time::Duration::hours(1)),
            fail_budget: AtomicUsize::new(0),
            gate: Mutex::new(None),
            refresh_count_tx: watch::channel(0).0,
            refresh_instants: Mutex::new(Vec::new()),
        }
    }

    pub fn set_instance_uid(&self, uid: &str) {
        *self.instance_uid.lock().unwrap() = uid.to_owned();
    }

    pub fn set_public_ip(&self, ip: Option<String>) {
        *self.public_ip.lock().unwrap() = ip;
    }

    pub fn set_cert_ttl(&self, ttl: time::Duration) {
        *self.cert_ttl.lock().unwrap() = ttl;
    }

    /// The next `n` certificate calls fail with a retryable 503.
    pub fn fail_next_refreshes(&self, n: usize) {
        self.fail_budget.store(n, Ordering::SeqCst);
    }

    /// Holds all certificate calls issued from now on until the returned
    /// [`Gate`] is released.
    pub fn hold_refreshes(&self) -> Gate {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(rx);
        Gate { tx }
    }

    /// Waits until the `n`th certificate call has been issued and returns
    /// the (tokio) instant at which it arrived.
    pub async fn wait_for_refreshes(&self, n: usize) -> tokio::time::Instant {
        let mut rx = self.refresh_count_tx.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
        self.refresh_instants.lock().unwrap()[n - 1]
    }

    async fn wait_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(mut gate) = gate {
            // A dropped gate counts as released.
            let _ = gate.wait_for(|released| *released).await;
        }
    }

    fn consume_failure(&self) -> bool {
        self.fail_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok()
    }
}

#[async_trait]
impl AdminApi for MockAdminApi {
    async fn connection_info(
        &self,
        _uri: &InstanceUri,
        _token: &SecretString,
    ) -> Result<ConnectionInfo, Error> {
        self.connection_info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectionInfo {
            ip_address: self.private_ip.lock().unwrap().clone(),
            public_ip_address: self.public_ip.lock().unwrap().clone(),
            psc_dns_name: self.psc_dns.lock().unwrap().clone(),
            instance_uid: self.instance_uid.lock().unwrap().clone(),
        })
    }

    async fn generate_client_certificate(
        &self,
        _uri: &InstanceUri,
        _token: &SecretString,
        public_key_pem: &str,
    ) -> Result<CertificateBundle, Error> {
        let count = {
            let mut instants = self.refresh_instants.lock().unwrap();
            instants.push(tokio::time::Instant::now());
            instants.len()
        };
        self.generate_cert_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.refresh_count_tx.send(count);

        self.wait_gate().await;

        if self.consume_failure() {
            return Err(Error::ControlPlane {
                status: 503,
                msg: "scripted unavailability".to_owned(),
            });
        }

        let ttl = *self.cert_ttl.lock().unwrap();
        Ok(CertificateBundle {
            pem_certificate_chain: self
                .authority
                .issue_client_cert(public_key_pem, ttl),
            ca_cert: self.authority.ca_cert_pem(),
        })
    }
}

// --- HTTP servers --- //

/// Serves `router` on an ephemeral localhost port, returning the base URL.
pub async fn spawn_http_server(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("can bind ephemeral port");
    let addr = listener.local_addr().expect("listener has an address");
    Task::spawn("mock-http-server", async move {
        if let Err(e) = axum::serve(listener, router).await {
            debug!("mock http server exited: {e:#}");
        }
    })
    .detach();
    format!("http://{addr}")
}

/// Wraps a [`MockAdminApi`] in the Admin API's HTTP surface so the real
/// [`AdminApiClient`](crate::api::AdminApiClient) can be exercised end to
/// end. Returns the endpoint base URL (including the API version prefix).
pub async fn spawn_admin_http(api: Arc<MockAdminApi>) -> String {
    use axum::{
        Json, Router,
        extract::State,
        http::StatusCode,
        routing::{get, post},
    };

    fn error_response(e: Error) -> (StatusCode, Json<serde_json::Value>) {
        let (status, msg) = match e {
            Error::ControlPlane { status, msg } => (
                StatusCode::from_u16(status)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                msg,
            ),
            other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        };
        (status, Json(serde_json::json!({ "error": { "message": msg } })))
    }

    async fn connection_info(
        State(api): State<Arc<MockAdminApi>>,
    ) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>
    {
        let token = SecretString::new("ignored".to_owned());
        let info = api
            .connection_info(&test_uri(), &token)
            .await
            .map_err(error_response)?;
        Ok(Json(serde_json::json!({
            "ipAddress": info.ip_address,
            "publicIpAddress": info.public_ip_address,
            "pscDnsName": info.psc_dns_name,
            "instanceUid": info.instance_uid,
        })))
    }

    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct GenerateRequest {
        public_key: String,
    }

    async fn generate_certificate(
        State(api): State<Arc<MockAdminApi>>,
        Json(request): Json<GenerateRequest>,
    ) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>
    {
        let token = SecretString::new("ignored".to_owned());
        let bundle = api
            .generate_client_certificate(
                &test_uri(),
                &token,
                &request.public_key,
            )
            .await
            .map_err(error_response)?;
        Ok(Json(serde_json::json!({
            "pemCertificateChain": bundle.pem_certificate_chain,
            "caCert": bundle.ca_cert,
        })))
    }

    let router = Router::new()
        .route(
            "/v1beta/projects/{project}/locations/{location}\
             /clusters/{cluster}/instances/{instance}/connectionInfo",
            get(connection_info),
        )
        // The POST path's final segment is "{cluster}:generateClientCertificate",
        // which lands in the same `{cluster}` param as the GET route.
        .route(
            "/v1beta/projects/{project}/locations/{location}\
             /clusters/{cluster}",
            post(generate_certificate),
        )
        .with_state(api);

    let base = spawn_http_server(router).await;
    format!("{base}/v1beta")
}

// --- MockServerProxy --- //

/// What the mock proxy replies to the metadata exchange.
#[derive(Clone)]
pub enum ProxyReply {
    /// Accept, then echo all subsequent bytes back.
    Ok,
    /// Reject with this error message.
    Error(String),
}

/// A TLS server on an ephemeral localhost port that performs the server half
/// of the metadata exchange, recording every request it sees.
pub struct MockServerProxy {
    pub port: u16,
    pub requests: Arc<Mutex<Vec<MetadataExchangeRequest>>>,
    config: Arc<Mutex<Arc<rustls::ServerConfig>>>,
}

impl MockServerProxy {
    pub async fn spawn(
        server_config: Arc<rustls::ServerConfig>,
        reply: ProxyReply,
    ) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("can bind ephemeral port");
        let port = listener.local_addr().expect("has address").port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let config = Arc::new(Mutex::new(server_config));

        let accept_requests = Arc::clone(&requests);
        let accept_config = Arc::clone(&config);
        Task::spawn("mock-server-proxy", async move {
            loop {
                let Ok((tcp, peer)) = listener.accept().await else {
                    return;
                };
                let config = Arc::clone(&*accept_config.lock().unwrap());
                let requests = Arc::clone(&accept_requests);
                let reply = reply.clone();
                Task::spawn("mock-server-proxy-conn", async move {
                    let result =
                        Self::handle_conn(tcp, config, requests, reply).await;
                    if let Err(e) = result {
                        debug!("mock proxy conn from {peer} errored: {e:#}");
                    }
                })
                .detach();
            }
        })
        .detach();

        Self {
            port,
            requests,
            config,
        }
    }

    /// Swaps the presented server identity, as if the instance rotated its
    /// certificate. Affects connections accepted from now on.
    pub fn set_config(&self, server_config: Arc<rustls::ServerConfig>) {
        *self.config.lock().unwrap() = server_config;
    }

    async fn handle_conn(
        tcp: tokio::net::TcpStream,
        config: Arc<rustls::ServerConfig>,
        requests: Arc<Mutex<Vec<MetadataExchangeRequest>>>,
        reply: ProxyReply,
    ) -> anyhow::Result<()> {
        let acceptor = tokio_rustls::TlsAcceptor::from(config);
        let mut stream =
            acceptor.accept(tcp).await.context("TLS accept failed")?;

        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .context("read request length")?;
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut body).await.context("read request")?;
        let request = MetadataExchangeRequest::decode(body.as_slice())
            .context("decode request")?;
        requests.lock().unwrap().push(request);

        let response = match &reply {
            ProxyReply::Ok => MetadataExchangeResponse {
                response_code: alloydb_proto::ResponseCode::Ok as i32,
                error: String::new(),
            },
            ProxyReply::Error(msg) => MetadataExchangeResponse {
                response_code: alloydb_proto::ResponseCode::Error as i32,
                error: msg.clone(),
            },
        };
        let encoded = response.encode_to_vec();
        let mut frame = (encoded.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&encoded);
        stream.write_all(&frame).await.context("write response")?;
        stream.flush().await.context("flush response")?;

        if matches!(reply, ProxyReply::Ok) {
            // Echo so tests can verify the socket is usable post-exchange.
            let (mut reader, mut writer) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
        Ok(())
    }
}
