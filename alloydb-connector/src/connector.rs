//! The process-wide connector facade.
//!
//! A [`Connector`] maps instance URIs to their refresh state machines,
//! shares one RSA key pair and one HTTP client across all of them, and
//! performs the actual dial: TCP connect, mTLS handshake pinned to the
//! instance UID, then the metadata exchange.

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::stream::{FuturesUnordered, StreamExt};
use rustls::pki_types::ServerName;
use secrecy::SecretString;
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::{debug, warn};

use crate::{
    api::{
        API_REQUEST_TIMEOUT, AdminApi, AdminApiClient, DEFAULT_API_ENDPOINT,
        DEFAULT_CERT_DURATION,
    },
    config::{ConnectOptions, IpType, RefreshStrategy},
    error::Error,
    exchange,
    instance::Instance,
    keys::{self, SharedKeyPair},
    shutdown::Shutdown,
    task::Task,
    tls,
    token::TokenProvider,
    uri::InstanceUri,
};

/// The fixed port AlloyDB server proxies listen on.
pub const SERVER_PROXY_PORT: u16 = 5433;

/// Default bound on TCP connect + TLS handshake time.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `close` waits for background tasks before giving up on them.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// The base user agent; a configured suffix is appended after a space.
const CONNECTOR_USER_AGENT: &str =
    concat!("alloydb-rust-connector/", env!("CARGO_PKG_VERSION"));

/// Dials authenticated, end-to-end encrypted connections to AlloyDB
/// instances. Cheap to clone; all clones share state.
///
/// ```no_run
/// # async fn example() -> Result<(), alloydb_connector::Error> {
/// use alloydb_connector::{Connector, StaticTokenProvider};
/// use std::sync::Arc;
///
/// let connector = Connector::builder()
///     .credentials(Arc::new(StaticTokenProvider::new("ya29...")))
///     .build()?;
///
/// let stream = connector
///     .connect(
///         "projects/my-project/locations/us-central1\
///          /clusters/my-cluster/instances/my-instance",
///     )
///     .await?;
/// // Hand `stream` to your database driver.
/// # drop(stream);
/// # connector.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").finish_non_exhaustive()
    }
}

struct ConnectorInner {
    api: Arc<dyn AdminApi>,
    token_provider: Arc<dyn TokenProvider>,
    keys: SharedKeyPair,
    user_agent: String,
    ip_type: IpType,
    enable_iam_auth: bool,
    strategy: RefreshStrategy,
    server_proxy_port: u16,
    dial_timeout: Duration,
    state: Mutex<ConnectorState>,
    shutdown: Shutdown,
}

#[derive(Default)]
struct ConnectorState {
    instances: HashMap<InstanceUri, Instance>,
    /// Background refresh loops, joined on close.
    refresh_loops: Vec<Task<()>>,
    closed: bool,
}

impl Connector {
    pub fn builder() -> ConnectorBuilder {
        ConnectorBuilder::default()
    }

    /// Establishes a ready-to-use connection to `uri` with the connector's
    /// default options. See [`Connector::connect_with`].
    pub async fn connect(
        &self,
        uri: &str,
    ) -> Result<TlsStream<TcpStream>, Error> {
        self.connect_with(uri, ConnectOptions::default()).await
    }

    /// Establishes a connection to `uri`: resolves (or creates) the
    /// instance's refresh state, TCP-dials the selected endpoint, completes
    /// the mTLS handshake against the instance's identity, and runs the
    /// metadata exchange.
    ///
    /// The returned stream is ready for the database protocol; the caller's
    /// driver performs the database handshake. Dropping the returned future
    /// abandons only this attempt; background credential state is unaffected.
    pub async fn connect_with(
        &self,
        uri: &str,
        options: ConnectOptions,
    ) -> Result<TlsStream<TcpStream>, Error> {
        let uri = InstanceUri::from_str(uri)?;
        let instance = self.instance(uri)?;
        let info = instance.connection_info().await?;

        let ip_type = options.ip_type.unwrap_or(self.inner.ip_type);
        let enable_iam_auth = options
            .enable_iam_auth
            .unwrap_or(self.inner.enable_iam_auth);

        // Endpoint selection happens before any dial so a misconfigured
        // ip_type fails fast with a typed error.
        let endpoint = info.endpoint(ip_type)?;
        let port = self.inner.server_proxy_port;
        debug!(%endpoint, %port, %ip_type, "Dialing instance");

        let tcp = match tokio::time::timeout(
            self.inner.dial_timeout,
            TcpStream::connect((endpoint, port)),
        )
        .await
        {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                // A dead endpoint may mean the cached IP is stale; renew
                // credentials for the next attempt.
                instance.force_refresh();
                return Err(Error::Network(format!(
                    "failed to connect to {endpoint}:{port}: {e}"
                )));
            }
            Err(_elapsed) => {
                instance.force_refresh();
                return Err(Error::Network(format!(
                    "dialing {endpoint}:{port} timed out after {:?}",
                    self.inner.dial_timeout,
                )));
            }
        };
        let _ = tcp.set_nodelay(true);

        // The expected server identity is the instance UID, never the dialed
        // address: the server proxy's certificate has the UID as its SAN.
        let server_name = ServerName::try_from(info.instance_uid().to_owned())
            .map_err(|e| {
                Error::Certificate(format!(
                    "instance UID '{}' is not a valid server name: {e}",
                    info.instance_uid(),
                ))
            })?;

        let tls_connect = TlsConnector::from(info.tls_config())
            .connect(server_name, tcp);
        let mut stream =
            match tokio::time::timeout(self.inner.dial_timeout, tls_connect)
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    // A failed handshake often means the server rotated its
                    // identity; renew credentials for the next attempt.
                    instance.force_refresh();
                    return Err(classify_handshake_error(e));
                }
                Err(_elapsed) => {
                    instance.force_refresh();
                    return Err(Error::Network(format!(
                        "TLS handshake with {endpoint}:{port} timed out"
                    )));
                }
            };

        // Fetch the IAM token immediately before the exchange so it carries
        // its full remaining lifetime.
        let iam_token: Option<SecretString> = if enable_iam_auth {
            Some(self.inner.token_provider.token().await?)
        } else {
            None
        };

        let exchange_result = exchange::exchange(
            &mut stream,
            &self.inner.user_agent,
            iam_token.as_ref(),
        )
        .await;
        if let Err(e) = exchange_result {
            instance.force_refresh();
            return Err(e);
        }

        Ok(stream)
    }

    /// Looks up or lazily creates the [`Instance`] for `uri`.
    fn instance(&self, uri: InstanceUri) -> Result<Instance, Error> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        if let Some(instance) = state.instances.get(&uri) {
            return Ok(instance.clone());
        }

        let (instance, refresh_loop) = Instance::spawn(
            uri.clone(),
            Arc::clone(&self.inner.api),
            Arc::clone(&self.inner.token_provider),
            self.inner.keys.clone(),
            self.inner.strategy,
            self.inner.shutdown.clone(),
        );
        state.instances.insert(uri, instance.clone());
        if let Some(refresh_loop) = refresh_loop {
            state.refresh_loops.push(refresh_loop);
        }
        Ok(instance)
    }

    /// Shuts the connector down: cancels scheduled and in-flight refreshes,
    /// fails pending callers with [`Error::Closed`], and waits (bounded) for
    /// background tasks to wind down. Idempotent.
    ///
    /// Already-established connections returned by [`Connector::connect`] are
    /// not touched; callers own those sockets.
    pub async fn close(&self) {
        let (instances, refresh_loops) = {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            (
                std::mem::take(&mut state.instances),
                std::mem::take(&mut state.refresh_loops),
            )
        };

        self.inner.shutdown.send();
        for instance in instances.values() {
            instance.close();
        }

        let mut remaining = refresh_loops
            .into_iter()
            .collect::<FuturesUnordered<_>>();
        let wind_down = async {
            while let Some(_result) = remaining.next().await {}
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, wind_down).await.is_err() {
            warn!("Some background refresh tasks did not finish on time");
        }
    }
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        // Guarantees background tasks stop even if `close` was never called.
        self.shutdown.send();
    }
}

/// rustls failures caused by certificate verification surface as
/// [`Error::Certificate`]; everything else at handshake time is
/// [`Error::Network`].
fn classify_handshake_error(e: std::io::Error) -> Error {
    let invalid_cert = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .and_then(|tls_error| match tls_error {
            rustls::Error::InvalidCertificate(reason) => Some(reason),
            _ => None,
        });
    match invalid_cert {
        Some(reason) => Error::Certificate(format!(
            "server presented an unacceptable certificate: {reason:?}"
        )),
        None => Error::Network(format!("TLS handshake failed: {e}")),
    }
}

/// Configures and builds a [`Connector`].
///
/// Only `credentials` is required; every other option has a production
/// default.
#[derive(Default)]
pub struct ConnectorBuilder {
    credentials: Option<Arc<dyn TokenProvider>>,
    quota_project: Option<String>,
    api_endpoint: Option<String>,
    user_agent: Option<String>,
    ip_type: IpType,
    enable_iam_auth: bool,
    refresh_strategy: RefreshStrategy,
    server_proxy_port: Option<u16>,
    dial_timeout: Option<Duration>,
    api_timeout: Option<Duration>,
    cert_duration: Option<Duration>,
    #[cfg(any(test, feature = "test-utils"))]
    admin_api: Option<Arc<dyn AdminApi>>,
    #[cfg(any(test, feature = "test-utils"))]
    client_key_pair: Option<Arc<keys::ClientKeyPair>>,
}

impl ConnectorBuilder {
    /// The OAuth2 token source used for the Admin API and (when IAM auth is
    /// enabled) the metadata exchange. Required.
    pub fn credentials(mut self, credentials: Arc<dyn TokenProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Bills API quota to this project instead of the credentials' project.
    pub fn quota_project(mut self, project: impl Into<String>) -> Self {
        self.quota_project = Some(project.into());
        self
    }

    /// Overrides the Admin API base URL, e.g. for sandbox environments.
    pub fn api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.api_endpoint = Some(endpoint.into());
        self
    }

    /// Appended to the connector's own user agent, both on Admin API
    /// requests and in the metadata exchange.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Default endpoint selection; see [`IpType`]. Overridable per connect.
    pub fn ip_type(mut self, ip_type: IpType) -> Self {
        self.ip_type = ip_type;
        self
    }

    /// Default auth mode for the metadata exchange; `false` means database
    /// native auth. Overridable per connect.
    pub fn enable_iam_auth(mut self, enable: bool) -> Self {
        self.enable_iam_auth = enable;
        self
    }

    /// When credentials are renewed; see [`RefreshStrategy`].
    pub fn refresh_strategy(mut self, strategy: RefreshStrategy) -> Self {
        self.refresh_strategy = strategy;
        self
    }

    /// Port the instances' server proxies listen on. The production fleet
    /// always uses [`SERVER_PROXY_PORT`].
    pub fn server_proxy_port(mut self, port: u16) -> Self {
        self.server_proxy_port = Some(port);
        self
    }

    /// Bound on TCP connect and TLS handshake time, each.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Per-attempt deadline for Admin API requests.
    pub fn api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = Some(timeout);
        self
    }

    /// Requested lifetime for ephemeral client certificates.
    pub fn cert_duration(mut self, duration: Duration) -> Self {
        self.cert_duration = Some(duration);
        self
    }

    /// Replaces the HTTP Admin API client, e.g. with an in-memory mock.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn admin_api(mut self, api: Arc<dyn AdminApi>) -> Self {
        self.admin_api = Some(api);
        self
    }

    /// Injects a pre-generated key pair, skipping the (slow) RSA generation.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn client_key_pair(mut self, keys: Arc<keys::ClientKeyPair>) -> Self {
        self.client_key_pair = Some(keys);
        self
    }

    /// Builds the connector. Must be called within a Tokio runtime: key
    /// generation starts in the background immediately.
    pub fn build(self) -> Result<Connector, Error> {
        let token_provider = self.credentials.ok_or_else(|| {
            Error::Config(
                "credentials are required; inject a TokenProvider".to_owned(),
            )
        })?;

        let user_agent = match &self.user_agent {
            Some(suffix) => format!("{CONNECTOR_USER_AGENT} {suffix}"),
            None => CONNECTOR_USER_AGENT.to_owned(),
        };
        let endpoint = self
            .api_endpoint
            .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_owned());

        let api: Arc<dyn AdminApi> = {
            #[cfg(any(test, feature = "test-utils"))]
            if let Some(api) = self.admin_api {
                api
            } else {
                Arc::new(Self::build_api_client(
                    &user_agent,
                    endpoint,
                    self.quota_project,
                    self.api_timeout,
                    self.cert_duration,
                )?)
            }
            #[cfg(not(any(test, feature = "test-utils")))]
            Arc::new(Self::build_api_client(
                &user_agent,
                endpoint,
                self.quota_project,
                self.api_timeout,
                self.cert_duration,
            )?)
        };

        let keys = {
            #[cfg(any(test, feature = "test-utils"))]
            if let Some(keys) = self.client_key_pair {
                keys::ready(keys)
            } else {
                Self::spawn_keygen()
            }
            #[cfg(not(any(test, feature = "test-utils")))]
            Self::spawn_keygen()
        };

        Ok(Connector {
            inner: Arc::new(ConnectorInner {
                api,
                token_provider,
                keys,
                user_agent,
                ip_type: self.ip_type,
                enable_iam_auth: self.enable_iam_auth,
                strategy: self.refresh_strategy,
                server_proxy_port: self
                    .server_proxy_port
                    .unwrap_or(SERVER_PROXY_PORT),
                dial_timeout: self.dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT),
                state: Mutex::new(ConnectorState::default()),
                shutdown: Shutdown::new(),
            }),
        })
    }

    fn build_api_client(
        user_agent: &str,
        endpoint: String,
        quota_project: Option<String>,
        api_timeout: Option<Duration>,
        cert_duration: Option<Duration>,
    ) -> Result<AdminApiClient, Error> {
        // Plain http is tolerated only so local mock endpoints work.
        let https_only = !endpoint.starts_with("http://");
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .use_preconfigured_tls(tls::admin_api_client_config())
            .https_only(https_only)
            .timeout(api_timeout.unwrap_or(API_REQUEST_TIMEOUT))
            .build()
            .map_err(|e| {
                Error::Config(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(AdminApiClient::new(
            client,
            endpoint,
            quota_project,
            cert_duration.unwrap_or(DEFAULT_CERT_DURATION),
        ))
    }

    fn spawn_keygen() -> SharedKeyPair {
        let (keys, driver) = keys::spawn_generate();
        // Generation finishes on its own; nothing joins this handle.
        driver.detach();
        keys
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering;

    use alloydb_proto::AuthType;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::{
        error::ErrorKind,
        test_utils::{self, MockAdminApi, MockServerProxy, ProxyReply},
        token::StaticTokenProvider,
    };

    /// Builds a connector wired to the in-memory control plane and the given
    /// proxy port, with the shared test key pair injected.
    fn test_connector(
        api: Arc<MockAdminApi>,
        proxy_port: u16,
    ) -> ConnectorBuilder {
        Connector::builder()
            .credentials(Arc::new(StaticTokenProvider::new("tok-XYZ")))
            .admin_api(api)
            .client_key_pair(test_utils::test_key_pair())
            .server_proxy_port(proxy_port)
    }

    #[test]
    fn builder_requires_credentials() {
        let err = Connector::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    /// Scenario: default options, healthy control plane and proxy. One
    /// upstream certificate call, a usable socket, database-native auth.
    #[tokio::test]
    async fn connect_end_to_end() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let proxy = MockServerProxy::spawn(
            api.authority.server_config("uid-1"),
            ProxyReply::Ok,
        )
        .await;
        let connector = test_connector(api.clone(), proxy.port)
            .user_agent("e2e-test")
            .build()
            .unwrap();

        let mut stream = connector
            .connect(&test_utils::test_uri().to_string())
            .await
            .unwrap();

        // The socket must be usable for the database protocol (echoed here).
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        assert_eq!(api.generate_cert_calls.load(Ordering::SeqCst), 1);
        let requests = proxy.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].auth_type(), AuthType::DbNative);
        assert!(requests[0].oauth2_token.is_empty());
        assert!(
            requests[0]
                .user_agent
                .starts_with("alloydb-rust-connector/"),
            "{}",
            requests[0].user_agent,
        );
        assert!(requests[0].user_agent.ends_with(" e2e-test"));
        drop(requests);

        connector.close().await;
    }

    /// Scenario: many concurrent connects racing the initial refresh still
    /// produce exactly one upstream refresh, and every caller gets a socket.
    #[tokio::test]
    async fn concurrent_connects_share_one_refresh() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let gate = api.hold_refreshes();
        let proxy = MockServerProxy::spawn(
            api.authority.server_config("uid-1"),
            ProxyReply::Ok,
        )
        .await;
        let connector =
            test_connector(api.clone(), proxy.port).build().unwrap();

        let mut attempts = Vec::new();
        for _ in 0..32 {
            let connector = connector.clone();
            attempts.push(tokio::spawn(async move {
                connector
                    .connect(&test_utils::test_uri().to_string())
                    .await
            }));
        }
        tokio::task::yield_now().await;
        gate.release();

        let mut streams = Vec::new();
        for attempt in attempts {
            streams.push(attempt.await.unwrap().unwrap());
        }
        assert_eq!(streams.len(), 32);
        assert_eq!(api.generate_cert_calls.load(Ordering::SeqCst), 1);

        connector.close().await;
    }

    /// Scenario: IAM database auth. The exchange carries `AUTO_IAM` and a
    /// freshly-fetched token.
    #[tokio::test]
    async fn iam_auth_sends_fresh_token() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let proxy = MockServerProxy::spawn(
            api.authority.server_config("uid-1"),
            ProxyReply::Ok,
        )
        .await;
        let connector = test_connector(api.clone(), proxy.port)
            .enable_iam_auth(true)
            .build()
            .unwrap();

        let _stream = connector
            .connect(&test_utils::test_uri().to_string())
            .await
            .unwrap();

        let requests = proxy.requests.lock().unwrap();
        assert_eq!(requests[0].auth_type(), AuthType::AutoIam);
        assert_eq!(requests[0].oauth2_token, "tok-XYZ");
        drop(requests);

        connector.close().await;
    }

    /// A rejected metadata exchange surfaces as `Protocol` and triggers a
    /// force refresh.
    #[tokio::test]
    async fn metadata_exchange_rejection() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let proxy = MockServerProxy::spawn(
            api.authority.server_config("uid-1"),
            ProxyReply::Error("not allowed".to_owned()),
        )
        .await;
        let connector =
            test_connector(api.clone(), proxy.port).build().unwrap();

        let err = connector
            .connect(&test_utils::test_uri().to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("not allowed"), "{err}");

        // The rejection kicked off a credential renewal.
        api.wait_for_refreshes(2).await;

        connector.close().await;
    }

    /// A server presenting the wrong identity fails the handshake with
    /// `Certificate` before any application data is sent.
    #[tokio::test]
    async fn wrong_server_identity_is_rejected() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let proxy = MockServerProxy::spawn(
            api.authority.server_config("uid-other"),
            ProxyReply::Ok,
        )
        .await;
        let connector =
            test_connector(api.clone(), proxy.port).build().unwrap();

        let err = connector
            .connect(&test_utils::test_uri().to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Certificate);
        // The exchange never ran; nothing reached the proxy.
        assert!(proxy.requests.lock().unwrap().is_empty());

        connector.close().await;
    }

    /// Scenario: the instance rotates its identity mid-session. The next
    /// connect fails and force-refreshes; once the refresh lands, connects
    /// succeed against the new identity.
    #[tokio::test]
    async fn server_identity_rotation_recovers() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let proxy = MockServerProxy::spawn(
            api.authority.server_config("uid-1"),
            ProxyReply::Ok,
        )
        .await;
        let connector =
            test_connector(api.clone(), proxy.port).build().unwrap();
        let uri = test_utils::test_uri().to_string();

        let _stream = connector.connect(&uri).await.unwrap();

        // The instance rotates: new identity on both planes.
        api.set_instance_uid("uid-2");
        proxy.set_config(api.authority.server_config("uid-2"));

        // This attempt still pins the cached uid-1 and must fail...
        let err = connector.connect(&uri).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Certificate);

        // ...but it forced a refresh; once current, connects succeed.
        let mut attempts = 0;
        loop {
            match connector.connect(&uri).await {
                Ok(_stream) => break,
                Err(_) if attempts < 100 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => panic!("never recovered: {e}"),
            }
        }

        connector.close().await;
    }

    /// `ip_type` misconfiguration fails fast, before any dial.
    #[tokio::test]
    async fn endpoint_selection_fails_without_dialing() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        // No proxy at all: a dial attempt would error differently.
        let connector = test_connector(api.clone(), 1).build().unwrap();

        let err = connector
            .connect_with(
                &test_utils::test_uri().to_string(),
                ConnectOptions {
                    ip_type: Some(IpType::Public),
                    ..ConnectOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("public IP"), "{err}");

        let err = connector
            .connect_with(
                &test_utils::test_uri().to_string(),
                ConnectOptions {
                    ip_type: Some(IpType::Psc),
                    ..ConnectOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("PSC"), "{err}");

        connector.close().await;
    }

    /// Scenario: the full HTTP pipeline. The real `AdminApiClient` talks to
    /// the mock control plane over HTTP, including JSON bodies both ways.
    #[tokio::test]
    async fn connect_via_http_control_plane() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let endpoint = test_utils::spawn_admin_http(api.clone()).await;
        let proxy = MockServerProxy::spawn(
            api.authority.server_config("uid-1"),
            ProxyReply::Ok,
        )
        .await;

        let connector = Connector::builder()
            .credentials(Arc::new(StaticTokenProvider::new("tok-XYZ")))
            .api_endpoint(endpoint)
            .client_key_pair(test_utils::test_key_pair())
            .server_proxy_port(proxy.port)
            .build()
            .unwrap();

        let mut stream = connector
            .connect(&test_utils::test_uri().to_string())
            .await
            .unwrap();
        stream.write_all(b"ok?").await.unwrap();
        stream.flush().await.unwrap();
        let mut echoed = [0u8; 3];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ok?");

        assert_eq!(api.generate_cert_calls.load(Ordering::SeqCst), 1);
        connector.close().await;
    }

    /// Close fails new connects with `Closed` and is idempotent.
    #[tokio::test]
    async fn close_is_terminal() {
        test_utils::init_logger();
        let api = Arc::new(MockAdminApi::new("uid-1"));
        let connector = test_connector(api, 1).build().unwrap();

        connector.close().await;
        connector.close().await;

        let err = connector
            .connect(&test_utils::test_uri().to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
