//! The shared RSA client key pair.

use std::sync::Arc;

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use rsa::{
    RsaPrivateKey,
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tracing::debug;

use crate::{error::Error, task::Task};

const RSA_KEY_BITS: usize = 2048;

/// The RSA-2048 key pair shared by every instance of a connector.
///
/// The PEM public half is sent to the Admin API, which binds it into each
/// ephemeral client certificate; the private half authenticates the client
/// side of the TLS handshake. Immutable once produced.
pub struct ClientKeyPair {
    key_der: PrivatePkcs8KeyDer<'static>,
    public_key_pem: String,
}

impl ClientKeyPair {
    /// Generates a fresh pair. CPU-heavy (typically hundreds of milliseconds,
    /// and much longer in unoptimized builds); call off the async request
    /// path, e.g. via [`tokio::task::spawn_blocking`].
    pub fn generate() -> Result<Self, Error> {
        fn keygen_failed(e: impl std::fmt::Display) -> Error {
            Error::Certificate(format!("RSA key generation failed: {e}"))
        }

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(keygen_failed)?;

        let key_der = private_key
            .to_pkcs8_der()
            .map_err(keygen_failed)?
            .as_bytes()
            .to_vec();
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(keygen_failed)?;

        Ok(Self {
            key_der: PrivatePkcs8KeyDer::from(key_der),
            public_key_pem,
        })
    }

    /// The SPKI PEM (`-----BEGIN PUBLIC KEY-----`) sent to the control plane.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// A copy of the private key in the form rustls wants for client auth.
    pub(crate) fn client_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::from(self.key_der.clone_key())
    }
}

/// The singleflight handle to the (possibly still generating) key pair. Every
/// instance clones one and awaits it at refresh time.
pub(crate) type SharedKeyPair =
    Shared<BoxFuture<'static, Result<Arc<ClientKeyPair>, Error>>>;

/// Wraps an already-generated pair (e.g. one injected by tests) into the
/// shared handle.
pub(crate) fn ready(keys: Arc<ClientKeyPair>) -> SharedKeyPair {
    async move { Ok(keys) }.boxed().shared()
}

/// Kicks off key generation on the blocking pool. The returned driver task
/// polls the shared future so generation makes progress before the first
/// caller awaits it.
pub(crate) fn spawn_generate() -> (SharedKeyPair, Task<()>) {
    let keys = async move {
        let started = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(ClientKeyPair::generate)
            .await
            .unwrap_or_else(|join_err| {
                Err(Error::Certificate(format!(
                    "RSA key generation task failed: {join_err}"
                )))
            });
        debug!("Generated client key pair in {:?}", started.elapsed());
        result.map(Arc::new)
    }
    .boxed()
    .shared();

    let driver = Task::spawn("client-keygen", {
        let keys = keys.clone();
        async move {
            let _ = keys.await;
        }
    });

    (keys, driver)
}
