//! The post-handshake metadata exchange.
//!
//! Immediately after the TLS handshake with an instance's server proxy, and
//! before any database bytes flow, the client sends one
//! [`MetadataExchangeRequest`] and reads one [`MetadataExchangeResponse`].
//! Both are framed as a 4-byte big-endian length followed by the protobuf
//! body.

use alloydb_proto::{
    AuthType, MetadataExchangeRequest, MetadataExchangeResponse, ResponseCode,
};
use prost::Message;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

const LEN_PREFIX: usize = 4;

/// Responses larger than this are assumed to be garbage framing, not a real
/// server reply.
const MAX_RESPONSE_LEN: u32 = 16 * 1024;

/// Runs the client half of the exchange over the established TLS session.
///
/// `iam_token` carries a freshly-fetched OAuth2 token iff automatic IAM
/// database authentication is enabled; its presence selects the
/// [`AuthType::AutoIam`] auth type.
pub(crate) async fn exchange<S>(
    stream: &mut S,
    user_agent: &str,
    iam_token: Option<&SecretString>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth_type = match iam_token {
        Some(_) => AuthType::AutoIam,
        None => AuthType::DbNative,
    };
    let request = MetadataExchangeRequest {
        user_agent: user_agent.to_owned(),
        auth_type: auth_type as i32,
        oauth2_token: iam_token
            .map(|token| token.expose_secret().clone())
            .unwrap_or_default(),
    };

    let body_len = request.encoded_len();
    let mut frame = Vec::with_capacity(LEN_PREFIX + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    request
        .encode(&mut frame)
        .expect("Vec<u8> never runs out of capacity");

    let send_failed = |e: std::io::Error| {
        Error::Network(format!("metadata exchange send failed: {e}"))
    };
    stream.write_all(&frame).await.map_err(send_failed)?;
    stream.flush().await.map_err(send_failed)?;

    let recv_failed = |e: std::io::Error| {
        Error::Network(format!("metadata exchange receive failed: {e}"))
    };
    let mut len_buf = [0u8; LEN_PREFIX];
    stream.read_exact(&mut len_buf).await.map_err(recv_failed)?;
    let response_len = u32::from_be_bytes(len_buf);
    if response_len > MAX_RESPONSE_LEN {
        return Err(Error::Protocol(format!(
            "oversized metadata exchange response ({response_len} bytes)"
        )));
    }

    let mut body = vec![0u8; response_len as usize];
    stream.read_exact(&mut body).await.map_err(recv_failed)?;
    let response =
        MetadataExchangeResponse::decode(body.as_slice()).map_err(|e| {
            Error::Protocol(format!(
                "malformed metadata exchange response: {e}"
            ))
        })?;

    match response.response_code() {
        ResponseCode::Ok => Ok(()),
        code => {
            let reason = if response.error.is_empty() {
                format!("server replied {code:?}")
            } else {
                response.error
            };
            Err(Error::Protocol(format!(
                "server rejected the metadata exchange: {reason}"
            )))
        }
    }
}
