//! Wire messages for the AlloyDB metadata exchange.
//!
//! After the mTLS handshake with an instance's server proxy, the client sends
//! a [`MetadataExchangeRequest`] and reads back a [`MetadataExchangeResponse`]
//! before handing the socket to the database driver. Both messages are framed
//! by the caller as a 4-byte big-endian length followed by the protobuf body.
//!
//! These are hand-written `prost` definitions rather than `protoc` output;
//! the field numbers are fixed and must not change, since the same schema is
//! spoken by the sibling connectors in other languages.

/// Authentication mode conveyed to the server proxy.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
pub enum AuthType {
    /// Left unset by ancient clients; servers reject it.
    Unspecified = 0,
    /// Built-in database username/password auth; the driver authenticates
    /// after the exchange.
    DbNative = 1,
    /// Automatic IAM database authentication; the exchange itself carries a
    /// fresh OAuth2 token.
    AutoIam = 2,
}

/// Whether the server proxy accepted the exchange.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
pub enum ResponseCode {
    Unspecified = 0,
    /// The connection may proceed to the database protocol.
    Ok = 1,
    /// The connection was rejected; see `error`.
    Error = 2,
}

/// Client half of the metadata exchange.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadataExchangeRequest {
    /// Identifies the connector, e.g. `alloydb-rust-connector/0.1.0`.
    #[prost(string, tag = "1")]
    pub user_agent: String,
    #[prost(enumeration = "AuthType", tag = "2")]
    pub auth_type: i32,
    /// Populated iff `auth_type` is [`AuthType::AutoIam`].
    #[prost(string, tag = "3")]
    pub oauth2_token: String,
}

/// Server half of the metadata exchange.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadataExchangeResponse {
    #[prost(enumeration = "ResponseCode", tag = "1")]
    pub response_code: i32,
    /// Human-readable rejection reason, empty on success.
    #[prost(string, tag = "2")]
    pub error: String,
}

#[cfg(test)]
mod test {
    use prost::Message;

    use super::*;

    #[test]
    fn request_roundtrip() {
        let request = MetadataExchangeRequest {
            user_agent: "alloydb-rust-connector/0.1.0".to_owned(),
            auth_type: AuthType::AutoIam as i32,
            oauth2_token: "tok-XYZ".to_owned(),
        };

        let encoded = request.encode_to_vec();
        let decoded = MetadataExchangeRequest::decode(encoded.as_slice()).unwrap();
        assert_eq!(request, decoded);
        assert_eq!(decoded.auth_type(), AuthType::AutoIam);
    }

    #[test]
    fn response_roundtrip() {
        let response = MetadataExchangeResponse {
            response_code: ResponseCode::Error as i32,
            error: "instance does not allow IAM auth".to_owned(),
        };

        let encoded = response.encode_to_vec();
        let decoded =
            MetadataExchangeResponse::decode(encoded.as_slice()).unwrap();
        assert_eq!(response, decoded);
        assert_eq!(decoded.response_code(), ResponseCode::Error);
    }

    /// The field numbers are a wire contract shared with the sibling
    /// connectors; changing a tag breaks every deployed server proxy.
    #[test]
    fn request_tags_are_fixed() {
        let request = MetadataExchangeRequest {
            user_agent: "ua".to_owned(),
            auth_type: AuthType::DbNative as i32,
            oauth2_token: String::new(),
        };

        let encoded = request.encode_to_vec();
        // field 1 (user_agent), wire type 2 (length-delimited)
        assert_eq!(encoded[0], 0x0a);
        // field 2 (auth_type), wire type 0 (varint), value 1
        assert_eq!(&encoded[encoded.len() - 2..], &[0x10, 0x01]);
    }

    /// Unknown enum values decode to the raw i32 and the accessor falls back
    /// to `Unspecified`, so old clients survive new server codes.
    #[test]
    fn unknown_response_code_is_tolerated() {
        let response = MetadataExchangeResponse {
            response_code: 7,
            error: String::new(),
        };

        let decoded =
            MetadataExchangeResponse::decode(response.encode_to_vec().as_slice())
                .unwrap();
        assert_eq!(decoded.response_code, 7);
        assert_eq!(decoded.response_code(), ResponseCode::Unspecified);
    }
}
