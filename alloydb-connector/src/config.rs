//! Connector configuration enums and per-connect overrides.

use std::{fmt, str::FromStr};

use crate::error::Error;

/// Which of an instance's addresses the connector dials.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum IpType {
    /// The instance's private (VPC) IP address. The default.
    #[default]
    Private,
    /// The instance's public IP address, if one is assigned.
    Public,
    /// The instance's Private Service Connect DNS name, if PSC is enabled.
    Psc,
}

impl FromStr for IpType {
    type Err = Error;

    /// Accepts the case-insensitive names `"private"`, `"public"`, `"psc"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(Self::Private),
            "public" => Ok(Self::Public),
            "psc" => Ok(Self::Psc),
            _ => Err(Error::Config(format!(
                "unknown ip_type '{s}'; expected PRIVATE, PUBLIC, or PSC"
            ))),
        }
    }
}

impl fmt::Display for IpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Private => "PRIVATE",
            Self::Public => "PUBLIC",
            Self::Psc => "PSC",
        };
        f.write_str(s)
    }
}

/// When an instance's credentials are renewed.
///
/// Both strategies share the same coalescing and force-refresh behavior; only
/// the scheduling differs.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum RefreshStrategy {
    /// Proactively renew in a background task, well before expiry, so a valid
    /// result is (almost) always on hand. The default.
    #[default]
    Background,
    /// Renew only when a caller needs a result and the cached one is missing
    /// or about to expire. No background work; suited to short-lived clients
    /// and serverless environments that throttle idle CPU.
    Lazy,
}

impl FromStr for RefreshStrategy {
    type Err = Error;

    /// Accepts the case-insensitive names `"background"`, `"lazy"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "lazy" => Ok(Self::Lazy),
            _ => Err(Error::Config(format!(
                "unknown refresh strategy '{s}'; expected BACKGROUND or LAZY"
            ))),
        }
    }
}

/// Per-`connect` overrides of the connector-wide defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectOptions {
    /// Overrides [`ConnectorBuilder::ip_type`].
    ///
    /// [`ConnectorBuilder::ip_type`]: crate::connector::ConnectorBuilder::ip_type
    pub ip_type: Option<IpType>,
    /// Overrides [`ConnectorBuilder::enable_iam_auth`].
    ///
    /// [`ConnectorBuilder::enable_iam_auth`]: crate::connector::ConnectorBuilder::enable_iam_auth
    pub enable_iam_auth: Option<bool>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn ip_type_from_str() {
        assert_eq!(IpType::from_str("PRIVATE").unwrap(), IpType::Private);
        assert_eq!(IpType::from_str("private").unwrap(), IpType::Private);
        assert_eq!(IpType::from_str("Public").unwrap(), IpType::Public);
        assert_eq!(IpType::from_str("psc").unwrap(), IpType::Psc);

        let err = IpType::from_str("ipv6").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn strategy_from_str() {
        assert_eq!(
            RefreshStrategy::from_str("BACKGROUND").unwrap(),
            RefreshStrategy::Background,
        );
        assert_eq!(
            RefreshStrategy::from_str("lazy").unwrap(),
            RefreshStrategy::Lazy,
        );
        assert!(RefreshStrategy::from_str("eager").is_err());
    }
}
