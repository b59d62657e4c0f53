//! The listener resource model handed to the data plane.
//!
//! Listeners are re-synthesized and re-serialized on every reconciliation,
//! so the model keeps deterministic content: any accidental reordering with
//! identical semantics would be perceived by the data plane as a
//! configuration change and churn connections.

use crate::Resource;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

/// A bound network address plus its filter chains; the unit of configuration
/// synthesized for the data plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,

    /// Filters that run before any chain match, in order. Proxy-protocol
    /// decoding must precede SNI inspection.
    pub listener_filters: Vec<ListenerFilter>,

    pub filter_chains: Vec<FilterChain>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerFilter {
    /// Expect a PROXY v1/v2 preamble on accepted connections.
    ProxyProtocol,

    /// Demultiplex SNI so filter-chain matches can apply before decryption.
    TlsInspector,
}

/// A processing pipeline scoped by an SNI match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FilterChain {
    /// The TLS server name selecting this chain. `None` on the plaintext
    /// listener's single chain.
    pub sni: Option<String>,

    pub tls: Option<DownstreamTlsContext>,

    pub filter: Filter,
}

/// The terminal filter of a chain: HTTP connection management or raw TCP
/// proxying. Exactly one per chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    HttpConnectionManager {
        /// Name of the route configuration this pipeline resolves requests
        /// against.
        route_config: String,
        access_log: Option<AccessLog>,
        /// Zero disables the timeout; never negative on the wire.
        request_timeout: Duration,
    },
    TcpProxy {
        /// The upstream cluster receiving the proxied bytes.
        cluster: String,
        access_log: Option<AccessLog>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DownstreamTlsContext {
    /// Reference to the secret holding the certificate material.
    pub secret: String,

    pub min_tls_version: TlsVersion,

    /// Application protocols offered during the handshake. Empty when no
    /// ALPN is offered; non-empty only on HTTP chains, since offering ALPN
    /// on a TCP passthrough chain would force a negotiation the backend
    /// never sees.
    pub alpn_protocols: Vec<String>,

    pub downstream_validation: Option<ClientValidation>,
}

/// Downstream client-certificate validation policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClientValidation {
    /// Reference to the secret holding the CA bundle clients are validated
    /// against.
    pub ca_secret: String,
}

/// Minimum TLS protocol versions negotiable by a filter chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "1.1")]
    V1_1,
    #[serde(rename = "1.2")]
    V1_2,
    #[serde(rename = "1.3")]
    V1_3,
}

/// An access-log destination and rendering mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLog {
    /// One preformatted text line per request.
    Plain { path: String },

    /// One structured entry per request, restricted to the listed fields.
    Structured { path: String, fields: Vec<String> },
}

// === impl Listener ===

impl Listener {
    pub fn new(
        name: impl ToString,
        address: impl ToString,
        port: u16,
        listener_filters: Vec<ListenerFilter>,
    ) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            port,
            listener_filters,
            filter_chains: Vec::new(),
        }
    }
}

impl Resource for Listener {
    fn name(&self) -> &str {
        &self.name
    }
}

// === impl TlsVersion ===

impl FromStr for TlsVersion {
    type Err = InvalidTlsVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.1" => Ok(Self::V1_1),
            "1.2" => Ok(Self::V1_2),
            "1.3" => Ok(Self::V1_3),
            _ => Err(InvalidTlsVersion(s.to_string())),
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1_1 => "1.1".fmt(f),
            Self::V1_2 => "1.2".fmt(f),
            Self::V1_3 => "1.3".fmt(f),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidTlsVersion(String);

impl fmt::Display for InvalidTlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid TLS version {:?}; expected 1.1, 1.2, or 1.3", self.0)
    }
}

impl std::error::Error for InvalidTlsVersion {}
