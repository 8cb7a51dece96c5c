//! Backend location value types.
//!
//! An [`EndpointAddress`] is a single resolvable backend location (scheme, host, port and the
//! protocol spoken there). Addresses are immutable once built and compare equal by their
//! normalized URI, so they can key per-address state in load balancers and pools.
use std::{
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Metadata key carrying the static weight of an address.
pub const WEIGHT_METADATA_KEY: &str = "weight";

/// Errors related to endpoint addresses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddressError {
    /// The URI could not be parsed at all
    #[error("Invalid endpoint URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    /// The URI scheme does not map to a supported protocol
    #[error("Unsupported scheme '{scheme}' in endpoint URI '{uri}'")]
    UnsupportedScheme { uri: String, scheme: String },

    /// The protocol name is unknown
    #[error("Unknown protocol type: {0}")]
    UnknownProtocol(String),
}

/// Result type for address operations
pub type AddressResult<T> = Result<T, AddressError>;

/// Wire protocol family spoken by a route or backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProtocolType {
    Http,
    Grpc,
    #[serde(rename = "WEBSOCKET")]
    WebSocket,
    Tcp,
}

impl ProtocolType {
    /// Canonical upper-case name used in configuration and pool keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Http => "HTTP",
            ProtocolType::Grpc => "GRPC",
            ProtocolType::WebSocket => "WEBSOCKET",
            ProtocolType::Tcp => "TCP",
        }
    }

    /// Whether an inbound request in `self` can be forwarded to a backend speaking `target`.
    ///
    /// Identical protocols always convert. HTTP can be bridged to gRPC, TCP and WebSocket,
    /// and WebSocket frames can be relayed over raw TCP.
    pub fn can_convert_to(&self, target: ProtocolType) -> bool {
        if *self == target {
            return true;
        }
        matches!(
            (self, target),
            (ProtocolType::Http, ProtocolType::Grpc)
                | (ProtocolType::Http, ProtocolType::Tcp)
                | (ProtocolType::Http, ProtocolType::WebSocket)
                | (ProtocolType::WebSocket, ProtocolType::Tcp)
        )
    }

    /// Default port when a URI omits one.
    pub fn default_port(&self, secure: bool) -> u16 {
        match (self, secure) {
            (ProtocolType::Http | ProtocolType::WebSocket, false) => 80,
            (ProtocolType::Http | ProtocolType::WebSocket, true) => 443,
            (ProtocolType::Grpc, _) => 50051,
            (ProtocolType::Tcp, _) => 0,
        }
    }

    fn from_scheme(scheme: &str) -> Option<(ProtocolType, bool)> {
        match scheme {
            "http" => Some((ProtocolType::Http, false)),
            "https" => Some((ProtocolType::Http, true)),
            "ws" => Some((ProtocolType::WebSocket, false)),
            "wss" => Some((ProtocolType::WebSocket, true)),
            "grpc" => Some((ProtocolType::Grpc, false)),
            "grpcs" => Some((ProtocolType::Grpc, true)),
            "tcp" => Some((ProtocolType::Tcp, false)),
            _ => None,
        }
    }
}

impl FromStr for ProtocolType {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HTTP" | "HTTPS" => Ok(ProtocolType::Http),
            "GRPC" => Ok(ProtocolType::Grpc),
            "WEBSOCKET" | "WS" => Ok(ProtocolType::WebSocket),
            "TCP" => Ok(ProtocolType::Tcp),
            other => Err(AddressError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol descriptor: family plus version string (e.g. `HTTP` / `1.1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protocol {
    #[serde(rename = "type")]
    pub kind: ProtocolType,
    pub version: String,
}

impl Protocol {
    pub fn new(kind: ProtocolType, version: impl Into<String>) -> Self {
        Self {
            kind,
            version: version.into(),
        }
    }

    pub fn http() -> Self {
        Self::new(ProtocolType::Http, "1.1")
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::http()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.version)
    }
}

/// A single resolvable backend location.
#[derive(Debug, Clone)]
pub struct EndpointAddress {
    uri: String,
    scheme: String,
    host: String,
    port: u16,
    secure: bool,
    protocol: ProtocolType,
    metadata: BTreeMap<String, String>,
}

impl EndpointAddress {
    /// Parse an address from a URI such as `http://10.0.0.1:8080`.
    ///
    /// The URI is normalized to `scheme://host:port` (path and query are dropped), which is
    /// also what equality and hashing use.
    pub fn parse(uri: &str) -> AddressResult<Self> {
        let parsed = Url::parse(uri.trim()).map_err(|e| AddressError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = parsed.scheme().to_ascii_lowercase();
        let (protocol, secure) =
            ProtocolType::from_scheme(&scheme).ok_or_else(|| AddressError::UnsupportedScheme {
                uri: uri.to_string(),
                scheme: scheme.clone(),
            })?;

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AddressError::InvalidUri {
                uri: uri.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_ascii_lowercase();

        let port = parsed
            .port()
            .unwrap_or_else(|| protocol.default_port(secure));

        Ok(Self {
            uri: format!("{scheme}://{host}:{port}"),
            scheme,
            host,
            port,
            secure,
            protocol,
            metadata: BTreeMap::new(),
        })
    }

    /// Attach metadata, consuming the address.
    pub fn with_metadata(mut self, metadata: impl IntoIterator<Item = (String, String)>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Attach a static load-balancing weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.metadata
            .insert(WEIGHT_METADATA_KEY.to_string(), weight.to_string());
        self
    }

    /// Normalized URI (`scheme://host:port`).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Static weight from metadata; missing or unparsable weights count as 1 and the
    /// result is never below 1.
    pub fn weight(&self) -> u32 {
        self.declared_weight().unwrap_or(1).max(1)
    }

    /// The weight carried in metadata, if it parses.
    pub fn declared_weight(&self) -> Option<u32> {
        self.metadata
            .get(WEIGHT_METADATA_KEY)
            .and_then(|w| w.trim().parse::<u32>().ok())
    }

    /// `host:port` authority, as used in outbound request URIs.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for EndpointAddress {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for EndpointAddress {}

impl Hash for EndpointAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl FromStr for EndpointAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndpointAddress::parse(s)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}
