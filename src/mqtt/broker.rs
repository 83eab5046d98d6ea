//! Broker descriptors and URL derivation
//!
//! A broker is identified by the service type string announced through service
//! discovery. That string alone decides which of the four transport classes is
//! used to reach it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const WEBSOCKET_MARKERS: [&str; 4] = [
    "_mqtt-ws._tcp.",
    "_mqtt-wss._tcp.",
    "._mqtt-ws._tcp",
    "._mqtt-wss._tcp",
];

const TLS_MARKERS: [&str; 4] = [
    "_mqtts._tcp.",
    "_mqtt-wss._tcp.",
    "._mqtts._tcp.",
    "._mqtt-wss._tcp.",
];

pub const DEFAULT_WS_PATH: &str = "/mqtt";

/// Transport variant inferred from a service type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportClass {
    TcpPlain,
    TcpTls,
    WebSocketPlain,
    WebSocketTls,
}

impl TransportClass {
    /// Classifies a discovery service type. Anything unrecognised is plain TCP.
    pub fn from_service_type(service_type: &str) -> Self {
        let websocket = WEBSOCKET_MARKERS.iter().any(|m| service_type.contains(m));
        let tls = TLS_MARKERS.iter().any(|m| service_type.contains(m));

        match (websocket, tls) {
            (true, true) => TransportClass::WebSocketTls,
            (true, false) => TransportClass::WebSocketPlain,
            (false, true) => TransportClass::TcpTls,
            (false, false) => TransportClass::TcpPlain,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            TransportClass::TcpPlain => "mqtt",
            TransportClass::TcpTls => "mqtts",
            TransportClass::WebSocketPlain => "ws",
            TransportClass::WebSocketTls => "wss",
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, TransportClass::TcpTls | TransportClass::WebSocketTls)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(
            self,
            TransportClass::WebSocketPlain | TransportClass::WebSocketTls
        )
    }
}

impl fmt::Display for TransportClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            TransportClass::TcpPlain => "TCP",
            TransportClass::TcpTls => "TCP+TLS",
            TransportClass::WebSocketPlain => "WebSocket",
            TransportClass::WebSocketTls => "WebSocket+TLS",
        };
        write!(f, "{}", label)
    }
}

#[derive(Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

// Keeps passwords out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn default_tls_verify() -> bool {
    true
}

/// A reachable MQTT endpoint as handed over by discovery or restored from
/// preferences.
///
/// Field order matters for the TOML encoding: plain values come before the
/// `credentials` table.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BrokerDescriptor {
    pub name: String,
    pub service_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl BrokerDescriptor {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            host: host.into(),
            port,
            domain: None,
            tls_verify: true,
            path_hint: None,
            credentials: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path_hint = Some(path.into());
        self
    }

    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn transport_class(&self) -> TransportClass {
        TransportClass::from_service_type(&self.service_type)
    }

    /// Connection identity: two descriptors address the same broker when host,
    /// port and service type agree. Name, credentials and flags are ignored.
    pub fn same_endpoint(&self, other: &BrokerDescriptor) -> bool {
        self.host == other.host && self.port == other.port && self.service_type == other.service_type
    }

    /// WebSocket path with a leading slash, falling back to `/mqtt`
    pub fn websocket_path(&self) -> String {
        match self.path_hint.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => {
                if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{}", path)
                }
            }
            _ => DEFAULT_WS_PATH.to_string(),
        }
    }

    /// Display URL: scheme and authority, never a path
    pub fn broker_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.transport_class().scheme(),
            self.host,
            self.port
        )
    }

    /// URL actually handed to the transport; WebSocket variants carry the path.
    pub fn connect_url(&self) -> String {
        let base = self.broker_url();
        if self.transport_class().is_websocket() {
            format!("{}{}", base, self.websocket_path())
        } else {
            base
        }
    }
}

impl fmt::Display for BrokerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.broker_url())
    }
}

/// Service record as delivered by the discovery collaborator.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DiscoveredService {
    pub name: String,
    pub service_type: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub txt_record: HashMap<String, String>,
    #[serde(default)]
    pub ipv4_addresses: Vec<String>,
    #[serde(default)]
    pub ipv6_addresses: Vec<String>,
}

impl DiscoveredService {
    /// Host to dial: the resolved hostname, otherwise the first resolved address.
    pub fn reachable_host(&self) -> Option<&str> {
        let host = self.host.trim();
        if !host.is_empty() {
            return Some(host);
        }
        self.ipv4_addresses
            .first()
            .or_else(|| self.ipv6_addresses.first())
            .map(String::as_str)
    }
}

impl From<&DiscoveredService> for BrokerDescriptor {
    fn from(service: &DiscoveredService) -> Self {
        let txt = &service.txt_record;
        let mut broker = BrokerDescriptor::new(
            service.name.clone(),
            service.service_type.clone(),
            service.reachable_host().unwrap_or_default(),
            service.port,
        );
        broker.domain = service.domain.clone();
        broker.path_hint = txt.get("path").cloned();

        if let (Some(username), Some(password)) = (txt.get("username"), txt.get("password")) {
            broker = broker.with_credentials(username.clone(), password.clone());
        }
        if let Some(verify) = txt.get("tls_verify") {
            broker.tls_verify = !verify.eq_ignore_ascii_case("false");
        }
        broker
    }
}

/// Finds the remembered broker among freshly discovered ones.
///
/// Hosts and addresses change between scans, so matching uses the instance
/// name and port, plus the domain when both sides know it.
pub fn select_preferred<'a>(
    discovered: &'a [BrokerDescriptor],
    preferred: &BrokerDescriptor,
) -> Option<&'a BrokerDescriptor> {
    discovered.iter().find(|candidate| {
        let domain_matches = match (&candidate.domain, &preferred.domain) {
            (Some(a), Some(b)) => a.trim_end_matches('.') == b.trim_end_matches('.'),
            _ => true,
        };
        candidate.name == preferred.name && candidate.port == preferred.port && domain_matches
    })
}
