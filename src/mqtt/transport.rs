//! Transport boundary
//!
//! The connection manager never talks to a network library directly. It asks a
//! [`TransportConnector`] to open a session and gets back a [`TransportLink`]
//! for outbound requests plus a channel of [`TransportEvent`]s for everything
//! the broker side does.
//!
//! Listener semantics map onto ownership: dropping the event receiver is
//! "remove all listeners", [`TransportLink::close`] is a forced end.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use super::broker::{BrokerDescriptor, Credentials, TransportClass};
use super::error::{ConnectionError, TransportError};

/// Options for a single transport session
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    /// Always false for sessions opened by this crate; reconnecting is a
    /// caller decision.
    pub auto_reconnect: bool,
    pub credentials: Option<Credentials>,
    /// Only set for TLS transport classes
    pub tls_verify: Option<bool>,
}

impl ConnectOptions {
    pub fn for_broker(
        broker: &BrokerDescriptor,
        client_id: String,
        connect_timeout: Duration,
        keep_alive: Duration,
    ) -> Self {
        let tls_verify = broker
            .transport_class()
            .is_tls()
            .then_some(broker.tls_verify);

        Self {
            client_id,
            clean_session: true,
            connect_timeout,
            keep_alive,
            auto_reconnect: false,
            credentials: broker.credentials.clone(),
            tls_verify,
        }
    }
}

/// Where to connect, already split into the parts transports need
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerUrl {
    pub class: TransportClass,
    pub host: String,
    pub port: u16,
    /// Full URL including the WebSocket path where applicable
    pub url: String,
}

impl From<&BrokerDescriptor> for BrokerUrl {
    fn from(broker: &BrokerDescriptor) -> Self {
        Self {
            class: broker.transport_class(),
            host: broker.host.clone(),
            port: broker.port,
            url: broker.connect_url(),
        }
    }
}

/// Something the broker side of a session did
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Handshake accepted
    Connected,
    /// Subscribe acknowledgement for one filter
    Subscribed {
        filter: String,
        outcome: Result<(), String>,
    },
    Message {
        topic: String,
        payload: Bytes,
    },
    Error(ConnectionError),
    /// Always the last event of a session
    Closed,
}

/// Outbound half of a transport session
pub trait TransportLink: Send {
    /// Queues a subscription; the result arrives as [`TransportEvent::Subscribed`].
    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    /// Queues a publish. `Ok` means the transport accepted it.
    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Forced end. Idempotent; no events are guaranteed after this.
    fn close(&mut self);
}

pub struct TransportSession {
    pub link: Box<dyn TransportLink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Random lowercase hex token, eight characters
pub fn random_token() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Fresh client identifier; every connection attempt gets its own.
pub fn generate_client_id(prefix: &str) -> String {
    format!("{}_{}", prefix, random_token())
}

/// Factory for transport sessions
pub trait TransportConnector: Send + Sync + 'static {
    /// Starts connecting. Errors here are synchronous setup failures; anything
    /// that goes wrong later is reported through the event channel.
    fn open(
        &self,
        url: &BrokerUrl,
        options: &ConnectOptions,
    ) -> Result<TransportSession, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_flag_only_for_tls_classes() {
        let plain = BrokerDescriptor::new("p", "_mqtt._tcp.", "h", 1883).with_tls_verify(false);
        let tls = BrokerDescriptor::new("t", "_mqtts._tcp.", "h", 8883).with_tls_verify(false);
        let ws_tls = BrokerDescriptor::new("w", "_mqtt-wss._tcp.", "h", 8884);

        let opts = |b: &BrokerDescriptor| {
            ConnectOptions::for_broker(b, "id".into(), Duration::from_secs(10), Duration::from_secs(30))
        };

        assert_eq!(opts(&plain).tls_verify, None);
        assert_eq!(opts(&tls).tls_verify, Some(false));
        assert_eq!(opts(&ws_tls).tls_verify, Some(true));
        assert!(opts(&plain).clean_session);
        assert!(!opts(&plain).auto_reconnect);
    }

    #[test]
    fn client_ids_are_unique_per_attempt() {
        let a = generate_client_id("brokerlink");
        let b = generate_client_id("brokerlink");
        assert!(a.starts_with("brokerlink_"));
        assert_eq!(a.len(), "brokerlink_".len() + 8);
        assert_ne!(a, b);
    }

    #[test]
    fn credentials_only_when_present() {
        let anon = BrokerDescriptor::new("a", "_mqtt._tcp.", "h", 1883);
        let auth = anon.clone().with_credentials("u", "p");
        let timeout = Duration::from_secs(10);

        assert!(ConnectOptions::for_broker(&anon, "id".into(), timeout, timeout)
            .credentials
            .is_none());
        assert_eq!(
            ConnectOptions::for_broker(&auth, "id".into(), timeout, timeout)
                .credentials
                .map(|c| c.username),
            Some("u".to_string())
        );
    }
}
