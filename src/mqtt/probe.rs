//! Echo probe behind `test_connect`
//!
//! Checks a candidate broker end to end on a throwaway session:
//!
//! ```text
//! Connecting ──► Subscribing ──► AwaitingEcho ──► reachable
//!      │              │               │
//!      └──────────────┴───────────────┴──► unreachable (error, close, deadline)
//! ```
//!
//! The probe shares nothing with the connection manager. It opens its own
//! session through the connector, and that session is closed on every outcome
//! before `test_connect` returns.

use bytes::Bytes;
use statum::{machine, state};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::broker::BrokerDescriptor;
use super::config::ManagerSettings;
use super::transport::{
    generate_client_id, random_token, BrokerUrl, ConnectOptions, TransportConnector,
    TransportEvent, TransportLink, TransportSession,
};

#[derive(Debug, Error, PartialEq, Eq)]
enum ProbeFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("session closed before the echo arrived")]
    Closed,
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum ProbeState {
    Connecting,
    Subscribing,
    AwaitingEcho,
}

#[machine]
pub struct EchoProbe<S: ProbeState> {
    events: mpsc::Receiver<TransportEvent>,
    topic: String,
    payload: String,
}

impl<S: ProbeState> EchoProbe<S> {
    /// Next event that is not a failure. Errors and closes end the probe.
    async fn next_event(&mut self) -> Result<TransportEvent, ProbeFailure> {
        match self.events.recv().await {
            Some(TransportEvent::Error(e)) => Err(ProbeFailure::Transport(e.to_string())),
            Some(TransportEvent::Closed) | None => Err(ProbeFailure::Closed),
            Some(event) => Ok(event),
        }
    }
}

impl EchoProbe<Connecting> {
    fn create(events: mpsc::Receiver<TransportEvent>) -> Self {
        let topic = format!("__test/{}", random_token());
        let payload = format!("test-{}", chrono::Utc::now().timestamp_millis());
        Self::new(events, topic, payload)
    }

    async fn run(self, link: &mut dyn TransportLink) -> Result<(), ProbeFailure> {
        self.await_connected(link)
            .await?
            .await_subscription(link)
            .await?
            .await_echo()
            .await
    }

    async fn await_connected(
        mut self,
        link: &mut dyn TransportLink,
    ) -> Result<EchoProbe<Subscribing>, ProbeFailure> {
        while self.next_event().await? != TransportEvent::Connected {}

        debug!("Probe connected, subscribing to {}", self.topic);
        link.subscribe(&self.topic)
            .map_err(|e| ProbeFailure::Subscribe(e.to_string()))?;
        Ok(self.transition())
    }
}

impl EchoProbe<Subscribing> {
    async fn await_subscription(
        mut self,
        link: &mut dyn TransportLink,
    ) -> Result<EchoProbe<AwaitingEcho>, ProbeFailure> {
        loop {
            if let TransportEvent::Subscribed { filter, outcome } = self.next_event().await? {
                if filter != self.topic {
                    continue;
                }
                outcome.map_err(ProbeFailure::Subscribe)?;
                break;
            }
        }

        link.publish(&self.topic, Bytes::from(self.payload.clone()))
            .map_err(|e| ProbeFailure::Publish(e.to_string()))?;
        Ok(self.transition())
    }
}

impl EchoProbe<AwaitingEcho> {
    async fn await_echo(mut self) -> Result<(), ProbeFailure> {
        loop {
            if let TransportEvent::Message { topic, payload } = self.next_event().await? {
                if topic == self.topic && payload.as_ref() == self.payload.as_bytes() {
                    return Ok(());
                }
            }
        }
    }
}

/// Runs the echo test against `candidate`. Every failure collapses to `false`.
pub async fn test_connect(
    connector: &dyn TransportConnector,
    candidate: &BrokerDescriptor,
    settings: &ManagerSettings,
) -> bool {
    let url = BrokerUrl::from(candidate);
    let options = ConnectOptions::for_broker(
        candidate,
        generate_client_id(&format!("{}_test", settings.client_id_prefix)),
        settings.probe_transport_timeout(),
        settings.keep_alive(),
    );

    info!("Testing broker {} at {}", candidate.name, url.url);
    let TransportSession { mut link, events } = match connector.open(&url, &options) {
        Ok(session) => session,
        Err(e) => {
            warn!("Test connection to {} could not be opened: {}", url.url, e);
            return false;
        }
    };

    let probe = EchoProbe::create(events);
    // The probe (and with it the event receiver) is dropped before the link closes
    let outcome = tokio::time::timeout(settings.probe_deadline(), probe.run(link.as_mut())).await;
    link.close();

    match outcome {
        Ok(Ok(())) => {
            info!("Broker {} echoed the test message", url.url);
            true
        }
        Ok(Err(failure)) => {
            warn!("Broker test for {} failed: {}", url.url, failure);
            false
        }
        Err(_) => {
            warn!(
                "Broker test for {} timed out after {}s",
                url.url, settings.probe_deadline_secs
            );
            false
        }
    }
}
