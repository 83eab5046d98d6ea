//! rumqttc-backed transport
//!
//! Each session owns an `AsyncClient` for requests and a driver task polling
//! the `EventLoop`. The driver translates rumqttc events into
//! [`TransportEvent`]s and stops at the first connection error, which is how
//! automatic reconnects are kept off: rumqttc only reconnects when polled
//! again after a failure.

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, NetworkOptions, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::TransportClass;
use super::error::{ConnectionError, TransportError};
use super::tls::tls_configuration;
use super::transport::{
    BrokerUrl, ConnectOptions, TransportConnector, TransportEvent, TransportLink, TransportSession,
};

const REQUEST_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;
// rumqttc rejects shorter keep-alive intervals
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Filters waiting for their SUBACK, in request order
type PendingSubscriptions = Arc<Mutex<VecDeque<String>>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

impl RumqttConnector {
    pub fn new() -> Self {
        Self
    }
}

pub fn build_mqtt_options(
    url: &BrokerUrl,
    options: &ConnectOptions,
) -> Result<MqttOptions, TransportError> {
    if url.host.trim().is_empty() {
        return Err(TransportError::InvalidUrl(format!("{} has no host", url.url)));
    }
    if url.port == 0 {
        return Err(TransportError::InvalidUrl(format!("{} has no port", url.url)));
    }
    if options.client_id.trim().is_empty() {
        return Err(TransportError::Rejected("empty client id".to_string()));
    }

    // WebSocket transports take the whole URL in place of the host
    let host = if url.class.is_websocket() {
        url.url.clone()
    } else {
        url.host.clone()
    };

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, url.port);
    mqtt_options
        .set_clean_session(options.clean_session)
        .set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    let verify = options.tls_verify.unwrap_or(true);
    let transport = match url.class {
        TransportClass::TcpPlain => Transport::Tcp,
        TransportClass::TcpTls => Transport::Tls(tls_configuration(verify)),
        TransportClass::WebSocketPlain => Transport::Ws,
        TransportClass::WebSocketTls => Transport::Wss(tls_configuration(verify)),
    };
    mqtt_options.set_transport(transport);

    Ok(mqtt_options)
}

/// Socket-level connect timeout; rumqttc defaults to 5s otherwise.
pub fn build_network_options(options: &ConnectOptions) -> NetworkOptions {
    let mut network = NetworkOptions::new();
    network.set_connection_timeout(options.connect_timeout.as_secs().max(1));
    network
}

impl TransportConnector for RumqttConnector {
    fn open(
        &self,
        url: &BrokerUrl,
        options: &ConnectOptions,
    ) -> Result<TransportSession, TransportError> {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Rejected(format!("no async runtime: {}", e)))?;
        let mqtt_options = build_mqtt_options(url, options)?;

        info!("Opening {} session to {} as {}", url.class, url.url, options.client_id);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        eventloop.set_network_options(build_network_options(options));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let pending: PendingSubscriptions = Arc::new(Mutex::new(VecDeque::new()));

        let driver = runtime.spawn(drive_session(
            eventloop,
            events_tx,
            cancel.clone(),
            pending.clone(),
            options.connect_timeout,
        ));

        Ok(TransportSession {
            link: Box::new(RumqttLink {
                client,
                cancel,
                pending,
                driver: Some(driver),
            }),
            events: events_rx,
        })
    }
}

pub struct RumqttLink {
    client: AsyncClient,
    cancel: CancellationToken,
    pending: PendingSubscriptions,
    driver: Option<JoinHandle<()>>,
}

impl TransportLink for RumqttLink {
    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        lock_pending(&self.pending).push_back(filter.to_string());
        self.client
            .try_subscribe(filter, QoS::AtMostOnce)
            .map_err(|e| {
                lock_pending(&self.pending).pop_back();
                TransportError::Rejected(e.to_string())
            })
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            debug!("Force-closing transport session");
            self.cancel.cancel();
            driver.abort();
        }
    }
}

impl Drop for RumqttLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_pending(pending: &PendingSubscriptions) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns false once nobody listens anymore.
async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    events.send(event).await.is_ok()
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
}

async fn drive_session(
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    pending: PendingSubscriptions,
    connect_timeout: Duration,
) {
    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        handshake = tokio::time::timeout(connect_timeout, await_connack(&mut eventloop)) => handshake,
    };

    let failure = match handshake {
        Ok(Ok(())) => None,
        Ok(Err(reason)) => Some(ConnectionError::Transport(reason)),
        Err(_) => Some(ConnectionError::TransportTimeout(connect_timeout.as_secs())),
    };
    if let Some(error) = failure {
        warn!("Handshake failed: {}", error);
        if emit(&events, TransportEvent::Error(error)).await {
            emit(&events, TransportEvent::Closed).await;
        }
        return;
    }
    if !emit(&events, TransportEvent::Connected).await {
        return;
    }

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let filter = lock_pending(&pending).pop_front().unwrap_or_default();
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let outcome = if rejected {
                    Err(format!("broker rejected subscription to {}", filter))
                } else {
                    Ok(())
                };
                TransportEvent::Subscribed { filter, outcome }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Broker closed the session");
                emit(&events, TransportEvent::Closed).await;
                break;
            }
            Ok(other) => {
                debug!("Transport event: {:?}", other);
                continue;
            }
            Err(e) => {
                info!("Connection lost: {}", e);
                let error = ConnectionError::Transport(e.to_string());
                if emit(&events, TransportEvent::Error(error)).await {
                    emit(&events, TransportEvent::Closed).await;
                }
                break;
            }
        };

        if !emit(&events, event).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::broker::BrokerDescriptor;

    fn options_for(broker: &BrokerDescriptor) -> ConnectOptions {
        ConnectOptions::for_broker(
            broker,
            "brokerlink_test".to_string(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn plain_tcp_options() {
        let broker = BrokerDescriptor::new("b", "_mqtt._tcp.local.", "10.0.0.5", 1883)
            .with_credentials("user", "pass");
        let mqtt = build_mqtt_options(&BrokerUrl::from(&broker), &options_for(&broker)).unwrap();

        assert_eq!(mqtt.broker_address(), ("10.0.0.5".to_string(), 1883));
        assert_eq!(mqtt.client_id(), "brokerlink_test");
        assert!(mqtt.clean_session());
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            mqtt.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
        assert!(matches!(mqtt.transport(), Transport::Tcp));
    }

    #[test]
    fn websocket_options_use_full_url() {
        let broker = BrokerDescriptor::new("b", "_mqtt-ws._tcp.local.", "h", 9001);
        let mqtt = build_mqtt_options(&BrokerUrl::from(&broker), &options_for(&broker)).unwrap();

        assert_eq!(mqtt.broker_address(), ("ws://h:9001/mqtt".to_string(), 9001));
        assert!(matches!(mqtt.transport(), Transport::Ws));
    }

    #[test]
    fn insecure_tls_uses_custom_rustls_config() {
        let broker = BrokerDescriptor::new("b", "_mqtts._tcp.local.", "h", 8883).with_tls_verify(false);
        let mqtt = build_mqtt_options(&BrokerUrl::from(&broker), &options_for(&broker)).unwrap();

        assert!(matches!(
            mqtt.transport(),
            Transport::Tls(rumqttc::TlsConfiguration::Rustls(_))
        ));
    }

    #[test]
    fn socket_timeout_follows_the_connect_timeout() {
        let broker = BrokerDescriptor::new("b", "_mqtt._tcp.", "h", 1883);
        assert_eq!(build_network_options(&options_for(&broker)).connection_timeout(), 10);

        let mut short = options_for(&broker);
        short.connect_timeout = Duration::from_millis(300);
        assert_eq!(build_network_options(&short).connection_timeout(), 1);
    }

    #[test]
    fn empty_host_is_rejected_up_front() {
        let broker = BrokerDescriptor::new("b", "_mqtt._tcp.", "", 1883);
        let result = build_mqtt_options(&BrokerUrl::from(&broker), &options_for(&broker));
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn open_outside_runtime_fails_synchronously() {
        let broker = BrokerDescriptor::new("b", "_mqtt._tcp.", "127.0.0.1", 1883);
        let result = RumqttConnector::new().open(&BrokerUrl::from(&broker), &options_for(&broker));
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn unreachable_broker_reports_error_then_close() {
        // Nothing listens on loopback port 1, so the TCP connect is refused
        let broker = BrokerDescriptor::new("b", "_mqtt._tcp.", "127.0.0.1", 1);
        let mut session = RumqttConnector::new()
            .open(&BrokerUrl::from(&broker), &options_for(&broker))
            .unwrap();

        let first = session.events.recv().await;
        assert!(matches!(first, Some(TransportEvent::Error(ConnectionError::Transport(_)))));
        assert_eq!(session.events.recv().await, Some(TransportEvent::Closed));
        session.link.close();
    }

    #[tokio::test]
    async fn connection_lost_after_handshake_reports_the_cause() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker_side = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut connect = [0u8; 256];
            let _ = socket.read(&mut connect).await.unwrap();
            // CONNACK, session not present, accepted
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        });

        let broker = BrokerDescriptor::new("b", "_mqtt._tcp.", "127.0.0.1", port);
        let mut session = RumqttConnector::new()
            .open(&BrokerUrl::from(&broker), &options_for(&broker))
            .unwrap();

        assert_eq!(session.events.recv().await, Some(TransportEvent::Connected));
        broker_side.await.unwrap();
        let lost = session.events.recv().await;
        assert!(matches!(lost, Some(TransportEvent::Error(ConnectionError::Transport(_)))));
        assert_eq!(session.events.recv().await, Some(TransportEvent::Closed));
        session.link.close();
    }
}
