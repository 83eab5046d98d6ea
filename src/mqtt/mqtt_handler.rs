//! Connection lifecycle manager
//!
//! One worker task owns the primary broker connection and everything that
//! belongs to it: state, error slot, message buffer and the hard connect
//! timeout. Callers talk to it through an [`MqttHandle`]; every command is
//! answered over a oneshot once the worker has fully applied it, and every
//! change is published as a [`ConnectionSnapshot`] on a watch channel.
//!
//! ```text
//!              connect                 Connected event
//! Disconnected ───────► Connecting ─────────────────────► Connected
//!      ▲                    │                                 │
//!      │   error / close /  │                                 │ close / error /
//!      └─── hard timeout ───┘◄────────────────────────────────┘ disconnect
//! ```

use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use super::broker::BrokerDescriptor;
use super::config::ManagerSettings;
use super::error::ConnectionError;
use super::message_manager::{MessageBuffer, MessageRecord};
use super::probe;
use super::transport::{
    generate_client_id, BrokerUrl, ConnectOptions, TransportConnector, TransportEvent,
    TransportLink, TransportSession,
};

const COMMAND_CAPACITY: usize = 32;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Everything an observer can see of the manager
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub error: Option<String>,
    /// Newest first
    pub messages: Vec<MessageRecord>,
    pub connected_broker: Option<BrokerDescriptor>,
}

impl ConnectionSnapshot {
    /// Display URL of the current broker, empty when there is none
    pub fn broker_url(&self) -> String {
        self.connected_broker
            .as_ref()
            .map(BrokerDescriptor::broker_url)
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }
}

#[derive(Debug)]
enum Command {
    Connect {
        broker: BrokerDescriptor,
        response_tx: oneshot::Sender<()>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        payload: String,
        response_tx: oneshot::Sender<Result<(), ConnectionError>>,
    },
    ClearMessages {
        response_tx: oneshot::Sender<()>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// The live session. Replaced wholesale, never patched.
struct ActiveConnection {
    link: Box<dyn TransportLink>,
    /// `None` once the transport has closed
    events: Option<mpsc::Receiver<TransportEvent>>,
    broker: BrokerDescriptor,
    /// Pending while connecting
    hard_timeout: Option<Pin<Box<Sleep>>>,
}

enum Activity {
    Event(TransportEvent),
    EventsEnded,
    HardTimeout,
}

async fn recv_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn hard_deadline(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Resolves with whatever the live session does next; pends forever without one.
async fn next_activity(active: &mut Option<ActiveConnection>) -> Activity {
    let Some(conn) = active.as_mut() else {
        return std::future::pending().await;
    };
    tokio::select! {
        event = recv_event(&mut conn.events) => match event {
            Some(event) => Activity::Event(event),
            None => Activity::EventsEnded,
        },
        _ = hard_deadline(&mut conn.hard_timeout) => Activity::HardTimeout,
    }
}

struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    settings: ManagerSettings,
    state: ConnectionState,
    error: Option<String>,
    messages: MessageBuffer,
    connected_broker: Option<BrokerDescriptor>,
    active: Option<ActiveConnection>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,
}

impl ConnectionManager {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Connection manager started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles dropped");
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                activity = next_activity(&mut self.active) => self.handle_activity(activity),
            }
        }
        self.teardown();
        info!("Connection manager stopped");
    }

    /// Returns false when the worker should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect {
                broker,
                response_tx,
            } => {
                self.connect(broker);
                reply(response_tx, ());
            }
            Command::Disconnect { response_tx } => {
                self.disconnect();
                reply(response_tx, ());
            }
            Command::Publish {
                topic,
                payload,
                response_tx,
            } => {
                let result = self.publish(topic, payload);
                reply(response_tx, result);
            }
            Command::ClearMessages { response_tx } => {
                self.messages.clear();
                self.publish_snapshot();
                reply(response_tx, ());
            }
            Command::Shutdown { response_tx } => {
                info!("Shutdown requested");
                self.teardown();
                self.state = ConnectionState::Disconnected;
                self.publish_snapshot();
                reply(response_tx, ());
                return false;
            }
        }
        true
    }

    fn connect(&mut self, broker: BrokerDescriptor) {
        let already_connected = self.state == ConnectionState::Connected
            && self
                .connected_broker
                .as_ref()
                .is_some_and(|current| current.same_endpoint(&broker));
        if already_connected {
            debug!("Already connected to {}, nothing to do", broker.broker_url());
            return;
        }

        self.teardown();

        let url = BrokerUrl::from(&broker);
        let options = ConnectOptions::for_broker(
            &broker,
            generate_client_id(&self.settings.client_id_prefix),
            self.settings.transport_connect_timeout(),
            self.settings.keep_alive(),
        );
        info!("Connecting to {} as {}", url.url, options.client_id);

        self.state = ConnectionState::Connecting;
        self.error = None;
        self.connected_broker = Some(broker.clone());

        match self.connector.open(&url, &options) {
            Ok(TransportSession { link, events }) => {
                self.active = Some(ActiveConnection {
                    link,
                    events: Some(events),
                    broker,
                    hard_timeout: Some(Box::pin(tokio::time::sleep(
                        self.settings.connect_timeout(),
                    ))),
                });
            }
            Err(e) => {
                let failure = ConnectionError::TransportOpen(e.to_string());
                error!("Could not open transport to {}: {}", url.url, e);
                self.error = Some(failure.to_string());
                self.state = ConnectionState::Disconnected;
                self.connected_broker = None;
            }
        }
        self.publish_snapshot();
    }

    fn disconnect(&mut self) {
        self.teardown();
        self.state = ConnectionState::Disconnected;
        if let Some(broker) = self.connected_broker.take() {
            info!("Disconnected from {}", broker.broker_url());
        }
        self.messages.push(MessageRecord::system("Disconnected from broker"));
        self.publish_snapshot();
    }

    fn publish(&mut self, topic: String, payload: String) -> Result<(), ConnectionError> {
        let conn = match (self.state, self.active.as_mut()) {
            (ConnectionState::Connected, Some(conn)) => conn,
            _ => {
                debug!("Publish to {} refused, not connected", topic);
                return Err(ConnectionError::NotConnected);
            }
        };

        match conn.link.publish(&topic, Bytes::from(payload.clone())) {
            Ok(()) => {
                debug!("Published {} bytes to {}", payload.len(), topic);
                self.messages.push(MessageRecord::system(format!(
                    "Published to {}: {}",
                    topic, payload
                )));
                self.publish_snapshot();
                Ok(())
            }
            Err(e) => {
                let failure = ConnectionError::Publish(e.to_string());
                warn!("{}", failure);
                self.error = Some(failure.to_string());
                self.publish_snapshot();
                Err(failure)
            }
        }
    }

    fn handle_activity(&mut self, activity: Activity) {
        match activity {
            Activity::Event(event) => self.handle_event(event),
            Activity::EventsEnded => {
                debug!("Transport event stream ended");
                if let Some(conn) = self.active.as_mut() {
                    conn.events = None;
                    conn.hard_timeout = None;
                }
                if self.state != ConnectionState::Disconnected {
                    self.state = ConnectionState::Disconnected;
                    self.publish_snapshot();
                }
            }
            Activity::HardTimeout => {
                if let Some(conn) = self.active.as_mut() {
                    conn.hard_timeout = None;
                }
                if self.state == ConnectionState::Connecting {
                    let failure = ConnectionError::Timeout;
                    warn!("{} ({}s)", failure, self.settings.connect_timeout_secs);
                    self.error = Some(failure.to_string());
                    self.state = ConnectionState::Disconnected;
                    self.teardown();
                    self.publish_snapshot();
                }
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Subscribed { filter, outcome } => {
                if filter != self.settings.firehose_filter {
                    debug!("Ignoring acknowledgement for {}", filter);
                    return;
                }
                match outcome {
                    Ok(()) => {
                        info!("Subscribed to {}", filter);
                        self.messages.push(MessageRecord::system(format!(
                            "Connected and subscribed to all topics ({})",
                            filter
                        )));
                    }
                    Err(reason) => self.subscribe_failed(reason),
                }
            }
            TransportEvent::Message { topic, payload } => {
                debug!("Message on {} ({} bytes)", topic, payload.len());
                self.messages.push(MessageRecord::from_payload(topic, &payload));
            }
            TransportEvent::Error(e) => {
                error!("Transport error: {}", e);
                self.error = Some(e.to_string());
                self.state = ConnectionState::Disconnected;
                if let Some(conn) = self.active.as_mut() {
                    conn.hard_timeout = None;
                }
            }
            TransportEvent::Closed => {
                info!("Connection closed");
                self.state = ConnectionState::Disconnected;
                if let Some(conn) = self.active.as_mut() {
                    conn.events = None;
                    conn.hard_timeout = None;
                }
                self.messages.push(MessageRecord::system("Connection closed"));
            }
        }
        self.publish_snapshot();
    }

    fn on_connected(&mut self) {
        let Some(conn) = self.active.as_mut() else {
            return;
        };
        info!("Connected to {}", conn.broker.broker_url());
        conn.hard_timeout = None;
        self.state = ConnectionState::Connected;

        let filter = self.settings.firehose_filter.clone();
        if let Err(e) = conn.link.subscribe(&filter) {
            self.subscribe_failed(e.to_string());
        }
    }

    fn subscribe_failed(&mut self, reason: String) {
        let failure = ConnectionError::Subscribe(reason);
        warn!("{}", failure);
        self.error = Some(failure.to_string());
    }

    /// Detaches listeners before the link is closed, so a superseded
    /// session can never touch manager state again.
    fn teardown(&mut self) {
        if let Some(mut conn) = self.active.take() {
            conn.hard_timeout = None;
            conn.events = None;
            conn.link.close();
            debug!("Session to {} torn down", conn.broker.broker_url());
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            error: self.error.clone(),
            messages: self.messages.to_vec(),
            connected_broker: self.connected_broker.clone(),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

fn reply<T>(response_tx: oneshot::Sender<T>, value: T) {
    if response_tx.send(value).is_err() {
        debug!("Caller went away before the reply");
    }
}

/// Cloneable front of the connection manager
#[derive(Clone)]
pub struct MqttHandle {
    tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<ConnectionSnapshot>,
    connector: Arc<dyn TransportConnector>,
    settings: Arc<ManagerSettings>,
}

impl MqttHandle {
    /// Starts the manager task. It runs until [`MqttHandle::shutdown`] or
    /// until every handle is dropped.
    pub fn spawn(
        connector: Arc<dyn TransportConnector>,
        settings: ManagerSettings,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        let manager = ConnectionManager {
            connector: connector.clone(),
            messages: MessageBuffer::new(settings.message_capacity),
            settings: settings.clone(),
            state: ConnectionState::Disconnected,
            error: None,
            connected_broker: None,
            active: None,
            snapshot_tx,
        };
        let worker = tokio::spawn(manager.run(rx));

        let handle = Self {
            tx,
            snapshot_rx,
            connector,
            settings: Arc::new(settings),
        };
        (handle, worker)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(make(response_tx))
            .await
            .map_err(|_| ConnectionError::ManagerGone)?;
        response_rx.await.map_err(|_| ConnectionError::ManagerGone)
    }

    /// Starts connecting to `broker`. Returns once the attempt is under way;
    /// the outcome shows up in the snapshot.
    pub async fn connect(&self, broker: BrokerDescriptor) -> Result<(), ConnectionError> {
        self.request(|response_tx| Command::Connect {
            broker,
            response_tx,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.request(|response_tx| Command::Disconnect { response_tx })
            .await
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let (topic, payload) = (topic.into(), payload.into());
        self.request(|response_tx| Command::Publish {
            topic,
            payload,
            response_tx,
        })
        .await?
    }

    pub async fn clear_messages(&self) -> Result<(), ConnectionError> {
        self.request(|response_tx| Command::ClearMessages { response_tx })
            .await
    }

    /// Closes the live session and stops the manager task.
    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        self.request(|response_tx| Command::Shutdown { response_tx })
            .await
    }

    /// Checks whether `candidate` echoes a test message. Runs on the caller's
    /// task with its own session; the primary connection is left alone.
    pub async fn test_connect(&self, candidate: &BrokerDescriptor) -> bool {
        probe::test_connect(self.connector.as_ref(), candidate, &self.settings).await
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Waits until the manager is no longer connecting.
    pub async fn wait_until_settled(&self) -> Result<ConnectionSnapshot, ConnectionError> {
        let mut rx = self.snapshot_rx.clone();
        let settled = rx
            .wait_for(|snapshot| !snapshot.is_connecting())
            .await
            .map_err(|_| ConnectionError::ManagerGone)?;
        Ok(settled.clone())
    }
}
