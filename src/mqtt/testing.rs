//! Scripted in-memory transport for tests

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::error::{ConnectionError, TransportError};
use super::transport::{
    BrokerUrl, ConnectOptions, TransportConnector, TransportEvent, TransportLink, TransportSession,
};

/// How a fake broker host behaves once a session is opened to it
#[derive(Clone, Debug, PartialEq)]
pub enum Behavior {
    /// Connects, acks subscriptions, echoes publishes to matching subscriptions
    Accept,
    /// Never emits anything
    Silent,
    /// Emits an error and then closes
    Refuse(String),
    /// Connects but rejects every subscription
    RejectSubscribe,
    /// Connects and acks, but never echoes publishes
    NoEcho,
    /// Connects and acks, refuses every publish
    FailPublish,
    /// Connects, then closes without an error
    HangUp,
}

#[derive(Default)]
pub struct FakeState {
    pub opened: usize,
    pub closed: usize,
    pub open_now: usize,
    pub max_open: usize,
    /// `open <url>` / `close <url>` in call order
    pub log: Vec<String>,
    pub published: Vec<(String, Bytes)>,
    pub options: Vec<ConnectOptions>,
    /// Sender side of every session's event channel, by open order
    pub senders: Vec<mpsc::Sender<TransportEvent>>,
    behaviors: HashMap<String, Behavior>,
    fail_next_open: Option<TransportError>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc(&self) -> Arc<dyn TransportConnector> {
        Arc::new(self.clone())
    }

    pub fn behave(&self, host: &str, behavior: Behavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(host.to_string(), behavior);
    }

    pub fn fail_next_open(&self, error: TransportError) {
        self.state.lock().unwrap().fail_next_open = Some(error);
    }

    pub fn with<R>(&self, f: impl FnOnce(&FakeState) -> R) -> R {
        f(&self.state.lock().unwrap())
    }

    pub fn sender(&self, index: usize) -> mpsc::Sender<TransportEvent> {
        self.state.lock().unwrap().senders[index].clone()
    }
}

impl TransportConnector for FakeConnector {
    fn open(
        &self,
        url: &BrokerUrl,
        options: &ConnectOptions,
    ) -> Result<TransportSession, TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.fail_next_open.take() {
            return Err(error);
        }

        let behavior = state
            .behaviors
            .get(&url.host)
            .cloned()
            .unwrap_or(Behavior::Accept);
        let (tx, rx) = mpsc::channel(64);

        state.opened += 1;
        state.open_now += 1;
        state.max_open = state.max_open.max(state.open_now);
        state.log.push(format!("open {}", url.url));
        state.options.push(options.clone());
        state.senders.push(tx.clone());

        match &behavior {
            Behavior::Silent => {}
            Behavior::HangUp => {
                let _ = tx.try_send(TransportEvent::Connected);
                let _ = tx.try_send(TransportEvent::Closed);
            }
            Behavior::Refuse(reason) => {
                let _ = tx.try_send(TransportEvent::Error(ConnectionError::Transport(
                    reason.clone(),
                )));
                let _ = tx.try_send(TransportEvent::Closed);
            }
            _ => {
                let _ = tx.try_send(TransportEvent::Connected);
            }
        }

        Ok(TransportSession {
            link: Box::new(FakeLink {
                url: url.url.clone(),
                behavior,
                events: tx,
                subscriptions: Vec::new(),
                closed: false,
                state: self.state.clone(),
            }),
            events: rx,
        })
    }
}

struct FakeLink {
    url: String,
    behavior: Behavior,
    events: mpsc::Sender<TransportEvent>,
    subscriptions: Vec<String>,
    closed: bool,
    state: Arc<Mutex<FakeState>>,
}

impl TransportLink for FakeLink {
    fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let outcome = if self.behavior == Behavior::RejectSubscribe {
            Err("not authorized".to_string())
        } else {
            self.subscriptions.push(filter.to_string());
            Ok(())
        };
        let _ = self.events.try_send(TransportEvent::Subscribed {
            filter: filter.to_string(),
            outcome,
        });
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.behavior == Behavior::FailPublish {
            return Err(TransportError::Rejected("outgoing queue full".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), payload.clone()));

        let matched = self.subscriptions.iter().any(|f| f == "#" || f == topic);
        if self.behavior == Behavior::Accept && matched {
            let _ = self.events.try_send(TransportEvent::Message {
                topic: topic.to_string(),
                payload,
            });
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap();
        state.closed += 1;
        state.open_now -= 1;
        state.log.push(format!("close {}", self.url));
    }
}
