//! # MQTT Connection Module
//!
//! Keeps one live broker connection and checks candidate brokers without
//! touching it.
//!
//! ```text
//! mqtt/
//! ├── broker.rs            - Broker descriptors, transport classes, URL derivation
//! ├── config.rs            - Manager tunables
//! ├── error.rs             - Connection and transport errors
//! ├── message_manager.rs   - Message records and the capped history buffer
//! ├── mqtt_handler.rs      - Connection manager task and its handle
//! ├── probe.rs             - Echo test behind `test_connect`
//! ├── transport.rs         - Transport boundary traits and events
//! ├── rumqtt_transport.rs  - rumqttc implementation of the boundary
//! └── tls.rs               - rustls configuration
//! ```
//!
//! ## Ownership
//!
//! The manager task is the only owner of the primary session. Everything else
//! talks to it through [`mqtt_handler::MqttHandle`] and observes it through
//! snapshots. A superseded session loses its event receiver before its link is
//! closed, so it can never write into the manager's state again.
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> Result<(), brokerlink::mqtt::error::ConnectionError> {
//! use brokerlink::mqtt::{
//!     broker::BrokerDescriptor, config::ManagerSettings, mqtt_handler::MqttHandle,
//!     rumqtt_transport::RumqttConnector,
//! };
//! use std::sync::Arc;
//!
//! let (handle, _worker) =
//!     MqttHandle::spawn(Arc::new(RumqttConnector::new()), ManagerSettings::default());
//! let broker = BrokerDescriptor::new("home", "_mqtt._tcp.local.", "192.168.1.10", 1883);
//!
//! if handle.test_connect(&broker).await {
//!     handle.connect(broker).await?;
//!     let snapshot = handle.wait_until_settled().await?;
//!     println!("{:?}", snapshot.state);
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod probe;
pub mod rumqtt_transport;
pub mod tls;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
