use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the connection manager and the echo probe.
///
/// Defaults are the values the manager was designed around; the settings file
/// only needs to list the ones it overrides.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerSettings {
    /// Hard cap on the `Connecting` state, enforced by the manager itself
    pub connect_timeout_secs: u64,
    /// Connect timeout handed to the transport
    pub transport_connect_timeout_secs: u64,
    /// Deadline for the whole echo test
    pub probe_deadline_secs: u64,
    /// Transport connect timeout used by the echo test
    pub probe_transport_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub message_capacity: usize,
    /// Filter subscribed on every primary connection
    pub firehose_filter: String,
    pub client_id_prefix: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            transport_connect_timeout_secs: 10,
            probe_deadline_secs: 8,
            probe_transport_timeout_secs: 5,
            keep_alive_secs: 30,
            message_capacity: 10,
            firehose_filter: "#".to_string(),
            client_id_prefix: "brokerlink".to_string(),
        }
    }
}

impl ManagerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn transport_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_connect_timeout_secs)
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_secs(self.probe_deadline_secs)
    }

    pub fn probe_transport_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_transport_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}
