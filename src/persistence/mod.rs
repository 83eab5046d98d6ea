//! # Persistence Module
//!
//! Remembers the preferred broker, the startup flags and the manager settings
//! between runs. Everything is plain TOML under the user's config directory.
//!
//! ## Error Handling Strategy
//! Uses `color_eyre` for rich error context on writes. Reads are fail-safe:
//! a missing or damaged file degrades to defaults so startup never blocks on
//! configuration.

pub mod preference_store;

use crate::mqtt::broker::BrokerDescriptor;
use crate::mqtt::mqtt_handler::MqttHandle;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// User choices that survive a restart.
///
/// Plain values are declared before the broker table; TOML cannot place a
/// value after a table.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Preferences {
    /// Connect to the preferred broker on startup
    pub auto_connect: bool,
    /// Start scanning for brokers on startup
    pub auto_scan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_broker: Option<BrokerDescriptor>,
}

impl Preferences {
    pub fn remember(&mut self, broker: BrokerDescriptor) {
        self.preferred_broker = Some(broker);
    }

    pub fn forget(&mut self) -> Option<BrokerDescriptor> {
        self.preferred_broker.take()
    }
}

/// Reconnects to the remembered broker when the user asked for it.
///
/// Returns whether a connect was issued. The outcome of the attempt is
/// reported through the handle's snapshots like any other connect.
pub async fn restore_session(handle: &MqttHandle, prefs: &Preferences) -> Result<bool> {
    if !prefs.auto_connect {
        debug!("Auto-connect disabled");
        return Ok(false);
    }
    let Some(broker) = prefs.preferred_broker.clone() else {
        debug!("No preferred broker stored");
        return Ok(false);
    };

    info!("Restoring connection to {}", broker);
    handle
        .connect(broker)
        .await
        .map_err(|e| eyre!("Failed to restore session: {}", e))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::ManagerSettings;
    use crate::mqtt::testing::FakeConnector;

    fn home() -> BrokerDescriptor {
        BrokerDescriptor::new("home", "_mqtt._tcp.local.", "10.0.0.2", 1883)
    }

    #[test]
    fn preferences_round_trip_through_toml() {
        let mut prefs = Preferences {
            auto_connect: true,
            ..Preferences::default()
        };
        prefs.remember(home().with_credentials("u", "p").with_domain("local."));

        let text = toml::to_string(&prefs).unwrap();
        let parsed: Preferences = toml::from_str(&text).unwrap();

        assert_eq!(parsed, prefs);
    }

    #[test]
    fn empty_file_means_defaults() {
        let prefs: Preferences = toml::from_str("").unwrap();
        assert_eq!(prefs, Preferences::default());
    }

    #[tokio::test]
    async fn restore_connects_to_the_preferred_broker() {
        let fake = FakeConnector::new();
        let (handle, _worker) = MqttHandle::spawn(fake.arc(), ManagerSettings::default());
        let mut prefs = Preferences {
            auto_connect: true,
            ..Preferences::default()
        };
        prefs.remember(home());

        assert!(restore_session(&handle, &prefs).await.unwrap());

        assert_eq!(handle.snapshot().broker_url(), "mqtt://10.0.0.2:1883");
        fake.with(|s| assert_eq!(s.opened, 1));
    }

    #[tokio::test]
    async fn restore_respects_the_auto_connect_flag() {
        let fake = FakeConnector::new();
        let (handle, _worker) = MqttHandle::spawn(fake.arc(), ManagerSettings::default());
        let mut prefs = Preferences::default();
        prefs.remember(home());
        assert!(!restore_session(&handle, &prefs).await.unwrap());

        prefs.auto_connect = true;
        prefs.forget();
        assert!(!restore_session(&handle, &prefs).await.unwrap());
        fake.with(|s| assert_eq!(s.opened, 0));
    }
}
