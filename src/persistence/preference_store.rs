use crate::mqtt::config::ManagerSettings;
use color_eyre::eyre::{eyre, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::Preferences;

const PREFERENCES_FILE: &str = "preferences.toml";
const SETTINGS_FILE: &str = "settings.toml";

/// TOML files in one configuration directory
#[derive(Clone, Debug)]
pub struct PreferenceStore {
    dir: PathBuf,
}

impl PreferenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.config/brokerlink`
    pub fn default_dir() -> PathBuf {
        get_home_dir().join(".config").join("brokerlink")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn load_preferences(&self) -> Preferences {
        load_or_default(&self.dir.join(PREFERENCES_FILE)).await
    }

    pub async fn save_preferences(&self, prefs: &Preferences) -> Result<()> {
        self.save(PREFERENCES_FILE, prefs).await
    }

    pub async fn load_settings(&self) -> ManagerSettings {
        load_or_default(&self.dir.join(SETTINGS_FILE)).await
    }

    pub async fn save_settings(&self, settings: &ManagerSettings) -> Result<()> {
        self.save(SETTINGS_FILE, settings).await
    }

    async fn save<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        if !tokio::fs::try_exists(&self.dir)
            .await
            .map_err(|e| eyre!("Failed to check if config directory exists: {}", e))?
        {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let path = self.dir.join(file);
        let content =
            toml::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", file, e))?;
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;

        info!("Saved {}", path.display());
        Ok(())
    }
}

async fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist, using defaults", path.display());
            return T::default();
        }
        Err(e) => {
            warn!("Could not read {}: {}, using defaults", path.display(), e);
            return T::default();
        }
    };

    match toml::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            warn!("Could not parse {}: {}, using defaults", path.display(), e);
            T::default()
        }
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}
