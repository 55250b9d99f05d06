use super::Settings;
use crate::notification::NotificationSettings;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CONFIG_DIR: &str = "mqttdemo";
const SETTINGS_FILE: &str = "settings.toml";
pub const SETTINGS_PATH_ENV: &str = "MQTTDEMO_SETTINGS";

/// TOML backed key/value settings.
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SettingsStore { path: path.into() }
    }

    /// `$MQTTDEMO_SETTINGS` if set, the platform config dir otherwise.
    pub fn open_default() -> Self {
        match std::env::var(SETTINGS_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::new(path),
            _ => {
                let mut path = get_config_dir();
                path.push(CONFIG_DIR);
                path.push(SETTINGS_FILE);
                Self::new(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Settings> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            warn!(
                "Settings file {} does not exist, using defaults",
                self.path.display()
            );
            return Ok(Settings::default());
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read settings file: {}", e))?;

        toml::from_str(&content).map_err(|e| eyre!("Failed to parse settings file: {}", e))
    }

    pub async fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty()
                && !tokio::fs::try_exists(parent)
                    .await
                    .map_err(|e| eyre!("Failed to check if settings directory exists: {}", e))?
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| eyre!("Failed to create settings directory: {}", e))?;
            }
        }

        let content = toml::to_string_pretty(settings)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;

        debug!("Settings saved to {}", self.path.display());
        Ok(())
    }

    /// Loads the settings and assigns a client id on first use.
    ///
    /// The generated id is written back before returning, so later loads see
    /// the same value.
    pub async fn load_or_init(&self) -> Result<Settings> {
        let mut settings = self.load().await?;

        let has_client_id = settings
            .connection
            .client_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());

        if !has_client_id {
            let client_id = uuid::Uuid::new_v4().to_string();
            info!("Generated client id {}", client_id);
            settings.connection.client_id = Some(client_id);
            self.save(&settings).await?;
        }

        Ok(settings)
    }

    pub async fn update_notifications(&self, notifications: NotificationSettings) -> Result<()> {
        let mut settings = self.load().await?;
        settings.notifications = notifications;
        self.save(&settings).await
    }

    /// Reads the notification preferences from disk and publishes them if
    /// they differ from what the receivers currently see.
    pub async fn reload_notifications(
        &self,
        notifications: &watch::Sender<NotificationSettings>,
    ) -> Result<bool> {
        let latest = self.load().await?.notifications;
        let changed = notifications.send_if_modified(|current| {
            if *current == latest {
                return false;
            }
            *current = latest;
            true
        });
        if changed {
            info!("Notification settings changed");
        }
        Ok(changed)
    }
}

/// Re-reads the settings file every `interval_seconds` so edits reach the
/// notification policy without a restart.
pub fn start_reload_task(
    store: Arc<SettingsStore>,
    notifications: watch::Sender<NotificationSettings>,
    interval_seconds: u64,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    info!(
        "Starting settings reload task with interval: {}s",
        interval_seconds
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        // the first tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = store.reload_notifications(&notifications).await {
                error!("Failed to reload settings: {}", e);
            }
        }
        debug!("Settings reload task stopped");
    })
}

fn get_config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    })
}
