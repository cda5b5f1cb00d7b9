//! Session-wide display preferences.
//!
//! Stored in `preferences.toml` next to the dashboard config and rewritten
//! on every change. A missing or unreadable file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Shortest refresh cadence accepted, in seconds.
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

impl std::str::FromStr for Theme {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            "system" => Ok(Theme::System),
            other => Err(SyncError::InvalidConfig(format!("unknown theme: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceValues {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default)]
    pub theme: Theme,
}

fn default_refresh_interval() -> u64 {
    30
}

impl Default for PreferenceValues {
    fn default() -> Self {
        PreferenceValues {
            refresh_interval_secs: default_refresh_interval(),
            theme: Theme::default(),
        }
    }
}

impl PreferenceValues {
    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Preference context shared by the dashboard session.
pub struct Preferences {
    path: Option<PathBuf>,
    values: Mutex<PreferenceValues>,
    changes: watch::Sender<PreferenceValues>,
}

impl Preferences {
    /// Loads preferences from `path`, or from the platform config directory.
    pub fn load(path: Option<PathBuf>) -> Self {
        let path = path.or_else(Self::default_path);
        let values = path
            .as_ref()
            .map(|p| Self::read(p).unwrap_or_else(|e| {
                warn!(path = ?p, error = %e, "Failed to read preferences, using defaults");
                PreferenceValues::default()
            }))
            .unwrap_or_default();
        Self::with_values(path, values)
    }

    /// In-memory preferences that are never written to disk.
    pub fn ephemeral() -> Self {
        Self::with_values(None, PreferenceValues::default())
    }

    fn with_values(path: Option<PathBuf>, values: PreferenceValues) -> Self {
        let (changes, _) = watch::channel(values.clone());
        Preferences {
            path,
            values: Mutex::new(values),
            changes,
        }
    }

    fn read(path: &PathBuf) -> SyncResult<PreferenceValues> {
        if !path.exists() {
            debug!(?path, "Preferences file not found, using defaults");
            return Ok(PreferenceValues::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "botwatch", "botwatch")
            .map(|dirs| dirs.config_dir().join("preferences.toml"))
    }

    fn lock(&self) -> MutexGuard<'_, PreferenceValues> {
        self.values.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self) -> PreferenceValues {
        self.lock().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PreferenceValues> {
        self.changes.subscribe()
    }

    /// Sets the refresh cadence. Returns whether the value changed.
    pub fn set_refresh_interval(&self, secs: u64) -> SyncResult<bool> {
        if secs < MIN_REFRESH_INTERVAL_SECS {
            return Err(SyncError::InvalidConfig(format!(
                "refresh interval must be at least {}s",
                MIN_REFRESH_INTERVAL_SECS
            )));
        }
        self.update(|v| {
            let changed = v.refresh_interval_secs != secs;
            v.refresh_interval_secs = secs;
            changed
        })
    }

    pub fn set_theme(&self, theme: Theme) -> SyncResult<bool> {
        self.update(|v| {
            let changed = v.theme != theme;
            v.theme = theme;
            changed
        })
    }

    /// Applies `apply` to a copy, persists it, then commits and publishes.
    /// A failed write leaves the current values untouched.
    fn update(&self, apply: impl FnOnce(&mut PreferenceValues) -> bool) -> SyncResult<bool> {
        let mut values = self.lock();
        let mut next = values.clone();
        if !apply(&mut next) {
            return Ok(false);
        }
        self.persist(&next)?;
        *values = next.clone();
        drop(values);
        self.changes.send_replace(next);
        Ok(true)
    }

    fn persist(&self, values: &PreferenceValues) -> SyncResult<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let save_failed = |e: std::io::Error| SyncError::ConfigSaveFailed(e.to_string());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(save_failed)?;
        }
        std::fs::write(path, toml::to_string_pretty(values)?).map_err(save_failed)?;
        info!(?path, "Preferences saved");
        Ok(())
    }
}
