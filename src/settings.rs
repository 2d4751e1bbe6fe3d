use std::{
    fs,
    path::PathBuf,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::fetch::BackoffConfig;
use crate::models::DEFAULT_PAGE_LIMIT;
use crate::repository::FeedConfig;
use crate::sync::SyncConfig;
use crate::tiles::TileCacheConfig;
use crate::window::WindowConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowSettings {
    pub on_pages: u32,
    pub off_pages: u32,
    pub eviction_pages: u32,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            on_pages: 1,
            off_pages: 2,
            eviction_pages: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TileSettings {
    pub limiter: usize,
    pub debounce_ms: u64,
}

impl Default for TileSettings {
    fn default() -> Self {
        Self {
            limiter: 4,
            debounce_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// `None` retries until the request is cancelled.
    pub times: Option<u32>,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 20_000,
            factor: 2.0,
            times: Some(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub chunk_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self { chunk_size: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveSettings {
    pub base_url: String,
    pub page_limit: u32,
    pub window: WindowSettings,
    pub tiles: TileSettings,
    pub backoff: BackoffSettings,
    pub sync: SyncSettings,
    pub probe_interval_secs: u64,
    /// Opaque session cookie issued by the archive server.
    pub session_cookie: Option<String>,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            page_limit: DEFAULT_PAGE_LIMIT,
            window: WindowSettings::default(),
            tiles: TileSettings::default(),
            backoff: BackoffSettings::default(),
            sync: SyncSettings::default(),
            probe_interval_secs: 15,
            session_cookie: None,
        }
    }
}

impl ArchiveSettings {
    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            on_pages: self.window.on_pages,
            off_pages: self.window.off_pages,
            eviction_pages: self.window.eviction_pages,
        }
    }

    pub fn tile_config(&self) -> TileCacheConfig {
        TileCacheConfig {
            limiter: self.tiles.limiter,
            debounce: Duration::from_millis(self.tiles.debounce_ms),
        }
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            window: self.window_config(),
            tiles: self.tile_config(),
        }
    }

    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.backoff.initial_delay_ms),
            max_delay: Duration::from_millis(self.backoff.max_delay_ms),
            factor: self.backoff.factor,
            times: self.backoff.times,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            chunk_size: self.sync.chunk_size,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    fn overridden_by(mut self, overrides: &EnvOverrides) -> Self {
        if let Some(base_url) = &overrides.base_url {
            self.base_url = base_url.clone();
        }
        if overrides.debug {
            self.probe_interval_secs = 1;
            self.tiles.debounce_ms = self.tiles.debounce_ms.min(50);
        }
        self
    }
}

/// Process-level overrides. Applied to every snapshot, never written back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvOverrides {
    /// `FOLIO_BASE_URL`
    pub base_url: Option<String>,
    /// `FOLIO_DEBUG=1|true`: 1s probe interval, debounce capped at 50ms.
    pub debug: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let base_url = std::env::var("FOLIO_BASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let debug = std::env::var("FOLIO_DEBUG")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self { base_url, debug }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    /// File contents only; overrides are layered on in [`SettingsStore::snapshot`].
    data: RwLock<ArchiveSettings>,
    overrides: EnvOverrides,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_overrides(path, EnvOverrides::from_env())
    }

    pub fn with_overrides(path: PathBuf, overrides: EnvOverrides) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed settings at {}: {err}", path.display());
                ArchiveSettings::default()
            })
        } else {
            ArchiveSettings::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
            overrides,
        })
    }

    pub fn snapshot(&self) -> ArchiveSettings {
        self.read().clone().overridden_by(&self.overrides)
    }

    pub fn session_cookie(&self) -> Option<String> {
        self.read().session_cookie.clone()
    }

    pub fn set_session_cookie(&self, cookie: Option<String>) -> Result<()> {
        let mut guard = self.write();
        if guard.session_cookie == cookie {
            return Ok(());
        }
        guard.session_cookie = cookie;
        self.persist(&guard)
    }

    fn read(&self) -> RwLockReadGuard<'_, ArchiveSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, ArchiveSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, data: &ArchiveSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json")).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.page_limit, 6);
        assert_eq!(settings.tiles.limiter, 4);
        assert_eq!(settings.sync.chunk_size, 10);
        assert_eq!(settings.backoff.factor, 2.0);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "page_limit": 9, "sync": { "chunk_size": 25 } }"#).unwrap();

        let settings = SettingsStore::new(path).unwrap().snapshot();
        assert_eq!(settings.page_limit, 9);
        assert_eq!(settings.sync.chunk_size, 25);
        assert_eq!(settings.window, WindowSettings::default());
    }

    #[test]
    fn session_cookie_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::new(path.clone()).unwrap();
        store
            .set_session_cookie(Some("session=abc".to_string()))
            .unwrap();

        let reopened = SettingsStore::new(path).unwrap();
        assert_eq!(reopened.session_cookie(), Some("session=abc".to_string()));

        reopened.set_session_cookie(None).unwrap();
        assert_eq!(reopened.session_cookie(), None);
    }

    #[test]
    fn env_overrides_apply_without_being_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let overrides = EnvOverrides {
            base_url: Some("http://override:1".to_string()),
            debug: true,
        };

        let store = SettingsStore::with_overrides(path.clone(), overrides).unwrap();
        let effective = store.snapshot();
        assert_eq!(effective.base_url, "http://override:1");
        assert_eq!(effective.probe_interval_secs, 1);
        assert_eq!(effective.tiles.debounce_ms, 50);
        store.set_session_cookie(Some("s=1".to_string())).unwrap();

        let reopened = SettingsStore::with_overrides(path, EnvOverrides::default()).unwrap();
        let settings = reopened.snapshot();
        assert_eq!(settings.base_url, ArchiveSettings::default().base_url);
        assert_eq!(settings.probe_interval_secs, 15);
        assert_eq!(settings.tiles.debounce_ms, 150);
        assert_eq!(settings.session_cookie, Some("s=1".to_string()));
    }
}
