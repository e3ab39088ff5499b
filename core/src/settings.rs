use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

pub const SETTINGS_FILE_NAME: &str = "vidfetch_settings.json";
pub const SETTINGS_ENV: &str = "VIDFETCH_SETTINGS";

fn home_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

pub fn default_download_path() -> PathBuf {
    home_dir().join("Downloads").join("VidFetch")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_download_path")]
    pub download_path: PathBuf,
    /// Keys written by other versions, kept so a save does not drop them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: default_download_path(),
            extra: Map::new(),
        }
    }
}

/// Settings bound to the JSON file they were loaded from.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    /// `$VIDFETCH_SETTINGS`, else `$HOME/vidfetch_settings.json`.
    pub fn default_file() -> PathBuf {
        match env::var_os(SETTINGS_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => home_dir().join(SETTINGS_FILE_NAME),
        }
    }

    pub fn open_default() -> Self {
        Self::load(Self::default_file())
    }

    /// Never fails: a missing file yields defaults, an unreadable or corrupt
    /// one is logged and also yields defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Settings>(&text) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring corrupt settings file");
                    Settings::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read settings file");
                Settings::default()
            }
        };
        Self { path, settings }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn download_path(&self) -> &Path {
        &self.settings.download_path
    }

    pub fn set_download_path(&mut self, path: impl Into<PathBuf>) -> CoreResult<()> {
        self.settings.download_path = path.into();
        self.save()
    }

    pub fn save(&self) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| CoreError::Config(err.to_string()))?;
            }
        }
        let text = serde_json::to_string_pretty(&self.settings)
            .map_err(|err| CoreError::Config(err.to_string()))?;
        fs::write(&self.path, text).map_err(|err| {
            CoreError::Config(format!("cannot write {}: {}", self.path.display(), err))
        })
    }
}
