use anyhow::{Context, Result};
use rmcard_core::Configuration;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const APP_DIR: &str = "rmcard";
const CONFIG_FILE: &str = "config.json";

/// Persistence for the application's [`Configuration`].
pub trait ConfigStore {
    fn load(&self) -> Result<Configuration>;
    fn save(&self, config: &Configuration) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `explicit`, or the per-user config directory.
    pub fn locate(explicit: Option<&Path>) -> Self {
        match explicit {
            Some(path) => Self::new(path),
            None => Self::new(default_config_path()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonConfigStore {
    fn load(&self) -> Result<Configuration> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no configuration yet");
            return Ok(Configuration::default());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("read config {}", self.path.display()))?;
        let config = serde_json::from_str(&data)
            .with_context(|| format!("parse config {}", self.path.display()))?;
        Ok(config)
    }

    fn save(&self, config: &Configuration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace config {}", self.path.display()))?;
        debug!(path = %self.path.display(), "configuration saved");
        Ok(())
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}
