use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine tuning, read from `<config_dir>/beatlayer/engine.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output rate; `None` keeps whatever the device prefers.
    pub sample_rate: Option<u32>,
    /// Gap between `Mixer::play` and the shared layer start.
    pub lookahead_secs: f64,
    /// Time constant of every smoothed gain change.
    pub smoothing_time_constant: f32,
    pub max_nodes: usize,
    pub default_bpm: f64,
    pub default_layer_volume: f32,
    pub fetch_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: None,
            lookahead_secs: 0.05,
            smoothing_time_constant: 0.01,
            max_nodes: beatlayer_engine::DEFAULT_MAX_NODES,
            default_bpm: beatlayer_transport::DEFAULT_BPM,
            default_layer_volume: 0.9,
            fetch_timeout_secs: 15,
        }
    }
}

impl EngineConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("beatlayer").join("engine.toml"))
    }

    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Missing or malformed files fall back to defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("ignoring malformed config {}: {e}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path =
            Self::config_path().ok_or_else(|| anyhow::anyhow!("no config directory available"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
