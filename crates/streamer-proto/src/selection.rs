use serde::{Deserialize, Serialize};
use std::num::ParseFloatError;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MIN_VOLUME: f64 = 0.0;
pub const MAX_VOLUME: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("selection file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed selection file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unparsable volume {value:?}: {source}")]
    InvalidVolume {
        value: String,
        #[source]
        source: ParseFloatError,
    },
    #[error("volume {0:?} is not a finite number")]
    InvalidVolumeValue(String),
}

/// Durable station/volume selection. Field names match the on-disk YAML
/// layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRecord {
    #[serde(default)]
    pub streams: Vec<String>,
    /// 1-based station number.
    #[serde(default = "default_current_stream")]
    pub current_stream: usize,
    #[serde(default = "default_current_volume")]
    pub current_volume: String,
}

impl Default for SelectionRecord {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            current_stream: default_current_stream(),
            current_volume: default_current_volume(),
        }
    }
}

fn default_current_stream() -> usize {
    1
}

fn default_current_volume() -> String {
    format_volume(0.5)
}

impl SelectionRecord {
    pub fn volume(&self) -> Result<f64, StoreError> {
        parse_volume(&self.current_volume)
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.current_volume = format_volume(volume);
    }
}

/// Durable home of the [`SelectionRecord`]. Callers re-read before every
/// decision; implementations must not cache.
pub trait SelectionStore: Send + Sync {
    fn load(&self) -> Result<SelectionRecord, StoreError>;
    fn store(&self, record: &SelectionRecord) -> Result<(), StoreError>;
}

/// YAML document at a fixed path.
#[derive(Debug, Clone)]
pub struct YamlSelectionStore {
    path: PathBuf,
}

impl YamlSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SelectionStore for YamlSelectionStore {
    fn load(&self) -> Result<SelectionRecord, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("selection file {:?} missing, using defaults", self.path);
                return Ok(SelectionRecord::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        if content.trim().is_empty() {
            return Ok(SelectionRecord::default());
        }

        serde_yaml::from_str(&content).map_err(|source| StoreError::Yaml {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, record: &SelectionRecord) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let yaml = serde_yaml::to_string(record).map_err(|source| StoreError::Yaml {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, yaml).map_err(|e| self.io_error(e))?;
        debug!(
            "selection stored: station={} volume={}",
            record.current_stream, record.current_volume
        );
        Ok(())
    }
}

/// Saturates into `[MIN_VOLUME, MAX_VOLUME]`.
pub fn clamp_volume(volume: f64) -> f64 {
    if volume.is_nan() {
        return MIN_VOLUME;
    }
    volume.clamp(MIN_VOLUME, MAX_VOLUME)
}

pub fn format_volume(volume: f64) -> String {
    format!("{:.2}", clamp_volume(volume))
}

pub fn parse_volume(value: &str) -> Result<f64, StoreError> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|source| StoreError::InvalidVolume {
            value: value.to_string(),
            source,
        })?;
    if !parsed.is_finite() {
        return Err(StoreError::InvalidVolumeValue(value.to_string()));
    }
    Ok(clamp_volume(parsed))
}
