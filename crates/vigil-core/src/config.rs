//! Run configuration and tracker config-file parsing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::PropertyValue;
use crate::error::{Result, VigilError};

pub const DEFAULT_PGIE_CONFIG: &str = "./models/pgie/pgie.txt";
pub const DEFAULT_TRACKER_CONFIG: &str = "./dstest2_tracker_config.txt";
pub const DEFAULT_SOURCE_COUNT: u32 = 2;

/// Batch-formation settings of the stream multiplexer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Output resolution of the batched frames.
    pub width: u32,
    pub height: u32,
    /// How long the multiplexer waits for a full batch before pushing a
    /// partial one, in microseconds.
    pub batched_push_timeout_us: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            batched_push_timeout_us: 4_000_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of per-source chains; every chain reads `media_path`.
    pub source_count: u32,
    pub media_path: PathBuf,
    /// Primary inference (nvinfer) config file.
    pub pgie_config_path: PathBuf,
    pub tracker_config_path: PathBuf,
    pub tracker_enabled: bool,
    /// Pace every sink to wall-clock timing.
    pub sync_sinks: bool,
    #[serde(default)]
    pub mux: MuxConfig,
    /// Where the topology diagram is written once the graph plays.
    #[serde(default)]
    pub dot_dump_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_count: DEFAULT_SOURCE_COUNT,
            media_path: PathBuf::new(),
            pgie_config_path: PathBuf::from(DEFAULT_PGIE_CONFIG),
            tracker_config_path: PathBuf::from(DEFAULT_TRACKER_CONFIG),
            tracker_enabled: true,
            sync_sinks: false,
            mux: MuxConfig::default(),
            dot_dump_dir: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.source_count == 0 {
            return Err(VigilError::InvalidConfig(
                "source count must be at least 1".into(),
            ));
        }
        if self.media_path.as_os_str().is_empty() {
            return Err(VigilError::InvalidConfig("media path is empty".into()));
        }
        if self.mux.width == 0 || self.mux.height == 0 {
            return Err(VigilError::InvalidConfig(format!(
                "mux resolution must be non-zero, got {}x{}",
                self.mux.width, self.mux.height
            )));
        }
        Ok(())
    }
}

// ─── Tracker config ─────────────────────────────────────────────────────────

const TRACKER_SECTION: &str = "tracker";

/// A key of the `[tracker]` section that is forwarded to the tracker stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerKey {
    Width,
    Height,
    GpuId,
    LowLevelLibrary,
    LowLevelConfig,
    EnableBatchProcess,
    EnablePastFrame,
}

impl TrackerKey {
    pub const ALL: [TrackerKey; 7] = [
        Self::Width,
        Self::Height,
        Self::GpuId,
        Self::LowLevelLibrary,
        Self::LowLevelConfig,
        Self::EnableBatchProcess,
        Self::EnablePastFrame,
    ];

    /// Spelling in the config file.
    pub fn file_key(self) -> &'static str {
        match self {
            Self::Width => "tracker-width",
            Self::Height => "tracker-height",
            Self::GpuId => "gpu-id",
            Self::LowLevelLibrary => "ll-lib-file",
            Self::LowLevelConfig => "ll-config-file",
            Self::EnableBatchProcess => "enable-batch-process",
            Self::EnablePastFrame => "enable-past-frame",
        }
    }

    /// Property name on the tracker stage.
    pub fn property(self) -> &'static str {
        match self {
            Self::Width => "tracker-width",
            Self::Height => "tracker-height",
            Self::GpuId => "gpu_id",
            Self::LowLevelLibrary => "ll-lib-file",
            Self::LowLevelConfig => "ll-config-file",
            Self::EnableBatchProcess => "enable_batch_process",
            Self::EnablePastFrame => "enable_past_frame",
        }
    }

    fn is_integer(self) -> bool {
        !matches!(self, Self::LowLevelLibrary | Self::LowLevelConfig)
    }

    fn from_file_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.file_key() == key)
    }
}

/// Recognized settings of a tracker config file, in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackerConfig {
    entries: Vec<(TrackerKey, PropertyValue)>,
}

impl TrackerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|err| VigilError::TrackerConfig {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::parse(&data).map_err(|reason| VigilError::TrackerConfig {
            path: path.display().to_string(),
            reason,
        })
    }

    /// Parse an INI-style document, keeping only recognized `[tracker]` keys.
    pub fn parse(data: &str) -> std::result::Result<Self, String> {
        let mut entries = Vec::new();
        let mut in_tracker = false;

        for (lineno, raw) in data.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                in_tracker = section.trim() == TRACKER_SECTION;
                continue;
            }
            if !in_tracker {
                continue;
            }
            let Some((key, value)) = line.split_once(['=', ':']) else {
                return Err(format!("line {}: expected key=value", lineno + 1));
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            let Some(tracker_key) = TrackerKey::from_file_key(&key) else {
                debug!(key = %key, "Ignoring unrecognized tracker key");
                continue;
            };
            let value = if tracker_key.is_integer() {
                let parsed = value.parse::<i64>().map_err(|_| {
                    format!(
                        "line {}: {} expects an integer, got '{value}'",
                        lineno + 1,
                        tracker_key.file_key()
                    )
                })?;
                PropertyValue::Int(parsed)
            } else {
                PropertyValue::Str(value.to_string())
            };
            entries.retain(|(k, _)| *k != tracker_key);
            entries.push((tracker_key, value));
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: TrackerKey) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find_map(|(k, v)| (*k == key).then_some(v))
    }

    /// `(property name, value)` pairs to set on the tracker stage.
    pub fn properties(&self) -> impl Iterator<Item = (&'static str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.property(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
