// Settings management and persistence
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{EngineError, Result};

const SETTINGS_FILE_NAME: &str = "stemsync.json";

/// A filename rule: a case-insensitive regex tested against the extensionless
/// file name. The first matching rule names the stem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilenameRule {
    pub pattern: String,
    #[serde(alias = "name")]
    pub label: String,
}

impl FilenameRule {
    pub fn new(pattern: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            label: label.into(),
        }
    }
}

/// Persisted gain for one stem label of one song
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemVolume {
    #[serde(deserialize_with = "clamped_volume")]
    pub volume: u8,
    #[serde(default)]
    pub muted: bool,
}

/// Reads any JSON number as a volume, clamped to 0-100
fn clamped_volume<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(raw.round().clamp(0.0, 100.0) as u8)
}

/// groupingKey -> label -> volume
pub type VolumeSettings = BTreeMap<String, BTreeMap<String, StemVolume>>;

/// How a drift-correction tick picks the position every stem is pulled to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferencePolicy {
    /// Always follow the first stem in song order
    FirstStem,
    /// Follow the most common sampled position
    Modal,
    /// Modal, but the priority stem wins whenever stems disagree
    ModalWithPriority,
}

impl Default for ReferencePolicy {
    fn default() -> Self {
        ReferencePolicy::ModalWithPriority
    }
}

/// Drift detector timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriftSettings {
    pub tolerance_ms: u64,
    pub cooldown_ms: u64,
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    pub settle_ms: u64,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            tolerance_ms: 15,
            cooldown_ms: 600,
            initial_delay_ms: 200,
            interval_ms: 3000,
            settle_ms: 80,
        }
    }
}

/// Main engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub skip_seconds: f64,
    pub filename_rules: Vec<FilenameRule>,
    pub volume_settings: VolumeSettings,
    pub playlist_order: Vec<String>,
    /// Volume given to a stem nobody has touched yet
    #[serde(deserialize_with = "clamped_volume")]
    pub default_volume: u8,
    pub priority_label: Option<String>,
    pub reference_policy: ReferencePolicy,
    pub drift: DriftSettings,
    pub progress_interval_ms: u64,
    /// Fields owned by other tools (theme editor etc), kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub fn default_filename_rules() -> Vec<FilenameRule> {
    ["Bass", "Drums", "Instrumental", "Other", "Vocals", "Piano", "Guitar"]
        .iter()
        .map(|label| FilenameRule::new(format!("({})$", label), *label))
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            skip_seconds: 5.0,
            filename_rules: default_filename_rules(),
            volume_settings: VolumeSettings::new(),
            playlist_order: Vec::new(),
            default_volume: 85,
            priority_label: Some("Vocals".to_string()),
            reference_policy: ReferencePolicy::default(),
            drift: DriftSettings::default(),
            progress_interval_ms: 200,
            extra: Map::new(),
        }
    }
}

impl Config {
    /// Get the settings file path
    pub fn settings_path(app_dir: &Path) -> PathBuf {
        app_dir.join(SETTINGS_FILE_NAME)
    }

    /// Load settings from the app directory, or return defaults if the file doesn't exist
    pub fn load(app_dir: &Path) -> Result<Self> {
        let path = Self::settings_path(app_dir);

        if !path.exists() {
            debug!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let config = Self::import_from(&path)?;
        info!("Loaded settings from {:?}", path);
        Ok(config)
    }

    /// Save settings into the app directory
    pub fn save(&self, app_dir: &Path) -> Result<()> {
        fs::create_dir_all(app_dir).map_err(|source| EngineError::Io {
            path: app_dir.to_path_buf(),
            source,
        })?;

        let path = Self::settings_path(app_dir);
        self.export_to(&path)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Write the full config as pretty JSON to an arbitrary file
    pub fn export_to(&self, path: &Path) -> Result<()> {
        let content = self.to_json()?;
        fs::write(path, content).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a config previously written by `export_to` (or by hand)
    pub fn import_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("Failed to serialize settings: {}", e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse settings: {}", e)))?;
        config.sanitize();
        Ok(config)
    }

    /// Clamp values a hand-edited file could push out of range
    fn sanitize(&mut self) {
        self.default_volume = self.default_volume.min(100);
        for stems in self.volume_settings.values_mut() {
            for setting in stems.values_mut() {
                setting.volume = setting.volume.min(100);
            }
        }
        if !self.skip_seconds.is_finite() || self.skip_seconds < 0.0 {
            self.skip_seconds = Config::default().skip_seconds;
        }
    }

    pub fn stem_volume(&self, grouping_key: &str, label: &str) -> Option<StemVolume> {
        self.volume_settings
            .get(grouping_key)
            .and_then(|stems| stems.get(label))
            .copied()
    }

    pub fn set_stem_volume(&mut self, grouping_key: &str, label: &str, setting: StemVolume) {
        self.volume_settings
            .entry(grouping_key.to_string())
            .or_default()
            .insert(label.to_string(), setting);
    }
}
