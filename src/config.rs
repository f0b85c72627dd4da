use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::analytics::{DetectionParameters, MismatchPolicy};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("input_photos")
}

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub watch: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dir: default_source_dir(),
            watch: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_region_path() -> PathBuf {
    PathBuf::from("region.json")
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    #[serde(default = "default_region_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub points: Option<Vec<[i32; 2]>>,
    /// Frames arrive already cropped; no polygon is applied.
    #[serde(default)]
    pub pre_cropped: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            path: default_region_path(),
            points: None,
            pre_cropped: false,
        }
    }
}

fn default_background_size() -> usize {
    15
}

fn default_update_every() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_background_size")]
    pub size: usize,
    #[serde(default = "default_update_every")]
    pub update_every: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            size: default_background_size(),
            update_every: default_update_every(),
        }
    }
}

fn default_thresholds() -> Vec<u8> {
    vec![10, 15, 20, 25, 30]
}

fn default_min_area() -> f64 {
    8.0
}

fn default_max_area() -> f64 {
    12000.0
}

fn default_color_lower() -> [u8; 3] {
    [5, 20, 20]
}

fn default_color_upper() -> [u8; 3] {
    [25, 255, 180]
}

fn default_min_aspect_ratio() -> f64 {
    0.2
}

fn default_max_aspect_ratio() -> f64 {
    5.0
}

fn default_min_solidity() -> f64 {
    0.2
}

fn default_mismatch_policy() -> MismatchPolicy {
    MismatchPolicy::Resize
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<u8>,
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    #[serde(default = "default_max_area")]
    pub max_area: f64,
    #[serde(default = "default_color_lower")]
    pub color_lower: [u8; 3],
    #[serde(default = "default_color_upper")]
    pub color_upper: [u8; 3],
    #[serde(default = "default_min_aspect_ratio")]
    pub min_aspect_ratio: f64,
    #[serde(default = "default_max_aspect_ratio")]
    pub max_aspect_ratio: f64,
    #[serde(default = "default_min_solidity")]
    pub min_solidity: f64,
    #[serde(default = "default_mismatch_policy")]
    pub on_dimension_mismatch: MismatchPolicy,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            min_area: default_min_area(),
            max_area: default_max_area(),
            color_lower: default_color_lower(),
            color_upper: default_color_upper(),
            min_aspect_ratio: default_min_aspect_ratio(),
            max_aspect_ratio: default_max_aspect_ratio(),
            min_solidity: default_min_solidity(),
            on_dimension_mismatch: default_mismatch_policy(),
        }
    }
}

impl DetectionConfig {
    pub fn parameters(&self) -> DetectionParameters {
        DetectionParameters {
            thresholds: self.thresholds.clone(),
            min_area: self.min_area,
            max_area: self.max_area,
            color_lower: self.color_lower,
            color_upper: self.color_upper,
            min_aspect_ratio: self.min_aspect_ratio,
            max_aspect_ratio: self.max_aspect_ratio,
            min_solidity: self.min_solidity,
            on_dimension_mismatch: self.on_dimension_mismatch,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("bee_detection.db")
}

fn default_csv_path() -> PathBuf {
    PathBuf::from("results.csv")
}

/// Where coverage results go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderKind {
    #[default]
    Sqlite,
    Csv,
    /// Dry run: results stay in memory and only the summary is logged.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub kind: RecorderKind,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
    #[serde(default)]
    pub hive_id: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            kind: RecorderKind::default(),
            database_path: default_database_path(),
            csv_path: default_csv_path(),
            hive_id: None,
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_artifacts_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub region: RegionConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

impl Config {
    /// Reads `config.toml` from the working directory, or falls back to
    /// defaults when it does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        if !Path::new(DEFAULT_CONFIG_PATH).exists() {
            tracing::info!(path = DEFAULT_CONFIG_PATH, "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.background.size == 0 {
            return Err(ConfigError::Invalid("background.size must be at least 1".into()));
        }
        if self.background.update_every == 0 {
            return Err(ConfigError::Invalid(
                "background.update_every must be at least 1".into(),
            ));
        }

        let detection = &self.detection;
        if detection.thresholds.is_empty() {
            return Err(ConfigError::Invalid("detection.thresholds is empty".into()));
        }
        if detection.min_area > detection.max_area {
            return Err(ConfigError::Invalid(format!(
                "detection.min_area ({}) exceeds max_area ({})",
                detection.min_area, detection.max_area
            )));
        }
        if detection.min_aspect_ratio > detection.max_aspect_ratio {
            return Err(ConfigError::Invalid(format!(
                "detection.min_aspect_ratio ({}) exceeds max_aspect_ratio ({})",
                detection.min_aspect_ratio, detection.max_aspect_ratio
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.background.size, 15);
        assert_eq!(config.background.update_every, 1);
        assert_eq!(config.detection.thresholds, vec![10, 15, 20, 25, 30]);
        assert_eq!(config.detection.color_lower, [5, 20, 20]);
        assert_eq!(config.detection.color_upper, [25, 255, 180]);
        assert_eq!(config.detection.on_dimension_mismatch, MismatchPolicy::Resize);
        assert!(!config.region.pre_cropped);
        assert!(!config.artifacts.enabled);
        assert_eq!(config.recorder.hive_id, None);
        assert_eq!(config.recorder.kind, RecorderKind::Sqlite);
        assert_eq!(config.recorder.csv_path, PathBuf::from("results.csv"));
    }

    #[test]
    fn test_recorder_kind() {
        let config =
            Config::parse("[recorder]\nkind = \"csv\"\ncsv_path = \"out/bees.csv\"").unwrap();
        assert_eq!(config.recorder.kind, RecorderKind::Csv);
        assert_eq!(config.recorder.csv_path, PathBuf::from("out/bees.csv"));

        let config = Config::parse("[recorder]\nkind = \"memory\"").unwrap();
        assert_eq!(config.recorder.kind, RecorderKind::Memory);

        assert!(matches!(
            Config::parse("[recorder]\nkind = \"postgres\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::parse(
            r#"
            [source]
            dir = "/var/hive/frames"
            watch = true

            [region]
            points = [[0, 0], [100, 0], [100, 80]]

            [background]
            size = 8
            update_every = 50

            [detection]
            thresholds = [15, 25, 35, 45]
            on_dimension_mismatch = "reject"

            [recorder]
            hive_id = "HIVE_7"
            "#,
        )
        .unwrap();

        assert!(config.source.watch);
        assert_eq!(config.source.dir, PathBuf::from("/var/hive/frames"));
        assert_eq!(config.region.points.as_ref().map(Vec::len), Some(3));
        assert_eq!(config.background.size, 8);
        assert_eq!(config.background.update_every, 50);
        assert_eq!(config.detection.thresholds, vec![15, 25, 35, 45]);
        assert_eq!(config.detection.on_dimension_mismatch, MismatchPolicy::Reject);
        assert_eq!(config.recorder.hive_id.as_deref(), Some("HIVE_7"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            Config::parse("[background]\nsize = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[background]\nupdate_every = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[detection]\nthresholds = []"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::parse("[detection]\nmin_area = 500.0\nmax_area = 10.0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(&path, "[artifacts]\nenabled = true\ndir = \"debug\"").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.artifacts.enabled);
        assert_eq!(config.artifacts.dir, PathBuf::from("debug"));
        assert!(matches!(
            Config::load_from(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_parameters_carry_detection_section() {
        let config = Config::parse("[detection]\nmin_solidity = 0.5").unwrap();
        let params = config.detection.parameters();
        assert_eq!(params.min_solidity, 0.5);
        assert_eq!(params.thresholds, default_thresholds());
    }
}
