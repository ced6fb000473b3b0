use crate::error::AppError;
use crate::state::settings::Settings;
use config::{Config, Environment, File};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top level configuration, layered from an optional file and `MIRROR__*` env vars.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub camera: CameraConfig,
    pub pipeline: PipelineConfig,
    pub remote: RemoteConfig,
    pub settings: Settings,
}

impl MirrorConfig {
    /// Loads the configuration. Without an explicit path, `mirror.{toml,json,yaml}` in the
    /// working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let builder = Config::builder();
        let builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("mirror").required(false)),
        };
        let config = builder
            .add_source(
                Environment::with_prefix("MIRROR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let mut loaded: MirrorConfig = config.try_deserialize()?;
        loaded.settings = loaded.settings.clamped();
        Ok(loaded)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub device: i32,
    /// Synthesize frames when no physical device can be opened.
    pub allow_mock: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 24,
            device: 0,
            allow_mock: true,
        }
    }
}

impl CameraConfig {
    pub fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Append-only per-cycle latency log. `None` disables logging.
    pub latency_log_path: Option<PathBuf>,
    pub intrinsics_path: PathBuf,
    pub routines_path: Option<PathBuf>,
    pub features: FeatureMap,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            latency_log_path: Some(PathBuf::from("logs/latency.csv")),
            intrinsics_path: PathBuf::from("config/camera_intrinsics.json"),
            routines_path: None,
            features: FeatureMap::default(),
        }
    }
}

/// Named landmark features and the mesh indices averaged to produce them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureMap {
    pub face: IndexMap<String, Vec<usize>>,
    pub hands: IndexMap<String, Vec<usize>>,
}

impl Default for FeatureMap {
    fn default() -> Self {
        let face = [
            ("mouth_center", vec![13, 14]),
            ("mouth_left", vec![61]),
            ("mouth_right", vec![291]),
            ("cheek_left", vec![234]),
            ("cheek_right", vec![454]),
            ("nose_tip", vec![1]),
        ];
        let hands = [("hand_right_index_tip", vec![8]), ("hand_thumb_tip", vec![4])];
        Self {
            face: face
                .into_iter()
                .map(|(name, indices)| (name.to_string(), indices))
                .collect(),
            hands: hands
                .into_iter()
                .map(|(name, indices)| (name.to_string(), indices))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub rps: u32,
    pub timeout_s: f64,
    pub min_interval_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://vision.googleapis.com/v1/images:annotate".to_string(),
            api_key: None,
            rps: 2,
            timeout_s: 0.8,
            min_interval_ms: 600,
        }
    }
}
