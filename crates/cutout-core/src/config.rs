use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::pipeline::Stage;

/// Segmentation model source and preprocessing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// HuggingFace repo ID (e.g., "briaai/RMBG-1.4")
    pub repo_id: String,
    /// ONNX file inside the repo
    pub filename: String,
    /// Square input edge the model expects
    pub input_size: u32,
    /// Per-channel normalization applied to RGB values in 0.0..=1.0
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Model cache directory (~/.cache/cutout/models)
    pub cache_dir: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cutout")
            .join("models");

        Self {
            repo_id: "briaai/RMBG-1.4".to_string(),
            filename: "onnx/model.onnx".to_string(),
            input_size: 1024,
            mean: [0.5, 0.5, 0.5],
            std: [1.0, 1.0, 1.0],
            cache_dir,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workers decoding and normalizing source images
    pub preprocess_workers: usize,
    /// Workers running segmentation (each loads its own model)
    pub segment_workers: usize,
    /// Workers compositing and encoding the output
    pub postprocess_workers: usize,
    /// Minimum interval between model-load progress updates
    pub progress_interval_ms: u64,
    /// How many times a crashed worker slot is respawned
    pub max_respawns: u32,
    /// Load the model while segment workers initialize instead of on first job
    pub preload_model: bool,
    /// Downscale sources so the long edge does not exceed this
    pub max_dimension: Option<u32>,
    /// Timeout for fetching URL sources
    pub fetch_timeout_secs: u64,
    pub model: ModelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preprocess_workers: 2,
            segment_workers: 4,
            postprocess_workers: 2,
            progress_interval_ms: 100,
            max_respawns: 1,
            preload_model: false,
            max_dimension: None,
            fetch_timeout_secs: 30,
            model: ModelConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read config, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Invalid config, using defaults");
                Self::default()
            }
        }
    }

    /// Default config file (~/.config/cutout/config.json)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cutout")
            .join("config.json")
    }

    /// Load configuration from the default path or use defaults
    pub fn load_or_default() -> Self {
        Self::load(&Self::default_path())
    }

    /// Save configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Override the three pool sizes.
    pub fn with_pool_sizes(mut self, preprocess: usize, segment: usize, postprocess: usize) -> Self {
        self.preprocess_workers = preprocess;
        self.segment_workers = segment;
        self.postprocess_workers = postprocess;
        self
    }

    pub fn pool_size(&self, stage: Stage) -> usize {
        match stage {
            Stage::Preprocess => self.preprocess_workers,
            Stage::Segment => self.segment_workers,
            Stage::Postprocess => self.postprocess_workers,
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for stage in Stage::ALL {
            if self.pool_size(stage) == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{} pool needs at least one worker",
                    stage
                )));
            }
        }
        if self.progress_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "progress_interval_ms must be > 0".to_string(),
            ));
        }
        if self.model.input_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "model input_size must be > 0".to_string(),
            ));
        }
        if self.max_dimension == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "max_dimension must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}
