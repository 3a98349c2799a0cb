//! Settings shared by every cross-validation driver.

use std::path::PathBuf;

use emg_core::{DataParameters, ExperimentConfig, TrackerConfig};

/// Experiment identity and output locations
#[derive(Debug, Clone)]
pub struct ExperimentSettings {
    /// Run name; artifacts use its sanitized form
    pub name: String,
    pub models_dir: PathBuf,
    /// Re-applied before each fold's model is built
    pub seed: u64,
    pub tracker: TrackerConfig,
    /// Model input shape and class count; taken from the data module when absent
    pub model_params: Option<DataParameters>,
}

impl ExperimentSettings {
    pub fn new(name: impl Into<String>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            models_dir: models_dir.into(),
            seed: 0,
            tracker: TrackerConfig::default(),
            model_params: None,
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            name: config.name.clone(),
            models_dir: config.models_dir.clone(),
            seed: config.seed,
            tracker: config.tracker.clone(),
            model_params: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    /// Where best-epoch checkpoints are kept during a fit
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.models_dir.join("checkpoints")
    }

    /// Run name of the sequence stage
    pub fn sequence_name(&self) -> String {
        format!("lstm {}", self.name)
    }
}
