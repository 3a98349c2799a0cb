//! Configuration structures for cross-validation experiments.
//!
//! Every driver parameter the experiment functions accept has a home here so
//! a whole run can be described by one TOML file.

use crate::error::{Error, Result};
use crate::transform::TransformChain;
use crate::types::{ColumnNames, DatasetKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Data module configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataModuleConfig {
    /// Number of cross-validation folds
    pub k_folds: usize,
    /// Share of non-test groups used for training, the rest validates
    pub train_ratio: f64,
    /// Batch size
    pub batch_size: usize,
    /// Number of data loading workers
    pub num_workers: usize,
    /// Whether to shuffle training data every epoch
    pub shuffle_train: bool,
    /// Seed for the group-to-bucket assignment
    pub seed: u64,
    /// Column names override, dataset defaults otherwise
    pub columns: Option<ColumnNames>,
    pub train_transforms: TransformChain,
    pub val_transforms: TransformChain,
    /// Also what a frozen feature extractor reads through
    pub test_transforms: TransformChain,
}

impl Default for DataModuleConfig {
    fn default() -> Self {
        Self {
            k_folds: 5,
            train_ratio: 0.8,
            batch_size: 12,
            num_workers: 8,
            shuffle_train: true,
            seed: 0,
            columns: None,
            train_transforms: TransformChain::identity(),
            val_transforms: TransformChain::identity(),
            test_transforms: TransformChain::identity(),
        }
    }
}

impl DataModuleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k_folds < 2 {
            return Err(Error::Configuration(format!(
                "k_folds must be at least 2, got {}",
                self.k_folds
            )));
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(Error::Configuration(format!(
                "train_ratio must be in (0, 1), got {}",
                self.train_ratio
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration("batch_size must be positive".into()));
        }
        Ok(())
    }
}

/// Metric watched by early stopping and best-checkpoint selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMetric {
    ValLoss,
    ValAccuracy,
}

impl MonitorMetric {
    /// Whether larger values are better
    pub fn maximize(&self) -> bool {
        matches!(self, MonitorMetric::ValAccuracy)
    }
}

impl std::fmt::Display for MonitorMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorMetric::ValLoss => write!(f, "val_loss"),
            MonitorMetric::ValAccuracy => write!(f, "val_accuracy"),
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    pub max_epochs: usize,
    pub learning_rate: f64,
    /// Weight decay (L2 regularization)
    pub weight_decay: Option<f64>,
    /// Early stopping patience (epochs), disabled when absent
    pub early_stopping_patience: Option<usize>,
    /// Keep the best validation weights and test those instead of the last
    pub checkpoint_best: bool,
    pub monitor: MonitorMetric,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            max_epochs: 30,
            learning_rate: 1e-3,
            weight_decay: Some(1e-4),
            early_stopping_patience: Some(5),
            checkpoint_best: true,
            monitor: MonitorMetric::ValAccuracy,
        }
    }
}

/// Window length and step for windowed feature aggregation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    pub time_window: usize,
    pub time_step: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            time_window: 150,
            time_step: 10,
        }
    }
}

impl WindowConfig {
    pub fn new(time_window: usize, time_step: usize) -> Result<Self> {
        let config = Self {
            time_window,
            time_step,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_window == 0 || self.time_step == 0 {
            return Err(Error::Configuration(format!(
                "time_window and time_step must be positive, got {}/{}",
                self.time_window, self.time_step
            )));
        }
        Ok(())
    }

    /// Number of windows over a sequence of `len` steps
    pub fn num_windows(&self, len: usize) -> usize {
        if len < self.time_window {
            0
        } else {
            (len - self.time_window) / self.time_step + 1
        }
    }
}

/// Convolutional model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub base_filters: usize,
    pub hidden_size: usize,
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_filters: 16,
            hidden_size: 128,
            dropout: 0.3,
        }
    }
}

/// Second-stage sequence model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceStageConfig {
    pub max_epochs: usize,
    pub hidden_size: usize,
    pub window: WindowConfig,
    /// Callbacks for the sequence stage; none are used when absent
    pub training: Option<TrainingParams>,
}

impl Default for SequenceStageConfig {
    fn default() -> Self {
        Self {
            max_epochs: 20,
            hidden_size: 64,
            window: WindowConfig::default(),
            training: None,
        }
    }
}

/// Gradient-boosted tree stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEnsembleConfig {
    /// One convolutional checkpoint per fold, in fold order
    pub model_files: Vec<PathBuf>,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default = "default_rounds")]
    pub num_rounds: usize,
    #[serde(default = "default_boost_lr")]
    pub learning_rate: f64,
    #[serde(default = "default_bins")]
    pub max_bins: usize,
}

fn default_rounds() -> usize {
    100
}

fn default_boost_lr() -> f64 {
    0.1
}

fn default_bins() -> usize {
    32
}

/// Upper bound on `max_bins`; bin indices are stored as `u16`
pub const MAX_TREE_BINS: usize = 1 << 16;

impl TreeEnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        if !(2..=MAX_TREE_BINS).contains(&self.max_bins) {
            return Err(Error::Configuration(format!(
                "max_bins must be in [2, {}], got {}",
                MAX_TREE_BINS, self.max_bins
            )));
        }
        if self.num_rounds == 0 {
            return Err(Error::Configuration("num_rounds must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Configuration(format!(
                "tree learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Experiment tracker session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub project: String,
    pub save_dir: PathBuf,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            project: "EMG Armband".to_string(),
            save_dir: PathBuf::from("run_logs"),
        }
    }
}

/// Dataset location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    pub kind: DatasetKind,
    /// Root holding processed sample indices
    pub root: PathBuf,
    /// Raw recordings, used to prepare the index when it is missing
    pub raw_dir: Option<PathBuf>,
}

/// A complete cross-validation experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub data: DataModuleConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingParams,
    pub sequence: Option<SequenceStageConfig>,
    pub tree_ensemble: Option<TreeEnsembleConfig>,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Seed for model initialization, re-applied at every fold
    #[serde(default)]
    pub seed: u64,
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration("experiment name is empty".into()));
        }
        self.data.validate()?;
        if self.training.max_epochs == 0 {
            return Err(Error::Configuration("max_epochs must be positive".into()));
        }
        if let Some(sequence) = &self.sequence {
            sequence.window.validate()?;
        }
        if let Some(trees) = &self.tree_ensemble {
            trees.validate()?;
            if trees.model_files.len() != self.data.k_folds {
                return Err(Error::Configuration(format!(
                    "tree ensemble needs one model file per fold: {} files for {} folds",
                    trees.model_files.len(),
                    self.data.k_folds
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Transform;

    #[test]
    fn test_default_data_module_config() {
        let config = DataModuleConfig::default();
        assert_eq!(config.k_folds, 5);
        assert_eq!(config.batch_size, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_data_module_config_rejects_single_fold() {
        let config = DataModuleConfig {
            k_folds: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_window_count() {
        let window = WindowConfig::new(4, 2).unwrap();
        assert_eq!(window.num_windows(3), 0);
        assert_eq!(window.num_windows(4), 1);
        assert_eq!(window.num_windows(10), 4);
        assert!(WindowConfig::new(0, 1).is_err());
    }

    #[test]
    fn test_monitor_display() {
        assert_eq!(MonitorMetric::ValLoss.to_string(), "val_loss");
        assert!(MonitorMetric::ValAccuracy.maximize());
        assert!(!MonitorMetric::ValLoss.maximize());
    }

    #[test]
    fn test_experiment_config_from_toml() {
        let config: ExperimentConfig = toml::from_str(
            r#"
            name = "Original Model"

            [dataset]
            kind = "csl-hdemg"
            root = "data/frames"

            [data]
            k_folds = 3

            [tree_ensemble]
            model_files = ["a.mpk", "b.mpk", "c.mpk"]
            "#,
        )
        .unwrap();

        assert_eq!(config.dataset.kind, DatasetKind::CslHdemg);
        assert_eq!(config.data.k_folds, 3);
        assert_eq!(config.data.batch_size, 12);
        assert_eq!(config.models_dir, PathBuf::from("models"));
        assert_eq!(config.tree_ensemble.as_ref().unwrap().num_rounds, 100);
        assert!(config.data.test_transforms.0.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_split_transforms_from_toml() {
        let config: DataModuleConfig = toml::from_str(
            r#"
            train_transforms = [{ kind = "rectify" }, { kind = "scale", factor = 2.0 }]
            test_transforms = [{ kind = "standardize_channels" }]
            "#,
        )
        .unwrap();

        assert_eq!(
            config.train_transforms,
            TransformChain::identity()
                .then(Transform::Rectify)
                .then(Transform::Scale { factor: 2.0 })
        );
        assert!(config.val_transforms.0.is_empty());
        assert_eq!(config.test_transforms.0, vec![Transform::StandardizeChannels]);
    }

    #[test]
    fn test_experiment_config_model_file_count() {
        let config: ExperimentConfig = toml::from_str(
            r#"
            name = "xgb"
            [dataset]
            kind = "ninapro"
            root = "data"
            [tree_ensemble]
            model_files = ["only_one.mpk"]
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_tree_bins_fit_bin_index() {
        let mut trees = TreeEnsembleConfig {
            model_files: Vec::new(),
            window: WindowConfig::default(),
            num_rounds: 10,
            learning_rate: 0.1,
            max_bins: MAX_TREE_BINS,
        };
        assert!(trees.validate().is_ok());

        trees.max_bins = MAX_TREE_BINS + 1;
        assert!(matches!(trees.validate(), Err(Error::Configuration(_))));
        trees.max_bins = 1;
        assert!(trees.validate().is_err());
    }
}
