//! Cross-validation results.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use emg_core::{Error, EvaluationMetrics, FoldIndex, Result};
use emg_training::sanitize_name;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Outcome of one fold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldReport {
    pub fold: FoldIndex,
    pub test: EvaluationMetrics,
    /// The fold's persisted model
    pub artifact: PathBuf,
    /// Test metrics of the sequence stage, for two-stage runs
    pub sequence_test: Option<EvaluationMetrics>,
}

/// Per-fold results plus accuracy statistics across folds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossValidationReport {
    pub name: String,
    pub k_folds: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub folds: Vec<FoldReport>,
    pub mean_accuracy: f64,
    pub std_accuracy: f64,
    pub sequence_mean_accuracy: Option<f64>,
}

impl CrossValidationReport {
    pub fn new(name: &str, k_folds: usize) -> Self {
        Self {
            name: name.to_string(),
            k_folds,
            started_at: Utc::now(),
            finished_at: None,
            folds: Vec::with_capacity(k_folds),
            mean_accuracy: 0.0,
            std_accuracy: 0.0,
            sequence_mean_accuracy: None,
        }
    }

    pub fn push(&mut self, fold: FoldReport) {
        self.folds.push(fold);
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Path> {
        self.folds.iter().map(|f| f.artifact.as_path())
    }

    /// Computes the summary statistics and stamps the finish time
    pub fn finish(&mut self) {
        let accuracies: Vec<f64> = self.folds.iter().map(|f| f.test.accuracy).collect();
        let (mean, std) = mean_std(&accuracies);
        self.mean_accuracy = mean;
        self.std_accuracy = std;

        let sequence: Vec<f64> = self
            .folds
            .iter()
            .filter_map(|f| f.sequence_test.as_ref().map(|m| m.accuracy))
            .collect();
        self.sequence_mean_accuracy = (!sequence.is_empty()).then(|| mean_std(&sequence).0);
        self.finished_at = Some(Utc::now());
    }

    /// `{models_dir}/{sanitized}_summary.json`
    pub fn summary_path(models_dir: &Path, name: &str) -> PathBuf {
        models_dir.join(format!("{}_summary.json", sanitize_name(name)))
    }

    pub fn save(&self, models_dir: &Path) -> Result<PathBuf> {
        let path = Self::summary_path(models_dir, &self.name);
        fs::create_dir_all(models_dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize report: {}", e)))?;
        fs::write(&path, json)?;
        info!("Cross-validation summary saved to {:?}", path);
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Serialization(format!("Failed to deserialize report: {}", e)))
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
