//! Deterministic gradient-boosted decision-stump classifier.
//!
//! Multi-class softmax boosting: every round fits one stump per class to
//! the Newton step of the cross-entropy loss. Candidate thresholds come
//! from per-feature quantile bins, so training never depends on row order.
//!
//! The classifier runs on windowed features: each window row of a sample
//! is one training example carrying the sample's label, and a sample's
//! prediction averages the class probabilities of its windows.

use std::fs;
use std::path::Path;

use emg_core::{
    EpochMetrics, Error, EvaluationMetrics, Record, Result, TreeEnsembleConfig, MAX_TREE_BINS,
};
use emg_dataset::{FoldData, FoldDataset};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::callbacks::CallbackSet;
use crate::checkpoint::{CheckpointFormat, Persist};
use crate::driver::TrainingDriver;
use crate::logger::RunSession;

/// L2 regularization on leaf values
const LAMBDA: f64 = 1.0;

/// Numerically stable softmax
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// One split: `x[feature] <= threshold` goes left
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

impl Stump {
    pub fn predict(&self, x: &[f32]) -> f32 {
        if x.get(self.feature).copied().unwrap_or(0.0) <= self.threshold {
            self.left
        } else {
            self.right
        }
    }
}

/// Boosting hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainOptions {
    pub num_rounds: usize,
    pub learning_rate: f64,
    pub max_bins: usize,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            num_rounds: 100,
            learning_rate: 0.1,
            max_bins: 32,
        }
    }
}

impl From<&TreeEnsembleConfig> for TrainOptions {
    fn from(config: &TreeEnsembleConfig) -> Self {
        Self {
            num_rounds: config.num_rounds,
            learning_rate: config.learning_rate,
            max_bins: config.max_bins,
        }
    }
}

/// Trained (or still empty) stump ensemble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedStumps {
    pub num_classes: usize,
    pub num_features: usize,
    pub base_scores: Vec<f32>,
    /// `rounds[r][k]` is the stump of class `k` in round `r`
    pub rounds: Vec<Vec<Stump>>,
}

impl GradientBoostedStumps {
    /// An ensemble predicting uniform probabilities until fitted
    pub fn untrained(num_classes: usize) -> Self {
        Self {
            num_classes,
            num_features: 0,
            base_scores: vec![0.0; num_classes],
            rounds: Vec::new(),
        }
    }

    pub fn is_trained(&self) -> bool {
        !self.rounds.is_empty()
    }

    pub fn predict_scores(&self, x: &[f32]) -> Vec<f32> {
        let mut scores = self.base_scores.clone();
        for round in &self.rounds {
            for (score, stump) in scores.iter_mut().zip(round) {
                *score += stump.predict(x);
            }
        }
        scores
    }

    pub fn predict_proba(&self, x: &[f32]) -> Vec<f32> {
        softmax(&self.predict_scores(x))
    }

    /// Mean class probabilities over the rows of a windowed record
    pub fn predict_record(&self, record: &Record) -> Vec<f32> {
        let mut mean = vec![0.0f32; self.num_classes];
        for row in 0..record.rows {
            for (m, p) in mean.iter_mut().zip(self.predict_proba(record.row(row))) {
                *m += p;
            }
        }
        let rows = record.rows.max(1) as f32;
        mean.iter_mut().for_each(|m| *m /= rows);
        mean
    }

    /// Fits a fresh ensemble on `features` (one row per example)
    pub fn fit(
        num_classes: usize,
        features: &[Vec<f32>],
        labels: &[usize],
        options: TrainOptions,
    ) -> Result<Self> {
        if features.is_empty() || features.len() != labels.len() {
            return Err(Error::Training(format!(
                "boosting needs matching non-empty features and labels, got {} and {}",
                features.len(),
                labels.len()
            )));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(Error::Training(format!(
                "label {bad} outside {num_classes} classes"
            )));
        }
        let num_features = features[0].len();
        if features.iter().any(|row| row.len() != num_features) {
            return Err(Error::Training("feature rows differ in width".into()));
        }

        let n = features.len();
        let max_bins = options.max_bins.clamp(2, MAX_TREE_BINS);
        let bins = FeatureBins::build(features, num_features, max_bins);

        // Log class priors, smoothed so unseen classes stay finite
        let mut counts = vec![1.0f64; num_classes];
        labels.iter().for_each(|&l| counts[l] += 1.0);
        let total: f64 = counts.iter().sum();
        let base_scores: Vec<f32> = counts.iter().map(|c| (c / total).ln() as f32).collect();

        let mut scores: Vec<Vec<f32>> = vec![base_scores.clone(); n];
        let mut rounds = Vec::with_capacity(options.num_rounds);

        for round in 0..options.num_rounds {
            let probs: Vec<Vec<f32>> = scores.iter().map(|s| softmax(s)).collect();

            let stumps: Vec<Stump> = (0..num_classes)
                .map(|k| {
                    let grad: Vec<f64> = (0..n)
                        .map(|i| (labels[i] == k) as u8 as f64 - probs[i][k] as f64)
                        .collect();
                    let hess: Vec<f64> = (0..n)
                        .map(|i| {
                            let p = probs[i][k] as f64;
                            (p * (1.0 - p)).max(1e-6)
                        })
                        .collect();
                    bins.best_stump(&grad, &hess, options.learning_rate)
                })
                .collect();

            for (row, score) in features.iter().zip(scores.iter_mut()) {
                for (s, stump) in score.iter_mut().zip(&stumps) {
                    *s += stump.predict(row);
                }
            }
            rounds.push(stumps);

            if round % 10 == 0 {
                let loss: f64 = probs
                    .iter()
                    .zip(labels)
                    .map(|(p, &l)| -(p[l].max(1e-7) as f64).ln())
                    .sum::<f64>()
                    / n as f64;
                debug!("Boosting round {}: train loss {:.4}", round, loss);
            }
        }

        Ok(Self {
            num_classes,
            num_features,
            base_scores,
            rounds,
        })
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::checkpoint_io(parent, e))?;
        }
        let json = serde_json::to_string(self).map_err(|e| Error::checkpoint_io(path, e))?;
        fs::write(path, json).map_err(|e| Error::checkpoint_io(path, e))
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| Error::checkpoint_io(path, e))?;
        serde_json::from_str(&json).map_err(|e| Error::checkpoint_io(path, e))
    }
}

impl Persist for GradientBoostedStumps {
    const FORMAT: CheckpointFormat = CheckpointFormat::TreeJson;

    fn save_artifact(&self, path: &Path) -> Result<()> {
        self.save_json(path)
    }

    fn load_artifact(self, path: &Path) -> Result<Self> {
        Self::load_json(path)
    }
}

/// Quantile thresholds and the bin of every value, per feature
struct FeatureBins {
    thresholds: Vec<Vec<f32>>,
    /// `assignments[f][i]`: bin of example `i` for feature `f`
    assignments: Vec<Vec<u16>>,
}

impl FeatureBins {
    fn build(features: &[Vec<f32>], num_features: usize, max_bins: usize) -> Self {
        let (thresholds, assignments) = (0..num_features)
            .into_par_iter()
            .map(|f| {
                let mut values: Vec<f32> = features.iter().map(|row| row[f]).collect();
                values.sort_by(f32::total_cmp);
                values.dedup();

                let cuts = (max_bins - 1).min(values.len().saturating_sub(1));
                let mut thresholds: Vec<f32> = (1..=cuts)
                    .map(|c| {
                        let pos = c * values.len() / (cuts + 1);
                        (values[pos - 1] + values[pos]) / 2.0
                    })
                    .collect();
                thresholds.dedup();

                let assignment: Vec<u16> = features
                    .iter()
                    .map(|row| thresholds.partition_point(|&t| t < row[f]) as u16)
                    .collect();
                (thresholds, assignment)
            })
            .unzip();
        Self {
            thresholds,
            assignments,
        }
    }

    /// Stump with the largest second-order gain; a constant stump when no
    /// split helps
    fn best_stump(&self, grad: &[f64], hess: &[f64], learning_rate: f64) -> Stump {
        let g_total: f64 = grad.iter().sum();
        let h_total: f64 = hess.iter().sum();
        let leaf = |g: f64, h: f64| (learning_rate * g / (h + LAMBDA)) as f32;

        let best = self
            .thresholds
            .par_iter()
            .zip(self.assignments.par_iter())
            .enumerate()
            .filter(|(_, (thresholds, _))| !thresholds.is_empty())
            .map(|(feature, (thresholds, assignment))| {
                let mut g_bins = vec![0.0f64; thresholds.len() + 1];
                let mut h_bins = vec![0.0f64; thresholds.len() + 1];
                for ((&bin, g), h) in assignment.iter().zip(grad).zip(hess) {
                    g_bins[bin as usize] += g;
                    h_bins[bin as usize] += h;
                }

                let mut best: Option<(f64, Stump)> = None;
                let (mut g_left, mut h_left) = (0.0, 0.0);
                for (t, &threshold) in thresholds.iter().enumerate() {
                    g_left += g_bins[t];
                    h_left += h_bins[t];
                    let (g_right, h_right) = (g_total - g_left, h_total - h_left);
                    let gain = g_left * g_left / (h_left + LAMBDA)
                        + g_right * g_right / (h_right + LAMBDA);
                    if best.as_ref().map_or(true, |(b, _)| gain > *b) {
                        best = Some((
                            gain,
                            Stump {
                                feature,
                                threshold,
                                left: leaf(g_left, h_left),
                                right: leaf(g_right, h_right),
                            },
                        ));
                    }
                }
                best
            })
            .flatten()
            .reduce_with(|a, b| {
                // Lowest feature index wins ties so results don't depend on scheduling
                if b.0 > a.0 || (b.0 == a.0 && b.1.feature < a.1.feature) {
                    b
                } else {
                    a
                }
            });

        match best {
            Some((_, stump)) => stump,
            None => {
                let value = leaf(g_total, h_total);
                Stump {
                    feature: 0,
                    threshold: f32::INFINITY,
                    left: value,
                    right: value,
                }
            }
        }
    }
}

/// Fits a [`GradientBoostedStumps`] once on a fold's windowed features
#[derive(Debug, Clone, Copy, Default)]
pub struct BoostingTrainer {
    options: TrainOptions,
}

impl BoostingTrainer {
    pub fn new(options: TrainOptions) -> Self {
        Self { options }
    }

    /// Window rows of every sample, each labelled with its sample's label
    fn collect_rows(dataset: &FoldDataset) -> Result<(Vec<Vec<f32>>, Vec<usize>)> {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for item in dataset.items() {
            let item = item?;
            for row in 0..item.record.rows {
                features.push(item.record.row(row).to_vec());
                labels.push(item.label);
            }
        }
        Ok((features, labels))
    }

    fn evaluate(model: &GradientBoostedStumps, dataset: &FoldDataset) -> Result<EvaluationMetrics> {
        let mut predictions = Vec::with_capacity(dataset.len());
        let mut labels = Vec::with_capacity(dataset.len());
        let mut loss = 0.0f64;
        for item in dataset.items() {
            let item = item?;
            let probs = model.predict_record(&item.record);
            let predicted = probs
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, _)| k)
                .unwrap_or(0);
            loss -= (probs.get(item.label).copied().unwrap_or(0.0).max(1e-7) as f64).ln();
            predictions.push(predicted);
            labels.push(item.label);
        }
        let n = labels.len().max(1) as f64;
        Ok(
            EvaluationMetrics::from_predictions(model.num_classes, &predictions, &labels)
                .with_loss(loss / n),
        )
    }
}

impl TrainingDriver<GradientBoostedStumps> for BoostingTrainer {
    fn fit(
        &self,
        model: GradientBoostedStumps,
        data: &FoldData,
        callbacks: &mut CallbackSet<GradientBoostedStumps>,
        session: &mut RunSession,
    ) -> Result<GradientBoostedStumps> {
        let (features, labels) = Self::collect_rows(&data.train)?;
        info!(
            "Fold {}: boosting {} rounds over {} windows of {} samples",
            data.fold,
            self.options.num_rounds,
            features.len(),
            data.train.len()
        );
        let fitted =
            GradientBoostedStumps::fit(model.num_classes, &features, &labels, self.options)?;

        let train = Self::evaluate(&fitted, &data.train)?;
        let val = if data.val.is_empty() {
            train.clone()
        } else {
            Self::evaluate(&fitted, &data.val)?
        };
        let metrics = EpochMetrics {
            epoch: 0,
            train_loss: train.loss.unwrap_or(f64::NAN),
            train_accuracy: train.accuracy,
            val_loss: val.loss.unwrap_or(f64::NAN),
            val_accuracy: val.accuracy,
        };
        info!(
            "Fold {}: train acc {:.2}% | val acc {:.2}%",
            data.fold,
            100.0 * metrics.train_accuracy,
            100.0 * metrics.val_accuracy
        );
        session.log_epoch(&metrics);
        callbacks.on_epoch_end(&metrics, &fitted)?;
        Ok(fitted)
    }

    fn test(
        &self,
        model: &GradientBoostedStumps,
        data: &FoldData,
        session: &mut RunSession,
    ) -> Result<EvaluationMetrics> {
        if !model.is_trained() {
            return Err(Error::Training("tree ensemble used before fit".into()));
        }
        let metrics = Self::evaluate(model, &data.test)?;
        info!(
            "Fold {} test accuracy {:.2}% over {} samples",
            data.fold,
            100.0 * metrics.accuracy,
            metrics.num_samples
        );
        session.log_test(&metrics);
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Class = which of the first two features is larger
    fn toy() -> (Vec<Vec<f32>>, Vec<usize>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for i in 0..60 {
            let a = (i % 10) as f32;
            let b = ((i * 7) % 10) as f32;
            features.push(vec![a, b, 0.5]);
            labels.push(if a > 4.5 { 1 } else { 0 });
        }
        (features, labels)
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_fit_separable() {
        let (features, labels) = toy();
        let options = TrainOptions {
            num_rounds: 30,
            learning_rate: 0.3,
            max_bins: 16,
        };
        let model = GradientBoostedStumps::fit(2, &features, &labels, options).unwrap();
        assert_eq!(model.rounds.len(), 30);
        assert!(model.rounds.iter().all(|r| r.len() == 2));

        let correct = features
            .iter()
            .zip(&labels)
            .filter(|(x, &y)| {
                let p = model.predict_proba(x);
                (p[1] > p[0]) == (y == 1)
            })
            .count();
        assert_eq!(correct, features.len());
    }

    #[test]
    fn test_fit_is_deterministic() {
        let (features, labels) = toy();
        let options = TrainOptions {
            num_rounds: 5,
            ..Default::default()
        };
        let a = GradientBoostedStumps::fit(2, &features, &labels, options).unwrap();
        let b = GradientBoostedStumps::fit(2, &features, &labels, options).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bad_labels() {
        let err = GradientBoostedStumps::fit(2, &[vec![1.0]], &[3], TrainOptions::default());
        assert!(matches!(err, Err(Error::Training(_))));
    }

    #[test]
    fn test_json_artifact() {
        let dir = TempDir::new().unwrap();
        let (features, labels) = toy();
        let options = TrainOptions {
            num_rounds: 3,
            ..Default::default()
        };
        let model = GradientBoostedStumps::fit(2, &features, &labels, options).unwrap();
        let path = dir.path().join("trees_0_fold.json");
        model.save_artifact(&path).unwrap();
        let loaded = GradientBoostedStumps::untrained(2).load_artifact(&path).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn test_predict_record_averages_windows() {
        let model = GradientBoostedStumps {
            num_classes: 2,
            num_features: 1,
            base_scores: vec![0.0, 0.0],
            rounds: vec![vec![
                Stump {
                    feature: 0,
                    threshold: 0.0,
                    left: 2.0,
                    right: -2.0,
                },
                Stump {
                    feature: 0,
                    threshold: 0.0,
                    left: -2.0,
                    right: 2.0,
                },
            ]],
        };
        let record = Record::new(2, 1, vec![-1.0, 1.0]).unwrap();
        let p = model.predict_record(&record);
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!((p[1] - 0.5).abs() < 1e-6);
    }
}
