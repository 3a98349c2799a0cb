//! Evaluation metrics for gesture classifiers.

use serde::{Deserialize, Serialize};

/// Classification metrics computed from a confusion matrix
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationMetrics {
    /// Mean loss over the evaluated batches, when the model produces one
    pub loss: Option<f64>,
    pub accuracy: f64,
    pub per_class_precision: Vec<f64>,
    pub per_class_recall: Vec<f64>,
    pub per_class_f1: Vec<f64>,
    /// Confusion matrix (actual x predicted)
    pub confusion_matrix: Vec<Vec<usize>>,
    pub num_samples: usize,
}

impl EvaluationMetrics {
    pub fn new(num_classes: usize) -> Self {
        Self {
            loss: None,
            accuracy: 0.0,
            per_class_precision: vec![0.0; num_classes],
            per_class_recall: vec![0.0; num_classes],
            per_class_f1: vec![0.0; num_classes],
            confusion_matrix: vec![vec![0; num_classes]; num_classes],
            num_samples: 0,
        }
    }

    /// Builds metrics from paired predictions and labels
    pub fn from_predictions(num_classes: usize, predictions: &[usize], labels: &[usize]) -> Self {
        let mut metrics = Self::new(num_classes);
        for (&predicted, &actual) in predictions.iter().zip(labels) {
            metrics.update_confusion_matrix(actual, predicted);
        }
        metrics.compute_from_confusion_matrix();
        metrics
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss);
        self
    }

    pub fn update_confusion_matrix(&mut self, actual: usize, predicted: usize) {
        let n = self.confusion_matrix.len();
        if actual < n && predicted < n {
            self.confusion_matrix[actual][predicted] += 1;
        }
    }

    pub fn compute_from_confusion_matrix(&mut self) {
        let num_classes = self.confusion_matrix.len();
        self.num_samples = self.confusion_matrix.iter().flatten().sum();
        if self.num_samples == 0 {
            return;
        }

        let correct: usize = (0..num_classes).map(|i| self.confusion_matrix[i][i]).sum();
        self.accuracy = correct as f64 / self.num_samples as f64;

        for class_id in 0..num_classes {
            let tp = self.confusion_matrix[class_id][class_id] as f64;
            let predicted: f64 = (0..num_classes)
                .map(|i| self.confusion_matrix[i][class_id] as f64)
                .sum();
            let actual: f64 = self.confusion_matrix[class_id].iter().sum::<usize>() as f64;

            let precision = if predicted > 0.0 { tp / predicted } else { 0.0 };
            let recall = if actual > 0.0 { tp / actual } else { 0.0 };
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };

            self.per_class_precision[class_id] = precision;
            self.per_class_recall[class_id] = recall;
            self.per_class_f1[class_id] = f1;
        }
    }

    pub fn macro_precision(&self) -> f64 {
        mean(&self.per_class_precision)
    }

    pub fn macro_recall(&self) -> f64 {
        mean(&self.per_class_recall)
    }

    pub fn macro_f1(&self) -> f64 {
        mean(&self.per_class_f1)
    }

    /// Scalars sent to the experiment tracker, keyed with a split prefix
    pub fn scalars(&self, prefix: &str) -> Vec<(String, f64)> {
        let mut scalars = vec![
            (format!("{prefix}_accuracy"), self.accuracy),
            (format!("{prefix}_precision"), self.macro_precision()),
            (format!("{prefix}_recall"), self.macro_recall()),
            (format!("{prefix}_f1"), self.macro_f1()),
        ];
        if let Some(loss) = self.loss {
            scalars.push((format!("{prefix}_loss"), loss));
        }
        scalars
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Metrics for a single epoch, handed to lifecycle callbacks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

/// Per-epoch training history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .map(|e| e.val_accuracy)
            .max_by(|a, b| a.total_cmp(b))
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.epochs
            .iter()
            .max_by(|a, b| a.val_accuracy.total_cmp(&b.val_accuracy))
            .map(|e| e.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_metrics_creation() {
        let metrics = EvaluationMetrics::new(4);
        assert_eq!(metrics.confusion_matrix.len(), 4);
        assert_eq!(metrics.num_samples, 0);
        assert_eq!(metrics.macro_f1(), 0.0);
    }

    #[test]
    fn test_from_predictions() {
        let metrics = EvaluationMetrics::from_predictions(2, &[0, 0, 1, 1, 0], &[0, 0, 1, 1, 1]);
        assert_eq!(metrics.num_samples, 5);
        assert!((metrics.accuracy - 0.8).abs() < 1e-12);
        assert!((metrics.per_class_precision[0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.per_class_recall[1] - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(metrics.per_class_recall[0], 1.0);
    }

    #[test]
    fn test_out_of_range_predictions_ignored() {
        let mut metrics = EvaluationMetrics::new(2);
        metrics.update_confusion_matrix(0, 5);
        metrics.compute_from_confusion_matrix();
        assert_eq!(metrics.num_samples, 0);
    }

    #[test]
    fn test_scalars_include_loss() {
        let metrics = EvaluationMetrics::from_predictions(2, &[0, 1], &[0, 1]).with_loss(0.25);
        let scalars = metrics.scalars("test");
        assert!(scalars.contains(&("test_accuracy".to_string(), 1.0)));
        assert!(scalars.contains(&("test_loss".to_string(), 0.25)));
    }

    #[test]
    fn test_training_history_best() {
        let mut history = TrainingHistory::default();
        for (epoch, acc) in [0.5, 0.8, 0.7].into_iter().enumerate() {
            history.push(EpochMetrics {
                epoch,
                train_loss: 1.0,
                train_accuracy: acc,
                val_loss: 1.0,
                val_accuracy: acc,
            });
        }
        assert_eq!(history.best_val_accuracy(), Some(0.8));
        assert_eq!(history.best_epoch(), Some(1));
    }
}
