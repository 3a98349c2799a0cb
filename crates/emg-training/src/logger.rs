//! Experiment tracking.
//!
//! A [`Tracker`] opens one [`RunLogger`] per `(project, run name, save
//! directory)`. The experiment driver talks to it through a [`RunSession`],
//! which turns every logging failure into a warning: losing a metric line
//! never aborts a fold.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use emg_core::{EpochMetrics, EvaluationMetrics, FoldIndex, Result, TrackerConfig};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::checkpoint::file_component;

/// Sink for one tracked run
pub trait RunLogger {
    fn log_metrics(&mut self, step: usize, metrics: &[(String, f64)]) -> Result<()>;

    fn log_params(&mut self, params: &Value) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

/// Opens run loggers
pub trait Tracker {
    fn open(&self, project: &str, run_name: &str, save_dir: &Path) -> Result<Box<dyn RunLogger>>;
}

/// Appends JSON lines to `{save_dir}/{project}/{run_name}.jsonl`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlTracker;

impl Tracker for JsonlTracker {
    fn open(&self, project: &str, run_name: &str, save_dir: &Path) -> Result<Box<dyn RunLogger>> {
        Ok(Box::new(JsonlRunLogger::create(project, run_name, save_dir)?))
    }
}

/// Discards everything, used for dry runs and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracker;

impl Tracker for NullTracker {
    fn open(&self, _project: &str, _run_name: &str, _save_dir: &Path) -> Result<Box<dyn RunLogger>> {
        Ok(Box::new(NullRunLogger))
    }
}

struct NullRunLogger;

impl RunLogger for NullRunLogger {
    fn log_metrics(&mut self, _step: usize, _metrics: &[(String, f64)]) -> Result<()> {
        Ok(())
    }

    fn log_params(&mut self, _params: &Value) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct JsonlRunLogger {
    path: PathBuf,
    run_name: String,
    writer: BufWriter<File>,
}

impl JsonlRunLogger {
    pub fn create(project: &str, run_name: &str, save_dir: &Path) -> Result<Self> {
        let dir = save_dir.join(file_component(project));
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.jsonl", file_component(run_name)));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut logger = Self {
            path,
            run_name: run_name.to_string(),
            writer: BufWriter::new(file),
        };
        logger.write(json!({ "event": "start" }))?;
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, mut record: Value) -> Result<()> {
        if let Value::Object(map) = &mut record {
            map.insert("run".into(), json!(self.run_name));
            map.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        }
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl RunLogger for JsonlRunLogger {
    fn log_metrics(&mut self, step: usize, metrics: &[(String, f64)]) -> Result<()> {
        let values: serde_json::Map<String, Value> = metrics
            .iter()
            .map(|(name, value)| (name.clone(), json!(value)))
            .collect();
        self.write(json!({ "event": "metrics", "step": step, "metrics": values }))
    }

    fn log_params(&mut self, params: &Value) -> Result<()> {
        self.write(json!({ "event": "params", "params": params }))
    }

    fn finish(&mut self) -> Result<()> {
        self.write(json!({ "event": "finish" }))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// A logger scoped to one run of one fold
pub struct RunSession {
    run_name: String,
    fold: FoldIndex,
    logger: Option<Box<dyn RunLogger>>,
}

impl RunSession {
    pub fn open(tracker: &dyn Tracker, config: &TrackerConfig, run_name: &str, fold: FoldIndex) -> Self {
        let logger = match tracker.open(&config.project, run_name, &config.save_dir) {
            Ok(logger) => Some(logger),
            Err(e) => {
                warn!("Could not open run log for '{}': {}", run_name, e);
                None
            }
        };
        let mut session = Self {
            run_name: run_name.to_string(),
            fold,
            logger,
        };
        session.log_params(&json!({ "fold": fold.get() }));
        session
    }

    /// Session that logs nothing
    pub fn detached(run_name: &str, fold: FoldIndex) -> Self {
        Self {
            run_name: run_name.to_string(),
            fold,
            logger: None,
        }
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn fold(&self) -> FoldIndex {
        self.fold
    }

    pub fn log_params(&mut self, params: &Value) {
        if let Some(logger) = self.logger.as_mut() {
            if let Err(e) = logger.log_params(params) {
                warn!("Dropping params for '{}': {}", self.run_name, e);
            }
        }
    }

    pub fn log_metrics(&mut self, step: usize, metrics: &[(String, f64)]) {
        if let Some(logger) = self.logger.as_mut() {
            if let Err(e) = logger.log_metrics(step, metrics) {
                warn!("Dropping metrics for '{}': {}", self.run_name, e);
            }
        }
    }

    pub fn log_epoch(&mut self, metrics: &EpochMetrics) {
        self.log_metrics(
            metrics.epoch,
            &[
                ("train_loss".to_string(), metrics.train_loss),
                ("train_accuracy".to_string(), metrics.train_accuracy),
                ("val_loss".to_string(), metrics.val_loss),
                ("val_accuracy".to_string(), metrics.val_accuracy),
            ],
        );
    }

    pub fn log_test(&mut self, metrics: &EvaluationMetrics) {
        self.log_metrics(0, &metrics.scalars("test"));
    }

    /// Closes the run
    pub fn finish(mut self) {
        if let Some(mut logger) = self.logger.take() {
            if let Err(e) = logger.finish() {
                warn!("Could not close run log for '{}': {}", self.run_name, e);
            } else {
                info!("Run '{}' fold {} closed", self.run_name, self.fold);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emg_core::Error;
    use tempfile::TempDir;

    struct FailingTracker;

    impl Tracker for FailingTracker {
        fn open(&self, _: &str, _: &str, _: &Path) -> Result<Box<dyn RunLogger>> {
            Err(Error::Configuration("tracker offline".into()))
        }
    }

    #[test]
    fn test_jsonl_session() {
        let dir = TempDir::new().unwrap();
        let config = TrackerConfig {
            project: "EMG Armband".into(),
            save_dir: dir.path().to_path_buf(),
        };
        let mut session = RunSession::open(&JsonlTracker, &config, "cnn", FoldIndex(1));
        session.log_epoch(&EpochMetrics {
            epoch: 0,
            train_loss: 1.0,
            train_accuracy: 0.5,
            val_loss: 1.2,
            val_accuracy: 0.4,
        });
        session.finish();

        let text = fs::read_to_string(dir.path().join("EMG Armband").join("cnn.jsonl")).unwrap();
        let events: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["start", "params", "metrics", "finish"]);
        assert_eq!(events[1]["params"]["fold"], 1);
        assert_eq!(events[2]["metrics"]["val_accuracy"], 0.4);
        assert!(events.iter().all(|e| e["run"] == "cnn"));
    }

    #[test]
    fn test_run_name_stays_inside_project_dir() {
        let dir = TempDir::new().unwrap();
        let save_dir = dir.path().join("logs");
        let logger = JsonlRunLogger::create("EMG/Armband", "../../escape", &save_dir).unwrap();

        assert_eq!(
            logger.path(),
            save_dir.join("EMG_Armband").join(".._.._escape.jsonl")
        );
        assert!(logger.path().starts_with(&save_dir));
    }

    #[test]
    fn test_failing_tracker_is_not_fatal() {
        let mut session = RunSession::open(
            &FailingTracker,
            &TrackerConfig::default(),
            "cnn",
            FoldIndex(0),
        );
        session.log_metrics(0, &[("x".into(), 1.0)]);
        assert_eq!(session.run_name(), "cnn");
        session.finish();
    }
}
