//! Training lifecycle callbacks.
//!
//! Callbacks run after every validation pass. They are rebuilt for each
//! fold from named factories and looked up by [`CallbackRole`], so the
//! experiment driver can ask for "the best checkpoint" without knowing
//! where in the list it was registered.

use std::path::{Path, PathBuf};

use emg_core::{EpochMetrics, FoldIndex, MonitorMetric, Result, TrainingParams};
use tracing::{debug, info};

use crate::checkpoint::{sanitize_name, Persist};

/// Name under which a callback is registered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallbackRole {
    BestCheckpoint,
    EarlyStopping,
    Custom(String),
}

impl CallbackRole {
    pub fn name(&self) -> &str {
        match self {
            CallbackRole::BestCheckpoint => "best_checkpoint",
            CallbackRole::EarlyStopping => "early_stopping",
            CallbackRole::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for CallbackRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What the training loop should do after a callback ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hook invoked with each epoch's metrics and the current model
pub trait Callback<M> {
    fn on_epoch_end(&mut self, metrics: &EpochMetrics, model: &M) -> Result<CallbackAction>;

    /// Where the best weights were written, for checkpointing callbacks
    fn best_model_path(&self) -> Option<&Path> {
        None
    }
}

fn monitored_value(metrics: &EpochMetrics, monitor: MonitorMetric) -> f64 {
    match monitor {
        MonitorMetric::ValLoss => metrics.val_loss,
        MonitorMetric::ValAccuracy => metrics.val_accuracy,
    }
}

fn improves(value: f64, best: Option<f64>, monitor: MonitorMetric) -> bool {
    match best {
        None => value.is_finite(),
        Some(best) if monitor.maximize() => value > best,
        Some(best) => value < best,
    }
}

/// Stops training when the monitored metric has not improved for
/// `patience` epochs
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: MonitorMetric,
    patience: usize,
    best: Option<f64>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(monitor: MonitorMetric, patience: usize) -> Self {
        Self {
            monitor,
            patience,
            best: None,
            wait: 0,
        }
    }
}

impl<M> Callback<M> for EarlyStopping {
    fn on_epoch_end(&mut self, metrics: &EpochMetrics, _model: &M) -> Result<CallbackAction> {
        let value = monitored_value(metrics, self.monitor);
        if improves(value, self.best, self.monitor) {
            self.best = Some(value);
            self.wait = 0;
            return Ok(CallbackAction::Continue);
        }

        self.wait += 1;
        if self.wait >= self.patience {
            info!(
                "Early stopping at epoch {}: {} did not improve for {} epochs",
                metrics.epoch, self.monitor, self.patience
            );
            return Ok(CallbackAction::Stop);
        }
        Ok(CallbackAction::Continue)
    }
}

/// Writes the model whenever the monitored metric improves
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    path: PathBuf,
    monitor: MonitorMetric,
    best: Option<f64>,
    saved: bool,
}

impl ModelCheckpoint {
    /// Saves to `{dir}/{file_stem}_best.{ext}`
    pub fn new<M: Persist>(dir: &Path, file_stem: &str, monitor: MonitorMetric) -> Self {
        let path = dir.join(format!("{file_stem}_best.{}", M::FORMAT.extension()));
        Self {
            path,
            monitor,
            best: None,
            saved: false,
        }
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best
    }
}

impl<M: Persist> Callback<M> for ModelCheckpoint {
    fn on_epoch_end(&mut self, metrics: &EpochMetrics, model: &M) -> Result<CallbackAction> {
        let value = monitored_value(metrics, self.monitor);
        if improves(value, self.best, self.monitor) {
            model.save_artifact(&self.path)?;
            debug!(
                "Epoch {}: {} improved to {:.4}, saved {:?}",
                metrics.epoch, self.monitor, value, self.path
            );
            self.best = Some(value);
            self.saved = true;
        }
        Ok(CallbackAction::Continue)
    }

    fn best_model_path(&self) -> Option<&Path> {
        self.saved.then_some(self.path.as_path())
    }
}

/// Callbacks built for one fit, in registration order
pub struct CallbackSet<M> {
    entries: Vec<(CallbackRole, Box<dyn Callback<M>>)>,
}

impl<M> Default for CallbackSet<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<M> CallbackSet<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: CallbackRole, callback: Box<dyn Callback<M>>) {
        self.entries.push((role, callback));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, role: &CallbackRole) -> Option<&dyn Callback<M>> {
        self.entries
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, callback)| callback.as_ref())
    }

    /// Best weights recorded by the [`CallbackRole::BestCheckpoint`] callback
    pub fn best_model_path(&self) -> Option<PathBuf> {
        self.get(&CallbackRole::BestCheckpoint)
            .and_then(|callback| callback.best_model_path())
            .map(Path::to_path_buf)
    }

    /// Runs every callback; any `Stop` stops training, but all callbacks
    /// still see the epoch
    pub fn on_epoch_end(&mut self, metrics: &EpochMetrics, model: &M) -> Result<CallbackAction> {
        let mut action = CallbackAction::Continue;
        for (_, callback) in &mut self.entries {
            if callback.on_epoch_end(metrics, model)? == CallbackAction::Stop {
                action = CallbackAction::Stop;
            }
        }
        Ok(action)
    }
}

/// Identifies the fit a callback set is built for
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub run_name: String,
    pub fold: FoldIndex,
    pub checkpoint_dir: PathBuf,
}

impl CallbackContext {
    pub fn file_stem(&self) -> String {
        format!("{}_{}_fold", sanitize_name(&self.run_name), self.fold)
    }
}

pub type CallbackFactory<M> = Box<dyn Fn(&CallbackContext) -> Box<dyn Callback<M>>>;

/// Named callback constructors, invoked once per fold
pub struct CallbackFactories<M> {
    entries: Vec<(CallbackRole, CallbackFactory<M>)>,
}

impl<M> Default for CallbackFactories<M> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<M: Persist + 'static> CallbackFactories<M> {
    /// Early stopping and best-checkpoint factories as configured in `params`
    pub fn from_params(params: &TrainingParams) -> Self {
        let mut factories = Self::default();
        let monitor = params.monitor;

        if params.checkpoint_best {
            factories = factories.with(CallbackRole::BestCheckpoint, move |ctx| {
                Box::new(ModelCheckpoint::new::<M>(
                    &ctx.checkpoint_dir,
                    &ctx.file_stem(),
                    monitor,
                ))
            });
        }
        if let Some(patience) = params.early_stopping_patience {
            factories = factories.with(CallbackRole::EarlyStopping, move |_| {
                Box::new(EarlyStopping::new(monitor, patience))
            });
        }
        factories
    }
}

impl<M> CallbackFactories<M> {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, role: CallbackRole, factory: F) -> Self
    where
        F: Fn(&CallbackContext) -> Box<dyn Callback<M>> + 'static,
    {
        self.entries.push((role, Box::new(factory)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn roles(&self) -> impl Iterator<Item = &CallbackRole> {
        self.entries.iter().map(|(role, _)| role)
    }

    /// Fresh callbacks for one fit
    pub fn build(&self, ctx: &CallbackContext) -> CallbackSet<M> {
        let mut set = CallbackSet::new();
        for (role, factory) in &self.entries {
            set.push(role.clone(), factory(ctx));
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointFormat;
    use emg_core::Error;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Records how often it was saved
    struct Counter {
        saves: Cell<usize>,
    }

    impl Persist for Counter {
        const FORMAT: CheckpointFormat = CheckpointFormat::TreeJson;

        fn save_artifact(&self, path: &Path) -> Result<()> {
            self.saves.set(self.saves.get() + 1);
            std::fs::write(path, b"{}").map_err(Error::from)
        }

        fn load_artifact(self, _path: &Path) -> Result<Self> {
            Ok(self)
        }
    }

    fn epoch(epoch: usize, val_loss: f64, val_accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            train_loss: 0.0,
            train_accuracy: 0.0,
            val_loss,
            val_accuracy,
        }
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut stopper = EarlyStopping::new(MonitorMetric::ValLoss, 2);
        let model = ();
        let mut actions = Vec::new();
        for (i, loss) in [1.0, 0.8, 0.9, 0.85].iter().enumerate() {
            actions.push(
                Callback::<()>::on_epoch_end(&mut stopper, &epoch(i, *loss, 0.0), &model).unwrap(),
            );
        }
        assert_eq!(
            actions,
            vec![
                CallbackAction::Continue,
                CallbackAction::Continue,
                CallbackAction::Continue,
                CallbackAction::Stop
            ]
        );
    }

    #[test]
    fn test_model_checkpoint_saves_on_improvement() {
        let dir = TempDir::new().unwrap();
        let model = Counter { saves: Cell::new(0) };
        let mut checkpoint =
            ModelCheckpoint::new::<Counter>(dir.path(), "run", MonitorMetric::ValAccuracy);
        assert!(Callback::<Counter>::best_model_path(&checkpoint).is_none());

        for (i, acc) in [0.5, 0.7, 0.6, 0.8].iter().enumerate() {
            checkpoint.on_epoch_end(&epoch(i, 0.0, *acc), &model).unwrap();
        }
        assert_eq!(model.saves.get(), 3);
        assert_eq!(checkpoint.best_score(), Some(0.8));
        let path = Callback::<Counter>::best_model_path(&checkpoint).unwrap();
        assert_eq!(path, dir.path().join("run_best.json"));
        assert!(path.exists());
    }

    #[test]
    fn test_factories_build_fresh_sets() {
        let dir = TempDir::new().unwrap();
        let params = TrainingParams {
            early_stopping_patience: Some(1),
            checkpoint_best: true,
            ..Default::default()
        };
        let factories = CallbackFactories::<Counter>::from_params(&params);
        let roles: Vec<_> = factories.roles().map(|r| r.name().to_string()).collect();
        assert_eq!(roles, vec!["best_checkpoint", "early_stopping"]);

        let ctx = CallbackContext {
            run_name: "My Run".into(),
            fold: FoldIndex(3),
            checkpoint_dir: dir.path().to_path_buf(),
        };
        let model = Counter { saves: Cell::new(0) };
        let mut set = factories.build(&ctx);
        assert_eq!(set.len(), 2);
        assert!(set.best_model_path().is_none());

        set.on_epoch_end(&epoch(0, 1.0, 0.4), &model).unwrap();
        let action = set.on_epoch_end(&epoch(1, 1.0, 0.3), &model).unwrap();
        assert_eq!(action, CallbackAction::Stop);
        assert_eq!(
            set.best_model_path(),
            Some(dir.path().join("my_run_3_fold_best.json"))
        );

        let fresh = factories.build(&ctx);
        assert!(fresh.get(&CallbackRole::EarlyStopping).is_some());
    }

    #[test]
    fn test_no_factories() {
        let factories = CallbackFactories::<Counter>::none();
        assert!(factories.is_empty());
        let set = factories.build(&CallbackContext {
            run_name: "x".into(),
            fold: FoldIndex(0),
            checkpoint_dir: PathBuf::from("."),
        });
        assert!(set.is_empty());
        assert!(set.best_model_path().is_none());
    }
}
