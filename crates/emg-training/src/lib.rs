//! Training infrastructure for EMG gesture classification.
//!
//! This crate provides:
//! - Model architectures (convolutional classifier, LSTM sequence model)
//! - A gradient-boosted stump ensemble over windowed features
//! - Training drivers with lifecycle callbacks
//! - Per-fold checkpoint artifacts and run logging

pub mod callbacks;
pub mod checkpoint;
pub mod driver;
pub mod extractor;
pub mod gbdt;
pub mod logger;
pub mod model;

pub use callbacks::{
    Callback, CallbackAction, CallbackContext, CallbackFactories, CallbackRole, CallbackSet,
    EarlyStopping, ModelCheckpoint,
};
pub use checkpoint::{
    artifact_path, file_component, persist_fold, sanitize_name, CheckpointFormat, Persist,
};
pub use driver::{evaluate, BurnTrainer, TrainingDriver};
pub use extractor::FrozenConvExtractor;
pub use gbdt::{BoostingTrainer, GradientBoostedStumps, Stump, TrainOptions};
pub use logger::{JsonlRunLogger, JsonlTracker, NullTracker, RunLogger, RunSession, Tracker};
pub use model::{EmgConvNet, EmgConvNetConfig, EmgModel, UniLstm, UniLstmConfig};

/// Re-export commonly used types
pub mod prelude {
    pub use super::callbacks::{CallbackFactories, CallbackRole};
    pub use super::checkpoint::{CheckpointFormat, Persist};
    pub use super::driver::{BurnTrainer, TrainingDriver};
    pub use super::gbdt::{BoostingTrainer, GradientBoostedStumps};
    pub use super::logger::{RunSession, Tracker};
    pub use super::model::{EmgConvNet, EmgModel, UniLstm};
}
