//! Cross-validation experiment drivers.
//!
//! Each driver walks every fold of a [`emg_dataset::DataModule`] in cursor
//! order, builds a fresh classifier per fold, trains and tests it, and
//! writes exactly one model artifact per fold plus a run summary:
//! - [`run_cross_validation`]: one model per fold
//! - [`run_two_stage_cross_validation`]: CNN, then an LSTM on its features
//! - [`run_tree_ensemble_cross_validation`]: boosted stumps on stored CNNs

pub mod cross_val;
pub mod report;
pub mod settings;
pub mod tree_ensemble;
pub mod two_stage;

pub use cross_val::{run_cross_validation, run_cross_validation_fold};
pub use report::{CrossValidationReport, FoldReport};
pub use settings::ExperimentSettings;
pub use tree_ensemble::{run_tree_ensemble_cross_validation, run_tree_ensemble_fold};
pub use two_stage::{run_two_stage_cross_validation, run_two_stage_fold};
