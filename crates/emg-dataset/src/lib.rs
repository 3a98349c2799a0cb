//! EMG dataset handling.
//!
//! This crate provides:
//! - Sample indices read from the JSON artifact a dataset preparer writes
//! - Grouped k-fold partitioning that never splits a subject/session
//! - Fold-aware data modules yielding train/val/test datasets
//! - Windowed feature aggregation for second-stage models

pub mod batcher;
pub mod data_module;
pub mod dataset;
pub mod folds;
pub mod index;
pub mod loader;
pub mod prepare;
pub mod window;

pub use batcher::{EmgBatch, EmgBatcher};
pub use data_module::{DataModule, FoldData};
pub use dataset::{EmgItem, FoldDataset};
pub use folds::FoldAssignment;
pub use index::SampleIndex;
pub use loader::{RecordLoader, SampleLoader, TransformedLoader};
pub use prepare::{ensure_index, DatasetPreparer, DirectoryPreparer};
pub use emg_core::{Transform, TransformChain};
pub use window::{sliding_windows, FeatureExtractor, WindowedFeatureLoader};
