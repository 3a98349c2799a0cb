//! Core types and utilities for EMG gesture-classification experiments.
//!
//! This crate holds what every other crate in the workspace agrees on:
//! the error taxonomy, the sample/record types, per-sample transforms,
//! configuration structures and evaluation metrics.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod transform;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use metrics::*;
pub use transform::{Transform, TransformChain};
pub use types::*;

/// Re-export commonly used items
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
