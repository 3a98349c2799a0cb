//! Per-fold checkpoint artifacts.
//!
//! Every fold writes exactly one artifact to
//! `{models_dir}/{sanitized_name}_{fold}_fold.{ext}`. The extension and the
//! serializer are picked by [`CheckpointFormat`]:
//! - `mpk`: burn parameter records written with `CompactRecorder`
//! - `json`: tree ensembles

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::backend::Backend,
};
use emg_core::{Error, FoldIndex, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{EmgConvNet, UniLstm};

/// On-disk representation of a trained model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    BurnRecord,
    TreeJson,
}

impl CheckpointFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CheckpointFormat::BurnRecord => "mpk",
            CheckpointFormat::TreeJson => "json",
        }
    }
}

/// Lower-cases `name` and replaces spaces and path separators with underscores
pub fn sanitize_name(name: &str) -> String {
    file_component(name).replace(' ', "_").to_lowercase()
}

/// `name` as a single path component: separators become `_`, and names that
/// would point at the current or parent directory are replaced
pub fn file_component(name: &str) -> String {
    let cleaned = name.replace(['/', '\\'], "_");
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// `{models_dir}/{sanitized}_{fold}_fold.{ext}`
pub fn artifact_path(
    models_dir: &Path,
    name: &str,
    fold: FoldIndex,
    format: CheckpointFormat,
) -> PathBuf {
    models_dir.join(format!(
        "{}_{}_fold.{}",
        sanitize_name(name),
        fold,
        format.extension()
    ))
}

/// A model that can be written to and restored from a checkpoint file
pub trait Persist: Sized {
    const FORMAT: CheckpointFormat;

    /// Writes the model to `path`, which already carries the extension
    fn save_artifact(&self, path: &Path) -> Result<()>;

    /// Replaces the model's parameters with those stored at `path`
    fn load_artifact(self, path: &Path) -> Result<Self>;
}

/// Saves the fold's artifact and returns where it went
pub fn persist_fold<M: Persist>(
    model: &M,
    models_dir: &Path,
    name: &str,
    fold: FoldIndex,
) -> Result<PathBuf> {
    fs::create_dir_all(models_dir).map_err(|e| Error::checkpoint_io(models_dir, e))?;
    let path = artifact_path(models_dir, name, fold, M::FORMAT);
    model.save_artifact(&path)?;
    info!("Fold {} model saved to {:?}", fold, path);
    Ok(path)
}

/// Saves a burn module with `CompactRecorder`
pub fn save_module<B: Backend, M: Module<B>>(module: &M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::checkpoint_io(parent, e))?;
    }
    module
        .clone()
        .save_file(path.to_path_buf(), &CompactRecorder::new())
        .map_err(|e| Error::checkpoint_io(path, format!("{e:?}")))
}

/// Loads a `CompactRecorder` record into `module` on the module's device
pub fn load_module<B: Backend, M: Module<B>>(module: M, path: &Path) -> Result<M> {
    if !path.exists() {
        return Err(Error::checkpoint_io(path, "file not found"));
    }
    let device = module.devices().into_iter().next().unwrap_or_default();
    module
        .load_file(path.to_path_buf(), &CompactRecorder::new(), &device)
        .map_err(|e| Error::checkpoint_io(path, format!("{e:?}")))
}

impl<B: Backend> Persist for EmgConvNet<B> {
    const FORMAT: CheckpointFormat = CheckpointFormat::BurnRecord;

    fn save_artifact(&self, path: &Path) -> Result<()> {
        save_module(self, path)
    }

    fn load_artifact(self, path: &Path) -> Result<Self> {
        load_module(self, path)
    }
}

impl<B: Backend> Persist for UniLstm<B> {
    const FORMAT: CheckpointFormat = CheckpointFormat::BurnRecord;

    fn save_artifact(&self, path: &Path) -> Result<()> {
        save_module(self, path)
    }

    fn load_artifact(self, path: &Path) -> Result<Self> {
        load_module(self, path)
    }
}
