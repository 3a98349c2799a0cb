//! Dataset preparation: producing the sample index on first use.

use std::path::{Path, PathBuf};

use emg_core::{ColumnNames, DatasetKind, Error, Record, Result, Sample, SourceRef};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::index::SampleIndex;

/// Produces the sample index of a dataset from its raw recordings
pub trait DatasetPreparer {
    fn prepare(&self, kind: DatasetKind, index_path: &Path, columns: &ColumnNames) -> Result<()>;
}

/// Builds an index from a `{raw_dir}/{label}/{group}/*.json` tree of records.
///
/// Frame datasets reference the record files by path; the others embed the
/// records in the index.
#[derive(Debug, Clone)]
pub struct DirectoryPreparer {
    raw_dir: PathBuf,
}

impl DirectoryPreparer {
    pub fn new(raw_dir: impl Into<PathBuf>) -> Self {
        Self {
            raw_dir: raw_dir.into(),
        }
    }

    fn collect(&self, inline: bool) -> Result<Vec<Sample>> {
        let mut samples = Vec::new();

        for entry in WalkDir::new(&self.raw_dir)
            .min_depth(3)
            .max_depth(3)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                Error::DataUnavailable(format!("cannot scan {}: {e}", self.raw_dir.display()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }

            let relative = path.strip_prefix(&self.raw_dir).unwrap_or(path);
            let mut parts = relative.iter().map(|p| p.to_string_lossy());
            let (Some(label), Some(group)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(label) = label.parse::<usize>() else {
                warn!("Skipping {}: '{}' is not a class index", path.display(), label);
                continue;
            };

            let source_ref = if inline {
                SourceRef::Inline(Record::load(path)?)
            } else {
                SourceRef::Path(path.to_path_buf())
            };
            samples.push(Sample::new(source_ref, label, group.into_owned()));
        }

        Ok(samples)
    }
}

impl DatasetPreparer for DirectoryPreparer {
    fn prepare(&self, kind: DatasetKind, index_path: &Path, columns: &ColumnNames) -> Result<()> {
        info!(
            "Preparing {} index from {}",
            kind,
            self.raw_dir.display()
        );
        let samples = self.collect(!kind.stores_frames())?;
        if samples.is_empty() {
            return Err(Error::DataUnavailable(format!(
                "no records found under {}",
                self.raw_dir.display()
            )));
        }

        let base_dir = index_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let count = samples.len();
        SampleIndex::new(samples, base_dir).save(index_path, columns)?;
        info!("Wrote {} samples to {}", count, index_path.display());
        Ok(())
    }
}

/// Returns the index path of `kind` under `root`, running `preparer` once
/// when the index does not exist yet.
pub fn ensure_index(
    kind: DatasetKind,
    root: &Path,
    columns: &ColumnNames,
    preparer: Option<&dyn DatasetPreparer>,
) -> Result<PathBuf> {
    let index_path = kind.index_path(root);
    if index_path.is_file() {
        return Ok(index_path);
    }

    let preparer = preparer.ok_or_else(|| {
        Error::DataUnavailable(format!(
            "{} is missing and no preparer is available",
            index_path.display()
        ))
    })?;
    preparer.prepare(kind, &index_path, columns)?;

    if !index_path.is_file() {
        return Err(Error::DataUnavailable(format!(
            "preparer did not produce {}",
            index_path.display()
        )));
    }
    Ok(index_path)
}
