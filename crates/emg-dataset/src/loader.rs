//! Resolving sample locators into records.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use emg_core::{Record, Result, Sample, SourceRef, TransformChain};

/// Turns a sample's `source_ref` into a record.
///
/// Implementations are shared by data-loading workers, hence `Send + Sync`.
pub trait SampleLoader: Send + Sync {
    fn load(&self, sample: &Sample) -> Result<Record>;
}

/// Loads inline records as-is and record files relative to a base directory
#[derive(Debug, Clone)]
pub struct RecordLoader {
    base_dir: PathBuf,
}

impl RecordLoader {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

impl SampleLoader for RecordLoader {
    fn load(&self, sample: &Sample) -> Result<Record> {
        match &sample.source_ref {
            SourceRef::Inline(record) => Ok(record.clone()),
            SourceRef::Path(path) => Record::load(&self.resolve(path)),
        }
    }
}

/// Applies a transform chain on top of another loader
pub struct TransformedLoader {
    inner: Arc<dyn SampleLoader>,
    transforms: TransformChain,
}

impl TransformedLoader {
    pub fn new(inner: Arc<dyn SampleLoader>, transforms: TransformChain) -> Self {
        Self { inner, transforms }
    }
}

impl SampleLoader for TransformedLoader {
    fn load(&self, sample: &Sample) -> Result<Record> {
        Ok(self.transforms.apply(self.inner.load(sample)?))
    }
}
