//! Windowed aggregation: slicing a record along time and turning each window
//! into a feature vector with a frozen extractor.

use std::sync::Arc;

use emg_core::{Error, Record, Result, Sample, WindowConfig};

use crate::loader::SampleLoader;

/// Cuts `record` into column windows of `time_window` columns every
/// `time_step` columns. Records no wider than one window yield a single
/// window covering the whole record.
pub fn sliding_windows(record: &Record, window: WindowConfig) -> Result<Vec<Record>> {
    window.validate()?;
    if record.cols <= window.time_window {
        return Ok(vec![record.clone()]);
    }
    (0..window.num_windows(record.cols))
        .map(|w| record.column_window(w * window.time_step, window.time_window))
        .collect()
}

/// Maps a batch of windows to one feature vector each
pub trait FeatureExtractor: Send + Sync {
    /// Width of every returned feature vector
    fn output_width(&self) -> usize;

    fn extract(&self, windows: &[Record]) -> Result<Vec<Vec<f32>>>;
}

/// Replaces raw-record loading with "window the record, run the extractor
/// on every window, stack the outputs" so each sample becomes a
/// `[num_windows, output_width]` feature sequence.
pub struct WindowedFeatureLoader {
    inner: Arc<dyn SampleLoader>,
    extractor: Arc<dyn FeatureExtractor>,
    window: WindowConfig,
}

impl WindowedFeatureLoader {
    pub fn new(
        inner: Arc<dyn SampleLoader>,
        extractor: Arc<dyn FeatureExtractor>,
        window: WindowConfig,
    ) -> Result<Self> {
        window.validate()?;
        Ok(Self {
            inner,
            extractor,
            window,
        })
    }

    pub fn output_width(&self) -> usize {
        self.extractor.output_width()
    }
}

impl SampleLoader for WindowedFeatureLoader {
    fn load(&self, sample: &Sample) -> Result<Record> {
        let record = self.inner.load(sample)?;
        let windows = sliding_windows(&record, self.window)?;
        let features = self.extractor.extract(&windows)?;

        let width = self.extractor.output_width();
        if features.len() != windows.len() || features.iter().any(|f| f.len() != width) {
            return Err(Error::Model(format!(
                "extractor returned {} vectors for {} windows (expected width {width})",
                features.len(),
                windows.len()
            )));
        }
        Record::new(windows.len(), width, features.concat())
    }
}
