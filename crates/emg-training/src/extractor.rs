//! Frozen convolutional feature extractor.
//!
//! After the first stage a trained [`EmgConvNet`] is cut before its
//! classification layer and run in inference mode over record windows.
//! Its outputs become the timesteps of the second-stage input.

use std::path::Path;
use std::sync::Mutex;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    tensor::backend::{AutodiffBackend, Backend},
};
use emg_core::{Error, Record, Result};
use emg_dataset::{EmgBatcher, EmgItem, FeatureExtractor};

use crate::checkpoint::Persist;
use crate::model::{EmgConvNet, EmgConvNetConfig};

/// Windows pushed through the network at once
const EXTRACT_BATCH: usize = 64;

/// Feature prefix of a trained CNN, shareable across loader threads
pub struct FrozenConvExtractor<B: Backend> {
    model: Mutex<EmgConvNet<B>>,
    batcher: EmgBatcher<B>,
    width: usize,
}

impl<B: Backend> FrozenConvExtractor<B> {
    pub fn new(model: EmgConvNet<B>, device: B::Device) -> Self {
        let width = model.feature_width();
        Self {
            model: Mutex::new(model),
            batcher: EmgBatcher::new(device),
            width,
        }
    }

    /// Loads a stored CNN and freezes it
    pub fn from_checkpoint(
        config: &EmgConvNetConfig,
        path: &Path,
        device: B::Device,
    ) -> Result<Self> {
        let model = config.init::<B>(&device).load_artifact(path)?;
        Ok(Self::new(model, device))
    }

    /// Freezes a model fresh out of training
    pub fn from_trained<AB>(model: &EmgConvNet<AB>, device: B::Device) -> Self
    where
        AB: AutodiffBackend<InnerBackend = B>,
    {
        Self::new(model.valid(), device)
    }
}

impl<B: Backend> FeatureExtractor for FrozenConvExtractor<B> {
    fn output_width(&self) -> usize {
        self.width
    }

    fn extract(&self, windows: &[Record]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .model
            .lock()
            .map_err(|_| Error::Model("feature extractor lock poisoned".into()))?;

        let mut features = Vec::with_capacity(windows.len());
        for chunk in windows.chunks(EXTRACT_BATCH) {
            let items = chunk
                .iter()
                .map(|record| EmgItem {
                    record: record.clone(),
                    label: 0,
                })
                .collect();
            let batch = self.batcher.batch(items);
            let values = model
                .forward_features(batch.inputs)
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| Error::Model(format!("failed to read features: {e:?}")))?;
            features.extend(values.chunks(self.width).map(<[f32]>::to_vec));
        }
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use emg_core::{Sample, WindowConfig};
    use emg_dataset::{RecordLoader, SampleLoader, WindowedFeatureLoader};
    use std::sync::Arc;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_extract_shapes() {
        let device = Default::default();
        let model = EmgConvNetConfig::new(3)
            .with_base_filters(2)
            .with_hidden_size(5)
            .init::<TestBackend>(&device);
        let extractor = FrozenConvExtractor::new(model, device);

        let windows = vec![Record::zeros(4, 10); 3];
        let features = extractor.extract(&windows).unwrap();
        assert_eq!(features.len(), 3);
        assert!(features.iter().all(|f| f.len() == 5));
    }

    #[test]
    fn test_windowed_loader_with_trained_model() {
        let device = Default::default();
        let model = EmgConvNetConfig::new(2)
            .with_base_filters(2)
            .with_hidden_size(6)
            .init::<Autodiff<TestBackend>>(&device);
        let extractor = FrozenConvExtractor::<TestBackend>::from_trained(&model, device);

        let loader = WindowedFeatureLoader::new(
            Arc::new(RecordLoader::new(".")),
            Arc::new(extractor),
            WindowConfig::new(20, 10).unwrap(),
        )
        .unwrap();
        let sample = Sample::inline(Record::zeros(3, 50), 1, "g");
        let sequence = loader.load(&sample).unwrap();
        assert_eq!(sequence.rows, 4);
        assert_eq!(sequence.cols, 6);
    }
}
