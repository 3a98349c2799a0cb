//! Burn batcher for EMG items.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::dataset::EmgItem;

/// A batch of records with shape `[batch, rows, cols]`
#[derive(Clone, Debug)]
pub struct EmgBatch<B: Backend> {
    pub inputs: Tensor<B, 3>,
    pub targets: Tensor<B, 1, Int>,
}

/// Stacks items into tensors.
///
/// Items of different shapes are zero-padded to the largest one: rows are
/// padded at the front so the last row of a sequence stays the last
/// timestep, columns are padded at the end.
#[derive(Clone, Debug)]
pub struct EmgBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> EmgBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<EmgItem, EmgBatch<B>> for EmgBatcher<B> {
    fn batch(&self, items: Vec<EmgItem>) -> EmgBatch<B> {
        let batch_size = items.len();
        let rows = items.iter().map(|i| i.record.rows).max().unwrap_or(0);
        let cols = items.iter().map(|i| i.record.cols).max().unwrap_or(0);

        let mut data = vec![0.0f32; batch_size * rows * cols];
        for (b, item) in items.iter().enumerate() {
            let row_offset = rows - item.record.rows;
            for r in 0..item.record.rows {
                let start = b * rows * cols + (row_offset + r) * cols;
                data[start..start + item.record.cols].copy_from_slice(item.record.row(r));
            }
        }

        let inputs = Tensor::<B, 3>::from_floats(
            TensorData::new(data, [batch_size, rows, cols]),
            &self.device,
        );

        let targets: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets, [batch_size]),
            &self.device,
        );

        EmgBatch { inputs, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use emg_core::Record;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_shapes_and_padding() {
        let batcher = EmgBatcher::<TestBackend>::new(Default::default());
        let items = vec![
            EmgItem {
                record: Record::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
                label: 1,
            },
            EmgItem {
                record: Record::new(1, 1, vec![9.0]).unwrap(),
                label: 0,
            },
        ];

        let batch = batcher.batch(items);
        assert_eq!(batch.inputs.dims(), [2, 2, 2]);
        assert_eq!(batch.targets.dims(), [2]);

        let values: Vec<f32> = batch.inputs.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 9.0, 0.0]);
    }
}
