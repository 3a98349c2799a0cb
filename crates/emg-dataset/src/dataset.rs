//! Fold datasets: the lazy, restartable sample views a data module hands out.

use std::collections::BTreeSet;
use std::sync::Arc;

use emg_core::{Error, Record, Result, Sample, TransformChain};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::index::SampleIndex;
use crate::loader::SampleLoader;

/// A transformed sample ready for batching
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmgItem {
    pub record: Record,
    pub label: usize,
}

/// The samples of one split of one fold.
///
/// Holds indices into the shared sample index; records are loaded and
/// transformed only when requested, so iterating twice reloads from source.
#[derive(Clone)]
pub struct FoldDataset {
    index: Arc<SampleIndex>,
    rows: Vec<usize>,
    loader: Arc<dyn SampleLoader>,
    transforms: TransformChain,
    pool: Option<Arc<ThreadPool>>,
}

impl FoldDataset {
    pub fn new(
        index: Arc<SampleIndex>,
        rows: Vec<usize>,
        loader: Arc<dyn SampleLoader>,
        transforms: TransformChain,
        pool: Option<Arc<ThreadPool>>,
    ) -> Self {
        Self {
            index,
            rows,
            loader,
            transforms,
            pool,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sample metadata for position `i`
    pub fn sample(&self, i: usize) -> Option<&Sample> {
        self.rows.get(i).and_then(|&row| self.index.get(row))
    }

    /// Distinct groups present in this split
    pub fn groups(&self) -> BTreeSet<String> {
        self.rows
            .iter()
            .filter_map(|&row| self.index.get(row))
            .map(|s| s.group.clone())
            .collect()
    }

    pub fn labels(&self) -> Vec<usize> {
        self.rows
            .iter()
            .filter_map(|&row| self.index.get(row))
            .map(|s| s.label)
            .collect()
    }

    /// Loads and transforms the item at position `i`
    pub fn load(&self, i: usize) -> Result<EmgItem> {
        let sample = self.sample(i).ok_or_else(|| {
            Error::DataUnavailable(format!(
                "position {i} outside fold split of {} samples",
                self.len()
            ))
        })?;
        let record = self.transforms.apply(self.loader.load(sample)?);
        Ok(EmgItem {
            record,
            label: sample.label,
        })
    }

    /// Loads several items, on the worker pool when one is configured
    pub fn load_many(&self, positions: &[usize]) -> Result<Vec<EmgItem>> {
        match &self.pool {
            Some(pool) => pool.install(|| positions.par_iter().map(|&i| self.load(i)).collect()),
            None => positions.iter().map(|&i| self.load(i)).collect(),
        }
    }

    /// The items at `positions`, sharing loader and transforms
    pub fn subset(&self, positions: &[usize]) -> Self {
        Self {
            rows: positions
                .iter()
                .filter_map(|&i| self.rows.get(i).copied())
                .collect(),
            ..self.clone()
        }
    }

    /// Restartable iterator over the split; load failures come out as `Err`
    pub fn items(&self) -> impl Iterator<Item = Result<EmgItem>> + '_ {
        (0..self.len()).map(move |i| self.load(i))
    }
}

impl std::fmt::Debug for FoldDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FoldDataset")
            .field("len", &self.rows.len())
            .field("transforms", &self.transforms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::RecordLoader;
    use emg_core::Transform;

    fn dataset(pool: Option<Arc<ThreadPool>>) -> FoldDataset {
        let samples = (0..4)
            .map(|i| {
                let record = Record::new(1, 1, vec![i as f32]).unwrap();
                Sample::inline(record, i % 2, format!("g{i}"))
            })
            .collect();
        let index = Arc::new(SampleIndex::new(samples, "."));
        FoldDataset::new(
            index,
            vec![3, 1],
            Arc::new(RecordLoader::new(".")),
            TransformChain::identity().then(Transform::Scale { factor: 10.0 }),
            pool,
        )
    }

    #[test]
    fn test_load_applies_transforms() {
        let ds = dataset(None);
        let item = ds.load(0).unwrap();
        assert_eq!(item.record.data, vec![30.0]);
        assert_eq!(item.label, 1);
        assert!(ds.load(2).is_err());
    }

    #[test]
    fn test_items_restartable() {
        let ds = dataset(None);
        let first: Vec<_> = ds.items().map(|r| r.unwrap().record.data[0]).collect();
        let second: Vec<_> = ds.items().map(|r| r.unwrap().record.data[0]).collect();
        assert_eq!(first, vec![30.0, 10.0]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_parallel_load_preserves_order() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let ds = dataset(Some(Arc::new(pool)));
        let items = ds.load_many(&[1, 0]).unwrap();
        assert_eq!(items[0].record.data, vec![10.0]);
        assert_eq!(items[1].record.data, vec![30.0]);
    }

    #[test]
    fn test_out_of_range_load_is_an_error() {
        let ds = dataset(None);
        assert_eq!(ds.len(), 2);
        assert!(matches!(ds.load(5), Err(Error::DataUnavailable(_))));
        assert_eq!(ds.groups().len(), 2);
    }
}
