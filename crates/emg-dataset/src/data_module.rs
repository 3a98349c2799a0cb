//! Fold-aware data module.
//!
//! A [`DataModule`] owns the sample index and its grouped fold assignment.
//! Datasets for a fold are requested with an explicit [`FoldIndex`]; the
//! module also keeps a cursor (`current_fold`) that experiment drivers
//! advance once per completed fold.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use emg_core::{
    DataModuleConfig, DataParameters, DataSplit, DatasetKind, Error, FoldIndex, Result,
    TransformChain,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::ThreadPool;
use tracing::{debug, info};

use crate::dataset::FoldDataset;
use crate::folds::FoldAssignment;
use crate::index::SampleIndex;
use crate::loader::{RecordLoader, SampleLoader, TransformedLoader};
use crate::prepare::{ensure_index, DatasetPreparer};

/// Train/validation/test datasets of one fold plus batching settings
#[derive(Debug, Clone)]
pub struct FoldData {
    pub fold: FoldIndex,
    pub train: FoldDataset,
    pub val: FoldDataset,
    pub test: FoldDataset,
    pub batch_size: usize,
    pub shuffle_train: bool,
    pub num_classes: usize,
}

impl FoldData {
    pub fn split(&self, split: DataSplit) -> &FoldDataset {
        match split {
            DataSplit::Train => &self.train,
            DataSplit::Validation => &self.val,
            DataSplit::Test => &self.test,
        }
    }
}

pub struct DataModule {
    index: Arc<SampleIndex>,
    assignment: FoldAssignment,
    config: DataModuleConfig,
    loader: Arc<dyn SampleLoader>,
    train_transforms: TransformChain,
    val_transforms: TransformChain,
    test_transforms: TransformChain,
    current_fold: FoldIndex,
    params: DataParameters,
    pool: Option<Arc<ThreadPool>>,
}

impl DataModule {
    /// Data module over `index` reading records with a [`RecordLoader`]
    pub fn new(index: SampleIndex, config: DataModuleConfig) -> Result<Self> {
        let loader = Arc::new(RecordLoader::new(index.base_dir()));
        Self::with_loader(Arc::new(index), loader, config)
    }

    /// Data module over `index` with a custom sample loader
    pub fn with_loader(
        index: Arc<SampleIndex>,
        loader: Arc<dyn SampleLoader>,
        config: DataModuleConfig,
    ) -> Result<Self> {
        config.validate()?;
        let assignment = FoldAssignment::build(&index, config.k_folds, config.seed)?;
        let pool = build_pool(config.num_workers)?;
        let params = derive_parameters(&index, loader.as_ref(), &TransformChain::identity())?;

        info!(
            "Data module ready: {} samples, {} groups, {} folds, {} classes",
            index.len(),
            index.groups().len(),
            config.k_folds,
            params.num_classes
        );

        Ok(Self {
            index,
            assignment,
            train_transforms: config.train_transforms.clone(),
            val_transforms: config.val_transforms.clone(),
            test_transforms: config.test_transforms.clone(),
            config,
            loader,
            current_fold: FoldIndex(0),
            params,
            pool,
        })
    }

    /// Opens the index of a known dataset, preparing it once when missing
    pub fn open(
        kind: DatasetKind,
        root: &Path,
        preparer: Option<&dyn DatasetPreparer>,
        config: DataModuleConfig,
    ) -> Result<Self> {
        let columns = config
            .columns
            .clone()
            .unwrap_or_else(|| kind.default_columns());
        let index_path = ensure_index(kind, root, &columns, preparer)?;
        let index = SampleIndex::load(&index_path, &columns)?;
        Self::new(index, config)
    }

    /// Replaces the per-split transform chains taken from the config
    pub fn with_transforms(
        mut self,
        train: TransformChain,
        val: TransformChain,
        test: TransformChain,
    ) -> Self {
        self.train_transforms = train;
        self.val_transforms = val;
        self.test_transforms = test;
        self
    }

    /// A module over the same index and fold assignment, positioned at the
    /// same fold, whose samples come from `loader` instead
    pub fn derive(&self, loader: Arc<dyn SampleLoader>) -> Result<Self> {
        let params = derive_parameters(&self.index, loader.as_ref(), &TransformChain::identity())?;
        Ok(Self {
            index: Arc::clone(&self.index),
            assignment: self.assignment.clone(),
            config: self.config.clone(),
            loader,
            train_transforms: TransformChain::identity(),
            val_transforms: TransformChain::identity(),
            test_transforms: TransformChain::identity(),
            current_fold: self.current_fold,
            params,
            pool: self.pool.clone(),
        })
    }

    /// Datasets of `fold`. Test holds the held-out bucket; train and
    /// validation come from the remaining groups.
    pub fn fold(&self, fold: FoldIndex) -> Result<FoldData> {
        let groups = self.assignment.split(fold, self.config.train_ratio)?;
        let test: HashSet<&str> = groups.test.iter().map(String::as_str).collect();
        let val: HashSet<&str> = groups.val.iter().map(String::as_str).collect();

        let mut train_rows = Vec::new();
        let mut val_rows = Vec::new();
        let mut test_rows = Vec::new();
        for (row, sample) in self.index.samples().iter().enumerate() {
            let group = sample.group.as_str();
            if test.contains(group) {
                test_rows.push(row);
            } else if val.contains(group) {
                val_rows.push(row);
            } else {
                train_rows.push(row);
            }
        }

        if val_rows.is_empty() {
            val_rows = self.carve_validation(fold, &mut train_rows);
        }

        debug!(
            "Fold {}: {} train / {} val / {} test samples",
            fold,
            train_rows.len(),
            val_rows.len(),
            test_rows.len()
        );

        Ok(FoldData {
            fold,
            train: self.dataset(train_rows, &self.train_transforms),
            val: self.dataset(val_rows, &self.val_transforms),
            test: self.dataset(test_rows, &self.test_transforms),
            batch_size: self.config.batch_size,
            shuffle_train: self.config.shuffle_train,
            num_classes: self.params.num_classes,
        })
    }

    /// Sample-level validation split for folds with a single training group
    fn carve_validation(&self, fold: FoldIndex, train_rows: &mut Vec<usize>) -> Vec<usize> {
        if train_rows.len() < 2 {
            return Vec::new();
        }
        let mut rng =
            ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(fold.get() as u64 + 1));
        train_rows.shuffle(&mut rng);
        let n_val = ((train_rows.len() as f64 * (1.0 - self.config.train_ratio)).round() as usize)
            .clamp(1, train_rows.len() - 1);
        let mut val = train_rows.split_off(train_rows.len() - n_val);
        train_rows.sort_unstable();
        val.sort_unstable();
        val
    }

    fn dataset(&self, rows: Vec<usize>, transforms: &TransformChain) -> FoldDataset {
        FoldDataset::new(
            Arc::clone(&self.index),
            rows,
            Arc::clone(&self.loader),
            transforms.clone(),
            self.pool.clone(),
        )
    }

    pub fn train_iterator(&self, fold: FoldIndex) -> Result<FoldDataset> {
        Ok(self.fold(fold)?.train)
    }

    pub fn val_iterator(&self, fold: FoldIndex) -> Result<FoldDataset> {
        Ok(self.fold(fold)?.val)
    }

    pub fn test_iterator(&self, fold: FoldIndex) -> Result<FoldDataset> {
        Ok(self.fold(fold)?.test)
    }

    /// The module's loader followed by its test transforms, the input a
    /// frozen feature extractor expects
    pub fn test_loader(&self) -> Arc<dyn SampleLoader> {
        Arc::new(TransformedLoader::new(
            Arc::clone(&self.loader),
            self.test_transforms.clone(),
        ))
    }

    /// Datasets of the fold under the cursor
    pub fn current(&self) -> Result<FoldData> {
        self.fold(self.current_fold)
    }

    /// Moves the cursor to the next fold, wrapping after the last one
    pub fn advance_fold(&mut self) {
        self.current_fold = FoldIndex((self.current_fold.get() + 1) % self.k_folds());
    }

    pub fn current_fold(&self) -> FoldIndex {
        self.current_fold
    }

    pub fn k_folds(&self) -> usize {
        self.assignment.k()
    }

    pub fn get_data_parameters(&self) -> DataParameters {
        self.params
    }

    pub fn num_classes(&self) -> usize {
        self.params.num_classes
    }

    pub fn config(&self) -> &DataModuleConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<SampleIndex> {
        &self.index
    }

    pub fn assignment(&self) -> &FoldAssignment {
        &self.assignment
    }
}

impl std::fmt::Debug for DataModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataModule")
            .field("samples", &self.index.len())
            .field("k_folds", &self.assignment.k())
            .field("current_fold", &self.current_fold)
            .field("params", &self.params)
            .finish()
    }
}

fn build_pool(num_workers: usize) -> Result<Option<Arc<ThreadPool>>> {
    if num_workers <= 1 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .thread_name(|i| format!("emg-loader-{i}"))
        .build()
        .map(|pool| Some(Arc::new(pool)))
        .map_err(|e| Error::Configuration(format!("failed to start loader pool: {e}")))
}

/// Shape of the first sample plus the class count of the whole index
fn derive_parameters(
    index: &SampleIndex,
    loader: &dyn SampleLoader,
    transforms: &TransformChain,
) -> Result<DataParameters> {
    let first = index
        .get(0)
        .ok_or_else(|| Error::DataUnavailable("sample index is empty".into()))?;
    let record = transforms.apply(loader.load(first)?);
    Ok(DataParameters {
        input_rows: record.rows,
        input_cols: record.cols,
        num_classes: index.num_classes(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use emg_core::{Record, Sample, Transform};

    fn index(groups: usize, per_group: usize) -> SampleIndex {
        let samples = (0..groups)
            .flat_map(|g| {
                (0..per_group).map(move |i| {
                    Sample::inline(
                        Record::new(2, 3, vec![(g + 1) as f32; 6]).unwrap(),
                        (g + i) % 3,
                        format!("subject{g}"),
                    )
                })
            })
            .collect();
        SampleIndex::new(samples, ".")
    }

    fn config(k: usize) -> DataModuleConfig {
        DataModuleConfig {
            k_folds: k,
            num_workers: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_data_parameters() {
        let module = DataModule::new(index(4, 3), config(2)).unwrap();
        let params = module.get_data_parameters();
        assert_eq!(params.input_rows, 2);
        assert_eq!(params.input_cols, 3);
        assert_eq!(params.num_classes, 3);
    }

    #[test]
    fn test_insufficient_groups() {
        let err = DataModule::new(index(2, 3), config(5)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_empty_index() {
        let err = DataModule::new(SampleIndex::new(Vec::new(), "."), config(2)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_) | Error::DataUnavailable(_)));
    }

    #[test]
    fn test_advance_fold_wraps() {
        let mut module = DataModule::new(index(6, 1), config(3)).unwrap();
        let start = module.current_fold();
        for _ in 0..3 {
            module.advance_fold();
        }
        assert_eq!(module.current_fold(), start);
        module.advance_fold();
        assert_eq!(module.current_fold(), FoldIndex(1));
        assert_eq!(module.current().unwrap().fold, FoldIndex(1));
    }

    #[test]
    fn test_every_sample_in_one_split() {
        let module = DataModule::new(index(7, 2), config(3)).unwrap();
        for fold in 0..3 {
            let data = module.fold(FoldIndex(fold)).unwrap();
            assert_eq!(data.train.len() + data.val.len() + data.test.len(), 14);
            assert!(!data.val.is_empty());
        }
    }

    #[test]
    fn test_single_training_group_uses_sample_split() {
        let module = DataModule::new(index(2, 5), config(2)).unwrap();
        let data = module.fold(FoldIndex(0)).unwrap();
        assert_eq!(data.test.len(), 5);
        assert_eq!(data.train.len(), 4);
        assert_eq!(data.val.len(), 1);
        assert!(data.test.groups().is_disjoint(&data.val.groups()));
    }

    #[test]
    fn test_each_split_gets_its_own_transforms() {
        let config = DataModuleConfig {
            train_transforms: TransformChain::identity().then(Transform::Scale { factor: 2.0 }),
            val_transforms: TransformChain::identity().then(Transform::Scale { factor: 3.0 }),
            test_transforms: TransformChain::identity().then(Transform::Scale { factor: -1.0 }),
            ..config(2)
        };
        let module = DataModule::new(index(4, 1), config).unwrap();
        let data = module.fold(FoldIndex(0)).unwrap();
        let loader = RecordLoader::new(".");

        for (dataset, factor) in [(&data.train, 2.0), (&data.val, 3.0), (&data.test, -1.0)] {
            let raw = loader.load(dataset.sample(0).unwrap()).unwrap();
            let item = dataset.load(0).unwrap();
            assert_eq!(item.record.data[0], factor * raw.data[0]);
        }
    }

    #[test]
    fn test_test_loader_applies_only_test_transforms() {
        let module = DataModule::new(index(4, 1), config(2))
            .unwrap()
            .with_transforms(
                TransformChain::identity().then(Transform::Scale { factor: 100.0 }),
                TransformChain::identity().then(Transform::Scale { factor: 100.0 }),
                TransformChain::identity().then(Transform::Scale { factor: 0.5 }),
            );
        let record = module.test_loader().load(&module.index().samples()[3]).unwrap();
        assert_eq!(record.data, vec![2.0; 6]);

        // derived modules read through the test chain and add nothing on top
        let derived = module.derive(module.test_loader()).unwrap();
        let train = derived.train_iterator(FoldIndex(0)).unwrap();
        let raw = RecordLoader::new(".").load(train.sample(0).unwrap()).unwrap();
        assert_eq!(train.load(0).unwrap().record.data[0], 0.5 * raw.data[0]);
    }

    #[test]
    fn test_derive_shares_assignment_and_cursor() {
        struct Doubling;
        impl SampleLoader for Doubling {
            fn load(&self, sample: &Sample) -> Result<Record> {
                let record = RecordLoader::new(".").load(sample)?;
                Record::new(record.rows * 2, record.cols, [record.data.clone(), record.data].concat())
            }
        }

        let mut module = DataModule::new(index(4, 2), config(2)).unwrap();
        module.advance_fold();
        let derived = module.derive(Arc::new(Doubling)).unwrap();

        assert_eq!(derived.current_fold(), FoldIndex(1));
        assert_eq!(derived.assignment(), module.assignment());
        assert_eq!(derived.get_data_parameters().input_rows, 4);
        let item = derived.test_iterator(FoldIndex(0)).unwrap().load(0).unwrap();
        assert_eq!(item.record.rows, 4);
    }
}
