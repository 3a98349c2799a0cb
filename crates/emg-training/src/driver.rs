//! Training drivers.
//!
//! A [`TrainingDriver`] fits a model on one fold and evaluates it on that
//! fold's test split. [`BurnTrainer`] is the gradient-descent loop used for
//! the CNN and the LSTM stage.

use std::cell::Cell;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use emg_core::{
    EpochMetrics, Error, EvaluationMetrics, Result, TrainingHistory, TrainingParams,
};
use emg_dataset::{EmgBatcher, FoldData, FoldDataset};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::callbacks::{CallbackAction, CallbackSet};
use crate::logger::RunSession;
use crate::model::EmgModel;

/// Fits and tests one model on one fold
pub trait TrainingDriver<M> {
    /// Re-seeds the driver's randomness before a model is built. Every fold
    /// gets the same seed; folds differ only by their data.
    fn reseed(&self, _seed: u64) {}

    fn fit(
        &self,
        model: M,
        data: &FoldData,
        callbacks: &mut CallbackSet<M>,
        session: &mut RunSession,
    ) -> Result<M>;

    fn test(&self, model: &M, data: &FoldData, session: &mut RunSession) -> Result<EvaluationMetrics>;
}

/// Adam + cross-entropy training loop on a burn autodiff backend
#[derive(Debug, Clone)]
pub struct BurnTrainer<B: AutodiffBackend> {
    device: B::Device,
    max_epochs: usize,
    learning_rate: f64,
    weight_decay: Option<f64>,
    /// Seed of the per-epoch training shuffle, replaced by `reseed`
    seed: Cell<u64>,
}

impl<B: AutodiffBackend> BurnTrainer<B> {
    pub fn new(device: B::Device, max_epochs: usize, learning_rate: f64) -> Self {
        Self {
            device,
            max_epochs,
            learning_rate,
            weight_decay: None,
            seed: Cell::new(0),
        }
    }

    pub fn from_params(device: B::Device, params: &TrainingParams) -> Self {
        Self::new(device, params.max_epochs, params.learning_rate)
            .with_weight_decay(params.weight_decay)
    }

    pub fn with_weight_decay(mut self, weight_decay: Option<f64>) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_max_epochs(mut self, max_epochs: usize) -> Self {
        self.max_epochs = max_epochs;
        self
    }

    /// Seed of the per-epoch training shuffle
    pub fn with_seed(self, seed: u64) -> Self {
        self.seed.set(seed);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed.get()
    }

    /// Training order of every epoch, drawn from the current seed only
    pub fn epoch_orders(&self, len: usize, shuffle: bool) -> impl Iterator<Item = Vec<usize>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.get());
        std::iter::repeat_with(move || {
            let mut order: Vec<usize> = (0..len).collect();
            if shuffle {
                order.shuffle(&mut rng);
            }
            order
        })
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn max_epochs(&self) -> usize {
        self.max_epochs
    }
}

impl<B, M> TrainingDriver<M> for BurnTrainer<B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + EmgModel<B>,
    M::InnerModule: EmgModel<B::InnerBackend>,
{
    fn reseed(&self, seed: u64) {
        B::seed(seed);
        self.seed.set(seed);
    }

    fn fit(
        &self,
        mut model: M,
        data: &FoldData,
        callbacks: &mut CallbackSet<M>,
        session: &mut RunSession,
    ) -> Result<M> {
        if data.train.is_empty() {
            return Err(Error::Training(format!(
                "fold {} has no training samples",
                data.fold
            )));
        }
        if data.val.is_empty() {
            warn!(
                "Fold {} has no validation samples; monitoring training metrics",
                data.fold
            );
        }

        let batcher = EmgBatcher::<B>::new(self.device.clone());
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);
        let mut optimizer = AdamConfig::new()
            .with_weight_decay(self.weight_decay.map(|wd| WeightDecayConfig::new(wd as f32)))
            .init();

        let mut history = TrainingHistory::default();
        let orders = self.epoch_orders(data.train.len(), data.shuffle_train);

        for (epoch, order) in orders.take(self.max_epochs).enumerate() {
            let mut loss_sum = 0.0f64;
            let mut correct = 0usize;
            let mut seen = 0usize;

            for chunk in order.chunks(data.batch_size.max(1)) {
                let items = data.train.load_many(chunk)?;
                let batch = batcher.batch(items);
                let batch_size = batch.targets.dims()[0];

                let output = model.forward(batch.inputs);
                let loss = loss_fn.forward(output.clone(), batch.targets.clone());

                let loss_value: f64 = loss.clone().into_scalar().elem();
                if !loss_value.is_finite() {
                    return Err(Error::Training(format!(
                        "non-finite loss at epoch {} of fold {}",
                        epoch, data.fold
                    )));
                }
                loss_sum += loss_value * batch_size as f64;
                correct += count_correct(output, batch.targets);
                seen += batch_size;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optimizer.step(self.learning_rate, model, grads);
            }

            let train_loss = loss_sum / seen.max(1) as f64;
            let train_accuracy = correct as f64 / seen.max(1) as f64;

            let (val_loss, val_accuracy) = if data.val.is_empty() {
                (train_loss, train_accuracy)
            } else {
                let val = evaluate(
                    &model.valid(),
                    &data.val,
                    data.batch_size,
                    &self.device,
                )?;
                (val.loss.unwrap_or(f64::NAN), val.accuracy)
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
            };
            info!(
                "Fold {} epoch {}/{}: loss {:.4} | train acc {:.2}% | val loss {:.4} | val acc {:.2}%",
                data.fold,
                epoch + 1,
                self.max_epochs,
                train_loss,
                100.0 * train_accuracy,
                val_loss,
                100.0 * val_accuracy
            );
            session.log_epoch(&metrics);
            history.push(metrics);

            if callbacks.on_epoch_end(&metrics, &model)? == CallbackAction::Stop {
                break;
            }
        }

        if let (Some(best), Some(epoch)) = (history.best_val_accuracy(), history.best_epoch()) {
            debug!(
                "Fold {} best validation accuracy {:.2}% at epoch {}",
                data.fold,
                100.0 * best,
                epoch
            );
        }
        Ok(model)
    }

    fn test(&self, model: &M, data: &FoldData, session: &mut RunSession) -> Result<EvaluationMetrics> {
        if data.test.is_empty() {
            return Err(Error::Training(format!(
                "fold {} has no test samples",
                data.fold
            )));
        }
        let metrics = evaluate(&model.valid(), &data.test, data.batch_size, &self.device)?;
        info!(
            "Fold {} test accuracy {:.2}% over {} samples",
            data.fold,
            100.0 * metrics.accuracy,
            metrics.num_samples
        );
        session.log_test(&metrics);
        Ok(metrics)
    }
}

fn count_correct<B: Backend>(
    output: Tensor<B, 2>,
    targets: Tensor<B, 1, burn::tensor::Int>,
) -> usize {
    let predictions = output.argmax(1).squeeze::<1>(1);
    let correct: i64 = predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

/// Loss and classification metrics of `model` over `dataset`
pub fn evaluate<B: Backend, M: EmgModel<B>>(
    model: &M,
    dataset: &FoldDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvaluationMetrics> {
    let batcher = EmgBatcher::<B>::new(device.clone());
    let loss_fn = CrossEntropyLossConfig::new().init(device);

    let mut predictions = Vec::with_capacity(dataset.len());
    let mut labels = Vec::with_capacity(dataset.len());
    let mut loss_sum = 0.0f64;

    let positions: Vec<usize> = (0..dataset.len()).collect();
    for chunk in positions.chunks(batch_size.max(1)) {
        let items = dataset.load_many(chunk)?;
        labels.extend(items.iter().map(|item| item.label));
        let batch = batcher.batch(items);
        let batch_size = batch.targets.dims()[0];

        let output = model.forward(batch.inputs);
        let loss: f64 = loss_fn
            .forward(output.clone(), batch.targets)
            .into_scalar()
            .elem();
        loss_sum += loss * batch_size as f64;

        let predicted = output
            .argmax(1)
            .squeeze::<1>(1)
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(|e| Error::Training(format!("failed to read predictions: {e:?}")))?;
        predictions.extend(predicted.into_iter().map(|p| p as usize));
    }

    let metrics = EvaluationMetrics::from_predictions(model.num_classes(), &predictions, &labels)
        .with_loss(loss_sum / labels.len().max(1) as f64);
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::CallbackFactories;
    use crate::model::{EmgConvNet, EmgConvNetConfig};
    use burn::backend::{Autodiff, NdArray};
    use emg_core::{DataModuleConfig, FoldIndex, Record, Sample};
    use emg_dataset::{DataModule, SampleIndex};

    type TestBackend = Autodiff<NdArray<f32>>;

    /// Two classes separable by the sign of the signal
    fn module() -> DataModule {
        let samples = (0..6)
            .flat_map(|g| {
                (0..4).map(move |i| {
                    let label = i % 2;
                    let value = if label == 0 { -1.0 } else { 1.0 };
                    Sample::inline(
                        Record::new(2, 8, vec![value; 16]).unwrap(),
                        label,
                        format!("s{g}"),
                    )
                })
            })
            .collect();
        let config = DataModuleConfig {
            k_folds: 3,
            batch_size: 4,
            num_workers: 0,
            ..Default::default()
        };
        DataModule::new(SampleIndex::new(samples, "."), config).unwrap()
    }

    #[test]
    fn test_fit_and_test() {
        let device = Default::default();
        let module = module();
        let data = module.fold(FoldIndex(0)).unwrap();

        let trainer = BurnTrainer::<TestBackend>::new(device, 3, 1e-2);
        let model: EmgConvNet<TestBackend> = EmgConvNetConfig::new(2)
            .with_base_filters(2)
            .with_hidden_size(8)
            .init(trainer.device());

        let mut callbacks = CallbackFactories::none().build(&crate::callbacks::CallbackContext {
            run_name: "t".into(),
            fold: FoldIndex(0),
            checkpoint_dir: ".".into(),
        });
        let mut session = RunSession::detached("t", FoldIndex(0));
        let model = trainer.fit(model, &data, &mut callbacks, &mut session).unwrap();
        let metrics = trainer.test(&model, &data, &mut session).unwrap();

        assert_eq!(metrics.num_samples, data.test.len());
        assert!(metrics.loss.unwrap().is_finite());
        assert!((0.0..=1.0).contains(&metrics.accuracy));
    }

    #[test]
    fn test_reseed_drives_the_shuffle() {
        let trainer = BurnTrainer::<TestBackend>::new(Default::default(), 1, 1e-3);
        let orders = |seed: u64| {
            TrainingDriver::<EmgConvNet<TestBackend>>::reseed(&trainer, seed);
            trainer.epoch_orders(32, true).take(3).collect::<Vec<_>>()
        };

        let first = orders(7);
        assert_eq!(trainer.seed(), 7);
        assert_ne!(first, orders(8));
        // the next fold re-seeds with the same value and replays the same order
        assert_eq!(first, orders(7));
        assert_ne!(first[0], first[1]);
    }

    #[test]
    fn test_unshuffled_order() {
        let trainer = BurnTrainer::<TestBackend>::new(Default::default(), 1, 1e-3).with_seed(3);
        let order = trainer.epoch_orders(4, false).next().unwrap();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_test_split_is_an_error() {
        let device = Default::default();
        let module = module();
        let mut data = module.fold(FoldIndex(1)).unwrap();
        data.test = data.train.subset(&[]);

        let trainer = BurnTrainer::<TestBackend>::new(device, 1, 1e-3);
        let model: EmgConvNet<TestBackend> = EmgConvNetConfig::new(2)
            .with_base_filters(2)
            .with_hidden_size(4)
            .init(trainer.device());
        let mut session = RunSession::detached("t", FoldIndex(1));
        assert!(matches!(
            trainer.test(&model, &data, &mut session),
            Err(Error::Training(_))
        ));
    }
}
