//! Two-stage cross-validation: a CNN, then an LSTM over its frozen features.

use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use emg_core::{DataParameters, Result, SequenceStageConfig};
use emg_dataset::{DataModule, FeatureExtractor, WindowedFeatureLoader};
use emg_training::{
    persist_fold, BurnTrainer, CallbackFactories, EmgConvNet, FrozenConvExtractor, Tracker,
    TrainingDriver, UniLstm, UniLstmConfig,
};
use tracing::info;

use crate::cross_val::{fit_and_test, model_params};
use crate::report::{CrossValidationReport, FoldReport};
use crate::settings::ExperimentSettings;

/// Both stages of one outer fold. The cursor advances once, after the
/// sequence stage.
#[allow(clippy::too_many_arguments)]
pub fn run_two_stage_fold<B, F>(
    data: &mut DataModule,
    trainer: &BurnTrainer<B>,
    build_model: &mut F,
    callbacks: &CallbackFactories<EmgConvNet<B>>,
    sequence: &SequenceStageConfig,
    seq_callbacks: &CallbackFactories<UniLstm<B>>,
    tracker: &dyn Tracker,
    settings: &ExperimentSettings,
) -> Result<FoldReport>
where
    B: AutodiffBackend,
    F: FnMut(&DataParameters) -> Result<EmgConvNet<B>>,
{
    let fold = data.current_fold();
    info!("Fold {}/{} of '{}'", fold.get() + 1, data.k_folds(), settings.name);

    TrainingDriver::<EmgConvNet<B>>::reseed(trainer, settings.seed);
    let params = model_params(data, settings);
    let model = build_model(&params)?;
    let fold_data = data.fold(fold)?;

    let (model, test) = fit_and_test(
        trainer,
        model,
        &fold_data,
        callbacks,
        tracker,
        settings,
        &settings.name,
    )?;
    let artifact = persist_fold(&model, &settings.models_dir, &settings.name, fold)?;

    // Everything but the classification layer, in inference mode
    let extractor =
        FrozenConvExtractor::<B::InnerBackend>::from_trained(&model, trainer.device().clone());
    let width = extractor.output_width();
    let loader =
        WindowedFeatureLoader::new(data.test_loader(), Arc::new(extractor), sequence.window)?;
    let seq_data = data.derive(Arc::new(loader))?;
    let seq_fold = seq_data.fold(fold)?;

    let seq_trainer = match &sequence.training {
        Some(training) => BurnTrainer::<B>::from_params(trainer.device().clone(), training),
        None => trainer.clone(),
    }
    .with_max_epochs(sequence.max_epochs);
    TrainingDriver::<UniLstm<B>>::reseed(&seq_trainer, settings.seed);
    let seq_model = UniLstmConfig::new(width, params.num_classes)
        .with_hidden_size(sequence.hidden_size)
        .init::<B>(trainer.device());

    let (_, sequence_test) = fit_and_test(
        &seq_trainer,
        seq_model,
        &seq_fold,
        seq_callbacks,
        tracker,
        settings,
        &settings.sequence_name(),
    )?;

    data.advance_fold();
    Ok(FoldReport {
        fold,
        test,
        artifact,
        sequence_test: Some(sequence_test),
    })
}

/// Cross-validation where each fold's trained CNN, minus its classifier,
/// feeds windowed features to a fresh LSTM evaluated on the same fold.
///
/// The LSTM stage logs under `"lstm " + name` and is not persisted; only the
/// CNN artifact is written per fold.
#[allow(clippy::too_many_arguments)]
pub fn run_two_stage_cross_validation<B, F>(
    data: &mut DataModule,
    trainer: &BurnTrainer<B>,
    mut build_model: F,
    callbacks: &CallbackFactories<EmgConvNet<B>>,
    sequence: &SequenceStageConfig,
    seq_callbacks: &CallbackFactories<UniLstm<B>>,
    tracker: &dyn Tracker,
    settings: &ExperimentSettings,
    on_fold: &mut dyn FnMut(&FoldReport),
) -> Result<CrossValidationReport>
where
    B: AutodiffBackend,
    F: FnMut(&DataParameters) -> Result<EmgConvNet<B>>,
{
    let k = data.k_folds();
    let mut report = CrossValidationReport::new(&settings.name, k);

    for _ in 0..k {
        let fold = run_two_stage_fold(
            data,
            trainer,
            &mut build_model,
            callbacks,
            sequence,
            seq_callbacks,
            tracker,
            settings,
        )?;
        on_fold(&fold);
        report.push(fold);
    }

    report.finish();
    report.save(&settings.models_dir)?;
    info!(
        "'{}' finished: CNN {:.2}% / LSTM {:.2}% mean test accuracy",
        settings.name,
        100.0 * report.mean_accuracy,
        100.0 * report.sequence_mean_accuracy.unwrap_or(0.0)
    );
    Ok(report)
}
