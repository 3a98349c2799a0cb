//! Tree-ensemble cross-validation over features of stored CNN checkpoints.

use std::path::PathBuf;
use std::sync::Arc;

use burn::tensor::backend::Backend;
use emg_core::{Error, Result, TreeEnsembleConfig};
use emg_dataset::{DataModule, WindowedFeatureLoader};
use emg_training::{
    persist_fold, BoostingTrainer, CallbackFactories, EmgConvNetConfig, FrozenConvExtractor,
    GradientBoostedStumps, Tracker, TrainOptions,
};
use tracing::info;

use crate::cross_val::fit_and_test;
use crate::report::{CrossValidationReport, FoldReport};
use crate::settings::ExperimentSettings;

fn check_model_files(data: &DataModule, trees: &TreeEnsembleConfig) -> Result<()> {
    trees.validate()?;
    if trees.model_files.len() != data.k_folds() {
        return Err(Error::Configuration(format!(
            "{} model files given for {} folds",
            trees.model_files.len(),
            data.k_folds()
        )));
    }
    Ok(())
}

/// Checkpoint of `fold`; relative paths are taken from the models directory
fn model_file(trees: &TreeEnsembleConfig, settings: &ExperimentSettings, fold: usize) -> PathBuf {
    settings.models_dir.join(&trees.model_files[fold])
}

/// Loads the fold's CNN, keeps its feature prefix and fits a boosted stump
/// ensemble on windowed features of the fold. Persists the ensemble as JSON
/// and advances the cursor.
pub fn run_tree_ensemble_fold<B: Backend>(
    data: &mut DataModule,
    model_config: &EmgConvNetConfig,
    device: &B::Device,
    trees: &TreeEnsembleConfig,
    tracker: &dyn Tracker,
    settings: &ExperimentSettings,
) -> Result<FoldReport> {
    check_model_files(data, trees)?;
    let fold = data.current_fold();
    let checkpoint = model_file(trees, settings, fold.get());
    info!(
        "Fold {}/{} of '{}' using {:?}",
        fold.get() + 1,
        data.k_folds(),
        settings.name,
        checkpoint
    );

    let extractor =
        FrozenConvExtractor::<B>::from_checkpoint(model_config, &checkpoint, device.clone())?;
    let loader =
        WindowedFeatureLoader::new(data.test_loader(), Arc::new(extractor), trees.window)?;
    let feature_data = data.derive(Arc::new(loader))?;
    let fold_data = feature_data.fold(fold)?;

    let trainer = BoostingTrainer::new(TrainOptions::from(trees));
    let model = GradientBoostedStumps::untrained(data.num_classes());
    let (model, test) = fit_and_test(
        &trainer,
        model,
        &fold_data,
        &CallbackFactories::none(),
        tracker,
        settings,
        &settings.name,
    )?;
    let artifact = persist_fold(&model, &settings.models_dir, &settings.name, fold)?;

    data.advance_fold();
    Ok(FoldReport {
        fold,
        test,
        artifact,
        sequence_test: None,
    })
}

/// Cross-validation of boosted stump ensembles, one per fold, each on top
/// of the CNN checkpoint listed for that fold in `trees.model_files`.
pub fn run_tree_ensemble_cross_validation<B: Backend>(
    data: &mut DataModule,
    model_config: &EmgConvNetConfig,
    device: &B::Device,
    trees: &TreeEnsembleConfig,
    tracker: &dyn Tracker,
    settings: &ExperimentSettings,
    on_fold: &mut dyn FnMut(&FoldReport),
) -> Result<CrossValidationReport> {
    check_model_files(data, trees)?;
    let k = data.k_folds();
    let mut report = CrossValidationReport::new(&settings.name, k);

    for _ in 0..k {
        let fold =
            run_tree_ensemble_fold::<B>(data, model_config, device, trees, tracker, settings)?;
        on_fold(&fold);
        report.push(fold);
    }

    report.finish();
    report.save(&settings.models_dir)?;
    info!(
        "'{}' finished: mean test accuracy {:.2}% (std {:.2}%)",
        settings.name,
        100.0 * report.mean_accuracy,
        100.0 * report.std_accuracy
    );
    Ok(report)
}
