//! Grouped k-fold cross-validation of a single model.

use emg_core::{DataParameters, EvaluationMetrics, Result};
use emg_dataset::{DataModule, FoldData};
use emg_training::{
    persist_fold, CallbackContext, CallbackFactories, Persist, RunSession, Tracker,
    TrainingDriver,
};
use tracing::info;

use crate::report::{CrossValidationReport, FoldReport};
use crate::settings::ExperimentSettings;

/// Builds callbacks and a logger session for `run_name`, fits, reloads the
/// best checkpoint when one was written, tests and closes the session.
pub(crate) fn fit_and_test<M, D>(
    driver: &D,
    model: M,
    data: &FoldData,
    factories: &CallbackFactories<M>,
    tracker: &dyn Tracker,
    settings: &ExperimentSettings,
    run_name: &str,
) -> Result<(M, EvaluationMetrics)>
where
    M: Persist,
    D: TrainingDriver<M>,
{
    let ctx = CallbackContext {
        run_name: run_name.to_string(),
        fold: data.fold,
        checkpoint_dir: settings.checkpoint_dir(),
    };
    let mut callbacks = factories.build(&ctx);
    let mut session = RunSession::open(tracker, &settings.tracker, run_name, data.fold);

    let model = driver.fit(model, data, &mut callbacks, &mut session)?;
    let model = match callbacks.best_model_path() {
        Some(path) => {
            info!("Reloading best weights from {:?}", path);
            model.load_artifact(&path)?
        }
        None => model,
    };

    let metrics = driver.test(&model, data, &mut session)?;
    session.finish();
    Ok((model, metrics))
}

pub(crate) fn model_params(data: &DataModule, settings: &ExperimentSettings) -> DataParameters {
    settings
        .model_params
        .unwrap_or_else(|| data.get_data_parameters())
}

/// Runs the fold under the data module's cursor, persists its model and
/// advances the cursor
pub fn run_cross_validation_fold<M, D, F>(
    data: &mut DataModule,
    driver: &D,
    build_model: &mut F,
    callbacks: &CallbackFactories<M>,
    tracker: &dyn Tracker,
    settings: &ExperimentSettings,
) -> Result<FoldReport>
where
    M: Persist,
    D: TrainingDriver<M>,
    F: FnMut(&DataParameters) -> Result<M>,
{
    let fold = data.current_fold();
    info!("Fold {}/{} of '{}'", fold.get() + 1, data.k_folds(), settings.name);

    driver.reseed(settings.seed);
    let model = build_model(&model_params(data, settings))?;
    let fold_data = data.fold(fold)?;

    let (model, test) = fit_and_test(
        driver,
        model,
        &fold_data,
        callbacks,
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

/// Grouped k-fold cross-validation.
///
/// For every fold in cursor order: re-seed, build a fresh model, fit, test
/// and persist `{models_dir}/{name}_{fold}_fold.{ext}`. Folds run one after
/// another and the first error ends the run.
pub fn run_cross_validation<M, D, F>(
    data: &mut DataModule,
    driver: &D,
    mut build_model: F,
    callbacks: &CallbackFactories<M>,
    tracker: &dyn Tracker,
    settings: &ExperimentSettings,
    on_fold: &mut dyn FnMut(&FoldReport),
) -> Result<CrossValidationReport>
where
    M: Persist,
    D: TrainingDriver<M>,
    F: FnMut(&DataParameters) -> Result<M>,
{
    let k = data.k_folds();
    let mut report = CrossValidationReport::new(&settings.name, k);

    for _ in 0..k {
        let fold = run_cross_validation_fold(
            data,
            driver,
            &mut build_model,
            callbacks,
            tracker,
            settings,
        )?;
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
