//! Cross-validation runner for EMG gesture classifiers
//!
//! Reads one experiment configuration (TOML) and runs grouped k-fold
//! cross-validation with one of three drivers: a single CNN, the two-stage
//! CNN → LSTM pipeline, or gradient-boosted trees over stored CNN features.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray};
use clap::{Parser, Subcommand};
use emg_core::{load_toml_config, setup_cli_logging, ExperimentConfig};
use emg_dataset::{ensure_index, DataModule, DatasetPreparer, DirectoryPreparer};
use emg_experiments::{
    run_cross_validation, run_tree_ensemble_cross_validation, run_two_stage_cross_validation,
    CrossValidationReport, ExperimentSettings, FoldReport,
};
use emg_training::{
    BurnTrainer, CallbackFactories, EmgConvNetConfig, JsonlTracker, NullTracker, Tracker,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

type InferenceBackend = NdArray<f32>;
type TrainBackend = Autodiff<InferenceBackend>;

/// Grouped k-fold cross-validation for EMG gesture classification
#[derive(Parser, Debug)]
#[command(name = "cross-val", version, about)]
struct Cli {
    /// Path to experiment configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true, default_value = "experiment.toml")]
    config: PathBuf,

    /// Override the directory fold artifacts are written to
    #[arg(long, value_name = "DIR", global = true)]
    models_dir: Option<PathBuf>,

    /// Do not write run logs
    #[arg(long, global = true)]
    no_track: bool,

    /// Validate the configuration and stop
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(flatten)]
    Experiment(Driver),

    /// Build the sample index from the raw recordings
    Prepare,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Driver {
    /// Train and test the convolutional classifier on every fold
    Run,

    /// CNN per fold, then an LSTM over its windowed features
    TwoStage,

    /// Boosted trees over features of previously stored CNN checkpoints
    TreeEnsemble,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_cli_logging(cli.verbose)?;

    let mut config: ExperimentConfig = load_toml_config(&cli.config).with_context(|| {
        format!("Failed to load experiment configuration {}", cli.config.display())
    })?;
    if let Some(dir) = &cli.models_dir {
        config.models_dir = dir.clone();
    }
    config.validate().context("Invalid experiment configuration")?;

    print_summary(&config, &cli.command);
    if cli.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    match cli.command {
        Command::Prepare => prepare(&config),
        Command::Experiment(driver) => run(driver, &config, cli.no_track),
    }
}

fn run(driver: Driver, config: &ExperimentConfig, no_track: bool) -> Result<()> {
    let tracker: &dyn Tracker = if no_track {
        &NullTracker
    } else {
        &JsonlTracker
    };

    std::fs::create_dir_all(&config.models_dir).with_context(|| {
        format!("Failed to create models directory {}", config.models_dir.display())
    })?;
    let config_path = config.models_dir.join("experiment_config.toml");
    std::fs::write(&config_path, toml::to_string_pretty(config)?)?;
    info!("Configuration saved to: {}", config_path.display());

    let mut data = open_data_module(config)?;
    let settings = ExperimentSettings::from_config(config);
    let progress = fold_progress(data.k_folds())?;
    let mut on_fold = |fold: &FoldReport| {
        progress.set_message(format!(
            "fold {} acc {:.2}%",
            fold.fold,
            100.0 * fold.test.accuracy
        ));
        progress.inc(1);
    };

    let report = match driver {
        Driver::Run => {
            let trainer =
                BurnTrainer::<TrainBackend>::from_params(Default::default(), &config.training)
                    .with_seed(config.seed);
            run_cross_validation(
                &mut data,
                &trainer,
                |params| {
                    Ok(EmgConvNetConfig::from_settings(&config.model, params.num_classes)
                        .init::<TrainBackend>(trainer.device()))
                },
                &CallbackFactories::from_params(&config.training),
                tracker,
                &settings,
                &mut on_fold,
            )?
        }
        Driver::TwoStage => {
            let sequence = config
                .sequence
                .as_ref()
                .context("two-stage runs need a [sequence] section")?;
            let trainer =
                BurnTrainer::<TrainBackend>::from_params(Default::default(), &config.training)
                    .with_seed(config.seed);
            let seq_callbacks = match &sequence.training {
                Some(params) => CallbackFactories::from_params(params),
                None => CallbackFactories::none(),
            };
            run_two_stage_cross_validation(
                &mut data,
                &trainer,
                |params| {
                    Ok(EmgConvNetConfig::from_settings(&config.model, params.num_classes)
                        .init::<TrainBackend>(trainer.device()))
                },
                &CallbackFactories::from_params(&config.training),
                sequence,
                &seq_callbacks,
                tracker,
                &settings,
                &mut on_fold,
            )?
        }
        Driver::TreeEnsemble => {
            let trees = config
                .tree_ensemble
                .as_ref()
                .context("tree-ensemble runs need a [tree_ensemble] section")?;
            let model_config = EmgConvNetConfig::from_settings(&config.model, data.num_classes());
            run_tree_ensemble_cross_validation::<InferenceBackend>(
                &mut data,
                &model_config,
                &Default::default(),
                trees,
                tracker,
                &settings,
                &mut on_fold,
            )?
        }
    };

    progress.finish_with_message("completed");
    print_report(&report);
    Ok(())
}

fn open_data_module(config: &ExperimentConfig) -> Result<DataModule> {
    let preparer = config.dataset.raw_dir.as_ref().map(DirectoryPreparer::new);
    let data = DataModule::open(
        config.dataset.kind,
        &config.dataset.root,
        preparer.as_ref().map(|p| p as &dyn DatasetPreparer),
        config.data.clone(),
    )
    .with_context(|| format!("Failed to open {} dataset", config.dataset.kind))?;
    info!("{:?}", data);
    Ok(data)
}

fn prepare(config: &ExperimentConfig) -> Result<()> {
    let raw_dir = config
        .dataset
        .raw_dir
        .as_ref()
        .context("preparing a dataset needs dataset.raw_dir")?;
    let kind = config.dataset.kind;
    let index_path = kind.index_path(&config.dataset.root);
    if index_path.is_file() {
        warn!("{} already exists, leaving it in place", index_path.display());
        return Ok(());
    }

    let columns = config
        .data
        .columns
        .clone()
        .unwrap_or_else(|| kind.default_columns());
    let preparer = DirectoryPreparer::new(raw_dir);
    let path = ensure_index(kind, &config.dataset.root, &columns, Some(&preparer))?;
    info!("Sample index ready at {}", path.display());
    Ok(())
}

fn fold_progress(k_folds: usize) -> Result<ProgressBar> {
    let progress = ProgressBar::new(k_folds as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} folds {msg}")?
            .progress_chars("=>-"),
    );
    Ok(progress)
}

fn print_summary(config: &ExperimentConfig, command: &Command) {
    info!("Experiment: {} ({:?})", config.name, command);
    info!("Dataset:");
    info!("  Kind: {}", config.dataset.kind);
    info!("  Root: {}", config.dataset.root.display());
    info!("  Folds: {}", config.data.k_folds);
    info!("  Batch size: {}", config.data.batch_size);
    info!("  Train transforms: {:?}", config.data.train_transforms.0);
    info!("  Test transforms: {:?}", config.data.test_transforms.0);
    info!("Training:");
    info!("  Max epochs: {}", config.training.max_epochs);
    info!("  Learning rate: {}", config.training.learning_rate);
    info!("  Monitor: {:?}", config.training.monitor);
    info!("Models: {}", config.models_dir.display());
}

fn print_report(report: &CrossValidationReport) {
    info!("");
    info!("Cross-validation of '{}' finished", report.name);
    for fold in &report.folds {
        match &fold.sequence_test {
            Some(sequence) => info!(
                "  Fold {}: {:.2}% (sequence {:.2}%) -> {}",
                fold.fold,
                100.0 * fold.test.accuracy,
                100.0 * sequence.accuracy,
                fold.artifact.display()
            ),
            None => info!(
                "  Fold {}: {:.2}% -> {}",
                fold.fold,
                100.0 * fold.test.accuracy,
                fold.artifact.display()
            ),
        }
    }
    info!(
        "Mean accuracy: {:.2}% ± {:.2}%",
        100.0 * report.mean_accuracy,
        100.0 * report.std_accuracy
    );
    if let Some(mean) = report.sequence_mean_accuracy {
        info!("Sequence mean accuracy: {:.2}%", 100.0 * mean);
    }
}
