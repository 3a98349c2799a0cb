//! Shared CLI helpers for workspace tools.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{Error, Result};

/// Installs the global tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn setup_cli_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(verbose))
        .with(filter)
        .try_init()
        .map_err(|e| Error::Configuration(format!("failed to initialize logger: {e}")))?;

    Ok(())
}

/// Reads and parses a TOML configuration file
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Configuration(format!("failed to read config {}: {e}", path.display()))
    })?;
    debug!("Loaded configuration from {}", path.display());

    toml::from_str(&content).map_err(|e| {
        Error::Configuration(format!("failed to parse config {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DataModuleConfig;
    use tempfile::TempDir;

    #[test]
    fn test_load_toml_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.toml");
        fs::write(&path, "k_folds = 4\nbatch_size = 32\n").unwrap();

        let config: DataModuleConfig = load_toml_config(&path).unwrap();
        assert_eq!(config.k_folds, 4);
        assert_eq!(config.batch_size, 32);
        assert!(config.shuffle_train);
    }

    #[test]
    fn test_load_missing_config() {
        let result: Result<DataModuleConfig> = load_toml_config(Path::new("/nope/config.toml"));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
