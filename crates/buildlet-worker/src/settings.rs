//! Config loading: JSON file first, then flags and their environment fallbacks.

use std::path::{Path, PathBuf};

use buildlet::config::WorkerConfig;

use crate::cli::Cli;

pub const DEFAULT_CONFIG_FILE: &str = "buildlet.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("--transport {kind} requires --pipe")]
    MissingPipe { kind: &'static str },

    #[error("{kind} transport is not available on this platform")]
    UnsupportedTransport { kind: &'static str },
}

pub fn load(cli: &Cli) -> Result<WorkerConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => read_file(path)?,
        None => {
            let fallback = Path::new(DEFAULT_CONFIG_FILE);
            if fallback.is_file() {
                read_file(fallback)?
            } else {
                WorkerConfig::default()
            }
        }
    };
    cli.apply(&mut config)?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<WorkerConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    WorkerConfig::from_json(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
