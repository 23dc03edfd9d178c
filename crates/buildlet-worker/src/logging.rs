//! Tracing setup for the worker binary.

use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use buildlet::config::{LogFormat, LoggingConfig, LogLevel};

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(level: LogLevel) -> String {
    format!("buildlet={level},buildlet_worker={level}")
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level and `LOG_FORMAT=json` forces
/// JSON lines. Output goes to stderr unless a log file is configured; stdout
/// may be the message transport.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_filter(config.level))
    };

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = open_log_file(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let use_json = config.format == LogFormat::Json
        || std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(writer))
            .try_init()
            .context("failed to install tracing subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init()
            .context("failed to install tracing subscriber")?;
    }
    Ok(())
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
