//! Command-line flags.
//!
//! Every flag also reads a `BUILDLET_*` environment variable. Values given
//! here override the config file; anything left unset keeps the file's value.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use buildlet::bridge::transport::TransportInfo;
use buildlet::config::{LogFormat, LogLevel, WorkerConfig};

use crate::settings::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Stdio,
    Named,
    Abstract,
}

#[derive(Debug, Parser)]
#[command(name = "buildlet-worker", version, about = "Compilation worker driven over a message stream")]
pub struct Cli {
    /// JSON config file. Defaults to ./buildlet.json when present.
    #[arg(long, env = "BUILDLET_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Parent process id; the worker exits when it disappears.
    #[arg(long, env = "BUILDLET_PARENT", value_name = "PID")]
    pub parent: Option<u32>,

    /// Start the message broker.
    #[arg(short = 'm', long = "message-stream", env = "BUILDLET_MESSAGE_STREAM")]
    pub message_stream: bool,

    #[arg(long, value_enum, env = "BUILDLET_TRANSPORT")]
    pub transport: Option<TransportKind>,

    /// Socket path or abstract name. Implies `--transport named` when given alone.
    #[arg(long, env = "BUILDLET_PIPE", value_name = "NAME")]
    pub pipe: Option<String>,

    /// Exit with an error if the transport cannot be opened.
    #[arg(long, env = "BUILDLET_REQUIRE_TRANSPORT")]
    pub require_transport: bool,

    #[arg(long, env = "BUILDLET_IDLE_INTERVAL_MS", value_name = "MS")]
    pub idle_interval_ms: Option<u64>,

    /// Raise verbosity one level per occurrence.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, env = "BUILDLET_LOG_LEVEL", value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[arg(long, env = "BUILDLET_LOG_FILE", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[arg(long, env = "BUILDLET_LOG_FORMAT", value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Compiler backend executable.
    #[arg(long, env = "BUILDLET_COMPILER", value_name = "PATH")]
    pub compiler: Option<PathBuf>,

    /// Extra argument for the backend. Repeatable.
    #[arg(long = "compiler-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub compiler_args: Vec<String>,

    #[arg(long)]
    pub allow_unsafe: bool,

    /// Compile against the standard libraries.
    #[arg(long = "std")]
    pub use_standard_libraries: bool,

    #[arg(long, env = "BUILDLET_FRAMEWORK_PATH", value_name = "PATH")]
    pub framework_path: Option<PathBuf>,
}

impl Cli {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut WorkerConfig) -> Result<(), ConfigError> {
        if let Some(pid) = self.parent {
            config.lifecycle.parent_pid = Some(pid);
        }
        if self.message_stream {
            config.compiler.enable_message_stream = true;
        }
        if let Some(endpoint) = self.endpoint()? {
            config.transport.endpoint = endpoint;
        }
        if self.require_transport {
            config.transport.required = true;
        }
        if let Some(ms) = self.idle_interval_ms {
            config.broker.idle_interval = std::time::Duration::from_millis(ms);
        }

        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        for _ in 0..self.verbose {
            config.logging.level = config.logging.level.more_verbose();
        }
        if let Some(path) = &self.log_file {
            config.logging.file = Some(path.clone());
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        if let Some(command) = &self.compiler {
            config.compiler.command = Some(command.clone());
        }
        if !self.compiler_args.is_empty() {
            config.compiler.args = self.compiler_args.clone();
        }
        if self.allow_unsafe {
            config.compiler.allow_unsafe = true;
        }
        if self.use_standard_libraries {
            config.compiler.use_standard_libraries = true;
        }
        if let Some(path) = &self.framework_path {
            config.compiler.framework_path = Some(path.clone());
        }
        Ok(())
    }

    fn endpoint(&self) -> Result<Option<TransportInfo>, ConfigError> {
        let kind = match (self.transport, &self.pipe) {
            (None, None) => return Ok(None),
            (Some(kind), _) => kind,
            (None, Some(_)) => TransportKind::Named,
        };
        match kind {
            TransportKind::Stdio => Ok(Some(TransportInfo::Stdio)),
            TransportKind::Named => named_endpoint(self.pipe.as_deref()),
            TransportKind::Abstract => abstract_endpoint(self.pipe.as_deref()),
        }
    }
}

#[cfg(unix)]
fn named_endpoint(pipe: Option<&str>) -> Result<Option<TransportInfo>, ConfigError> {
    let path = pipe.ok_or(ConfigError::MissingPipe { kind: "named" })?;
    Ok(Some(TransportInfo::Named {
        path: PathBuf::from(path),
    }))
}

#[cfg(not(unix))]
fn named_endpoint(_pipe: Option<&str>) -> Result<Option<TransportInfo>, ConfigError> {
    Err(ConfigError::UnsupportedTransport { kind: "named" })
}

#[cfg(target_os = "linux")]
fn abstract_endpoint(pipe: Option<&str>) -> Result<Option<TransportInfo>, ConfigError> {
    let name = pipe.ok_or(ConfigError::MissingPipe { kind: "abstract" })?;
    Ok(Some(TransportInfo::Abstract {
        name: name.to_string(),
    }))
}

#[cfg(not(target_os = "linux"))]
fn abstract_endpoint(_pipe: Option<&str>) -> Result<Option<TransportInfo>, ConfigError> {
    Err(ConfigError::UnsupportedTransport { kind: "abstract" })
}
