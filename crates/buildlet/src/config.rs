//! Worker configuration.
//!
//! Plain data with defaults. The binary layers a JSON file, environment and
//! command-line flags on top; components receive only their own section.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_TRANSFER_SIZE};
use crate::bridge::transport::TransportInfo;

/// Durations are whole milliseconds in config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, ser::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).map_err(|_| {
            S::Error::custom(format!("duration {:?} does not fit in u64 milliseconds", value))
        })?;
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long the worker loop sleeps when neither direction had work.
    #[serde(rename = "idle_interval_ms", with = "millis")]
    pub idle_interval: Duration,
    /// How long a single inbound read attempt may wait for bytes.
    #[serde(rename = "read_poll_interval_ms", with = "millis")]
    pub read_poll_interval: Duration,
    /// Max envelopes per direction per loop iteration.
    pub batch_size: usize,
    pub max_transfer_size: usize,
    pub max_frame_len: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            read_poll_interval: Duration::from_millis(50),
            batch_size: 3,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl BrokerConfig {
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_max_transfer_size(mut self, n: usize) -> Self {
        self.max_transfer_size = n.max(1);
        self
    }

    pub fn with_max_frame_len(mut self, n: usize) -> Self {
        self.max_frame_len = n;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: TransportInfo,
    /// Fail startup instead of running degraded when the endpoint cannot be opened.
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub parent_pid: Option<u32>,
    #[serde(rename = "parent_poll_interval_ms", with = "millis")]
    pub parent_poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            parent_pid: None,
            parent_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Start the broker. Without it the worker only waits for termination.
    pub enable_message_stream: bool,
    /// Backend executable run once per job.
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub allow_unsafe: bool,
    pub use_standard_libraries: bool,
    pub framework_path: Option<PathBuf>,
    pub default_encoding: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            enable_message_stream: false,
            command: None,
            args: Vec::new(),
            allow_unsafe: false,
            use_standard_libraries: false,
            framework_path: None,
            default_encoding: "utf-8".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// One step more verbose, saturating at trace.
    pub fn more_verbose(self) -> Self {
        match self {
            Self::Error => Self::Warn,
            Self::Warn => Self::Info,
            Self::Info => Self::Debug,
            Self::Debug | Self::Trace => Self::Trace,
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" | "verbose" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" | "information" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "fatal" | "critical" => Ok(Self::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub transport: TransportConfig,
    pub lifecycle: LifecycleConfig,
    pub compiler: CompilerConfig,
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        let config = WorkerConfig::from_json("{}").unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.broker.idle_interval, Duration::from_millis(500));
        assert_eq!(config.broker.batch_size, 3);
        assert_eq!(config.broker.max_transfer_size, 1024);
        assert_eq!(config.transport.endpoint, TransportInfo::Stdio);
        assert!(!config.transport.required);
        assert!(!config.compiler.enable_message_stream);
        assert_eq!(config.compiler.default_encoding, "utf-8");
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = WorkerConfig::from_json(
            r#"{
                "broker": {"idle_interval_ms": 1500},
                "lifecycle": {"parent_pid": 4242},
                "compiler": {"enable_message_stream": true, "args": ["--fast"]},
                "logging": {"level": "debug", "format": "json"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.broker.idle_interval, Duration::from_millis(1500));
        assert_eq!(config.broker.read_poll_interval, Duration::from_millis(50));
        assert_eq!(config.lifecycle.parent_pid, Some(4242));
        assert_eq!(config.lifecycle.parent_poll_interval, Duration::from_secs(1));
        assert!(config.compiler.enable_message_stream);
        assert_eq!(config.compiler.args, vec!["--fast"]);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[cfg(unix)]
    #[test]
    fn transport_endpoint_is_tagged() {
        let config = WorkerConfig::from_json(
            r#"{"transport": {"endpoint": {"kind": "named", "path": "/run/buildlet.sock"}, "required": true}}"#,
        )
        .unwrap();
        assert_eq!(
            config.transport.endpoint,
            TransportInfo::Named {
                path: PathBuf::from("/run/buildlet.sock")
            }
        );
        assert!(config.transport.required);
    }

    #[test]
    fn builder_clamps_sizes() {
        let config = BrokerConfig::default()
            .with_batch_size(0)
            .with_max_transfer_size(0)
            .with_idle_interval(Duration::from_millis(10));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_transfer_size, 1);
        assert_eq!(config.idle_interval, Duration::from_millis(10));
    }

    #[test]
    fn durations_roundtrip_as_millis() {
        let config = BrokerConfig::default().with_idle_interval(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["idle_interval_ms"], 1500);
        assert_eq!(json["read_poll_interval_ms"], 50);
    }

    #[test]
    fn oversized_duration_is_a_serialize_error() {
        let config = BrokerConfig::default().with_idle_interval(Duration::MAX);
        let err = serde_json::to_string(&config).unwrap_err();
        assert!(err.to_string().contains("does not fit"), "{err}");
    }

    #[test]
    fn log_levels_parse_loosely() {
        assert_eq!("Information".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("verbose".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Info.more_verbose(), LogLevel::Debug);
        assert_eq!(LogLevel::Trace.more_verbose(), LogLevel::Trace);
    }
}
