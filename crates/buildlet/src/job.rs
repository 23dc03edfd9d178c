//! Job and result types that cross the wire inside `Data` envelopes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::base64_bytes;
use crate::compiler::CompileError;

/// A named blob: a source file or a reference assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    #[serde(default, with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Final path component of `name`.
    pub fn file_name(&self) -> &str {
        self.name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileTarget {
    #[default]
    Library,
    Exe,
    WinExe,
    Module,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    AnyCpu,
    AnyCpu32Preferred,
    Arm,
    X86,
    X64,
    Ia64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LanguageVersion {
    #[default]
    Preview,
    Latest,
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    V10,
    V11,
    V12,
    V13,
}

macro_rules! display_via_serde {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(serde_json::Value::String(name)) => f.write_str(&name),
                    _ => write!(f, "{:?}", self),
                }
            }
        }
    )*};
}

display_via_serde!(CompileTarget, Platform, LanguageVersion);

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_sdk_version() -> String {
    "2".to_string()
}

/// Compilation options. Every field has a default so peers may send a subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub target: CompileTarget,
    pub platform: Platform,
    pub language_version: LanguageVersion,
    pub encoding: String,
    pub debug: bool,
    pub preprocessor: Vec<String>,
    /// Link the platform standard library set.
    pub std_lib: bool,
    pub load_default_references: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    pub sdk_version: String,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            target: CompileTarget::default(),
            platform: Platform::default(),
            language_version: LanguageVersion::default(),
            encoding: default_encoding(),
            debug: false,
            preprocessor: Vec::new(),
            std_lib: false,
            load_default_references: false,
            output_file: None,
            sdk_version: default_sdk_version(),
        }
    }
}

impl fmt::Display for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings[Encoding: {}, Version: {}, Target: {}, Platform: {}, StdLib: {}, Debug: {}, Preprocessor: {}]",
            self.encoding,
            self.language_version,
            self.target,
            self.platform,
            self.std_lib,
            self.debug,
            self.preprocessor.join(", ")
        )
    }
}

/// A compilation request, deserialized from a `Data` envelope payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub sources: Vec<SourceFile>,
    #[serde(default)]
    pub references: Vec<SourceFile>,
    #[serde(flatten)]
    pub options: JobOptions,
}

impl Job {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        if self.sources.is_empty() {
            return Err(CompileError::invalid_job("No source files provided"));
        }
        Ok(())
    }

    /// Apply worker-level defaults to fields the peer left blank.
    pub fn apply_defaults(&mut self, default_encoding: &str) {
        if self.options.encoding.trim().is_empty() {
            self.options.encoding = default_encoding.to_string();
        }
    }

    /// Multi-line listing of reference and source files with their sizes.
    pub fn file_listing(&self) -> String {
        let mut out = String::new();
        for (title, files) in [
            ("Reference Files:", &self.references),
            ("Source Files:", &self.sources),
        ] {
            if files.is_empty() {
                continue;
            }
            out.push('\n');
            out.push_str(title);
            for (i, file) in files.iter().enumerate() {
                out.push_str(&format!(
                    "\n  - [{}] {}({})",
                    i + 1,
                    file.file_name(),
                    file.data.len()
                ));
            }
        }
        out
    }
}

/// One compiler diagnostic that caused a source file to be dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Error][{}]", self.code)?;
        if let Some(ref file) = self.file {
            write!(f, "[{}]", file)?;
        }
        write!(f, " {}", self.message)?;
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, " | Line: {}, Pos: {}", line, column)?;
        }
        Ok(())
    }
}

/// What a [`Compiler`](crate::compiler::Compiler) reports for one job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationOutcome {
    /// Assembly name; the worker picks one if absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(with = "base64_bytes")]
    pub artifact: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub symbols: Vec<u8>,
    pub succeeded: usize,
    pub failed: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilationOutcome {
    /// An outcome is a success when an artifact was produced.
    pub fn produced_artifact(&self) -> bool {
        !self.artifact.is_empty()
    }

    /// Diagnostics rendered one per line, as carried in an envelope's `extra`.
    pub fn diagnostic_text(&self) -> Option<String> {
        if self.diagnostics.is_empty() {
            return None;
        }
        let mut text = String::new();
        for diagnostic in &self.diagnostics {
            text.push_str(&diagnostic.to_string());
            text.push('\n');
        }
        Some(text)
    }
}

/// Payload of a successful `Data` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationResult {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub symbols: Vec<u8>,
    pub succeeded: usize,
    pub failed: usize,
}

impl CompilationResult {
    pub fn from_outcome(outcome: CompilationOutcome, fallback_name: impl Into<String>) -> Self {
        Self {
            name: outcome.name.unwrap_or_else(|| fallback_name.into()),
            data: outcome.artifact,
            symbols: outcome.symbols,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
