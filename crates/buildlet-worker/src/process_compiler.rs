//! Compiler backend run as a child process, one process per job.
//!
//! The backend reads a JSON manifest (the job plus worker-level compiler
//! flags) from stdin and writes a JSON [`CompilationOutcome`] to stdout.
//! Anything on stderr is logged. A non-zero exit is a backend failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use buildlet::config::CompilerConfig;
use buildlet::{CompilationOutcome, CompileError, Compiler, Job};

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    job: &'a Job,
    allow_unsafe: bool,
    use_standard_libraries: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    framework_path: Option<&'a Path>,
}

#[derive(Debug, Clone)]
pub struct ProcessCompiler {
    command: Option<PathBuf>,
    args: Vec<String>,
    allow_unsafe: bool,
    use_standard_libraries: bool,
    framework_path: Option<PathBuf>,
}

impl ProcessCompiler {
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            allow_unsafe: config.allow_unsafe,
            use_standard_libraries: config.use_standard_libraries,
            framework_path: config.framework_path.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.command.is_some()
    }

    fn manifest(&self, job: &Job) -> Result<Vec<u8>, CompileError> {
        serde_json::to_vec(&Manifest {
            job,
            allow_unsafe: self.allow_unsafe,
            use_standard_libraries: self.use_standard_libraries,
            framework_path: self.framework_path.as_deref(),
        })
        .map_err(|e| CompileError::backend(format!("failed to encode job manifest: {}", e)))
    }
}

#[async_trait]
impl Compiler for ProcessCompiler {
    async fn compile(
        &self,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<CompilationOutcome, CompileError> {
        let Some(command) = &self.command else {
            return Err(CompileError::backend("no compiler backend configured"));
        };
        let manifest = self.manifest(&job)?;

        let mut child = Command::new(command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CompileError::backend(format!("failed to start {}: {}", command.display(), e))
            })?;
        tracing::debug!(command = %command.display(), pid = ?child.id(), "Spawned compiler backend");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CompileError::backend("backend stdin was not captured"))?;
        let feed = async move {
            stdin.write_all(&manifest).await?;
            stdin.shutdown().await
        };

        // Dropping the output future drops the child, and kill_on_drop reaps it.
        let (fed, output) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(command = %command.display(), "Killing cancelled compiler backend");
                return Err(CompileError::Cancelled);
            }
            result = async { tokio::join!(feed, child.wait_with_output()) } => result,
        };

        let output = output.map_err(|e| {
            CompileError::backend(format!("failed to wait for {}: {}", command.display(), e))
        })?;
        if let Err(e) = fed {
            tracing::debug!(error = %e, "Backend did not read the whole manifest");
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !output.status.success() {
            return Err(CompileError::backend(if stderr.is_empty() {
                format!("{} exited with {}", command.display(), output.status)
            } else {
                format!("{} exited with {}: {}", command.display(), output.status, stderr)
            }));
        }
        if !stderr.is_empty() {
            tracing::debug!(stderr = %stderr, "Compiler backend stderr");
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| CompileError::backend(format!("invalid backend output: {}", e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use buildlet::SourceFile;

    use super::*;

    fn shell(script: &str, extra: &[&str]) -> ProcessCompiler {
        let mut args = vec!["-c".to_string(), script.to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        ProcessCompiler::from_config(&CompilerConfig {
            command: Some(PathBuf::from("sh")),
            args,
            allow_unsafe: true,
            ..CompilerConfig::default()
        })
    }

    fn job() -> Job {
        Job {
            sources: vec![SourceFile::new("Program.cs", b"class P {}".to_vec())],
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn unconfigured_backend_fails_every_job() {
        let compiler = ProcessCompiler::from_config(&CompilerConfig::default());
        assert!(!compiler.is_configured());
        let err = compiler
            .compile(job(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "compiler backend failed: no compiler backend configured"
        );
    }

    #[tokio::test]
    async fn outcome_is_read_from_stdout() {
        let compiler = shell(
            r#"cat > /dev/null; printf '{"name":"App","artifact":"AQI=","succeeded":1}'"#,
            &[],
        );
        let outcome = compiler
            .compile(job(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.name.as_deref(), Some("App"));
        assert_eq!(outcome.artifact, vec![1, 2]);
        assert_eq!(outcome.succeeded, 1);
        assert!(outcome.symbols.is_empty());
    }

    #[tokio::test]
    async fn manifest_carries_job_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("manifest.json");
        let compiler = shell(r#"cat > "$0"; printf '{}'"#, &[capture.to_str().unwrap()]);
        compiler
            .compile(job(), CancellationToken::new())
            .await
            .unwrap();

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&capture).unwrap()).unwrap();
        assert_eq!(manifest["job"]["sources"][0]["name"], "Program.cs");
        assert_eq!(manifest["allow_unsafe"], true);
        assert_eq!(manifest["use_standard_libraries"], false);
        assert!(manifest.get("framework_path").is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let compiler = shell("cat > /dev/null; echo 'csc: out of memory' >&2; exit 3", &[]);
        let err = compiler
            .compile(job(), CancellationToken::new())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, CompileError::Backend(_)));
        assert!(message.contains("csc: out of memory"), "{message}");
    }

    #[tokio::test]
    async fn garbage_output_is_a_backend_failure() {
        let compiler = shell("cat > /dev/null; echo 'not json'", &[]);
        let err = compiler
            .compile(job(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid backend output"));
    }

    #[tokio::test]
    async fn missing_executable_fails_to_start() {
        let compiler = ProcessCompiler::from_config(&CompilerConfig {
            command: Some(PathBuf::from("/nonexistent/buildlet-backend")),
            ..CompilerConfig::default()
        });
        let err = compiler
            .compile(job(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_backend() {
        let compiler = shell("sleep 30", &[]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            compiler.compile(job(), cancel),
        )
        .await
        .expect("cancelled compile should return promptly");
        assert!(matches!(result, Err(CompileError::Cancelled)));
    }
}
