//! The compilation collaborator.
//!
//! The worker never compiles anything itself. A [`Compiler`] is handed one
//! [`Job`] at a time and reports a [`CompilationOutcome`]; how it gets there
//! (an in-process library, a child process, a remote service) is its business.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::job::{CompilationOutcome, Job};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The job cannot be compiled as submitted.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("compilation cancelled")]
    Cancelled,

    /// The backend failed to produce an outcome at all.
    #[error("compiler backend failed: {0}")]
    Backend(String),
}

impl CompileError {
    pub fn invalid_job(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Compiles jobs. Called with at most one job in flight per worker.
#[async_trait]
pub trait Compiler: Send + Sync + 'static {
    /// Compile `job`. Implementations should return promptly with
    /// [`CompileError::Cancelled`] once `cancel` fires.
    async fn compile(
        &self,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<CompilationOutcome, CompileError>;
}

#[async_trait]
impl<C: Compiler + ?Sized> Compiler for std::sync::Arc<C> {
    async fn compile(
        &self,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<CompilationOutcome, CompileError> {
        (**self).compile(job, cancel).await
    }
}
