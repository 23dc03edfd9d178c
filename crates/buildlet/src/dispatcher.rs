//! Job dispatcher - turns inbound `Data` envelopes into compilations.
//!
//! Architecture:
//! - Intake loop: reads the broker's inbound channel, answers control
//!   envelopes immediately and queues jobs
//! - Compile loop: runs queued jobs one at a time through the [`Compiler`]
//!
//! Every job gets exactly one response carrying the request id: `Data` with a
//! [`CompilationResult`] payload, or `Error` with the failure in `extra`.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::bridge::protocol::{Envelope, EnvelopeId, MessageType};
use crate::broker::EnvelopeSink;
use crate::compiler::{CompileError, Compiler};
use crate::job::{CompilationOutcome, CompilationResult, Job};
use crate::lifecycle::{ShutdownCause, ShutdownSignal};

const COMPILE_TARGET: &str = "buildlet::compile";

type QueuedJob = (EnvelopeId, Vec<u8>);

pub struct JobDispatcher<C: Compiler> {
    compiler: Arc<C>,
    sink: Arc<dyn EnvelopeSink>,
    shutdown: ShutdownSignal,
    default_encoding: String,
}

impl<C: Compiler> JobDispatcher<C> {
    pub fn new(compiler: Arc<C>, sink: Arc<dyn EnvelopeSink>, shutdown: ShutdownSignal) -> Self {
        Self {
            compiler,
            sink,
            shutdown,
            default_encoding: "utf-8".to_string(),
        }
    }

    pub fn with_default_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.default_encoding = encoding.into();
        self
    }

    /// Run until shutdown is triggered or the inbound channel closes.
    ///
    /// A closed channel means the stream is gone, which is itself a shutdown.
    pub async fn run(self, inbound: mpsc::UnboundedReceiver<Envelope>) {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        tokio::join!(self.intake(inbound, job_tx), self.compile_loop(job_rx));
        tracing::debug!("Job dispatcher exiting");
    }

    async fn intake(
        &self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        jobs: mpsc::UnboundedSender<QueuedJob>,
    ) {
        let token = self.shutdown.token();
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                msg = inbound.recv() => match msg {
                    Some(envelope) => self.route(envelope, &jobs),
                    None => {
                        self.shutdown.trigger(ShutdownCause::StreamClosed);
                        break;
                    }
                },
            }
        }
    }

    fn route(&self, envelope: Envelope, jobs: &mpsc::UnboundedSender<QueuedJob>) {
        let id = envelope.id;
        match envelope.kind {
            MessageType::Data => {
                tracing::debug!(%id, payload_len = envelope.payload.len(), "Job queued");
                if jobs.send((id, envelope.payload)).is_err() {
                    tracing::warn!(%id, "Compile loop gone, dropping job");
                }
            }
            MessageType::Heartbeat => {
                tracing::trace!(%id, "Heartbeat received");
            }
            MessageType::Shutdown => {
                tracing::info!(%id, "Shutdown requested by peer");
                self.shutdown.trigger(ShutdownCause::PeerRequested);
            }
            other => {
                tracing::debug!(%id, kind = %other, "Ignoring envelope");
            }
        }
    }

    async fn compile_loop(&self, mut jobs: mpsc::UnboundedReceiver<QueuedJob>) {
        let token = self.shutdown.token();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                job = jobs.recv() => job,
            };
            let Some((id, payload)) = next else {
                break;
            };

            let response = self.process(id, payload).await;
            tracing::debug!(target: COMPILE_TARGET, %id, kind = %response.kind, "Pushing job back to parent");
            if let Err(e) = self.sink.enqueue(response) {
                tracing::warn!(%id, error = %e, "Failed to queue job response");
            }
        }

        let mut abandoned = 0;
        while jobs.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::warn!(abandoned, "Dropped queued jobs on shutdown");
        }
    }

    /// Compile one job payload into its single response envelope.
    async fn process(&self, id: EnvelopeId, payload: Vec<u8>) -> Envelope {
        let started = Instant::now();

        let mut job = match Job::from_slice(&payload) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(target: COMPILE_TARGET, %id, error = %e, "Failed to decode job");
                return Envelope::error(id, format!("invalid job payload: {}", e));
            }
        };
        job.apply_defaults(&self.default_encoding);

        let total = job.sources.len();
        tracing::debug!(
            target: COMPILE_TARGET,
            %id,
            sources = total,
            references = job.references.len(),
            "Received job"
        );
        tracing::info!(
            target: COMPILE_TARGET,
            "Starting compilation of job {} | Total sources: {}",
            id,
            total
        );
        if tracing::enabled!(target: COMPILE_TARGET, tracing::Level::DEBUG) {
            tracing::debug!(target: COMPILE_TARGET, "{}{}", job.options, job.file_listing());
        }

        let outcome = match job.validate() {
            Ok(()) => self.compile(job).await,
            Err(e) => Err(e),
        };
        let elapsed_ms = started.elapsed().as_millis();

        match outcome {
            Ok(outcome) => {
                if outcome.produced_artifact() {
                    tracing::info!(
                        target: COMPILE_TARGET,
                        "Successfully compiled {}/{} sources for job {} in {}ms",
                        outcome.succeeded,
                        total,
                        id,
                        elapsed_ms
                    );
                } else {
                    tracing::error!(
                        target: COMPILE_TARGET,
                        "Failed to compile job {} in {}ms",
                        id,
                        elapsed_ms
                    );
                }
                data_response(id, outcome)
            }
            Err(e) => {
                tracing::error!(target: COMPILE_TARGET, "Error while compiling job {} - {}", id, e);
                Envelope::error(id, e.to_string())
            }
        }
    }

    /// Run the compiler on its own task so a panic still yields a response.
    async fn compile(&self, job: Job) -> Result<CompilationOutcome, CompileError> {
        let compiler = Arc::clone(&self.compiler);
        let cancel = self.shutdown.token().child_token();
        match tokio::spawn(async move { compiler.compile(job, cancel).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(CompileError::backend("compiler panicked")),
            Err(_) => Err(CompileError::Cancelled),
        }
    }
}

fn data_response(id: EnvelopeId, outcome: CompilationOutcome) -> Envelope {
    let diagnostics = outcome.diagnostic_text();
    let fallback_name = format!("buildlet-{}", uuid::Uuid::new_v4().simple());
    let result = CompilationResult::from_outcome(outcome, fallback_name);

    match result.to_bytes() {
        Ok(payload) => {
            let mut envelope = Envelope::data(id, payload);
            if let Some(text) = diagnostics {
                envelope.append_extra(&text);
            }
            envelope
        }
        Err(e) => Envelope::error(id, format!("failed to serialize compilation result: {}", e)),
    }
}
