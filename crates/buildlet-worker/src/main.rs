//! buildlet-worker: a compilation worker driven by its parent over a message stream.
//!
//! Startup order:
//! 1. Load config (file, environment, flags) and install tracing
//! 2. With `--message-stream`: open the transport, announce `Ready`, start the
//!    job dispatcher
//! 3. Supervise until a signal, parent loss or the peer ends the session

mod cli;
mod logging;
mod process_compiler;
mod settings;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use buildlet::{
    BUILDLET_VERSION, EnvelopeSink, JobDispatcher, LifecycleSupervisor, MessageBroker,
    ShutdownSignal, WorkerConfig,
};

use crate::cli::Cli;
use crate::process_compiler::ProcessCompiler;

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = settings::load(&cli)?;
    logging::init_tracing(&config.logging)?;

    info!(
        version = BUILDLET_VERSION,
        level = %config.logging.level,
        "Starting buildlet worker"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let result = runtime.block_on(run(config));
    // A blocked stdin read can never be cancelled; don't wait on it.
    runtime.shutdown_background();
    result
}

async fn run(config: WorkerConfig) -> anyhow::Result<ExitCode> {
    let shutdown = ShutdownSignal::new();
    let mut supervisor = LifecycleSupervisor::new(config.lifecycle.clone(), shutdown.clone());
    let mut dispatcher = None;

    if config.compiler.enable_message_stream {
        let broker = MessageBroker::new(config.broker.clone());
        match broker.connect(&config.transport.endpoint).await {
            Ok(inbound) => {
                info!(transport = %config.transport.endpoint, "Message stream connected");
                broker.send_ready().context("failed to announce readiness")?;

                let compiler = Arc::new(ProcessCompiler::from_config(&config.compiler));
                if !compiler.is_configured() {
                    warn!("No compiler backend configured, every job will fail");
                }
                let sink: Arc<dyn EnvelopeSink> = broker.clone();
                let jobs = JobDispatcher::new(compiler, sink, shutdown.clone())
                    .with_default_encoding(config.compiler.default_encoding.clone());
                dispatcher = Some(tokio::spawn(jobs.run(inbound)));
                supervisor = supervisor.with_broker(broker);
            }
            Err(e) if config.transport.required => {
                return Err(e).with_context(|| {
                    format!("required transport {} is unavailable", config.transport.endpoint)
                });
            }
            Err(e) => {
                warn!(error = %e, "Message stream unavailable, running without a peer");
            }
        }
    } else {
        info!("Message stream disabled, waiting for termination");
    }

    let cause = supervisor.run().await;
    if let Some(task) = dispatcher
        && let Err(e) = task.await
    {
        error!(error = %e, "Job dispatcher task failed");
    }
    info!(%cause, "Worker exiting");
    Ok(ExitCode::SUCCESS)
}
