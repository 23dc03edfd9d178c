//! buildlet: IPC broker and job dispatch for child-process compilation workers.
//!
//! A parent process spawns the worker and talks to it over a framed duplex
//! stream. The [`MessageBroker`] owns that stream, the [`JobDispatcher`] feeds
//! `Data` envelopes to a [`Compiler`], and the [`LifecycleSupervisor`] turns
//! signals and parent loss into one orderly shutdown.

pub mod bridge;
pub mod broker;
pub mod compiler;
pub mod config;
pub mod dispatcher;
pub mod job;
pub mod lifecycle;

pub use bridge::protocol::{Envelope, EnvelopeId, MessageType};
pub use bridge::transport::{Transport, TransportInfo};
pub use broker::{BrokerError, ConnectionState, EnvelopeSink, MessageBroker};
pub use compiler::{CompileError, Compiler};
pub use config::WorkerConfig;
pub use dispatcher::JobDispatcher;
pub use job::{CompilationOutcome, CompilationResult, Job, JobOptions, SourceFile};
pub use lifecycle::{LifecycleSupervisor, ShutdownCause, ShutdownSignal};

pub const BUILDLET_VERSION: &str = env!("CARGO_PKG_VERSION");
