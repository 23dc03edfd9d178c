//! Process lifecycle: every reason to exit converges on one shutdown.
//!
//! Triggers: SIGINT, SIGTERM, loss of the parent process, a `Shutdown`
//! envelope from the peer, or the message stream closing. The first trigger
//! wins; later ones are ignored, so racing triggers never shut down twice.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broker::MessageBroker;
use crate::config::LifecycleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    Interrupt,
    Terminate,
    /// The watched parent went away while we were running.
    ParentShutdown,
    /// The watched parent was already gone at startup.
    ParentExited,
    /// The peer sent a `Shutdown` envelope.
    PeerRequested,
    /// The peer closed the message stream.
    StreamClosed,
}

impl std::fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Interrupt => "SIGINT (Ctrl + C)",
            Self::Terminate => "SIGTERM",
            Self::ParentShutdown => "parent process shutdown",
            Self::ParentExited => "parent process exited",
            Self::PeerRequested => "compiler stream",
            Self::StreamClosed => "message stream closed",
        };
        f.write_str(s)
    }
}

/// Shared, cloneable handle to the one-shot shutdown.
#[derive(Clone)]
pub struct ShutdownSignal {
    cause: Arc<watch::Sender<Option<ShutdownCause>>>,
    token: CancellationToken,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (cause, _) = watch::channel(None);
        Self {
            cause: Arc::new(cause),
            token: CancellationToken::new(),
        }
    }

    /// Request shutdown. Returns true only for the call that won.
    pub fn trigger(&self, cause: ShutdownCause) -> bool {
        let won = self.cause.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause);
                true
            } else {
                false
            }
        });

        if won {
            tracing::info!(%cause, "Termination request has been received from {}", cause);
            self.token.cancel();
        } else {
            tracing::debug!(%cause, "Ignoring termination request, shutdown already underway");
        }
        won
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        *self.cause.borrow()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancelled once shutdown has been triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the winning cause.
    pub async fn triggered(&self) -> ShutdownCause {
        let mut rx = self.cause.subscribe();
        loop {
            if let Some(cause) = *rx.borrow_and_update() {
                return cause;
            }
            // The sender lives in `self`, so this only fails if it is dropped elsewhere.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("cause", &self.cause())
            .finish()
    }
}

/// Answers "is this process still running?".
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes with a null signal.
///
/// The process that launched the worker gets a stricter check: once the worker
/// has been re-parented, the launcher is gone even if its pid still answers
/// (an unreaped zombie, or the pid handed to a new process).
#[derive(Debug, Clone, Copy)]
pub struct ProcessProbe {
    launch_parent: Option<u32>,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            launch_parent: current_parent(),
        }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn current_parent() -> Option<u32> {
    u32::try_from(nix::unistd::getppid().as_raw()).ok()
}

#[cfg(not(unix))]
fn current_parent() -> Option<u32> {
    None
}

#[cfg(unix)]
impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        if self.launch_parent == Some(pid) {
            return current_parent() == Some(pid);
        }

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        let answers = match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists, owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        };
        answers && !is_zombie(pid)
    }
}

/// A zombie still answers signals but has already exited.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The command name is parenthesised and may itself contain ") ".
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
impl LivenessProbe for ProcessProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

pub struct LifecycleSupervisor {
    config: LifecycleConfig,
    signal: ShutdownSignal,
    probe: Arc<dyn LivenessProbe>,
    broker: Option<Arc<MessageBroker>>,
    os_signals: bool,
}

impl LifecycleSupervisor {
    pub fn new(config: LifecycleConfig, signal: ShutdownSignal) -> Self {
        Self {
            config,
            signal,
            probe: Arc::new(ProcessProbe::new()),
            broker: None,
            os_signals: true,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Broker to stop once shutdown is triggered.
    pub fn with_broker(mut self, broker: Arc<MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_os_signals(mut self, enabled: bool) -> Self {
        self.os_signals = enabled;
        self
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// Watch every trigger until one fires, then stop the broker.
    pub async fn run(self) -> ShutdownCause {
        let os = async {
            if self.os_signals {
                watch_os_signals(&self.signal).await;
            }
        };
        let parent = watch_parent(
            self.config.parent_pid,
            self.config.parent_poll_interval,
            Arc::clone(&self.probe),
            &self.signal,
        );

        let cause = tokio::select! {
            cause = self.signal.triggered() => cause,
            _ = async { tokio::join!(os, parent) } => self.signal.triggered().await,
        };

        if let Some(ref broker) = self.broker {
            broker.stop().await;
        }
        tracing::debug!(%cause, "Lifecycle supervisor finished");
        cause
    }
}

async fn watch_os_signals(shutdown: &ShutdownSignal) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::SignalKind;
        match tokio::signal::unix::signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => shutdown.trigger(ShutdownCause::Interrupt),
        _ = terminate => shutdown.trigger(ShutdownCause::Terminate),
    };
}

async fn watch_parent(
    parent_pid: Option<u32>,
    poll_interval: Duration,
    probe: Arc<dyn LivenessProbe>,
    shutdown: &ShutdownSignal,
) {
    let Some(pid) = parent_pid else {
        tracing::warn!(
            "No parent process id supplied, this worker may outlive an improperly terminated parent"
        );
        return;
    };

    if !probe.is_alive(pid) {
        tracing::warn!(parent_pid = pid, "Parent process is not running");
        shutdown.trigger(ShutdownCause::ParentExited);
        return;
    }

    tracing::info!(parent_pid = pid, "Watching parent process");
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !probe.is_alive(pid) {
            shutdown.trigger(ShutdownCause::ParentShutdown);
            return;
        }
    }
}
