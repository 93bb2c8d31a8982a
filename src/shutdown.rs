//! Graceful shutdown on process exit.
//!
//! Several things can end the process: SIGTERM, SIGINT, the application
//! running out of work, or an explicit call. They all go through one
//! [`ShutdownOrchestrator`], which flushes telemetry exactly once and never
//! waits longer than its timeout. Triggers that arrive after the first one do
//! not flush again; if they carry a signal, the signal is re-delivered with its
//! default disposition so the process terminates the way it normally would.

use crate::config::DistroConfig;
use crate::error::DistroError;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

/// How long a flush may take before the process is let go.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

const FLUSH_THREAD_NAME: &str = "otel-distro-flush";

type FlushFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), DistroError>> + Send>;

/// Termination signals that trigger a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    /// SIGTERM.
    Terminate,
    /// SIGINT.
    Interrupt,
}

impl ExitSignal {
    /// Conventional signal name.
    pub fn name(self) -> &'static str {
        match self {
            ExitSignal::Terminate => "SIGTERM",
            ExitSignal::Interrupt => "SIGINT",
        }
    }

    fn as_nix(self) -> nix::sys::signal::Signal {
        match self {
            ExitSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
            ExitSignal::Interrupt => nix::sys::signal::Signal::SIGINT,
        }
    }
}

/// What asked for the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// A termination signal was received.
    Signal(ExitSignal),
    /// The application has no more work scheduled.
    EmptyEventLoop,
    /// Application code asked for it.
    Explicit,
}

impl ShutdownTrigger {
    fn signal(self) -> Option<ExitSignal> {
        match self {
            ShutdownTrigger::Signal(signal) => Some(signal),
            ShutdownTrigger::EmptyEventLoop | ShutdownTrigger::Explicit => None,
        }
    }
}

/// How a shutdown call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The flush completed.
    Flushed,
    /// The flush returned an error or panicked; it was logged.
    FlushFailed,
    /// The flush did not complete within the timeout.
    TimedOut,
    /// An earlier trigger already performed the shutdown.
    AlreadyShutDown,
}

/// Result of [`first_settled`].
#[derive(Debug)]
pub enum Settled<T> {
    /// The operation finished first.
    Completed(T),
    /// The operation panicked or was cancelled before the timeout.
    Aborted(JoinError),
    /// The timeout elapsed first.
    TimedOut,
}

/// Races `operation` against `timeout`.
///
/// The operation runs as its own task. If the timeout wins, that task is
/// detached and keeps running; its result is ignored. The timer is dropped as
/// soon as either side settles.
pub async fn first_settled<F>(operation: F, timeout: Duration) -> Settled<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let task = tokio::spawn(operation);
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(output)) => Settled::Completed(output),
        Ok(Err(err)) => Settled::Aborted(err),
        Err(_) => Settled::TimedOut,
    }
}

/// Runs blocking `work` on a dedicated thread and awaits its result.
///
/// The thread does not belong to the tokio runtime: a caller that stops
/// waiting leaves it behind, and runtime teardown does not join it.
pub(crate) fn run_detached<T, W>(
    work: W,
) -> impl Future<Output = Result<T, DistroError>> + Send + 'static
where
    T: Send + 'static,
    W: FnOnce() -> Result<T, DistroError> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let spawned = spawn_detached(move || {
        let _ = tx.send(work());
    });
    async move {
        spawned?;
        rx.await.map_err(DistroError::FlushTask)?
    }
}

/// Runs blocking `work` on a dedicated thread, waiting at most `timeout`.
///
/// Returns `Ok(None)` if the timeout elapses or the thread dies before
/// reporting; the thread is then left running.
pub(crate) fn wait_detached<T, W>(work: W, timeout: Duration) -> Result<Option<T>, DistroError>
where
    T: Send + 'static,
    W: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    spawn_detached(move || {
        let _ = tx.send(work());
    })?;
    Ok(rx.recv_timeout(timeout).ok())
}

fn spawn_detached(work: impl FnOnce() + Send + 'static) -> Result<(), DistroError> {
    std::thread::Builder::new()
        .name(FLUSH_THREAD_NAME.to_string())
        .spawn(work)
        .map(drop)
        .map_err(DistroError::FlushThread)
}

/// Re-delivers a termination signal to the current process.
pub trait ProcessControl: Send + Sync {
    /// Restores the default disposition of `signal` and raises it.
    fn redeliver(&self, signal: ExitSignal);
}

/// [`ProcessControl`] acting on the real process.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcess;

impl ProcessControl for OsProcess {
    #[allow(unsafe_code)]
    fn redeliver(&self, signal: ExitSignal) {
        use nix::sys::signal::{self, SigHandler};

        // SAFETY: installing SIG_DFL registers no user code as a handler.
        if let Err(e) = unsafe { signal::signal(signal.as_nix(), SigHandler::SigDfl) } {
            tracing::error!(
                target: "otel_lifecycle",
                error = %e,
                signal = signal.name(),
                "Failed to restore default signal disposition"
            );
        }
        if let Err(e) = signal::raise(signal.as_nix()) {
            tracing::error!(
                target: "otel_lifecycle",
                error = %e,
                signal = signal.name(),
                "Failed to re-raise signal"
            );
        }
    }
}

/// Flushes telemetry once, whichever exit trigger comes first.
pub struct ShutdownOrchestrator<P = OsProcess> {
    flush: Mutex<Option<FlushFn>>,
    invoked: AtomicBool,
    timeout: Duration,
    process: P,
}

impl ShutdownOrchestrator<OsProcess> {
    /// Creates an orchestrator around the SDK's flush-and-close operation.
    pub fn new<F, Fut>(flush: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DistroError>> + Send + 'static,
    {
        Self::with_process(flush, OsProcess)
    }
}

impl<P: ProcessControl> ShutdownOrchestrator<P> {
    /// Creates an orchestrator that re-delivers signals through `process`.
    pub fn with_process<F, Fut>(flush: F, process: P) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), DistroError>> + Send + 'static,
    {
        let flush: FlushFn = Box::new(move || flush().boxed());
        Self {
            flush: Mutex::new(Some(flush)),
            invoked: AtomicBool::new(false),
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            process,
        }
    }

    /// Overrides [`DEFAULT_SHUTDOWN_TIMEOUT`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// True once any trigger has started the shutdown.
    pub fn has_shut_down(&self) -> bool {
        self.invoked.load(Ordering::Acquire)
    }

    /// Flushes telemetry if no earlier trigger did, bounded by the timeout.
    ///
    /// Never fails. Signal triggers end with the signal being re-delivered,
    /// which normally terminates the process; for other triggers exiting is
    /// left to the caller.
    pub async fn shutdown(&self, trigger: ShutdownTrigger) -> ShutdownOutcome {
        let outcome = match self.take_flush() {
            Some(flush) => self.run_flush(flush, trigger).await,
            None => {
                tracing::debug!(
                    target: "otel_lifecycle",
                    ?trigger,
                    "Shutdown already performed"
                );
                ShutdownOutcome::AlreadyShutDown
            }
        };

        if let Some(signal) = trigger.signal() {
            self.process.redeliver(signal);
        }
        outcome
    }

    /// Marks the shutdown as performed without running the stored flush.
    ///
    /// Returns true if no trigger had fired yet, in which case the caller
    /// owns the teardown.
    pub(crate) fn claim(&self) -> bool {
        self.take_flush().is_some()
    }

    fn take_flush(&self) -> Option<FlushFn> {
        self.invoked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.flush
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn run_flush(&self, flush: FlushFn, trigger: ShutdownTrigger) -> ShutdownOutcome {
        match first_settled(flush(), self.timeout).await {
            Settled::Completed(Ok(())) => {
                tracing::debug!(
                    target: "otel_lifecycle",
                    ?trigger,
                    "OpenTelemetry SDK has been shut down"
                );
                ShutdownOutcome::Flushed
            }
            Settled::Completed(Err(e)) => {
                tracing::error!(
                    target: "otel_lifecycle",
                    error = %e,
                    ?trigger,
                    "Error shutting down the OpenTelemetry SDK"
                );
                ShutdownOutcome::FlushFailed
            }
            Settled::Aborted(e) => {
                tracing::error!(
                    target: "otel_lifecycle",
                    error = %e,
                    ?trigger,
                    "OpenTelemetry SDK shutdown task did not complete"
                );
                ShutdownOutcome::FlushFailed
            }
            Settled::TimedOut => {
                tracing::error!(
                    target: "otel_lifecycle",
                    timeout = ?self.timeout,
                    ?trigger,
                    "OpenTelemetry SDK shutdown timed out"
                );
                ShutdownOutcome::TimedOut
            }
        }
    }
}

/// Wires process exit triggers to a [`ShutdownOrchestrator`].
///
/// Signal listening stops when the hooks are dropped.
pub struct ExitHooks<P: ProcessControl + 'static = OsProcess> {
    orchestrator: Arc<ShutdownOrchestrator<P>>,
    flush_on_empty_event_loop: bool,
    signal_task: Option<JoinHandle<()>>,
}

impl<P: ProcessControl + 'static> ExitHooks<P> {
    /// Installs the triggers enabled in `config`.
    ///
    /// Must be called from within a tokio runtime when signal flushing is
    /// enabled.
    ///
    /// # Errors
    ///
    /// Returns [`DistroError::SignalHandler`] if a signal handler cannot be
    /// registered.
    pub fn install(
        orchestrator: Arc<ShutdownOrchestrator<P>>,
        config: &DistroConfig,
    ) -> Result<Self, DistroError> {
        let signal_task = if config.flush_on_signals {
            Some(spawn_signal_listener(Arc::clone(&orchestrator))?)
        } else {
            None
        };

        Ok(Self {
            orchestrator,
            flush_on_empty_event_loop: config.flush_on_empty_event_loop,
            signal_task,
        })
    }

    /// Signals that the application has no more work scheduled.
    ///
    /// Returns `None` when flushing on an empty event loop is disabled.
    pub async fn before_exit(&self) -> Option<ShutdownOutcome> {
        if !self.flush_on_empty_event_loop {
            return None;
        }
        Some(
            self.orchestrator
                .shutdown(ShutdownTrigger::EmptyEventLoop)
                .await,
        )
    }

    /// The orchestrator behind these hooks.
    pub fn orchestrator(&self) -> &Arc<ShutdownOrchestrator<P>> {
        &self.orchestrator
    }
}

impl<P: ProcessControl + 'static> Drop for ExitHooks<P> {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }
}

fn spawn_signal_listener<P: ProcessControl + 'static>(
    orchestrator: Arc<ShutdownOrchestrator<P>>,
) -> Result<JoinHandle<()>, DistroError> {
    let mut terminate = signal(SignalKind::terminate()).map_err(|source| {
        DistroError::SignalHandler {
            signal: ExitSignal::Terminate.name(),
            source,
        }
    })?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(|source| {
        DistroError::SignalHandler {
            signal: ExitSignal::Interrupt.name(),
            source,
        }
    })?;

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = terminate.recv() => ExitSignal::Terminate,
                Some(()) = interrupt.recv() => ExitSignal::Interrupt,
                else => break,
            };
            // A signal arriving while a flush is running must not wait for it.
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .shutdown(ShutdownTrigger::Signal(received))
                    .await;
            });
        }
    }))
}
