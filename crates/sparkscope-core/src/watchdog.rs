//! Command execution watchdog.
//!
//! Operator commands run one at a time in arrival order (a fair tokio mutex).
//! Each execution gets a supervisor task that wakes every
//! `warning_interval_secs`, up to `max_warnings` times, and warns if the
//! command has not finished:
//!
//! ```text
//! execute(cmd)
//!   ├── supervisor ──► sleep(interval) ──► still running? ──► warn (+ trace)
//!   └── lock (FIFO) ──► heartbeat.attach_executor() ──► body(heartbeat) ──► done ──► supervisor interrupted
//! ```
//!
//! A command still queued behind another has no executor yet; that case gets
//! its own warning. Nothing is ever forcibly cancelled, but dropping an
//! `execute` future takes its supervisor down with it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::WatchdogSettings;
use crate::display::MessageSink;
use crate::error::Result;

/// Shown when no trace can be produced.
pub const NO_TRACE: &str = "could not capture trace";

const IGNORE_HINT: &str =
    "If the command subsequently completes without any errors, this warning should be ignored.";

/// Produces a stack trace of the thread/task running a command.
pub trait DiagnosticDump: Send + Sync {
    fn dump(&self, executor: &str) -> Result<String>;
}

// =============================================================================
// Heartbeat
// =============================================================================

/// Progress reported by a running command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandProgress {
    pub command: String,
    pub stage: String,
    /// Epoch ms of the last progress update.
    pub updated_at_ms: u64,
}

/// Who is running a command, as seen by its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ExecutorSlot {
    Queued,
    Running(String),
    Exited,
}

/// Marks the executor gone when the body finishes or is dropped.
struct AttachedExecutor<'a>(&'a CommandHeartbeat);

impl Drop for AttachedExecutor<'_> {
    fn drop(&mut self) {
        self.0.set_executor(ExecutorSlot::Exited);
    }
}

/// Aborts the supervisor when `execute` is dropped mid-flight.
struct SupervisorGuard(JoinHandle<()>);

impl Drop for SupervisorGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Shared between a command body and its supervisor.
#[derive(Debug)]
pub struct CommandHeartbeat {
    command: String,
    executor: Mutex<ExecutorSlot>,
    stage: Mutex<(String, Instant)>,
    updated_at_ms: AtomicU64,
    completed: AtomicBool,
}

impl CommandHeartbeat {
    fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            executor: Mutex::new(ExecutorSlot::Queued),
            stage: Mutex::new(("queued".to_string(), Instant::now())),
            updated_at_ms: AtomicU64::new(epoch_ms()),
            completed: AtomicBool::new(false),
        }
    }

    /// Record that the command reached `stage`.
    pub fn record(&self, stage: &str) {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner) =
            (stage.to_string(), Instant::now());
        self.updated_at_ms.store(epoch_ms(), Ordering::SeqCst);
    }

    fn set_executor(&self, slot: ExecutorSlot) {
        *self.executor.lock().unwrap_or_else(PoisonError::into_inner) = slot;
    }

    fn executor_slot(&self) -> ExecutorSlot {
        self.executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn attach_executor(&self) -> AttachedExecutor<'_> {
        let thread = std::thread::current();
        let name = thread
            .name()
            .map_or_else(|| format!("{:?}", thread.id()), str::to_string);
        self.set_executor(ExecutorSlot::Running(name));
        self.record("running");
        AttachedExecutor(self)
    }

    /// Name of the thread running the body, while it runs.
    #[must_use]
    pub fn executor(&self) -> Option<String> {
        match self.executor_slot() {
            ExecutorSlot::Running(name) => Some(name),
            ExecutorSlot::Queued | ExecutorSlot::Exited => None,
        }
    }

    /// Still waiting for an earlier command to finish.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        self.executor_slot() == ExecutorSlot::Queued
    }

    #[must_use]
    pub fn progress(&self) -> CommandProgress {
        let stage = self
            .stage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .clone();
        CommandProgress {
            command: self.command.clone(),
            stage,
            updated_at_ms: self.updated_at_ms.load(Ordering::SeqCst),
        }
    }

    fn stage_with_age(&self) -> (String, Duration) {
        let guard = self.stage.lock().unwrap_or_else(PoisonError::into_inner);
        (guard.0.clone(), guard.1.elapsed())
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Watchdog
// =============================================================================

/// Serialises command execution and warns about stuck commands.
pub struct CommandWatchdog {
    lock: Arc<tokio::sync::Mutex<()>>,
    interval: Duration,
    max_warnings: u32,
    dump: Option<Arc<dyn DiagnosticDump>>,
    sink: Arc<dyn MessageSink>,
}

impl std::fmt::Debug for CommandWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandWatchdog")
            .field("interval", &self.interval)
            .field("max_warnings", &self.max_warnings)
            .field("has_dump", &self.dump.is_some())
            .finish_non_exhaustive()
    }
}

impl CommandWatchdog {
    #[must_use]
    pub fn new(
        settings: &WatchdogSettings,
        dump: Option<Arc<dyn DiagnosticDump>>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            interval: Duration::from_secs(settings.warning_interval_secs.max(1)),
            max_warnings: settings.max_warnings,
            dump,
            sink,
        }
    }

    /// Run `body` once every earlier command has finished, supervised.
    /// The body's error is logged and returned unchanged.
    pub async fn execute<T, F, Fut>(&self, command: &str, body: F) -> Result<T>
    where
        F: FnOnce(Arc<CommandHeartbeat>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let heartbeat = Arc::new(CommandHeartbeat::new(command));
        let (done_tx, done_rx) = oneshot::channel();
        let mut supervisor = SupervisorGuard(tokio::spawn(supervise(
            Arc::clone(&heartbeat),
            self.interval,
            self.max_warnings,
            self.dump.clone(),
            Arc::clone(&self.sink),
            done_rx,
        )));

        let result = {
            let _guard = self.lock.lock().await;
            let _executor = heartbeat.attach_executor();
            let result = body(Arc::clone(&heartbeat)).await;
            heartbeat.completed.store(true, Ordering::SeqCst);
            result
        };

        let _ = done_tx.send(());
        if let Err(e) = (&mut supervisor.0).await {
            debug!(command, error = %e, "Command supervisor ended abnormally");
        }
        if let Err(e) = &result {
            warn!(command, error = %e, "Command failed");
        }
        result
    }
}

async fn supervise(
    heartbeat: Arc<CommandHeartbeat>,
    interval: Duration,
    max_warnings: u32,
    dump: Option<Arc<dyn DiagnosticDump>>,
    sink: Arc<dyn MessageSink>,
    mut done: oneshot::Receiver<()>,
) {
    let started = Instant::now();
    for warning in 1..=max_warnings {
        tokio::select! {
            _ = &mut done => return,
            () = tokio::time::sleep(interval) => {}
        }
        if heartbeat.is_completed() {
            return;
        }

        let elapsed_secs = started.elapsed().as_secs();
        let command = heartbeat.command.as_str();
        match heartbeat.executor_slot() {
            ExecutorSlot::Queued => {
                warn!(command, elapsed_secs, warning, "Command still queued");
                sink.reply_prefixed(&format!(
                    "A command execution has not started after {elapsed_secs} seconds; it is still queued behind another command."
                ));
            }
            ExecutorSlot::Exited => {
                warn!(command, elapsed_secs, warning, "Command has no executor");
                sink.reply_prefixed(&format!(
                    "A command execution has not completed after {elapsed_secs} seconds but there is no executor present. Perhaps the executor shutdown?"
                ));
            }
            ExecutorSlot::Running(executor) => {
                let trace = match &dump {
                    Some(dump) => dump.dump(&executor).unwrap_or_else(|e| {
                        warn!(command, executor = %executor, error = %e, "Diagnostic dump failed");
                        NO_TRACE.to_string()
                    }),
                    None => NO_TRACE.to_string(),
                };
                let (stage, age) = heartbeat.stage_with_age();
                warn!(
                    command,
                    elapsed_secs,
                    warning,
                    stage = %stage,
                    stage_age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                    "Command might be stuck"
                );
                sink.reply_prefixed(&format!(
                    "A command execution has not completed after {elapsed_secs} seconds, it *might* be stuck. Last progress: {stage} ({}s ago). Trace: {trace}",
                    age.as_secs()
                ));
            }
        }
        sink.reply_prefixed(IGNORE_HINT);
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}
