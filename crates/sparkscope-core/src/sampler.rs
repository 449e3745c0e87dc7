//! Sampler session state machine.
//!
//! A [`SamplerSession`] owns one profiling run:
//!
//! ```text
//! Idle ──► Starting ──► Running(Foreground | Background) ──► Stopping ──► Completed
//!   │          │                      │
//!   └──────────┴──────────────────────┴──────────────────────────────────► Cancelled
//! ```
//!
//! The state is an atomic `u8` and every transition is a compare-and-swap, so
//! concurrent `stop`/`cancel`/timeout calls have exactly one winner and the
//! completion channel is resolved exactly once.
//!
//! Captures run on a tokio task that polls the state before each capture and
//! exits once the session is no longer running; it never blocks the tick
//! source. A timeout is a one-shot `sleep` task that performs the same stop as
//! an operator would.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::call_tree::{CallTreeMerger, MergeMode};
use crate::capture::{CaptureSnapshot, StackCapture};
use crate::config::SamplerSettings;
use crate::error::{Error, Result};
use crate::export::{SessionMetadata, SessionResult};
use crate::thread_policy::{ThreadCapturePolicy, ThreadGrouping};
use crate::tick_monitor::TickReport;
use crate::trust::ViewerSocket;

/// Hotspots recorded with every result.
const RESULT_HOTSPOTS: usize = 10;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SamplerState {
    Idle = 0,
    Starting = 1,
    RunningForeground = 2,
    RunningBackground = 3,
    Stopping = 4,
    Completed = 5,
    Cancelled = 6,
}

impl SamplerState {
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::RunningForeground | Self::RunningBackground)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::RunningForeground,
            3 => Self::RunningBackground,
            4 => Self::Stopping,
            5 => Self::Completed,
            _ => Self::Cancelled,
        }
    }
}

impl std::fmt::Display for SamplerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::RunningForeground => "running",
            Self::RunningBackground => "running (background)",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a session left the running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Operator stop (upload requested).
    Manual,
    /// The configured timeout elapsed.
    Timeout,
    /// A background session was superseded by an operator-started one.
    Replaced,
    /// Platform shutdown.
    Shutdown,
}

/// How a session ended, delivered once on the completion channel.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Completed {
        reason: StopReason,
        result: Arc<SessionResult>,
    },
    Cancelled,
}

impl SessionOutcome {
    #[must_use]
    pub fn result(&self) -> Option<&Arc<SessionResult>> {
        match self {
            Self::Completed { result, .. } => Some(result),
            Self::Cancelled => None,
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<StopReason> {
        match self {
            Self::Completed { reason, .. } => Some(*reason),
            Self::Cancelled => None,
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Sampling interval from milliseconds. Rejects values that are not
/// positive or do not fit a `Duration`.
pub fn interval_from_ms(ms: f64) -> Result<Duration> {
    let interval = Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| {
        Error::InvalidConfiguration(format!("The specified interval ({ms} ms) is out of range."))
    })?;
    if interval.is_zero() {
        return Err(Error::InvalidConfiguration(
            "sampling interval must be greater than zero".to_string(),
        ));
    }
    Ok(interval)
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub policy: ThreadCapturePolicy,
    pub grouping: ThreadGrouping,
    pub merge_mode: MergeMode,
    pub interval: Duration,
    /// Auto-stop after this long. `None` runs until stopped.
    pub timeout: Option<Duration>,
    pub background: bool,
    /// Keep only captures taken during ticks longer than this.
    pub only_ticks_over: Option<Duration>,
    pub creator: Option<String>,
    pub comment: Option<String>,
}

impl SamplerConfig {
    #[must_use]
    pub fn new(policy: ThreadCapturePolicy) -> Self {
        Self {
            policy,
            grouping: ThreadGrouping::ByPoolName,
            merge_mode: MergeMode::SameMethod,
            interval: Duration::from_millis(4),
            timeout: None,
            background: false,
            only_ticks_over: None,
            creator: None,
            comment: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn with_grouping(mut self, grouping: ThreadGrouping) -> Self {
        self.grouping = grouping;
        self
    }

    #[must_use]
    pub fn with_merge_mode(mut self, merge_mode: MergeMode) -> Self {
        self.merge_mode = merge_mode;
        self
    }

    #[must_use]
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    #[must_use]
    pub fn only_ticks_over(mut self, threshold: Duration) -> Self {
        self.only_ticks_over = Some(threshold);
        self
    }

    #[must_use]
    pub fn created_by(mut self, creator: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self
    }

    /// When a session started at `now` should auto-stop. Fails if the
    /// timeout cannot be represented as a deadline.
    pub fn auto_end_from(&self, now: Instant) -> Result<Option<Instant>> {
        self.timeout
            .map(|timeout| {
                now.checked_add(timeout).ok_or_else(|| {
                    Error::InvalidConfiguration(format!(
                        "The specified timeout ({} seconds) is too large.",
                        timeout.as_secs()
                    ))
                })
            })
            .transpose()
    }

    /// Check operator-supplied values against the platform limits.
    ///
    /// Returns advisory lines to show the operator when the config is
    /// accepted but likely to give poor results.
    pub fn validate(&self, limits: &SamplerSettings) -> Result<Vec<String>> {
        let mut advisories = Vec::new();
        if self.interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "sampling interval must be greater than zero".to_string(),
            ));
        }
        if let Some(timeout) = self.timeout {
            if self.background {
                return Err(Error::InvalidConfiguration(
                    "a background profiler cannot have a timeout".to_string(),
                ));
            }
            self.auto_end_from(Instant::now())?;
            if timeout <= Duration::from_secs(limits.min_timeout_secs) {
                return Err(Error::InvalidConfiguration(format!(
                    "The specified timeout is not long enough for accurate results to be formed. \
                     Please choose a value greater than {}.",
                    limits.min_timeout_secs
                )));
            }
            if timeout < Duration::from_secs(limits.recommended_timeout_secs) {
                advisories.push(format!(
                    "The accuracy of the output will significantly improve when the profiler is \
                     able to run for longer periods. Consider setting a timeout value over {} seconds.",
                    limits.recommended_timeout_secs
                ));
            }
        }
        Ok(advisories)
    }
}

// =============================================================================
// Per-tick buffering (only_ticks_over)
// =============================================================================

/// Holds captures until the tick they were taken in ends, then keeps them
/// only if that tick ran over the threshold.
#[derive(Debug)]
pub struct TickFilter {
    threshold: Duration,
    last_tick: Option<u64>,
    pending: Vec<(Vec<CaptureSnapshot>, Duration)>,
}

impl TickFilter {
    #[must_use]
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_tick: None,
            pending: Vec::new(),
        }
    }

    pub fn buffer(&mut self, snapshots: Vec<CaptureSnapshot>, interval: Duration) {
        self.pending.push((snapshots, interval));
    }

    /// Apply a tick-end report. Returns the captures to keep; anything
    /// buffered before the first report is discarded because its tick length
    /// is unknown.
    pub fn on_tick(&mut self, report: TickReport) -> Vec<(Vec<CaptureSnapshot>, Duration)> {
        if self.last_tick == Some(report.index) {
            return Vec::new();
        }
        let first = self.last_tick.is_none();
        self.last_tick = Some(report.index);
        let drained = std::mem::take(&mut self.pending);
        if first || report.duration <= self.threshold {
            Vec::new()
        } else {
            drained
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// =============================================================================
// Session
// =============================================================================

/// Point-in-time description of a session for `profiler info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub state: SamplerState,
    pub background: bool,
    pub running_for: Duration,
    /// `None` when the session runs until stopped.
    pub time_to_auto_end: Option<Duration>,
    pub thread_policy: String,
    pub capture_count: u64,
    pub capture_failures: u64,
    pub attached_viewers: usize,
}

pub struct SamplerSession {
    id: u64,
    state: AtomicU8,
    config: SamplerConfig,
    started_wall: Mutex<Option<DateTime<Utc>>>,
    started_at: Mutex<Option<Instant>>,
    auto_end_at: Mutex<Option<Instant>>,
    merger: Mutex<CallTreeMerger>,
    capture_failures: AtomicU64,
    viewers: Mutex<Vec<Arc<dyn ViewerSocket>>>,
    completion: watch::Sender<Option<SessionOutcome>>,
    capture_task: Mutex<Option<JoinHandle<()>>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SamplerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("background", &self.config.background)
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl SamplerSession {
    /// Create an idle session.
    #[must_use]
    pub fn new(id: u64, config: SamplerConfig) -> Arc<Self> {
        let merger = CallTreeMerger::new(config.merge_mode, config.grouping);
        let (completion, _) = watch::channel(None);
        Arc::new(Self {
            id,
            state: AtomicU8::new(SamplerState::Idle as u8),
            config,
            started_wall: Mutex::new(None),
            started_at: Mutex::new(None),
            auto_end_at: Mutex::new(None),
            merger: Mutex::new(merger),
            capture_failures: AtomicU64::new(0),
            viewers: Mutex::new(Vec::new()),
            completion,
            capture_task: Mutex::new(None),
            timeout_task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SamplerState {
        SamplerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    #[must_use]
    pub fn is_background(&self) -> bool {
        self.config.background
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    fn transition(&self, from: SamplerState, to: SamplerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Begin sampling. Valid only from `Idle`; must be called inside a tokio
    /// runtime.
    ///
    /// `ticks` supplies tick-end reports and is required when
    /// `only_ticks_over` is set.
    pub fn start(
        self: &Arc<Self>,
        capture: Arc<dyn StackCapture>,
        ticks: Option<watch::Receiver<TickReport>>,
    ) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("no tokio runtime: {e}")))?;
        if self.config.only_ticks_over.is_some() && ticks.is_none() {
            return Err(Error::InvalidConfiguration(
                "tick counting is not supported on this platform".to_string(),
            ));
        }
        let now = Instant::now();
        let auto_end_at = self.config.auto_end_from(now)?;
        if !self.transition(SamplerState::Idle, SamplerState::Starting) {
            return Err(Error::AlreadyRunning {
                session_id: self.id,
            });
        }

        *lock(&self.started_at) = Some(now);
        *lock(&self.started_wall) = Some(Utc::now());
        *lock(&self.auto_end_at) = auto_end_at;

        let running = if self.config.background {
            SamplerState::RunningBackground
        } else {
            SamplerState::RunningForeground
        };
        if !self.transition(SamplerState::Starting, running) {
            // cancelled while starting
            return Ok(());
        }

        *lock(&self.capture_task) = Some(handle.spawn(Arc::clone(self).capture_loop(capture, ticks)));
        if let Some(timeout) = self.config.timeout {
            let session = Arc::clone(self);
            *lock(&self.timeout_task) = Some(handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                debug!(session_id = session.id, "Profiler timeout elapsed");
                session.stop(StopReason::Timeout);
            }));
        }

        info!(
            session_id = self.id,
            thread_policy = %self.config.policy,
            grouping = %self.config.grouping,
            merge_mode = %self.config.merge_mode,
            background = self.config.background,
            timeout_secs = self.config.timeout.map(|t| t.as_secs()),
            "Profiler started"
        );
        Ok(())
    }

    async fn capture_loop(
        self: Arc<Self>,
        capture: Arc<dyn StackCapture>,
        mut ticks: Option<watch::Receiver<TickReport>>,
    ) {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut filter = self.config.only_ticks_over.map(TickFilter::new);
        let policy = Arc::new(self.config.policy.clone());

        loop {
            ticker.tick().await;
            if !self.is_running() {
                break;
            }

            if let (Some(filter), Some(rx)) = (filter.as_mut(), ticks.as_mut()) {
                if rx.has_changed().unwrap_or(false) {
                    let report = *rx.borrow_and_update();
                    let keep = filter.on_tick(report);
                    if !keep.is_empty() {
                        self.record(|merger| merger.absorb(&keep));
                    }
                }
            }

            let captured = {
                let capture = Arc::clone(&capture);
                let policy = Arc::clone(&policy);
                tokio::task::spawn_blocking(move || capture.capture(&policy))
                    .await
                    .unwrap_or_else(|e| Err(Error::CaptureFailure(format!("capture task failed: {e}"))))
            };
            match captured {
                Ok(snapshots) => {
                    let snapshots: Vec<_> = snapshots
                        .into_iter()
                        .filter(|s| self.config.policy.matches(&s.thread_name))
                        .collect();
                    // no matched threads: nothing was sampled this round
                    if snapshots.is_empty() {
                        continue;
                    }
                    match filter.as_mut() {
                        Some(filter) => filter.buffer(snapshots, interval),
                        None => self.record(|merger| merger.merge_capture(&snapshots, interval)),
                    }
                }
                Err(e) => {
                    self.capture_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(session_id = self.id, error = %e, "Stack capture failed");
                }
            }
        }
        debug!(session_id = self.id, state = %self.state(), "Capture loop exited");
    }

    /// Merge under the merger lock, but only while still running, so nothing
    /// lands in a tree after the result has been exported.
    fn record(&self, f: impl FnOnce(&mut CallTreeMerger)) {
        let mut merger = lock(&self.merger);
        if self.is_running() {
            f(&mut merger);
        }
    }

    /// `Running → Stopping → Completed`. Returns the outcome if this call
    /// performed the transition, `None` if the session was not running or
    /// another stop/cancel won.
    pub fn stop(&self, reason: StopReason) -> Option<SessionOutcome> {
        let current = self.state();
        if !current.is_running() || !self.transition(current, SamplerState::Stopping) {
            return None;
        }
        if reason != StopReason::Timeout {
            self.abort_timeout();
        }

        let result = Arc::new(self.build_result(Some(reason)));
        self.state
            .store(SamplerState::Completed as u8, Ordering::Release);
        let outcome = SessionOutcome::Completed { reason, result };
        self.finish(&outcome);
        info!(session_id = self.id, ?reason, "Profiler stopped");
        Some(outcome)
    }

    /// Abandon the run without exporting. Returns true if this call cancelled
    /// the session.
    pub fn cancel(&self) -> bool {
        loop {
            let current = self.state();
            if current.is_terminal() || current == SamplerState::Stopping {
                return false;
            }
            if self.transition(current, SamplerState::Cancelled) {
                break;
            }
        }
        self.abort_timeout();
        self.finish(&SessionOutcome::Cancelled);
        info!(session_id = self.id, "Profiler cancelled");
        true
    }

    fn abort_timeout(&self) {
        // the capture loop notices the state change on its own
        if let Some(task) = lock(&self.timeout_task).take() {
            task.abort();
        }
    }

    fn finish(&self, outcome: &SessionOutcome) {
        let cancelled = matches!(outcome, SessionOutcome::Cancelled);
        for viewer in lock(&self.viewers).iter() {
            viewer.session_closed(self.id, cancelled);
        }
        self.completion.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
            true
        });
    }

    /// Wait for the session to complete or be cancelled.
    pub async fn wait(&self) -> SessionOutcome {
        let mut rx = self.completion.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(SessionOutcome::Cancelled),
            Err(_) => SessionOutcome::Cancelled,
        }
    }

    /// Completion channel; holds `Some` once the session has ended.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<SessionOutcome>> {
        self.completion.subscribe()
    }

    /// The outcome, if the session has already ended.
    #[must_use]
    pub fn outcome(&self) -> Option<SessionOutcome> {
        self.completion.borrow().clone()
    }

    pub fn attach_viewer(&self, viewer: Arc<dyn ViewerSocket>) {
        lock(&self.viewers).push(viewer);
    }

    #[must_use]
    pub fn viewers(&self) -> Vec<Arc<dyn ViewerSocket>> {
        lock(&self.viewers).clone()
    }

    #[must_use]
    pub fn running_for(&self) -> Duration {
        lock(&self.started_at).map_or(Duration::ZERO, |t| t.elapsed())
    }

    #[must_use]
    pub fn time_to_auto_end(&self) -> Option<Duration> {
        lock(&self.auto_end_at).map(|end| end.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            state: self.state(),
            background: self.config.background,
            running_for: self.running_for(),
            time_to_auto_end: self.time_to_auto_end(),
            thread_policy: self.config.policy.label(),
            capture_count: lock(&self.merger).capture_count(),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            attached_viewers: lock(&self.viewers).len(),
        }
    }

    /// Result of everything captured so far (used for live viewers and at
    /// completion). Always produces a result, even with zero captures.
    #[must_use]
    pub fn build_result(&self, reason: Option<StopReason>) -> SessionResult {
        let merger = lock(&self.merger);
        let started_at = lock(&self.started_wall).unwrap_or_else(Utc::now);
        let metadata = SessionMetadata {
            session_id: self.id,
            started_at,
            ended_at: Utc::now(),
            duration_ms: u64::try_from(self.running_for().as_millis()).unwrap_or(u64::MAX),
            thread_policy: self.config.policy.label(),
            grouping: self.config.grouping.label().to_string(),
            merge_mode: self.config.merge_mode.label().to_string(),
            interval_ms: self.config.interval.as_secs_f64() * 1000.0,
            background: self.config.background,
            only_ticks_over_ms: self
                .config
                .only_ticks_over
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            creator: self.config.creator.clone(),
            comment: self.config.comment.clone(),
            stop_reason: reason,
            capture_count: merger.capture_count(),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
        };
        SessionResult {
            metadata,
            trees: merger.export(),
            hotspots: merger.hotspots(RESULT_HOTSPOTS),
        }
    }
}

impl Drop for SamplerSession {
    fn drop(&mut self) {
        for slot in [&self.capture_task, &self.timeout_task] {
            if let Some(task) = lock(slot).take() {
                task.abort();
            }
        }
    }
}
