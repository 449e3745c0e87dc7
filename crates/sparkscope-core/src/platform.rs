//! Composition root.
//!
//! [`Platform`] owns the active-session slot, the background profiler, the
//! rolling statistics, the trust gate and the command watchdog. Hosts build
//! one from an [`EngineConfig`] plus [`Collaborators`], call
//! [`Platform::enable`] once the runtime is up, and route operator commands to
//! the async methods below. Every command runs through the watchdog, so
//! commands execute one at a time in arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::background::BackgroundSamplerManager;
use crate::capture::StackCapture;
use crate::config::EngineConfig;
use crate::container::SamplerContainer;
use crate::cpu::{CpuLoadSource, CpuStatistics};
use crate::display::{CommandResponder, MessageSink};
use crate::error::{Error, Result};
use crate::export::{ActivityLog, ExportOutcome, Exporter, MemoryActivityLog, ResultSink};
use crate::format;
use crate::gc::{self, GcHub};
use crate::health::{self, HealthSources};
use crate::ping::{PingProvider, PingStatistics};
use crate::sampler::{
    interval_from_ms, SamplerConfig, SamplerSession, SessionInfo, SessionOutcome, StopReason,
};
use crate::thread_policy::{ThreadCapturePolicy, ThreadGrouping};
use crate::tick_monitor::{self, TickGcMonitor, TickMonitorHandle, TickSource};
use crate::tick_stats::{DurationWindow, TickStatistics};
use crate::trust::{TrustGate, TrustOutcome, ViewerSocket};
use crate::watchdog::{CommandHeartbeat, CommandWatchdog, DiagnosticDump};

/// Name operators type before sub-commands.
pub const COMMAND_NAME: &str = "sparkscope";

fn cmd_prompt(args: &str) -> String {
    format!("  /{COMMAND_NAME} {args}")
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Collaborators
// =============================================================================

/// Host-provided integrations. Only stack capture and message output are
/// required; every other source is optional and its features are reported as
/// unsupported when absent.
#[derive(Clone)]
pub struct Collaborators {
    pub capture: Arc<dyn StackCapture>,
    pub messages: Arc<dyn MessageSink>,
    pub activity: Arc<dyn ActivityLog>,
    pub ticks: Option<Arc<dyn TickSource>>,
    pub gc: Option<Arc<GcHub>>,
    pub ping: Option<Arc<dyn PingProvider>>,
    pub cpu: Option<Arc<dyn CpuLoadSource>>,
    pub results: Option<Arc<dyn ResultSink>>,
    pub dump: Option<Arc<dyn DiagnosticDump>>,
}

impl Collaborators {
    #[must_use]
    pub fn new(capture: Arc<dyn StackCapture>, messages: Arc<dyn MessageSink>) -> Self {
        Self {
            capture,
            messages,
            activity: Arc::new(MemoryActivityLog::default()),
            ticks: None,
            gc: None,
            ping: None,
            cpu: None,
            results: None,
            dump: None,
        }
    }

    #[must_use]
    pub fn with_activity_log(mut self, activity: Arc<dyn ActivityLog>) -> Self {
        self.activity = activity;
        self
    }

    #[must_use]
    pub fn with_ticks(mut self, ticks: Arc<dyn TickSource>) -> Self {
        self.ticks = Some(ticks);
        self
    }

    #[must_use]
    pub fn with_gc(mut self, gc: Arc<GcHub>) -> Self {
        self.gc = Some(gc);
        self
    }

    #[must_use]
    pub fn with_ping(mut self, ping: Arc<dyn PingProvider>) -> Self {
        self.ping = Some(ping);
        self
    }

    #[must_use]
    pub fn with_cpu(mut self, cpu: Arc<dyn CpuLoadSource>) -> Self {
        self.cpu = Some(cpu);
        self
    }

    #[must_use]
    pub fn with_result_sink(mut self, results: Arc<dyn ResultSink>) -> Self {
        self.results = Some(results);
        self
    }

    #[must_use]
    pub fn with_diagnostic_dump(mut self, dump: Arc<dyn DiagnosticDump>) -> Self {
        self.dump = Some(dump);
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("ticks", &self.ticks.is_some())
            .field("gc", &self.gc.is_some())
            .field("ping", &self.ping.is_some())
            .field("cpu", &self.cpu.is_some())
            .field("results", &self.results.is_some())
            .field("dump", &self.dump.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Parsed `profiler start` arguments.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub user: String,
    /// `--thread` values; empty selects the primary thread, `*` selects all.
    pub threads: Vec<String>,
    pub regex: bool,
    pub grouping: ThreadGrouping,
    /// Non-positive values fall back to the configured default.
    pub interval_ms: Option<f64>,
    pub timeout_secs: Option<u64>,
    pub only_ticks_over_ms: Option<u64>,
    /// Only used when the run ends by timeout.
    pub save_to_file: bool,
    pub comment: Option<String>,
}

impl StartRequest {
    #[must_use]
    pub fn by(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }
}

// =============================================================================
// Platform
// =============================================================================

pub struct Platform {
    config: EngineConfig,
    capture: Arc<dyn StackCapture>,
    ticks: Option<Arc<dyn TickSource>>,
    gc: Option<Arc<GcHub>>,
    ping_provider: Option<Arc<dyn PingProvider>>,
    cpu_source: Option<Arc<dyn CpuLoadSource>>,
    responder: Arc<CommandResponder>,
    container: Arc<SamplerContainer>,
    background: Arc<BackgroundSamplerManager>,
    exporter: Exporter,
    trust: Arc<TrustGate>,
    watchdog: CommandWatchdog,
    tick_stats: TickStatistics,
    ping_stats: PingStatistics,
    cpu_stats: CpuStatistics,
    enabled: AtomicBool,
    enabled_at: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tick_monitor: Mutex<Option<TickMonitorHandle>>,
    gc_reporter: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("enabled", &self.is_enabled())
            .field("container", &self.container)
            .field("watchdog", &self.watchdog)
            .finish_non_exhaustive()
    }
}

impl Platform {
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let responder = Arc::new(CommandResponder::new(
            Arc::clone(&collaborators.messages),
            config.export.broadcast_responses,
        ));
        let container = Arc::new(SamplerContainer::new());
        let background = Arc::new(BackgroundSamplerManager::new(
            config.background.clone(),
            config.sampler.primary_thread.clone(),
            Arc::clone(&container),
            Arc::clone(&collaborators.capture),
            collaborators.ticks.as_ref().map(|t| t.reports()),
        ));
        let exporter = Exporter::new(
            collaborators.results.clone(),
            config.export.output_dir.clone(),
            Arc::clone(&collaborators.activity),
        );
        let trust = Arc::new(TrustGate::with_trusted(&config.viewer.trusted_keys));
        let watchdog = CommandWatchdog::new(
            &config.watchdog,
            collaborators.dump.clone(),
            Arc::clone(&responder) as Arc<dyn MessageSink>,
        );
        let stats = &config.statistics;

        Ok(Self {
            tick_stats: TickStatistics::new(stats.ticks_per_second),
            ping_stats: PingStatistics::new(Duration::from_secs(stats.ping_poll_interval_secs)),
            cpu_stats: CpuStatistics::new(Duration::from_secs(stats.cpu_poll_interval_secs)),
            capture: collaborators.capture,
            ticks: collaborators.ticks,
            gc: collaborators.gc,
            ping_provider: collaborators.ping,
            cpu_source: collaborators.cpu,
            responder,
            container,
            background,
            exporter,
            trust,
            watchdog,
            config,
            enabled: AtomicBool::new(false),
            enabled_at: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
            tick_monitor: Mutex::new(None),
            gc_reporter: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn container(&self) -> &Arc<SamplerContainer> {
        &self.container
    }

    #[must_use]
    pub fn trust_gate(&self) -> &Arc<TrustGate> {
        &self.trust
    }

    #[must_use]
    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    #[must_use]
    pub fn tick_statistics(&self) -> &TickStatistics {
        &self.tick_stats
    }

    #[must_use]
    pub fn ping_statistics(&self) -> &PingStatistics {
        &self.ping_stats
    }

    #[must_use]
    pub fn cpu_statistics(&self) -> &CpuStatistics {
        &self.cpu_stats
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start statistics collection and the background profiler. Must run
    /// inside a tokio runtime; a second call fails.
    pub fn enable(&self) -> Result<()> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("no tokio runtime: {e}")))?;
        if self
            .enabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Runtime("platform is already enabled".to_string()));
        }

        *lock(&self.enabled_at) = Instant::now();
        if let Some(gc) = &self.gc {
            gc.capture_baseline();
        }

        {
            let mut tasks = lock(&self.tasks);
            if let Some(ticks) = &self.ticks {
                tasks.push(self.tick_stats.spawn_collector(ticks.subscribe()));
            }
            if let Some(provider) = &self.ping_provider {
                tasks.push(self.ping_stats.spawn(Arc::clone(provider)));
            }
            if let Some(source) = &self.cpu_source {
                tasks.push(self.cpu_stats.spawn(Arc::clone(source)));
            }
        }

        if let Err(e) = self.background.start_on_enable() {
            warn!(error = %e, "Background profiler failed to start");
        }
        info!(
            ticks = self.ticks.is_some(),
            gc = self.gc.is_some(),
            ping = self.ping_provider.is_some(),
            cpu = self.cpu_source.is_some(),
            background = self.background.is_enabled(),
            "Platform enabled"
        );
        Ok(())
    }

    /// Cancel the active session and stop every task. Returns false if the
    /// platform was not enabled.
    pub fn disable(&self) -> bool {
        if self
            .enabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.container.close();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(monitor) = lock(&self.tick_monitor).take() {
            monitor.stop();
        }
        if let Some(reporter) = lock(&self.gc_reporter).take() {
            reporter.abort();
        }
        info!("Platform disabled");
        true
    }

    fn running_session(&self) -> Option<Arc<SamplerSession>> {
        self.container.get_active().filter(|s| s.is_running())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // =========================================================================
    // Profiler commands
    // =========================================================================

    /// `profiler start`. Replaces a background session; refuses (after
    /// printing its info) when an operator session is already running.
    pub async fn start_profiler(&self, request: StartRequest) -> Result<Arc<SamplerSession>> {
        self.watchdog
            .execute("profiler start", move |hb| async move {
                self.start_profiler_now(request, &hb)
            })
            .await
    }

    fn start_profiler_now(
        &self,
        request: StartRequest,
        hb: &CommandHeartbeat,
    ) -> Result<Arc<SamplerSession>> {
        let out = self.responder.as_ref();

        if let Some(previous) = self.running_session() {
            if previous.is_background() {
                out.reply_prefixed("Stopping the background profiler before starting... please wait");
                previous.cancel();
                self.container.unset_active(&previous);
            } else {
                self.print_info(Some(&previous));
                return Err(Error::AlreadyRunning {
                    session_id: previous.id(),
                });
            }
        }

        hb.record("building configuration");
        let config = match self.build_config(&request) {
            Ok(config) => config,
            Err(e) => {
                if let Error::InvalidConfiguration(message) = &e {
                    out.reply_prefixed(message);
                }
                return Err(e);
            }
        };
        let advisories = match config.validate(&self.config.sampler) {
            Ok(advisories) => advisories,
            Err(e) => {
                if let Error::InvalidConfiguration(message) = &e {
                    out.reply_prefixed(message);
                }
                return Err(e);
            }
        };
        for advisory in &advisories {
            out.reply_prefixed(advisory);
        }

        out.broadcast_prefixed("Starting a new profiler, please wait...");
        hb.record("starting session");
        let session = self.container.start_session(
            config,
            Arc::clone(&self.capture),
            self.ticks.as_ref().map(|t| t.reports()),
        )?;

        out.broadcast_prefixed("Profiler is now running!");
        match request.timeout_secs {
            None => {
                out.broadcast_prefixed("It will run in the background until it is stopped by an admin.");
                out.broadcast_prefixed("To stop the profiler and upload the results, run:");
                out.broadcast_prefixed(&cmd_prompt("profiler stop"));
                out.broadcast_prefixed("To view the profiler while it's running, run:");
                out.broadcast_prefixed(&cmd_prompt("profiler open"));
            }
            Some(secs) => out.broadcast_prefixed(&format!(
                "The results will be automatically returned after the profiler has been running for {}.",
                format::seconds(secs)
            )),
        }

        self.track(self.spawn_completion_watcher(
            Arc::clone(&session),
            request.user,
            request.save_to_file,
        ));
        Ok(session)
    }

    fn build_config(&self, request: &StartRequest) -> Result<SamplerConfig> {
        let policy = ThreadCapturePolicy::from_selection(
            &request.threads,
            request.regex,
            &self.config.sampler.primary_thread,
        )?;
        let interval = match request.interval_ms.filter(|ms| *ms > 0.0) {
            Some(ms) => interval_from_ms(ms)?,
            None => self.config.sampler.default_interval()?,
        };

        let mut config = SamplerConfig::new(policy)
            .with_grouping(request.grouping)
            .with_interval(interval)
            .created_by(request.user.clone());
        if let Some(secs) = request.timeout_secs {
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Some(ms) = request.only_ticks_over_ms {
            if self.ticks.is_none() {
                return Err(Error::InvalidConfiguration(
                    "Tick counting is not supported!".to_string(),
                ));
            }
            config = config.only_ticks_over(Duration::from_millis(ms));
        }
        config.comment.clone_from(&request.comment);
        Ok(config)
    }

    /// Clears the slot when the session ends and exports timed-out runs.
    fn spawn_completion_watcher(
        &self,
        session: Arc<SamplerSession>,
        user: String,
        save_to_file: bool,
    ) -> JoinHandle<()> {
        let container = Arc::clone(&self.container);
        let exporter = self.exporter.clone();
        let out = Arc::clone(&self.responder);
        tokio::spawn(async move {
            let outcome = session.wait().await;
            container.unset_active(&session);
            if let SessionOutcome::Completed {
                reason: StopReason::Timeout,
                result,
            } = outcome
            {
                out.broadcast_prefixed("The active profiler has completed! Uploading results...");
                if let Err(e) = exporter.export(result, &user, save_to_file, out.as_ref()).await {
                    warn!(session_id = session.id(), error = %e, "Timed-out profiler export failed");
                }
            }
        })
    }

    /// `profiler info`.
    pub async fn profiler_info(&self) -> Result<Option<SessionInfo>> {
        self.watchdog
            .execute("profiler info", move |_| async move {
                let session = self.running_session();
                self.print_info(session.as_ref());
                Ok(session.map(|s| s.info()))
            })
            .await
    }

    fn print_info(&self, session: Option<&Arc<SamplerSession>>) {
        let out = self.responder.as_ref();
        let Some(session) = session else {
            out.reply_prefixed("The profiler isn't running!");
            out.reply_prefixed("To start a new one, run:");
            out.reply_prefixed(&cmd_prompt("profiler start"));
            return;
        };

        out.reply_prefixed("Profiler is already running!");
        let running = format::seconds(session.running_for().as_secs());
        if session.is_background() {
            out.reply_prefixed(&format!(
                "It was started automatically when {COMMAND_NAME} enabled and has been running in the background for {running}."
            ));
        } else {
            out.reply_prefixed(&format!("So far, it has profiled for {running}."));
        }
        out.reply_prefixed("To view the profiler while it's running, run:");
        out.reply_prefixed(&cmd_prompt("profiler open"));
        match session.time_to_auto_end() {
            None => {
                out.reply_prefixed("To stop the profiler and upload the results, run:");
                out.reply_prefixed(&cmd_prompt("profiler stop"));
            }
            Some(remaining) => out.reply_prefixed(&format!(
                "It is due to complete automatically and upload results in {}.",
                format::seconds(remaining.as_secs())
            )),
        }
        out.reply_prefixed("To cancel the profiler without uploading the results, run:");
        out.reply_prefixed(&cmd_prompt("profiler cancel"));
    }

    /// `profiler cancel`. Returns whether a session was cancelled.
    pub async fn cancel_profiler(&self) -> Result<bool> {
        self.watchdog
            .execute("profiler cancel", move |_| async move {
                let out = self.responder.as_ref();
                if self.running_session().is_none() {
                    out.reply_prefixed("There isn't an active profiler running.");
                    return Ok(false);
                }
                let cancelled = self.container.stop_active(true).is_some();
                out.broadcast_prefixed("Profiler has been cancelled.");
                Ok(cancelled)
            })
            .await
    }

    /// `profiler stop`: stop, export, then bring the background profiler
    /// back if it is enabled. `None` when nothing was running.
    pub async fn stop_profiler(&self, user: &str, save_to_file: bool) -> Result<Option<ExportOutcome>> {
        self.watchdog
            .execute("profiler stop", move |hb| async move {
                self.stop_profiler_now(user, save_to_file, &hb).await
            })
            .await
    }

    async fn stop_profiler_now(
        &self,
        user: &str,
        save_to_file: bool,
        hb: &CommandHeartbeat,
    ) -> Result<Option<ExportOutcome>> {
        let out = self.responder.as_ref();
        let Some(session) = self.running_session() else {
            out.reply_prefixed("There isn't an active profiler running.");
            return Ok(None);
        };

        self.container.unset_active(&session);
        let Some(outcome) = session.stop(StopReason::Manual) else {
            // the timeout got there first; its watcher exports
            out.reply_prefixed("There isn't an active profiler running.");
            return Ok(None);
        };
        let Some(result) = outcome.result() else {
            return Ok(None);
        };

        out.broadcast_prefixed(if save_to_file {
            "Stopping the profiler & saving results, please wait..."
        } else {
            "Stopping the profiler & uploading results, please wait..."
        });
        hb.record("exporting results");
        let exported = self
            .exporter
            .export(Arc::clone(result), user, save_to_file, out)
            .await;

        hb.record("restarting background profiler");
        if self.background.restart_background_sampler() {
            out.broadcast_prefixed(&format!(
                "Restarted the background profiler. (If you don't want this to happen, run: /{COMMAND_NAME} profiler cancel)"
            ));
        }
        exported.map(Some)
    }

    /// `profiler open`: attach a live viewer to the running session and
    /// register its client id as pending trust. Returns the session id.
    pub async fn open_viewer(
        &self,
        client_id: &str,
        viewer: Arc<dyn ViewerSocket>,
    ) -> Result<Option<u64>> {
        self.watchdog
            .execute("profiler open", move |_| async move {
                let out = self.responder.as_ref();
                let Some(session) = self.running_session() else {
                    out.reply_prefixed("The profiler isn't running!");
                    out.reply_prefixed("To start a new one, run:");
                    out.reply_prefixed(&cmd_prompt("profiler start"));
                    return Ok(None);
                };
                session.attach_viewer(viewer);
                if !self.trust.is_trusted(client_id) {
                    self.trust.register_pending(client_id);
                    out.reply_prefixed(&format!(
                        "Viewer client '{client_id}' is waiting to be trusted. To trust it, run:"
                    ));
                    out.reply_prefixed(&cmd_prompt(&format!(
                        "profiler trust-viewer --id {client_id}"
                    )));
                }
                out.broadcast_prefixed("Profiler live viewer attached.");
                Ok(Some(session.id()))
            })
            .await
    }

    /// `profiler trust-viewer --id ...`. Returns how many ids became trusted.
    pub async fn trust_viewer(&self, ids: &[String]) -> Result<usize> {
        self.watchdog
            .execute("profiler trust-viewer", move |_| async move {
                let out = self.responder.as_ref();
                if ids.is_empty() {
                    out.reply_prefixed("Please provide a client id with '--id <client id>'.");
                    return Ok(0);
                }
                let viewers = self
                    .container
                    .get_active()
                    .map(|s| s.viewers())
                    .unwrap_or_default();
                let mut trusted = 0;
                for id in ids {
                    match self.trust.trust(id) {
                        Ok(TrustOutcome::Trusted(notice)) => {
                            notice.notify(&viewers);
                            out.reply_prefixed(&notice.message());
                            trusted += 1;
                        }
                        Ok(TrustOutcome::AlreadyTrusted) => out.reply_prefixed(&format!(
                            "Client connected to the viewer using id '{id}' is already trusted."
                        )),
                        Err(Error::NotFound(_)) => out.reply_prefixed(&format!(
                            "Unable to find pending client with id '{id}'."
                        )),
                        Err(e) => return Err(e),
                    }
                }
                Ok(trusted)
            })
            .await
    }

    // =========================================================================
    // Statistics commands
    // =========================================================================

    fn reply_lines(&self, lines: &[String]) {
        for line in lines {
            self.responder.reply_prefixed(line);
        }
    }

    /// `health`: every available statistics section.
    pub async fn health(&self) -> Result<Vec<String>> {
        self.watchdog
            .execute("health", move |_| async move {
                self.responder
                    .reply_prefixed("Generating server health report...");
                let lines = health::health_report(HealthSources {
                    ticks: self.ticks.as_ref().map(|_| &self.tick_stats),
                    cpu: self.cpu_source.as_ref().map(|_| &self.cpu_stats),
                    ping: self.ping_provider.as_ref().map(|_| &self.ping_stats),
                });
                self.reply_lines(&lines);
                Ok(lines)
            })
            .await
    }

    /// `tps`: tick rate, tick durations and CPU usage.
    pub async fn tps(&self) -> Result<Vec<String>> {
        self.watchdog
            .execute("tps", move |_| async move {
                let mut lines = Vec::new();
                if self.ticks.is_some() {
                    lines.extend(health::tps_lines(&self.tick_stats));
                    lines.push(String::new());
                    lines.extend(health::tick_duration_lines(
                        &self.tick_stats,
                        &[DurationWindow::Seconds10, DurationWindow::Minutes1],
                    ));
                    lines.push(String::new());
                }
                lines.extend(health::cpu_lines(&self.cpu_stats));
                self.reply_lines(&lines);
                Ok(lines)
            })
            .await
    }

    /// `ping [player]`.
    pub async fn ping(&self, player: Option<&str>) -> Result<Vec<String>> {
        self.watchdog
            .execute("ping", move |_| async move {
                let lines = if self.ping_provider.is_some() {
                    health::ping_lines(&self.ping_stats, player)
                } else {
                    vec!["Ping data is not available on this platform.".to_string()]
                };
                self.reply_lines(&lines);
                Ok(lines)
            })
            .await
    }

    /// `gc`: per-collector statistics since the platform was enabled.
    pub async fn gc_report(&self) -> Result<Vec<String>> {
        self.watchdog
            .execute("gc", move |_| async move {
                self.responder.reply_prefixed("Calculating GC statistics...");
                let stats = self
                    .gc
                    .as_ref()
                    .map(|gc| gc.stats_since_baseline())
                    .unwrap_or_default();
                let uptime = lock(&self.enabled_at).elapsed();
                let lines = gc::collector_report(&stats, uptime);
                self.reply_lines(&lines);
                Ok(lines)
            })
            .await
    }

    /// `gcmonitor`: toggle per-collection reports. Returns whether
    /// reporting is now on.
    pub async fn toggle_gc_monitor(&self) -> Result<bool> {
        self.watchdog
            .execute("gcmonitor", move |_| async move {
                let out = self.responder.as_ref();
                let Some(gc) = &self.gc else {
                    out.reply_prefixed("GC monitoring is not supported on this platform.");
                    return Ok(false);
                };
                let mut reporter = lock(&self.gc_reporter);
                if let Some(task) = reporter.take() {
                    task.abort();
                    out.broadcast_prefixed("GC monitor disabled.");
                    return Ok(false);
                }
                *reporter = Some(gc::spawn_gc_reporter(
                    gc.subscribe(),
                    Arc::clone(&self.responder) as Arc<dyn MessageSink>,
                ));
                out.broadcast_prefixed("GC monitor enabled.");
                Ok(true)
            })
            .await
    }

    /// `tickmonitor`: toggle the tick/GC monitor. Returns whether it is now
    /// running.
    pub async fn toggle_tick_monitor(&self) -> Result<bool> {
        self.watchdog
            .execute("tickmonitor", move |_| async move {
                let out = self.responder.as_ref();
                let Some(ticks) = &self.ticks else {
                    out.reply_prefixed("Tick counting is not supported!");
                    return Ok(false);
                };
                let mut slot = lock(&self.tick_monitor);
                if let Some(handle) = slot.take() {
                    handle.stop();
                    out.broadcast_prefixed("Tick monitor disabled.");
                    return Ok(false);
                }
                let settings = &self.config.tick_monitor;
                let gcs = self
                    .gc
                    .as_ref()
                    .filter(|_| settings.monitor_gc)
                    .map(|gc| gc.subscribe());
                *slot = Some(tick_monitor::spawn_tick_monitor(
                    TickGcMonitor::from_settings(settings, ticks.current_tick()),
                    ticks.subscribe(),
                    gcs,
                    Arc::clone(&self.responder) as Arc<dyn MessageSink>,
                ));
                out.broadcast_prefixed("Tick monitor enabled.");
                Ok(true)
            })
            .await
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureSnapshot, ScriptedCapture, StackFrame};
    use crate::display::CollectingSink;
    use crate::gc::GcEvent;
    use crate::tick_monitor::TickHub;

    fn capture() -> Arc<dyn StackCapture> {
        Arc::new(ScriptedCapture::repeating(vec![CaptureSnapshot::new(
            "main",
            vec![
                StackFrame::new("app.Server", "run"),
                StackFrame::new("app.World", "tick"),
            ],
        )]))
    }

    fn platform(config: EngineConfig) -> (Platform, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let collaborators = Collaborators::new(capture(), sink.clone());
        (Platform::new(config, collaborators).unwrap(), sink)
    }

    /// Poll until `done`, giving blocking-pool work time to finish.
    async fn settle_until(done: impl Fn() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn config_in(dir: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.export.output_dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn enable_only_once() {
        let (platform, _sink) = platform(EngineConfig::default());
        platform.enable().unwrap();
        assert!(platform.enable().is_err());
        assert!(platform.disable());
        assert!(!platform.disable());
    }

    #[tokio::test(start_paused = true)]
    async fn start_info_cancel() {
        let (platform, sink) = platform(EngineConfig::default());
        platform.enable().unwrap();

        assert!(platform.profiler_info().await.unwrap().is_none());
        assert!(sink.contains("The profiler isn't running!"));

        let session = platform
            .start_profiler(StartRequest::by("ops"))
            .await
            .unwrap();
        assert!(session.is_running());
        assert!(sink.contains("Profiler is now running!"));
        assert!(sink.contains("It will run in the background until it is stopped by an admin."));

        let err = platform
            .start_profiler(StartRequest::by("ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
        assert!(sink.contains("Profiler is already running!"));

        let info = platform.profiler_info().await.unwrap().unwrap();
        assert_eq!(info.session_id, session.id());
        assert!(info.time_to_auto_end.is_none());

        assert!(platform.cancel_profiler().await.unwrap());
        assert!(sink.contains("Profiler has been cancelled."));
        assert!(!platform.cancel_profiler().await.unwrap());
        assert!(sink.contains("There isn't an active profiler running."));
    }

    #[tokio::test]
    async fn short_timeout_is_rejected() {
        let (platform, sink) = platform(EngineConfig::default());
        let mut request = StartRequest::by("ops");
        request.timeout_secs = Some(10);
        let err = platform.start_profiler(request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(sink.contains("Please choose a value greater than 10."));
        assert!(platform.container().get_active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_timeout_is_rejected_and_slot_stays_free() {
        let (platform, sink) = platform(EngineConfig::default());
        let mut request = StartRequest::by("ops");
        request.timeout_secs = Some(u64::MAX);
        let err = platform.start_profiler(request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(sink.contains("is too large."));
        assert!(platform.container().get_active().is_none());

        let session = platform
            .start_profiler(StartRequest::by("ops"))
            .await
            .unwrap();
        assert!(session.is_running());
        assert!(platform.cancel_profiler().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_interval_is_rejected() {
        let (platform, sink) = platform(EngineConfig::default());
        let mut request = StartRequest::by("ops");
        request.interval_ms = Some(1e30);
        let err = platform.start_profiler(request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(sink.contains("is out of range."));
        assert!(platform.container().get_active().is_none());

        // non-positive values still fall back to the default
        let mut request = StartRequest::by("ops");
        request.interval_ms = Some(-5.0);
        let session = platform.start_profiler(request).await.unwrap();
        assert_eq!(session.config().interval, Duration::from_millis(4));
        platform.cancel_profiler().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn short_but_valid_timeout_gets_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, sink) = platform(config_in(dir.path()));
        let mut request = StartRequest::by("ops");
        request.timeout_secs = Some(20);
        platform.start_profiler(request).await.unwrap();
        assert!(sink.contains("Consider setting a timeout value over 30 seconds."));
        assert!(sink.contains(
            "The results will be automatically returned after the profiler has been running for 20s."
        ));
        platform.cancel_profiler().await.unwrap();
    }

    #[tokio::test]
    async fn only_ticks_over_needs_a_tick_source() {
        let (platform, sink) = platform(EngineConfig::default());
        let mut request = StartRequest::by("ops");
        request.only_ticks_over_ms = Some(50);
        assert!(platform.start_profiler(request).await.is_err());
        assert!(sink.contains("Tick counting is not supported!"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_stop_saves_without_sink() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, sink) = platform(config_in(dir.path()));
        platform
            .start_profiler(StartRequest::by("ops"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = platform.stop_profiler("ops", false).await.unwrap();
        let Some(ExportOutcome::Saved(path)) = outcome else {
            panic!("expected a saved file, got {outcome:?}");
        };
        assert!(path.starts_with(dir.path()));
        assert!(sink.contains("Stopping the profiler & uploading results, please wait..."));
        assert!(sink.contains("Data has been written to:"));
        assert!(platform.container().get_active().is_none());
        assert_eq!(platform.exporter().activity().recent().len(), 1);
        assert_eq!(platform.stop_profiler("ops", false).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn background_profiler_is_replaced_and_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.background.enabled = true;
        let (platform, sink) = platform(config);
        platform.enable().unwrap();
        let background = platform.container().get_active().unwrap();
        assert!(background.is_background());

        let session = platform
            .start_profiler(StartRequest::by("ops"))
            .await
            .unwrap();
        assert!(sink.contains("Stopping the background profiler before starting... please wait"));
        assert!(!background.is_running());
        assert!(!session.is_background());

        platform.stop_profiler("ops", true).await.unwrap();
        assert!(sink.contains("Stopping the profiler & saving results, please wait..."));
        assert!(sink.contains("Restarted the background profiler."));
        let restarted = platform.container().get_active().unwrap();
        assert!(restarted.is_background());
        assert_ne!(restarted.id(), background.id());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_exports_and_clears_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (platform, sink) = platform(config_in(dir.path()));
        platform.enable().unwrap();
        let mut request = StartRequest::by("ops");
        request.timeout_secs = Some(15);
        request.save_to_file = true;
        let session = platform.start_profiler(request).await.unwrap();

        tokio::time::sleep(Duration::from_secs(16)).await;
        settle_until(|| sink.contains("Data has been written to:")).await;

        assert_eq!(session.outcome().and_then(|o| o.reason()), Some(StopReason::Timeout));
        assert!(sink.contains("The active profiler has completed! Uploading results..."));
        assert!(sink.contains("Data has been written to:"));
        assert!(platform.container().get_active().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_session_with_no_samples_still_exports() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let collaborators = Collaborators::new(Arc::new(ScriptedCapture::default()), sink.clone());
        let platform = Platform::new(config_in(dir.path()), collaborators).unwrap();
        platform.enable().unwrap();
        let mut request = StartRequest::by("ops");
        request.timeout_secs = Some(30);
        request.save_to_file = true;
        let session = platform.start_profiler(request).await.unwrap();

        let outcome = session.wait().await;
        let result = outcome.result().unwrap();
        assert_eq!(result.metadata.capture_count, 0);
        assert!(result.trees.is_empty());

        settle_until(|| sink.contains("Data has been written to:")).await;
        assert!(sink.contains("Data has been written to:"));
        assert!(platform.container().get_active().is_none());
    }

    #[tokio::test]
    async fn trust_viewer_messages() {
        let (platform, sink) = platform(EngineConfig::default());
        assert_eq!(platform.trust_viewer(&[]).await.unwrap(), 0);
        assert!(sink.contains("Please provide a client id with '--id <client id>'."));

        platform.trust_gate().register_pending("abc");
        let ids = vec!["abc".to_string(), "zzz".to_string()];
        assert_eq!(platform.trust_viewer(&ids).await.unwrap(), 1);
        assert!(sink.contains("Client connected to the viewer using id 'abc' is now trusted."));
        assert!(sink.contains("Unable to find pending client with id 'zzz'."));
    }

    #[tokio::test]
    async fn configured_keys_are_trusted() {
        let mut config = EngineConfig::default();
        config.viewer.trusted_keys = vec!["known".to_string()];
        let (platform, _sink) = platform(config);
        assert!(platform.trust_gate().is_trusted("known"));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_monitor_toggles() {
        let hub = Arc::new(TickHub::new());
        let gc = Arc::new(GcHub::new());
        let sink = Arc::new(CollectingSink::default());
        let collaborators = Collaborators::new(capture(), sink.clone())
            .with_ticks(hub.clone())
            .with_gc(gc.clone());
        let platform = Platform::new(EngineConfig::default(), collaborators).unwrap();
        platform.enable().unwrap();

        assert!(platform.toggle_tick_monitor().await.unwrap());
        hub.on_tick();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(sink.contains("Tick monitor started."));
        assert!(!platform.toggle_tick_monitor().await.unwrap());
        assert!(sink.contains("Tick monitor disabled."));

        assert!(platform.toggle_gc_monitor().await.unwrap());
        gc.publish(GcEvent::new("G1 Young Generation", 12.0));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(sink.contains("Young Gen GC lasting 12 ms."));
        assert!(!platform.toggle_gc_monitor().await.unwrap());

        let report = platform.gc_report().await.unwrap();
        assert_eq!(report[0], "G1 Young Generation collector (Young Gen):");
    }

    #[tokio::test]
    async fn statistics_without_sources() {
        let (platform, sink) = platform(EngineConfig::default());
        assert_eq!(
            platform.ping(None).await.unwrap(),
            vec!["Ping data is not available on this platform."]
        );
        let health = platform.health().await.unwrap();
        assert!(health.is_empty());
        assert!(sink.contains("Generating server health report..."));
        assert!(!platform.toggle_tick_monitor().await.unwrap());
        assert!(!platform.toggle_gc_monitor().await.unwrap());
        assert_eq!(
            platform.gc_report().await.unwrap(),
            vec!["No garbage collectors are reporting data."]
        );
    }
}
