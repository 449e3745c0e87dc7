//! The always-on background profiler.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::capture::StackCapture;
use crate::config::BackgroundSettings;
use crate::container::SamplerContainer;
use crate::error::Result;
use crate::sampler::{interval_from_ms, SamplerConfig, SamplerSession};
use crate::thread_policy::ThreadCapturePolicy;
use crate::tick_monitor::TickReport;

/// Starts the background session on enable and brings it back after an
/// operator session finishes.
pub struct BackgroundSamplerManager {
    settings: BackgroundSettings,
    primary_thread: String,
    container: Arc<SamplerContainer>,
    capture: Arc<dyn StackCapture>,
    ticks: Option<watch::Receiver<TickReport>>,
}

impl std::fmt::Debug for BackgroundSamplerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSamplerManager")
            .field("settings", &self.settings)
            .field("primary_thread", &self.primary_thread)
            .finish_non_exhaustive()
    }
}

impl BackgroundSamplerManager {
    #[must_use]
    pub fn new(
        settings: BackgroundSettings,
        primary_thread: impl Into<String>,
        container: Arc<SamplerContainer>,
        capture: Arc<dyn StackCapture>,
        ticks: Option<watch::Receiver<TickReport>>,
    ) -> Self {
        Self {
            settings,
            primary_thread: primary_thread.into(),
            container,
            capture,
            ticks,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn config(&self) -> Result<SamplerConfig> {
        Ok(
            SamplerConfig::new(ThreadCapturePolicy::PrimaryThread(self.primary_thread.clone()))
                .with_interval(interval_from_ms(self.settings.interval_ms)?)
                .with_grouping(self.settings.grouping)
                .background(),
        )
    }

    /// Start the background session if enabled. `Ok(None)` when disabled.
    pub fn start_on_enable(&self) -> Result<Option<Arc<SamplerSession>>> {
        if !self.settings.enabled {
            return Ok(None);
        }
        let session = self.start()?;
        info!(session_id = session.id(), "Background profiler started");
        Ok(Some(session))
    }

    fn start(&self) -> Result<Arc<SamplerSession>> {
        self.container
            .start_session(self.config()?, Arc::clone(&self.capture), self.ticks.clone())
    }

    /// Start a new background session if enabled and the slot is free.
    /// Returns whether one was started.
    pub fn restart_background_sampler(&self) -> bool {
        if !self.settings.enabled {
            return false;
        }
        match self.start() {
            Ok(session) => {
                info!(session_id = session.id(), "Background profiler restarted");
                true
            }
            Err(e) => {
                warn!(error = %e, "Background profiler not restarted");
                false
            }
        }
    }
}
