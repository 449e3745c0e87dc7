//! The single active-session slot.
//!
//! At most one sampler session is active per platform. Ownership of the slot
//! moves explicitly: [`SamplerContainer::set_active`] installs (displacing a
//! background session), [`SamplerContainer::unset_active`] clears only if the
//! slot still holds the given session, [`SamplerContainer::stop_active`] takes
//! and ends whatever is there.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::capture::StackCapture;
use crate::error::{Error, Result};
use crate::sampler::{SamplerConfig, SamplerSession, SamplerState, SessionOutcome, StopReason};
use crate::tick_monitor::TickReport;

#[derive(Debug, Default)]
pub struct SamplerContainer {
    active: Mutex<Option<Arc<SamplerSession>>>,
    next_id: AtomicU64,
}

/// Whether a session still claims the slot.
fn occupies_slot(session: &SamplerSession) -> bool {
    let state = session.state();
    !state.is_terminal() && state != SamplerState::Stopping
}

impl SamplerContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<SamplerSession>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh, never reused session id.
    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn get_active(&self) -> Option<Arc<SamplerSession>> {
        self.slot().clone()
    }

    /// Install `session`. A live background session is cancelled and
    /// returned; a live operator session makes this fail with
    /// `AlreadyRunning`. Finished sessions are simply replaced.
    pub fn set_active(&self, session: Arc<SamplerSession>) -> Result<Option<Arc<SamplerSession>>> {
        let mut slot = self.slot();
        let displaced = match slot.take() {
            Some(current) if occupies_slot(&current) => {
                if current.is_background() && !session.is_background() {
                    current.cancel();
                    info!(
                        session_id = current.id(),
                        replaced_by = session.id(),
                        "Background profiler replaced"
                    );
                    Some(current)
                } else {
                    let session_id = current.id();
                    *slot = Some(current);
                    return Err(Error::AlreadyRunning { session_id });
                }
            }
            other => other,
        };
        debug!(session_id = session.id(), "Session installed");
        *slot = Some(session);
        Ok(displaced)
    }

    /// Clear the slot if it still holds `session`. Returns whether it did.
    pub fn unset_active(&self, session: &SamplerSession) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(current) if current.id() == session.id() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Take the active session and end it: cancelled, or stopped with a
    /// result. `None` when nothing was active or it had already finished.
    pub fn stop_active(&self, cancel: bool) -> Option<SessionOutcome> {
        let session = self.slot().take()?;
        if cancel {
            session.cancel().then_some(SessionOutcome::Cancelled)
        } else {
            session.stop(StopReason::Manual)
        }
    }

    /// Create, install and start a session. Nothing is displaced and the
    /// slot is left as it was when the session cannot start.
    pub fn start_session(
        &self,
        config: SamplerConfig,
        capture: Arc<dyn StackCapture>,
        ticks: Option<watch::Receiver<TickReport>>,
    ) -> Result<Arc<SamplerSession>> {
        config.auto_end_from(Instant::now())?;
        let session = SamplerSession::new(self.next_session_id(), config);
        self.set_active(Arc::clone(&session))?;
        if let Err(e) = session.start(capture, ticks) {
            self.unset_active(&session);
            return Err(e);
        }
        Ok(session)
    }

    /// Shut down: end the active session without exporting.
    pub fn close(&self) {
        if let Some(session) = self.slot().take() {
            session.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ScriptedCapture;
    use crate::thread_policy::ThreadCapturePolicy;

    fn foreground() -> SamplerConfig {
        SamplerConfig::new(ThreadCapturePolicy::All)
    }

    fn capture() -> Arc<dyn StackCapture> {
        Arc::new(ScriptedCapture::default())
    }

    #[tokio::test]
    async fn second_operator_session_is_rejected() {
        let container = SamplerContainer::new();
        let first = container.start_session(foreground(), capture(), None).unwrap();
        let err = container
            .start_session(foreground(), capture(), None)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { session_id } if session_id == first.id()));
        assert_eq!(container.get_active().unwrap().id(), first.id());
        container.close();
    }

    #[tokio::test]
    async fn operator_session_displaces_background() {
        let container = SamplerContainer::new();
        let background = container
            .start_session(foreground().background(), capture(), None)
            .unwrap();
        let operator = container.start_session(foreground(), capture(), None).unwrap();

        assert_eq!(background.state(), SamplerState::Cancelled);
        assert!(matches!(background.wait().await, SessionOutcome::Cancelled));
        assert_eq!(container.get_active().unwrap().id(), operator.id());
        container.close();
    }

    #[tokio::test]
    async fn background_cannot_displace_operator() {
        let container = SamplerContainer::new();
        container.start_session(foreground(), capture(), None).unwrap();
        let err = container
            .start_session(foreground().background(), capture(), None)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
        container.close();
    }

    #[tokio::test]
    async fn unset_only_clears_matching_session() {
        let container = SamplerContainer::new();
        let stale = SamplerSession::new(container.next_session_id(), foreground());
        let live = container.start_session(foreground(), capture(), None).unwrap();
        assert!(!container.unset_active(&stale));
        assert!(container.get_active().is_some());
        assert!(container.unset_active(&live));
        assert!(container.get_active().is_none());
        live.cancel();
    }

    #[tokio::test]
    async fn stop_active_returns_result_or_cancellation() {
        let container = SamplerContainer::new();
        assert!(container.stop_active(false).is_none());

        container.start_session(foreground(), capture(), None).unwrap();
        let outcome = container.stop_active(false).unwrap();
        assert!(outcome.result().is_some());
        assert!(container.get_active().is_none());

        container.start_session(foreground(), capture(), None).unwrap();
        assert!(matches!(
            container.stop_active(true),
            Some(SessionOutcome::Cancelled)
        ));
    }

    #[tokio::test]
    async fn finished_session_is_replaced() {
        let container = SamplerContainer::new();
        let first = container.start_session(foreground(), capture(), None).unwrap();
        first.stop(StopReason::Timeout);
        let second = container.start_session(foreground(), capture(), None).unwrap();
        assert_ne!(first.id(), second.id());
        container.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_have_one_winner() {
        let container = Arc::new(SamplerContainer::new());
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let runtime = tokio::runtime::Handle::current();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let container = Arc::clone(&container);
                let barrier = Arc::clone(&barrier);
                let runtime = runtime.clone();
                std::thread::spawn(move || {
                    let _guard = runtime.enter();
                    barrier.wait();
                    container
                        .start_session(SamplerConfig::new(ThreadCapturePolicy::All), capture(), None)
                        .map(|s| s.id())
                })
            })
            .collect();
        let (wins, losses): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .partition(|r| r.is_ok());
        assert_eq!(wins.len(), 1);
        assert_eq!(losses.len(), 7);
        let winner = container.get_active().unwrap().id();
        for loss in losses {
            assert!(matches!(
                loss,
                Err(Error::AlreadyRunning { session_id }) if session_id == winner
            ));
        }
        container.close();
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_timeout_leaves_slot_untouched() {
        let container = SamplerContainer::new();
        let background = container
            .start_session(foreground().background(), capture(), None)
            .unwrap();

        let huge = foreground().with_timeout(std::time::Duration::from_secs(u64::MAX));
        let err = container.start_session(huge, capture(), None).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(background.state(), SamplerState::RunningBackground);
        assert_eq!(container.get_active().unwrap().id(), background.id());

        let operator = container.start_session(foreground(), capture(), None).unwrap();
        assert_eq!(container.get_active().unwrap().id(), operator.id());
        container.close();
    }
}
