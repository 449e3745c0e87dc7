//! Trust gating for live viewer clients.
//!
//! A client that connects to the viewer is *pending* until an operator trusts
//! its id. Only trusted clients may receive profiler data; [`GatedTransport`]
//! enforces that on every send.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A connected live viewer.
pub trait ViewerSocket: Send + Sync {
    /// Tell the viewer that `client_id` has been trusted.
    fn send_client_trusted(&self, client_id: &str);

    /// The session this viewer is attached to has ended.
    fn session_closed(&self, session_id: u64, cancelled: bool);
}

/// Notice sent to attached viewers when a client becomes trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTrusted {
    pub client_id: String,
}

impl ClientTrusted {
    #[must_use]
    pub fn message(&self) -> String {
        format!(
            "Client connected to the viewer using id '{}' is now trusted.",
            self.client_id
        )
    }

    /// Deliver to each viewer.
    pub fn notify(&self, viewers: &[Arc<dyn ViewerSocket>]) {
        for viewer in viewers {
            viewer.send_client_trusted(&self.client_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustOutcome {
    /// The client moved from pending to trusted.
    Trusted(ClientTrusted),
    /// The client was trusted already; nothing changed.
    AlreadyTrusted,
}

#[derive(Debug, Default)]
struct TrustState {
    pending: BTreeSet<String>,
    trusted: BTreeSet<String>,
}

/// Pending and trusted client ids. The two sets never overlap.
#[derive(Debug, Default)]
pub struct TrustGate {
    state: Mutex<TrustState>,
}

impl TrustGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate with ids already trusted, e.g. from `viewer.trusted_keys`.
    #[must_use]
    pub fn with_trusted<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let gate = Self::new();
        gate.seed(ids);
        gate
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TrustState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark ids as trusted without an operator action.
    pub fn seed<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        for id in ids {
            let id = id.into();
            state.pending.remove(&id);
            state.trusted.insert(id);
        }
    }

    /// Record a newly connected client. Returns false when the id is already
    /// known (pending or trusted).
    pub fn register_pending(&self, client_id: &str) -> bool {
        let mut state = self.state();
        if state.trusted.contains(client_id) {
            return false;
        }
        let added = state.pending.insert(client_id.to_string());
        if added {
            debug!(client_id, "Viewer client awaiting trust");
        }
        added
    }

    /// Move a pending client to trusted.
    pub fn trust(&self, client_id: &str) -> Result<TrustOutcome> {
        let mut state = self.state();
        if state.trusted.contains(client_id) {
            return Ok(TrustOutcome::AlreadyTrusted);
        }
        if !state.pending.remove(client_id) {
            return Err(Error::NotFound(client_id.to_string()));
        }
        state.trusted.insert(client_id.to_string());
        drop(state);
        info!(client_id, "Viewer client trusted");
        Ok(TrustOutcome::Trusted(ClientTrusted {
            client_id: client_id.to_string(),
        }))
    }

    /// Forget a pending client (it disconnected). Trusted ids are kept.
    pub fn forget_pending(&self, client_id: &str) -> bool {
        self.state().pending.remove(client_id)
    }

    #[must_use]
    pub fn is_trusted(&self, client_id: &str) -> bool {
        self.state().trusted.contains(client_id)
    }

    #[must_use]
    pub fn is_pending(&self, client_id: &str) -> bool {
        self.state().pending.contains(client_id)
    }

    pub fn ensure_trusted(&self, client_id: &str) -> Result<()> {
        if self.is_trusted(client_id) {
            Ok(())
        } else {
            Err(Error::NotTrusted(client_id.to_string()))
        }
    }

    /// Sorted pending ids.
    #[must_use]
    pub fn pending(&self) -> Vec<String> {
        self.state().pending.iter().cloned().collect()
    }

    /// Sorted trusted ids, suitable for persisting back to configuration.
    #[must_use]
    pub fn trusted(&self) -> Vec<String> {
        self.state().trusted.iter().cloned().collect()
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Sends profiler payloads to viewer clients.
pub trait ViewerTransport: Send + Sync {
    fn send(&self, client_id: &str, payload: &[u8]) -> Result<()>;
}

/// Refuses sends to clients the gate has not trusted.
pub struct GatedTransport<T> {
    gate: Arc<TrustGate>,
    inner: T,
}

impl<T: ViewerTransport> GatedTransport<T> {
    #[must_use]
    pub fn new(gate: Arc<TrustGate>, inner: T) -> Self {
        Self { gate, inner }
    }

    #[must_use]
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: ViewerTransport> ViewerTransport for GatedTransport<T> {
    fn send(&self, client_id: &str, payload: &[u8]) -> Result<()> {
        self.gate.ensure_trusted(client_id)?;
        self.inner.send(client_id, payload)
    }
}

impl<T> std::fmt::Debug for GatedTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatedTransport")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
