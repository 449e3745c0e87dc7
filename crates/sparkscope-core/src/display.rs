//! Operator-facing message output.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

/// Prepended to every prefixed message.
pub const MESSAGE_PREFIX: &str = "[sparkscope] ";

#[must_use]
pub fn prefixed(message: &str) -> String {
    format!("{MESSAGE_PREFIX}{message}")
}

/// Where command responses and monitor alerts go.
///
/// `reply` targets whoever issued the current command; `broadcast` targets
/// every operator allowed to see profiler output.
pub trait MessageSink: Send + Sync {
    fn reply(&self, message: &str);

    fn broadcast(&self, message: &str);

    fn reply_prefixed(&self, message: &str) {
        self.reply(&prefixed(message));
    }

    fn broadcast_prefixed(&self, message: &str) {
        self.broadcast(&prefixed(message));
    }
}

/// Wraps a sink for one command invocation. With broadcasting disabled,
/// broadcasts only reach the command sender.
#[derive(Clone)]
pub struct CommandResponder {
    inner: Arc<dyn MessageSink>,
    broadcast_enabled: bool,
}

impl CommandResponder {
    #[must_use]
    pub fn new(inner: Arc<dyn MessageSink>, broadcast_enabled: bool) -> Self {
        Self {
            inner,
            broadcast_enabled,
        }
    }
}

impl std::fmt::Debug for CommandResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResponder")
            .field("broadcast_enabled", &self.broadcast_enabled)
            .finish_non_exhaustive()
    }
}

impl MessageSink for CommandResponder {
    fn reply(&self, message: &str) {
        self.inner.reply(message);
    }

    fn broadcast(&self, message: &str) {
        if self.broadcast_enabled {
            self.inner.broadcast(message);
        } else {
            self.inner.reply(message);
        }
    }
}

/// Writes every message to the log. Used when the host has no console.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn reply(&self, message: &str) {
        info!(target: "sparkscope::reply", "{message}");
    }

    fn broadcast(&self, message: &str) {
        info!(target: "sparkscope::broadcast", "{message}");
    }
}

/// Records messages in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    replies: Mutex<Vec<String>>,
    broadcasts: Mutex<Vec<String>>,
}

impl CollectingSink {
    #[must_use]
    pub fn replies(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replies then broadcasts, prefixes stripped.
    #[must_use]
    pub fn all_plain(&self) -> Vec<String> {
        self.replies()
            .into_iter()
            .chain(self.broadcasts())
            .map(|m| m.strip_prefix(MESSAGE_PREFIX).map(str::to_string).unwrap_or(m))
            .collect()
    }

    /// Whether any message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.all_plain().iter().any(|m| m.contains(needle))
    }
}

impl MessageSink for CollectingSink {
    fn reply(&self, message: &str) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }

    fn broadcast(&self, message: &str) {
        self.broadcasts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }
}
