//! Stack capture data model.
//!
//! The host platform owns the actual stack-dump primitive and exposes it
//! through [`StackCapture`]. Snapshots are immutable once produced.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::thread_policy::ThreadCapturePolicy;

/// One frame of a captured stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub declaring_type: String,
    pub method: String,
    /// Source line currently executing in this frame, when known.
    pub line: Option<u32>,
    /// Full signature/descriptor, used to tell overloads apart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
}

impl StackFrame {
    #[must_use]
    pub fn new(declaring_type: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            method: method.into(),
            line: None,
            descriptor: None,
        }
    }

    #[must_use]
    pub fn at_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    #[must_use]
    pub fn with_descriptor(mut self, descriptor: impl Into<String>) -> Self {
        self.descriptor = Some(descriptor.into());
        self
    }
}

/// The stack of one thread at one instant. Frames run root (outermost call)
/// to leaf (currently executing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSnapshot {
    pub thread_name: String,
    pub frames: Vec<StackFrame>,
}

impl CaptureSnapshot {
    #[must_use]
    pub fn new(thread_name: impl Into<String>, frames: Vec<StackFrame>) -> Self {
        Self {
            thread_name: thread_name.into(),
            frames,
        }
    }
}

/// The host's stack-dump primitive.
///
/// Implementations should only return threads matched by `policy`, but the
/// sampler filters again so a sloppy implementation cannot widen the capture.
pub trait StackCapture: Send + Sync {
    fn capture(&self, policy: &ThreadCapturePolicy) -> Result<Vec<CaptureSnapshot>>;
}

/// Replays a fixed script of captures, one entry per call, then returns
/// nothing. Used by tests and the fuzz target.
#[derive(Debug, Default)]
pub struct ScriptedCapture {
    script: Mutex<std::collections::VecDeque<Result<Vec<CaptureSnapshot>>>>,
    repeat_last: Option<Vec<CaptureSnapshot>>,
}

impl ScriptedCapture {
    #[must_use]
    pub fn new(script: Vec<Vec<CaptureSnapshot>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            repeat_last: None,
        }
    }

    /// Returns the same snapshot set on every call.
    #[must_use]
    pub fn repeating(snapshots: Vec<CaptureSnapshot>) -> Self {
        Self {
            script: Mutex::new(std::collections::VecDeque::new()),
            repeat_last: Some(snapshots),
        }
    }

    /// Queue a failing capture.
    pub fn push_failure(&self, message: &str) {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Err(Error::CaptureFailure(message.to_string())));
    }
}

impl StackCapture for ScriptedCapture {
    fn capture(&self, policy: &ThreadCapturePolicy) -> Result<Vec<CaptureSnapshot>> {
        let next = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        let snapshots = match next {
            Some(result) => result?,
            None => self.repeat_last.clone().unwrap_or_default(),
        };
        Ok(snapshots
            .into_iter()
            .filter(|s| policy.matches(&s.thread_name))
            .collect())
    }
}
