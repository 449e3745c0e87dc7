//! Error types for sparkscope-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested operator commands
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add an operator command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sparkscope-core
#[derive(Error, Debug)]
pub enum Error {
    /// A non-background profiler already holds the active slot
    #[error("A profiler is already running (session {session_id})")]
    AlreadyRunning { session_id: u64 },

    /// Rejected before any state was touched
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Statistics requested before any samples were recorded
    #[error("Insufficient data: {0}")]
    InsufficientData(&'static str),

    /// Trust-gate lookup for an id that is not pending
    #[error("No pending viewer client with id '{0}'")]
    NotFound(String),

    /// Outbound message addressed to a client that has not been trusted
    #[error("Viewer client '{0}' is not trusted")]
    NotTrusted(String),

    /// Stack-dump or export primitive failed
    #[error("Capture failure: {0}")]
    CaptureFailure(String),

    /// Result export (upload or save-to-file) failed
    #[error("Export failed: {0}")]
    Export(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, closed channels, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::AlreadyRunning { .. } => Some(
                Remediation::new("Stop or cancel the running profiler before starting a new one.")
                    .command("Stop and upload", "profiler stop")
                    .command("Cancel", "profiler cancel")
                    .alternative("Run `profiler info` to see how long the profiler has been running."),
            ),
            Self::InvalidConfiguration(_) => Some(
                Remediation::new("Adjust the profiler options and retry.")
                    .command("Start with a longer timeout", "profiler start --timeout 60")
                    .alternative("Omit --timeout to run until stopped."),
            ),
            Self::InsufficientData(_) => Some(
                Remediation::new("Not enough samples have been recorded yet. Try again shortly.")
                    .command("Tick statistics", "tps"),
            ),
            Self::NotFound(_) => Some(
                Remediation::new("Check the client id shown by the live viewer and retry.")
                    .command("Trust a viewer", "profiler trust-viewer --id <client id>")
                    .alternative("Reopen the live viewer to obtain a fresh client id."),
            ),
            Self::NotTrusted(_) => Some(
                Remediation::new("The viewer must be trusted by an operator before it receives data.")
                    .command("Trust a viewer", "profiler trust-viewer --id <client id>"),
            ),
            Self::CaptureFailure(_) => Some(
                Remediation::new("The stack capture primitive failed; partial results were kept.")
                    .command("Profiler status", "profiler info")
                    .alternative("Narrow the thread selection with --thread."),
            ),
            Self::Export(_) => Some(
                Remediation::new("Uploading results failed. Save the profile to disk instead.")
                    .command("Save to file", "profiler stop --save-to-file"),
            ),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Save to file", "profiler stop --save-to-file")
                    .alternative("Verify the output directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Result serialization failed; retry the export.")
                    .command("Stop and upload", "profiler stop"),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("An internal task failed. Retry the command.")
                    .command("Profiler status", "profiler info")
                    .alternative("If the issue persists, restart the host process."),
            ),
        }
    }

    /// Whether the caller should treat this as "not yet available" rather
    /// than as a hard failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::InsufficientData(_))
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Start without a config file to use the defaults."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                .command("Validate", "taplo check sparkscope.toml"),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Validate", "taplo check sparkscope.toml")
                    .alternative("Remove the field to fall back to its default.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
