//! Finished-session results and where they go.
//!
//! A completed session produces a [`SessionResult`]. The [`Exporter`] uploads
//! it through a [`ResultSink`] and falls back to writing a `.sparkprofile`
//! file when there is no sink or the upload fails. Every export is recorded in
//! the [`ActivityLog`].

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::call_tree::{ExportedTree, Hotspot};
use crate::display::MessageSink;
use crate::error::{Error, Result};
use crate::sampler::StopReason;

/// Extension of saved result files.
pub const PROFILE_EXTENSION: &str = "sparkprofile";

/// Entries kept by activity logs.
pub const ACTIVITY_LOG_CAPACITY: usize = 50;

// =============================================================================
// Result model
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub thread_policy: String,
    pub grouping: String,
    pub merge_mode: String,
    pub interval_ms: f64,
    pub background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_ticks_over_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub stop_reason: Option<StopReason>,
    pub capture_count: u64,
    pub capture_failures: u64,
}

/// Everything a finished session exports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub metadata: SessionMetadata,
    pub trees: Vec<ExportedTree>,
    pub hotspots: Vec<Hotspot>,
}

impl SessionResult {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Remote destination for results (e.g. a viewer upload endpoint).
pub trait ResultSink: Send + Sync {
    /// Upload and return a locator (URL) for the stored result.
    fn upload(&self, result: &SessionResult) -> Result<String>;
}

/// `profile-<yyyy-MM-dd_HH.mm.ss>.sparkprofile`
#[must_use]
pub fn profile_file_name(at: DateTime<Utc>) -> String {
    format!(
        "profile-{}.{PROFILE_EXTENSION}",
        at.format("%Y-%m-%d_%H.%M.%S")
    )
}

/// Write `result` as JSON under `dir`, creating it if needed. A name clash
/// within the same second gets a numeric suffix.
pub fn save_to_file(result: &SessionResult, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let base = profile_file_name(result.metadata.ended_at);
    let mut path = dir.join(&base);
    let mut n = 1;
    while path.exists() {
        let stem = base.trim_end_matches(&format!(".{PROFILE_EXTENSION}"));
        path = dir.join(format!("{stem}-{n}.{PROFILE_EXTENSION}"));
        n += 1;
    }
    fs::write(&path, result.to_json_bytes()?)?;
    Ok(path)
}

// =============================================================================
// Activity log
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActivityData {
    Url(String),
    File(PathBuf),
}

/// One recorded export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub user: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub data: ActivityData,
}

impl Activity {
    #[must_use]
    pub fn profiler(user: impl Into<String>, data: ActivityData) -> Self {
        Self {
            user: user.into(),
            time: Utc::now(),
            activity_type: "Profiler".to_string(),
            data,
        }
    }
}

pub trait ActivityLog: Send + Sync {
    fn record(&self, activity: Activity);

    /// Newest first.
    fn recent(&self) -> Vec<Activity>;
}

/// Bounded in-memory log.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    entries: Mutex<VecDeque<Activity>>,
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, activity: Activity) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_front(activity);
        entries.truncate(ACTIVITY_LOG_CAPACITY);
    }

    fn recent(&self) -> Vec<Activity> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Log persisted as a JSON array, rewritten on every record.
#[derive(Debug)]
pub struct FileActivityLog {
    path: PathBuf,
    memory: MemoryActivityLog,
}

impl FileActivityLog {
    /// Open (or start) the log at `path`. A missing file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let memory = MemoryActivityLog::default();
        if path.exists() {
            let raw = fs::read(&path)?;
            let mut entries: Vec<Activity> = serde_json::from_slice(&raw)?;
            entries.truncate(ACTIVITY_LOG_CAPACITY);
            *memory.entries.lock().unwrap_or_else(PoisonError::into_inner) = entries.into();
        }
        Ok(Self { path, memory })
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&self.memory.recent())?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl ActivityLog for FileActivityLog {
    fn record(&self, activity: Activity) {
        self.memory.record(activity);
        if let Err(e) = self.persist() {
            warn!(path = %self.path.display(), error = %e, "Failed to save activity log");
        }
    }

    fn recent(&self) -> Vec<Activity> {
        self.memory.recent()
    }
}

// =============================================================================
// Exporter
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Uploaded(String),
    Saved(PathBuf),
}

/// Upload-or-save policy for finished sessions.
#[derive(Clone)]
pub struct Exporter {
    sink: Option<Arc<dyn ResultSink>>,
    output_dir: PathBuf,
    activity: Arc<dyn ActivityLog>,
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("has_sink", &self.sink.is_some())
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

impl Exporter {
    #[must_use]
    pub fn new(
        sink: Option<Arc<dyn ResultSink>>,
        output_dir: impl Into<PathBuf>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            sink,
            output_dir: output_dir.into(),
            activity,
        }
    }

    #[must_use]
    pub fn activity(&self) -> &Arc<dyn ActivityLog> {
        &self.activity
    }

    /// Upload `result` (or save it when asked or when there is no sink),
    /// reporting progress through `out` and recording the activity for `user`.
    /// Upload and file writes run on the blocking pool.
    pub async fn export(
        &self,
        result: Arc<SessionResult>,
        user: &str,
        save_to_file: bool,
        out: &dyn MessageSink,
    ) -> Result<ExportOutcome> {
        let session_id = result.metadata.session_id;
        if !save_to_file {
            if let Some(sink) = &self.sink {
                match upload_blocking(Arc::clone(sink), Arc::clone(&result)).await {
                    Ok(url) => {
                        out.broadcast_prefixed("Profiler results:");
                        out.broadcast(&url);
                        self.activity
                            .record(Activity::profiler(user, ActivityData::Url(url.clone())));
                        info!(session_id, url = %url, "Profiler results uploaded");
                        return Ok(ExportOutcome::Uploaded(url));
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "Profiler result upload failed");
                        out.broadcast_prefixed(
                            "An error occurred whilst uploading the results. Attempting to save to disk instead.",
                        );
                    }
                }
            }
        }

        let path = save_to_file_reporting(result, self.output_dir.clone(), out).await?;
        self.activity
            .record(Activity::profiler(user, ActivityData::File(path.clone())));
        info!(session_id, path = %path.display(), "Profiler results saved");
        Ok(ExportOutcome::Saved(path))
    }
}

async fn upload_blocking(sink: Arc<dyn ResultSink>, result: Arc<SessionResult>) -> Result<String> {
    tokio::task::spawn_blocking(move || sink.upload(&result))
        .await
        .map_err(|e| Error::Export(format!("upload task failed: {e}")))?
}

async fn save_to_file_reporting(
    result: Arc<SessionResult>,
    dir: PathBuf,
    out: &dyn MessageSink,
) -> Result<PathBuf> {
    let target = dir.clone();
    let saved = tokio::task::spawn_blocking(move || save_to_file(&result, &target))
        .await
        .map_err(|e| Error::Export(format!("save task failed: {e}")))
        .and_then(|r| r);
    match saved {
        Ok(path) => {
            out.broadcast_prefixed(&format!("Data has been written to: {}", path.display()));
            Ok(path)
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to save profiler results");
            out.broadcast_prefixed("An error occurred whilst saving the data.");
            Err(Error::Export(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::CollectingSink;

    fn result() -> SessionResult {
        let at = DateTime::parse_from_rfc3339("2024-03-05T06:07:08Z")
            .unwrap()
            .with_timezone(&Utc);
        SessionResult {
            metadata: SessionMetadata {
                session_id: 7,
                started_at: at,
                ended_at: at,
                duration_ms: 1000,
                thread_policy: "all".to_string(),
                grouping: "by pool".to_string(),
                merge_mode: "same method".to_string(),
                interval_ms: 4.0,
                background: false,
                only_ticks_over_ms: None,
                creator: Some("ops".to_string()),
                comment: None,
                stop_reason: Some(StopReason::Manual),
                capture_count: 0,
                capture_failures: 0,
            },
            trees: Vec::new(),
            hotspots: Vec::new(),
        }
    }

    struct FixedSink(std::result::Result<String, String>);

    impl ResultSink for FixedSink {
        fn upload(&self, _result: &SessionResult) -> Result<String> {
            self.0.clone().map_err(Error::Export)
        }
    }

    #[test]
    fn file_name_uses_timestamp() {
        assert_eq!(
            profile_file_name(result().metadata.ended_at),
            "profile-2024-03-05_06.07.08.sparkprofile"
        );
    }

    #[test]
    fn save_round_trips_and_avoids_clobbering() {
        let dir = tempfile::tempdir().unwrap();
        let first = save_to_file(&result(), dir.path()).unwrap();
        let second = save_to_file(&result(), dir.path()).unwrap();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1.sparkprofile"));
        let loaded = SessionResult::from_json_bytes(&fs::read(&first).unwrap()).unwrap();
        assert_eq!(loaded, result());
    }

    #[tokio::test]
    async fn upload_success_records_url() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(MemoryActivityLog::default());
        let exporter = Exporter::new(
            Some(Arc::new(FixedSink(Ok("https://viewer/abc".to_string())))),
            dir.path(),
            log.clone(),
        );
        let out = CollectingSink::default();
        let outcome = exporter
            .export(Arc::new(result()), "ops", false, &out)
            .await
            .unwrap();
        assert_eq!(outcome, ExportOutcome::Uploaded("https://viewer/abc".to_string()));
        assert!(out.contains("https://viewer/abc"));
        assert_eq!(log.recent()[0].data, ActivityData::Url("https://viewer/abc".to_string()));
    }

    #[tokio::test]
    async fn upload_failure_falls_back_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(MemoryActivityLog::default());
        let exporter = Exporter::new(
            Some(Arc::new(FixedSink(Err("503".to_string())))),
            dir.path(),
            log.clone(),
        );
        let out = CollectingSink::default();
        let outcome = exporter
            .export(Arc::new(result()), "ops", false, &out)
            .await
            .unwrap();
        let ExportOutcome::Saved(path) = outcome else {
            panic!("expected a saved file");
        };
        assert!(path.exists());
        assert!(out.contains("Attempting to save to disk instead."));
        assert!(out.contains("Data has been written to:"));
        assert!(matches!(log.recent()[0].data, ActivityData::File(_)));
    }

    #[tokio::test]
    async fn save_requested_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(
            Some(Arc::new(FixedSink(Ok("unused".to_string())))),
            dir.path().join("nested"),
            Arc::new(MemoryActivityLog::default()),
        );
        let out = CollectingSink::default();
        let outcome = exporter
            .export(Arc::new(result()), "ops", true, &out)
            .await
            .unwrap();
        assert!(matches!(outcome, ExportOutcome::Saved(_)));
        assert!(!out.contains("unused"));
    }

    struct SlowSink;

    impl ResultSink for SlowSink {
        fn upload(&self, _result: &SessionResult) -> Result<String> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok("https://viewer/slow".to_string())
        }
    }

    #[tokio::test]
    async fn slow_upload_does_not_stall_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = Exporter::new(
            Some(Arc::new(SlowSink)),
            dir.path(),
            Arc::new(MemoryActivityLog::default()),
        );
        let export = tokio::spawn(async move {
            let out = CollectingSink::default();
            exporter.export(Arc::new(result()), "ops", false, &out).await
        });
        tokio::task::yield_now().await;

        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        let outcome = export.await.unwrap().unwrap();
        assert_eq!(outcome, ExportOutcome::Uploaded("https://viewer/slow".to_string()));
    }

    #[test]
    fn memory_log_is_bounded_newest_first() {
        let log = MemoryActivityLog::default();
        for i in 0..(ACTIVITY_LOG_CAPACITY + 5) {
            log.record(Activity::profiler(format!("u{i}"), ActivityData::Url(String::new())));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), ACTIVITY_LOG_CAPACITY);
        assert_eq!(recent[0].user, format!("u{}", ACTIVITY_LOG_CAPACITY + 4));
    }

    #[test]
    fn file_log_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.json");
        {
            let log = FileActivityLog::open(&path).unwrap();
            log.record(Activity::profiler("ops", ActivityData::File(PathBuf::from("a.sparkprofile"))));
        }
        let reopened = FileActivityLog::open(&path).unwrap();
        let recent = reopened.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].activity_type, "Profiler");
        assert_eq!(recent[0].user, "ops");
    }
}
