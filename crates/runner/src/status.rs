use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::log::iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Serialize)]
struct RunnerStatus<'a> {
    mode: RunnerMode,
    active_sessions: usize,
    active_session_ids: Vec<&'a str>,
    completed: usize,
    failed: usize,
    #[serde(serialize_with = "serialize_iso")]
    started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_iso")]
    updated_at: DateTime<Utc>,
}

fn serialize_iso<S: serde::Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&iso(dt))
}

/// Persists the set of running sessions to a JSON file, atomically.
///
/// Share via `Arc<StatusTracker>`. Without a path every update is in-memory only.
pub struct StatusTracker {
    started_at: DateTime<Utc>,
    path: Option<PathBuf>,
    state: Mutex<MutableState>,
}

struct MutableState {
    mode: RunnerMode,
    active: BTreeSet<String>,
    completed: usize,
    failed: usize,
}

impl StatusTracker {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            started_at: Utc::now(),
            path,
            state: Mutex::new(MutableState {
                mode: RunnerMode::Running,
                active: BTreeSet::new(),
                completed: 0,
                failed: 0,
            }),
        }
    }

    pub async fn set_mode(&self, mode: RunnerMode) {
        let mut state = self.state.lock().await;
        state.mode = mode;
        self.write_status(&state).await;
    }

    pub async fn add_session(&self, session_id: &str) {
        let mut state = self.state.lock().await;
        state.active.insert(session_id.to_string());
        self.write_status(&state).await;
    }

    /// Drop `session_id` from the active set and count how it ended.
    pub async fn finish_session(&self, session_id: &str, success: bool) {
        let mut state = self.state.lock().await;
        if !state.active.remove(session_id) {
            return;
        }
        if success {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
        self.write_status(&state).await;
    }

    pub async fn write_initial(&self) {
        let state = self.state.lock().await;
        self.write_status(&state).await;
    }

    /// Atomic write: write to a temp file in the same directory, then rename.
    async fn write_status(&self, state: &MutableState) {
        let Some(path) = &self.path else {
            return;
        };
        let status = RunnerStatus {
            mode: state.mode,
            active_sessions: state.active.len(),
            active_session_ids: state.active.iter().map(String::as_str).collect(),
            completed: state.completed,
            failed: state.failed,
            started_at: self.started_at,
            updated_at: Utc::now(),
        };

        let json = match serde_json::to_string_pretty(&status) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize status");
                return;
            }
        };

        if let Some(parent) = path.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(error = %e, path = %parent.display(), "failed to create status directory");
            return;
        }
        let tmp = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            warn!(error = %e, path = %tmp.display(), "failed to write status temp file");
            return;
        }
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            warn!(error = %e, "failed to rename status file");
        }
    }
}
