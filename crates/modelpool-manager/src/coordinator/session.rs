//! Loading sessions.
//!
//! One session tracks one coordinated load request from analysis to a
//! terminal status. Status, progress, and per-component results are
//! updated under a single lock so a session is never observable with a
//! terminal status but no end timestamp. Completed sessions stay
//! queryable for a retention window, then the sweep discards them.

use modelpool_core::{DeviceId, ModelError};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of one loading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Analyzing,
    Planning,
    ResourceValidation,
    Loading,
    Completed,
    PartialFailure,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::PartialFailure | SessionStatus::Failed
        )
    }
}

/// Outcome for one component within a session.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentLoadResult {
    pub component_id: String,
    pub success: bool,
    pub loading_time_ms: u64,
    pub error: Option<ModelError>,
    /// Set when the component was skipped because this dependency
    /// failed earlier in the plan.
    pub skipped_on: Option<String>,
    /// Recovery attempts consumed before the outcome, if any.
    pub recovery_attempts: u32,
}

/// One tracked load request.
#[derive(Debug, Clone, Serialize)]
pub struct LoadingSession {
    pub session_id: String,
    pub requested: Vec<String>,
    pub device: DeviceId,
    pub plan: Vec<Vec<String>>,
    pub status: SessionStatus,
    pub results: Vec<ComponentLoadResult>,
    pub progress_percent: f32,
    pub stage: String,
    #[serde(skip)]
    pub started_at: Instant,
    #[serde(skip)]
    pub ended_at: Option<Instant>,
    /// Wall-clock start for serialized diagnostics.
    pub started_at_utc: chrono::DateTime<chrono::Utc>,
}

impl LoadingSession {
    fn new(requested: Vec<String>, device: DeviceId) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            requested,
            device,
            plan: Vec::new(),
            status: SessionStatus::Analyzing,
            results: Vec::new(),
            progress_percent: 0.0,
            stage: "analyzing dependencies".to_string(),
            started_at: Instant::now(),
            ended_at: None,
            started_at_utc: chrono::Utc::now(),
        }
    }
}

/// Concurrency-safe session table with retention-based cleanup.
#[derive(Debug)]
pub struct SessionTable {
    sessions: RwLock<HashMap<String, LoadingSession>>,
    retention: Duration,
}

impl SessionTable {
    pub fn new(retention: Duration) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), retention }
    }

    /// Open a new session in `Analyzing` and return its id.
    pub async fn open(&self, requested: Vec<String>, device: DeviceId) -> String {
        let session = LoadingSession::new(requested, device);
        let id = session.session_id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        id
    }

    pub async fn get(&self, session_id: &str) -> Option<LoadingSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Advance a non-terminal session to a new status/stage. Terminal
    /// transitions go through [`SessionTable::close`] so the end
    /// timestamp is set in the same critical section.
    pub async fn advance(&self, session_id: &str, status: SessionStatus, stage: &str) {
        debug_assert!(!status.is_terminal(), "terminal transitions must use close()");
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = status;
            session.stage = stage.to_string();
        }
    }

    pub async fn set_plan(&self, session_id: &str, plan: Vec<Vec<String>>) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.plan = plan;
        }
    }

    pub async fn set_progress(&self, session_id: &str, percent: f32, stage: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.progress_percent = percent.clamp(0.0, 100.0);
            session.stage = stage.to_string();
        }
    }

    pub async fn push_result(&self, session_id: &str, result: ComponentLoadResult) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.results.push(result);
        }
    }

    /// Close a session with a terminal status; status, progress, and end
    /// time move together.
    pub async fn close(&self, session_id: &str, status: SessionStatus) {
        debug_assert!(status.is_terminal());
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = status;
            session.progress_percent = 100.0;
            session.stage = "done".to_string();
            session.ended_at = Some(Instant::now());
        }
    }

    /// Ids of sessions that have not reached a terminal status.
    pub async fn active_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Discard terminal sessions older than the retention window.
    /// Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| {
            !(s.status.is_terminal()
                && s.ended_at.is_some_and(|t| t.elapsed() > self.retention))
        });
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(removed, "swept expired loading sessions");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
