//! Polling-visible run state.
//!
//! Consumers that are not holding the live stream (or that reconnected)
//! follow a run through a [`RunState`] record the orchestrator keeps in the
//! key-value store under `state:{runId}`, refreshed on every event and
//! swept by TTL.

use crate::kv::KvStore;
use crate::model::event::{EvaluationEvent, RunSummary, StopReason};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

/// Maximum number of events kept in the recent-event ring.
pub const RECENT_EVENTS_LIMIT: usize = 50;

fn state_key(run_id: &str) -> String {
    format!("state:{run_id}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Stopped,
}

/// Snapshot of a run for polling consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    pub status: RunStatus,
    pub progress: usize,
    pub total: usize,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Bounded ring of the most recent events, oldest first.
    #[serde(default)]
    pub recent_events: VecDeque<EvaluationEvent>,
}

impl RunState {
    /// Loads the state of a run, if one is (still) recorded.
    pub async fn load(kv: &dyn KvStore, run_id: &str) -> Option<RunState> {
        let raw = kv.get(&state_key(run_id)).await.ok()??;
        serde_json::from_str(&raw).ok()
    }
}

/// Maintains and persists one run's [`RunState`].
pub struct RunStateTracker {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    state: Mutex<RunState>,
}

impl RunStateTracker {
    pub fn new(
        kv: Arc<dyn KvStore>,
        ttl: Duration,
        run_id: String,
        project_id: String,
        experiment_id: Option<String>,
        started_at: u64,
    ) -> Self {
        Self {
            kv,
            ttl,
            state: Mutex::new(RunState {
                run_id,
                project_id,
                experiment_id,
                status: RunStatus::Running,
                progress: 0,
                total: 0,
                started_at,
                finished_at: None,
                summary: None,
                error: None,
                recent_events: VecDeque::new(),
            }),
        }
    }

    /// Folds one event into the state and persists the new snapshot.
    pub async fn record(&self, event: &EvaluationEvent, now_ms: u64) {
        let mut state = self.state.lock().await;
        match event {
            EvaluationEvent::ExecutionStarted { total, .. } => {
                state.total = *total;
            }
            EvaluationEvent::Progress { completed, total } => {
                state.progress = *completed;
                state.total = *total;
            }
            EvaluationEvent::Error { message, .. } => {
                state.error = Some(message.clone());
            }
            EvaluationEvent::Stopped { reason } => {
                state.status = RunStatus::Stopped;
                state.finished_at = Some(now_ms);
                if *reason == StopReason::Error && state.error.is_none() {
                    state.error = Some("stopped on error".to_string());
                }
            }
            EvaluationEvent::Done { summary } => {
                state.status = RunStatus::Completed;
                state.finished_at = Some(summary.timestamps.finished_at);
                state.summary = Some(summary.clone());
            }
            _ => {}
        }

        state.recent_events.push_back(event.clone());
        while state.recent_events.len() > RECENT_EVENTS_LIMIT {
            state.recent_events.pop_front();
        }

        match serde_json::to_string(&*state) {
            Ok(serialized) => {
                if let Err(e) = self
                    .kv
                    .set(&state_key(&state.run_id), &serialized, Some(self.ttl))
                    .await
                {
                    warn!(run_id = %state.run_id, error = %e, "failed to persist run state");
                }
            }
            Err(e) => warn!(run_id = %state.run_id, error = %e, "failed to serialize run state"),
        }
    }
}
