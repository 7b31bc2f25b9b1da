//! Out-of-band run cancellation over the shared key-value store.
//!
//! Abort requests are sticky: the flag stays set until the orchestrator
//! clears it on termination, and a TTL sweeps it if the orchestrator died.
//! When the store is unreachable, writes become logged no-ops and reads
//! report "not aborted" so a degraded store never takes runs down.

use crate::kv::KvStore;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// TTL for `abort:{runId}` and `running:{runId}` flags.
pub const FLAG_TTL: Duration = Duration::from_secs(3600);

/// Publishes and observes per-run abort and liveness flags.
#[derive(Clone)]
pub struct AbortCoordinator {
    kv: Arc<dyn KvStore>,
}

impl AbortCoordinator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn abort_key(run_id: &str) -> String {
        format!("abort:{run_id}")
    }

    fn running_key(run_id: &str) -> String {
        format!("running:{run_id}")
    }

    /// Requests cooperative cancellation of `run_id`. Idempotent.
    pub async fn request_abort(&self, run_id: &str) {
        if let Err(e) = self
            .kv
            .set(&Self::abort_key(run_id), "1", Some(FLAG_TTL))
            .await
        {
            warn!(run_id, error = %e, "failed to set abort flag");
        }
    }

    /// Whether an abort has been requested for `run_id`.
    ///
    /// Degrades to `false` when the store cannot be reached.
    pub async fn is_aborted(&self, run_id: &str) -> bool {
        match self.kv.get(&Self::abort_key(run_id)).await {
            Ok(value) => value.as_deref() == Some("1"),
            Err(e) => {
                warn!(run_id, error = %e, "failed to read abort flag");
                false
            }
        }
    }

    pub async fn clear_abort(&self, run_id: &str) {
        if let Err(e) = self.kv.delete(&Self::abort_key(run_id)).await {
            warn!(run_id, error = %e, "failed to clear abort flag");
        }
    }

    /// Marks `run_id` as running, stamping the current millisecond time.
    pub async fn set_running(&self, run_id: &str) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        if let Err(e) = self
            .kv
            .set(&Self::running_key(run_id), &now_ms.to_string(), Some(FLAG_TTL))
            .await
        {
            warn!(run_id, error = %e, "failed to set running flag");
        }
    }

    pub async fn clear_running(&self, run_id: &str) {
        if let Err(e) = self.kv.delete(&Self::running_key(run_id)).await {
            warn!(run_id, error = %e, "failed to clear running flag");
        }
    }

    /// A cheap cloneable handle bound to one run, handed to the backend so
    /// it can stop streaming early.
    pub fn signal(&self, run_id: &str) -> AbortSignal {
        AbortSignal {
            coordinator: self.clone(),
            run_id: run_id.to_string(),
        }
    }
}

/// Per-run abort probe passed down to backend clients.
#[derive(Clone)]
pub struct AbortSignal {
    coordinator: AbortCoordinator,
    run_id: String,
}

impl AbortSignal {
    pub async fn is_aborted(&self) -> bool {
        self.coordinator.is_aborted(&self.run_id).await
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}
