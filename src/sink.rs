//! Auxiliary event dispatcher seam.
//!
//! Production dual-writes every public event to an analytics pipeline
//! (ClickHouse); the core only knows this trait. Dispatch failures are
//! logged by the orchestrator and never affect the run.

use crate::model::event::EvaluationEvent;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
#[error("event sink dispatch failed: {0}")]
pub struct SinkError(pub String);

/// Receives every event of a run, in emission order.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, run_id: &str, event: &EvaluationEvent) -> Result<(), SinkError>;
}

/// In-process sink collecting events for assertions.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<(String, EvaluationEvent)>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<(String, EvaluationEvent)> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn dispatch(&self, run_id: &str, event: &EvaluationEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .await
            .push((run_id.to_string(), event.clone()));
        Ok(())
    }
}
