//! Component-execution backend protocol.
//!
//! The remote backend actually runs prompts, agents, HTTP calls and
//! evaluators; the core only submits `execute_component` requests and
//! consumes the resulting event stream. The backend receives an
//! [`AbortSignal`](crate::abort::AbortSignal) and may stop streaming early
//! when it reports aborted.

use crate::abort::AbortSignal;
use crate::model::JsonMap;
use crate::workflow::Workflow;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend RPC failures.
///
/// For a target these surface as `target_result.error`; for an evaluator as
/// a synthesized `evaluator_result` with status `error`.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend rpc failed: {0}")]
    Rpc(String),
    #[error("backend returned a malformed response: {0}")]
    InvalidResponse(String),
}

/// Component lifecycle states reported by the backend.
///
/// Only `success` and `error` produce public events; the rest are
/// book-keeping the mapper ignores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Waiting,
    Running,
    Success,
    Error,
}

/// Backend-side start/finish instants, milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionTimestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

/// The state of one component as reported in a stream event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<ExecutionTimestamps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ExecutionState {
    /// Backend wall-time in milliseconds, when both instants are present.
    pub fn duration_ms(&self) -> Option<u64> {
        let timestamps = self.timestamps.as_ref()?;
        let started = timestamps.started_at?;
        let finished = timestamps.finished_at?;
        finished.checked_sub(started)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ComponentStateChange {
    pub component_id: String,
    pub execution_state: ExecutionState,
}

/// One event on the backend's stream: `{type, payload}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BackendEvent {
    ComponentStateChange(ComponentStateChange),
    Debug(serde_json::Value),
    Done,
}

/// An `execute_component` submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ComponentRequest {
    pub trace_id: String,
    pub workflow: Workflow,
    /// Which node of the workflow to drive.
    pub node_id: String,
    /// Input values for that node, keyed by field identifier.
    pub inputs: JsonMap,
}

/// Stream of events for one component execution, ending when the backend
/// terminates it.
pub type BackendEventStream = BoxStream<'static, BackendEvent>;

/// Client-side contract of the remote execution backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Submits one component for execution and returns its event stream.
    ///
    /// Implementations must poll `signal` between emissions so an aborted
    /// run stops streaming early; an in-flight component may still run to
    /// completion.
    async fn execute_component(
        &self,
        request: ComponentRequest,
        signal: AbortSignal,
    ) -> Result<BackendEventStream, BackendError>;
}
