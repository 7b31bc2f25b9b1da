//! Public events emitted by a run.
//!
//! The orchestrator's output is a single ordered async sequence of
//! [`EvaluationEvent`]s. Field names serialize in camelCase, matching the
//! wire format consumed by SSE clients of the surrounding service.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A monetary cost attributed to a target or evaluator execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cost {
    pub currency: String,
    pub amount: f64,
}

impl Cost {
    pub fn usd(amount: f64) -> Self {
        Self {
            currency: "USD".to_string(),
            amount,
        }
    }
}

/// The verdict of one evaluator on one target output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationResult {
    Processed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<Cost>,
    },
    Error {
        error_type: String,
        details: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    Skipped,
}

impl EvaluationResult {
    /// Synthesized verdict for an evaluator whose submission to the backend
    /// failed outright.
    pub fn evaluator_error(details: impl Into<String>) -> Self {
        Self::Error {
            error_type: "EvaluatorError".to_string(),
            details: details.into(),
            traceback: Vec::new(),
        }
    }
}

/// Why a run stopped before completing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    User,
    Error,
}

/// Start/finish timestamps of a run, in milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunTimestamps {
    pub started_at: u64,
    pub finished_at: u64,
}

/// Final accounting of a run that completed normally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub total_cells: usize,
    pub completed_cells: usize,
    pub failed_cells: usize,
    /// Wall-clock duration in milliseconds.
    pub duration: u64,
    pub timestamps: RunTimestamps,
}

/// One event in a run's ordered event log.
///
/// Per run, exactly one `execution_started` is emitted first and exactly one
/// of `done`/`stopped` is emitted last. A `progress` event follows the final
/// sub-event of each accounted cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EvaluationEvent {
    ExecutionStarted {
        run_id: String,
        total: usize,
    },
    CellStarted {
        row_index: usize,
        target_id: String,
    },
    TargetResult {
        row_index: usize,
        target_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<Cost>,
        /// Backend wall-time in milliseconds, queueing included.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    EvaluatorResult {
        row_index: usize,
        target_id: String,
        evaluator_id: String,
        result: EvaluationResult,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evaluator_id: Option<String>,
    },
    Stopped {
        reason: StopReason,
    },
    Done {
        summary: RunSummary,
    },
}

impl EvaluationEvent {
    /// The wire tag of this event, useful for logging and ring buffers.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::CellStarted { .. } => "cell_started",
            Self::TargetResult { .. } => "target_result",
            Self::EvaluatorResult { .. } => "evaluator_result",
            Self::Progress { .. } => "progress",
            Self::Error { .. } => "error",
            Self::Stopped { .. } => "stopped",
            Self::Done { .. } => "done",
        }
    }

    /// Whether this is one of the two terminal events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped { .. } | Self::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = EvaluationEvent::TargetResult {
            row_index: 0,
            target_id: "t-1".to_string(),
            output: Some(json!({"pizza": false})),
            cost: Some(Cost::usd(0.002)),
            duration: Some(120),
            trace_id: Some("abc".to_string()),
            error: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "target_result");
        assert_eq!(value["rowIndex"], 0);
        assert_eq!(value["targetId"], "t-1");
        assert_eq!(value["output"]["pizza"], false);
        assert_eq!(value["cost"]["currency"], "USD");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_result_status_tag() {
        let result = EvaluationResult::Error {
            error_type: "EvaluatorError".to_string(),
            details: "boom".to_string(),
            traceback: Vec::new(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error_type"], "EvaluatorError");

        let skipped = serde_json::to_value(EvaluationResult::Skipped).unwrap();
        assert_eq!(skipped["status"], "skipped");
    }

    #[test]
    fn test_event_type_names() {
        let event = EvaluationEvent::Progress {
            completed: 1,
            total: 2,
        };
        assert_eq!(event.event_type(), "progress");
        assert!(!event.is_terminal());
        assert!(
            EvaluationEvent::Stopped {
                reason: StopReason::User
            }
            .is_terminal()
        );
    }
}
