//! Cell enumeration per execution scope.
//!
//! Cells are generated lazily at orchestration start, before
//! `execution_started` is emitted, so the event's `total` is exact. Empty
//! rows are skipped here and never cause any events.

use crate::model::{
    DATASET_ID_FIELD, EvaluatorConfig, ExecutionCell, ExecutionRequest, ExecutionScope, JsonMap,
    TargetConfig,
};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Whether a dataset row has no content worth executing.
///
/// A row is empty iff every non-structural field is null, an empty string,
/// or whitespace only. Structural fields are `id` and anything starting
/// with `_` (the synthetic dataset id included).
pub fn is_empty_row(row: &JsonMap) -> bool {
    row.iter().all(|(key, value)| {
        if key == "id" || key.starts_with('_') {
            return true;
        }
        match value {
            JsonValue::Null => true,
            JsonValue::String(s) => s.trim().is_empty(),
            _ => false,
        }
    })
}

/// Enumerates the cells the scope selects.
///
/// `full` orders rows outer and targets inner; `rows` preserves the
/// caller's row order and drops out-of-range indices. Every scope skips
/// empty rows, `cell` included; only `evaluator` bypasses the check, being
/// a rerun against a provided output.
pub fn generate_cells(request: &ExecutionRequest) -> Vec<ExecutionCell> {
    match &request.scope {
        ExecutionScope::Full => {
            let row_indices: Vec<usize> = (0..request.dataset.rows.len()).collect();
            grid_cells(request, &row_indices, &request.targets)
        }
        ExecutionScope::Rows { row_indices } => {
            let row_indices: Vec<usize> = row_indices
                .iter()
                .copied()
                .filter(|&i| i < request.dataset.rows.len())
                .collect();
            grid_cells(request, &row_indices, &request.targets)
        }
        ExecutionScope::Target { target_id } => {
            let Some(target) = request.target(target_id) else {
                warn!(target_id = %target_id, "scope references an unknown target");
                return Vec::new();
            };
            let row_indices: Vec<usize> = (0..request.dataset.rows.len()).collect();
            grid_cells(request, &row_indices, std::slice::from_ref(target))
        }
        ExecutionScope::Cell {
            row_index,
            target_id,
        } => {
            let Some(target) = request.target(target_id) else {
                warn!(target_id = %target_id, "scope references an unknown target");
                return Vec::new();
            };
            grid_cells(request, &[*row_index], std::slice::from_ref(target))
        }
        ExecutionScope::Evaluator {
            row_index,
            target_id,
            evaluator_id,
            target_output,
            trace_id,
        } => evaluator_rerun_cell(
            request,
            *row_index,
            target_id,
            evaluator_id,
            target_output.clone(),
            trace_id.clone(),
        )
        .into_iter()
        .collect(),
    }
}

fn entry_for_row(request: &ExecutionRequest, row: &JsonMap) -> JsonMap {
    let mut entry = row.clone();
    entry.insert(
        DATASET_ID_FIELD.to_string(),
        JsonValue::String(request.dataset.dataset_id.clone()),
    );
    entry
}

fn evaluators_for_target(request: &ExecutionRequest, target_id: &str) -> Vec<EvaluatorConfig> {
    request
        .evaluators
        .iter()
        .filter(|e| e.targets(&request.dataset.dataset_id, target_id))
        .cloned()
        .collect()
}

fn grid_cells(
    request: &ExecutionRequest,
    row_indices: &[usize],
    targets: &[TargetConfig],
) -> Vec<ExecutionCell> {
    let mut cells = Vec::new();
    for &row_index in row_indices {
        let Some(row) = request.dataset.rows.get(row_index) else {
            continue;
        };
        if is_empty_row(row) {
            continue;
        }
        for target in targets {
            cells.push(ExecutionCell {
                row_index,
                target: target.clone(),
                evaluators: evaluators_for_target(request, &target.id),
                entry: entry_for_row(request, row),
                skip_target: false,
                precomputed_target_output: None,
                trace_id: None,
            });
        }
    }
    cells
}

fn evaluator_rerun_cell(
    request: &ExecutionRequest,
    row_index: usize,
    target_id: &str,
    evaluator_id: &str,
    target_output: Option<JsonValue>,
    trace_id: Option<String>,
) -> Option<ExecutionCell> {
    let target = request.target(target_id).or_else(|| {
        warn!(target_id = %target_id, "scope references an unknown target");
        None
    })?;
    let evaluator = request.evaluator(evaluator_id).or_else(|| {
        warn!(evaluator_id = %evaluator_id, "scope references an unknown evaluator");
        None
    })?;
    let row = request.dataset.rows.get(row_index).or_else(|| {
        warn!(row_index, "scope references an out-of-range row");
        None
    })?;

    Some(ExecutionCell {
        row_index,
        target: target.clone(),
        evaluators: vec![evaluator.clone()],
        entry: entry_for_row(request, row),
        skip_target: target_output.is_some(),
        precomputed_target_output: target_output,
        trace_id,
    })
}
