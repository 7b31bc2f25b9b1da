//! Translation of backend stream events into public evaluation events.
//!
//! Backends return loosely-typed JSON; [`coerce_score`] and
//! [`coerce_passed`] are the only sanctioned entry points for turning that
//! into typed verdict fields. Both are pure and total: anything that does
//! not coerce becomes `None`.

use crate::backend::{ComponentStateChange, ExecutionState, ExecutionStatus};
use crate::model::event::{Cost, EvaluationEvent, EvaluationResult};
use crate::model::{EvaluatorConfig, EvaluatorTypeInfo, JsonMap};
use crate::workflow::ENTRY_NODE_ID;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};

/// Evaluator types whose score is intrinsically binary and therefore
/// stripped from emitted results, matched on the final path segment.
pub const SCORE_STRIP_TYPES: &[&str] = &["exact_match", "llm_answer_match"];

/// A node id split at its first dot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedNodeId<'a> {
    pub target_id: &'a str,
    pub evaluator_id: Option<&'a str>,
}

/// Splits a workflow node id into target and evaluator parts.
///
/// Everything before the **first** dot is the target id; target ids never
/// contain dots, so a dotless id is a plain target node.
pub fn parse_node_id(node_id: &str) -> ParsedNodeId<'_> {
    match node_id.split_once('.') {
        Some((target_id, evaluator_id)) => ParsedNodeId {
            target_id,
            evaluator_id: Some(evaluator_id),
        },
        None => ParsedNodeId {
            target_id: node_id,
            evaluator_id: None,
        },
    }
}

/// Coerces a loosely-typed score into a float.
///
/// Native numbers pass through; strings are trimmed and parsed, with empty
/// or non-numeric strings becoming `None`; every other type becomes `None`.
pub fn coerce_score(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse().ok()
            }
        }
        _ => None,
    }
}

/// Coerces a loosely-typed pass/fail flag into a boolean.
///
/// Native booleans pass through; strings equal (case-insensitive, trimmed)
/// to `"true"`/`"false"` map to the booleans; everything else is `None`.
pub fn coerce_passed(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => {
            let trimmed = s.trim();
            if trimmed.eq_ignore_ascii_case("true") {
                Some(true)
            } else if trimmed.eq_ignore_ascii_case("false") {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

const EVALUATOR_SHAPE_KEYS: &[&str] = &["passed", "score", "label", "details"];

/// Extracts the public target output from a backend `outputs` map.
///
/// 1. An evaluator-shaped map (any of `passed`/`score`/`label`/`details`)
///    is trimmed down to those keys.
/// 2. A map with exactly one key named `output` is unwrapped.
/// 3. Anything else is returned verbatim, preserving structured outputs
///    like `{"pizza": false}`.
pub fn extract_target_output(outputs: Option<&JsonMap>) -> Option<JsonValue> {
    let outputs = outputs?;

    if EVALUATOR_SHAPE_KEYS.iter().any(|k| outputs.contains_key(*k)) {
        let trimmed: JsonMap = EVALUATOR_SHAPE_KEYS
            .iter()
            .filter_map(|k| outputs.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect();
        return Some(JsonValue::Object(trimmed));
    }

    if outputs.len() == 1 {
        if let Some(value) = outputs.get("output") {
            return Some(value.clone());
        }
    }

    Some(JsonValue::Object(outputs.clone()))
}

/// Computes the set of evaluator ids whose emitted score must be omitted.
///
/// An evaluator is stripped when the catalog flags its type as a guardrail
/// or when the type's final path segment is in [`SCORE_STRIP_TYPES`];
/// `custom/…` types are never stripped. Computed once at run start.
pub fn compute_strip_set(
    evaluators: &[EvaluatorConfig],
    catalog: &HashMap<String, EvaluatorTypeInfo>,
) -> HashSet<String> {
    let mut strip = HashSet::new();
    for evaluator in evaluators {
        let evaluator_type = evaluator.evaluator_type.as_str();
        if evaluator_type.starts_with("custom/") {
            continue;
        }
        let is_guardrail = catalog
            .get(evaluator_type)
            .is_some_and(|info| info.is_guardrail);
        let last_segment = evaluator_type
            .rsplit('/')
            .next()
            .unwrap_or(evaluator_type);
        if is_guardrail || SCORE_STRIP_TYPES.contains(&last_segment) {
            strip.insert(evaluator.id.clone());
        }
    }
    strip
}

/// Translates one cell's backend events into public events.
pub struct ResultMapper {
    target_node_ids: HashSet<String>,
    strip_set: HashSet<String>,
}

impl ResultMapper {
    pub fn new(target_node_ids: HashSet<String>, strip_set: HashSet<String>) -> Self {
        Self {
            target_node_ids,
            strip_set,
        }
    }

    pub fn is_target(&self, component_id: &str) -> bool {
        self.target_node_ids.contains(component_id)
    }

    /// Maps a `component_state_change` to the public event it produces, if
    /// any. Entry-node events and non-terminal statuses are dropped.
    pub fn map_component_event(
        &self,
        row_index: usize,
        change: &ComponentStateChange,
    ) -> Option<EvaluationEvent> {
        if change.component_id == ENTRY_NODE_ID {
            return None;
        }
        let state = &change.execution_state;
        if !matches!(state.status, ExecutionStatus::Success | ExecutionStatus::Error) {
            return None;
        }

        if self.is_target(&change.component_id) {
            return Some(self.target_result(row_index, &change.component_id, state));
        }

        let parsed = parse_node_id(&change.component_id);
        let evaluator_id = parsed.evaluator_id?;
        Some(EvaluationEvent::EvaluatorResult {
            row_index,
            target_id: parsed.target_id.to_string(),
            evaluator_id: evaluator_id.to_string(),
            result: self.evaluator_result(evaluator_id, state),
        })
    }

    fn target_result(
        &self,
        row_index: usize,
        target_id: &str,
        state: &ExecutionState,
    ) -> EvaluationEvent {
        let error = match state.status {
            ExecutionStatus::Error => Some(
                state
                    .error
                    .clone()
                    .unwrap_or_else(|| "execution failed".to_string()),
            ),
            _ => state.error.clone(),
        };
        EvaluationEvent::TargetResult {
            row_index,
            target_id: target_id.to_string(),
            output: extract_target_output(state.outputs.as_ref()),
            cost: state.cost.map(Cost::usd),
            duration: state.duration_ms(),
            trace_id: state.trace_id.clone(),
            error,
        }
    }

    /// Normalizes a weakly-typed evaluator payload into a verdict.
    ///
    /// Execution-level errors win over payload-level ones.
    fn evaluator_result(&self, evaluator_id: &str, state: &ExecutionState) -> EvaluationResult {
        if state.status == ExecutionStatus::Error || state.error.is_some() {
            return EvaluationResult::evaluator_error(
                state
                    .error
                    .clone()
                    .unwrap_or_else(|| "evaluator execution failed".to_string()),
            );
        }

        let empty = JsonMap::new();
        let outputs = state.outputs.as_ref().unwrap_or(&empty);

        match outputs.get("status").and_then(JsonValue::as_str) {
            Some("error") => {
                return EvaluationResult::Error {
                    error_type: outputs
                        .get("error_type")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("EvaluatorError")
                        .to_string(),
                    details: outputs
                        .get("details")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    traceback: outputs
                        .get("traceback")
                        .and_then(JsonValue::as_array)
                        .map(|lines| {
                            lines
                                .iter()
                                .filter_map(|l| l.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default(),
                };
            }
            Some("skipped") => return EvaluationResult::Skipped,
            _ => {}
        }

        let score = outputs.get("score").and_then(|v| coerce_score(v));
        EvaluationResult::Processed {
            score: if self.strip_set.contains(evaluator_id) {
                None
            } else {
                score
            },
            passed: outputs.get("passed").and_then(|v| coerce_passed(v)),
            label: outputs
                .get("label")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            details: outputs
                .get("details")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            cost: state.cost.map(Cost::usd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionTimestamps;
    use serde_json::json;

    fn json_map(value: JsonValue) -> JsonMap {
        serde_json::from_value(value).unwrap()
    }

    fn success_state(outputs: JsonValue) -> ExecutionState {
        ExecutionState {
            status: ExecutionStatus::Success,
            outputs: Some(json_map(outputs)),
            error: None,
            cost: None,
            timestamps: None,
            trace_id: None,
        }
    }

    fn mapper(targets: &[&str], strip: &[&str]) -> ResultMapper {
        ResultMapper::new(
            targets.iter().map(|s| s.to_string()).collect(),
            strip.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn test_parse_node_id() {
        assert_eq!(
            parse_node_id("t-1"),
            ParsedNodeId {
                target_id: "t-1",
                evaluator_id: None
            }
        );
        assert_eq!(
            parse_node_id("t-1.e-1"),
            ParsedNodeId {
                target_id: "t-1",
                evaluator_id: Some("e-1")
            }
        );
        // Splits on the first dot only.
        assert_eq!(
            parse_node_id("a-b.c-d.e"),
            ParsedNodeId {
                target_id: "a-b",
                evaluator_id: Some("c-d.e")
            }
        );
    }

    #[test]
    fn test_coerce_score() {
        assert_eq!(coerce_score(&json!(0.85)), Some(0.85));
        assert_eq!(coerce_score(&json!("0.5")), Some(0.5));
        assert_eq!(coerce_score(&json!("  0.5  ")), Some(0.5));
        assert_eq!(coerce_score(&json!("abc")), None);
        assert_eq!(coerce_score(&json!("")), None);
        assert_eq!(coerce_score(&json!("   ")), None);
        assert_eq!(coerce_score(&json!(true)), None);
        assert_eq!(coerce_score(&json!(null)), None);
        assert_eq!(coerce_score(&json!([1])), None);
    }

    #[test]
    fn test_coerce_passed() {
        assert_eq!(coerce_passed(&json!(true)), Some(true));
        assert_eq!(coerce_passed(&json!(false)), Some(false));
        assert_eq!(coerce_passed(&json!("True")), Some(true));
        assert_eq!(coerce_passed(&json!(" FALSE ")), Some(false));
        assert_eq!(coerce_passed(&json!("yes")), None);
        assert_eq!(coerce_passed(&json!(0)), None);
        assert_eq!(coerce_passed(&json!(null)), None);
    }

    #[test]
    fn test_extract_target_output() {
        assert_eq!(
            extract_target_output(Some(&json_map(json!({"output": "x"})))),
            Some(json!("x"))
        );
        assert_eq!(
            extract_target_output(Some(&json_map(json!({"pizza": false})))),
            Some(json!({"pizza": false}))
        );
        // Evaluator-shaped maps are trimmed to the verdict keys.
        assert_eq!(
            extract_target_output(Some(&json_map(
                json!({"passed": false, "score": 0, "extra": 1})
            ))),
            Some(json!({"passed": false, "score": 0}))
        );
        assert_eq!(extract_target_output(None), None);
        // Two keys, one of them `output`: not the unwrap case.
        assert_eq!(
            extract_target_output(Some(&json_map(json!({"output": "x", "other": 1})))),
            Some(json!({"output": "x", "other": 1}))
        );
    }

    #[test]
    fn test_strip_set_computation() {
        let evaluators = vec![
            EvaluatorConfig {
                id: "e-exact".to_string(),
                evaluator_type: "langevals/exact_match".to_string(),
                db_evaluator_id: None,
                inputs: Vec::new(),
                mappings: HashMap::new(),
            },
            EvaluatorConfig {
                id: "e-guard".to_string(),
                evaluator_type: "langevals/pii_check".to_string(),
                db_evaluator_id: None,
                inputs: Vec::new(),
                mappings: HashMap::new(),
            },
            EvaluatorConfig {
                id: "e-custom".to_string(),
                evaluator_type: "custom/exact_match".to_string(),
                db_evaluator_id: None,
                inputs: Vec::new(),
                mappings: HashMap::new(),
            },
            EvaluatorConfig {
                id: "e-scored".to_string(),
                evaluator_type: "langevals/answer_relevancy".to_string(),
                db_evaluator_id: None,
                inputs: Vec::new(),
                mappings: HashMap::new(),
            },
        ];
        let mut catalog = HashMap::new();
        catalog.insert(
            "langevals/pii_check".to_string(),
            EvaluatorTypeInfo {
                name: "PII check".to_string(),
                is_guardrail: true,
            },
        );

        let strip = compute_strip_set(&evaluators, &catalog);
        assert!(strip.contains("e-exact"));
        assert!(strip.contains("e-guard"));
        assert!(!strip.contains("e-custom"));
        assert!(!strip.contains("e-scored"));
    }

    #[test]
    fn test_entry_and_running_events_are_dropped() {
        let mapper = mapper(&["t-1"], &[]);
        let entry = ComponentStateChange {
            component_id: "entry".to_string(),
            execution_state: success_state(json!({})),
        };
        assert_eq!(mapper.map_component_event(0, &entry), None);

        let running = ComponentStateChange {
            component_id: "t-1".to_string(),
            execution_state: ExecutionState {
                status: ExecutionStatus::Running,
                outputs: None,
                error: None,
                cost: None,
                timestamps: None,
                trace_id: None,
            },
        };
        assert_eq!(mapper.map_component_event(0, &running), None);
    }

    #[test]
    fn test_target_success_maps_to_target_result() {
        let mapper = mapper(&["t-1"], &[]);
        let mut state = success_state(json!({"output": "hi"}));
        state.cost = Some(0.002);
        state.trace_id = Some("trace-1".to_string());
        state.timestamps = Some(ExecutionTimestamps {
            started_at: Some(1_000),
            finished_at: Some(1_200),
        });
        let change = ComponentStateChange {
            component_id: "t-1".to_string(),
            execution_state: state,
        };

        let Some(EvaluationEvent::TargetResult {
            row_index,
            target_id,
            output,
            cost,
            duration,
            trace_id,
            error,
        }) = mapper.map_component_event(3, &change)
        else {
            panic!("expected target_result");
        };
        assert_eq!(row_index, 3);
        assert_eq!(target_id, "t-1");
        assert_eq!(output, Some(json!("hi")));
        assert_eq!(cost, Some(Cost::usd(0.002)));
        assert_eq!(duration, Some(200));
        assert_eq!(trace_id, Some("trace-1".to_string()));
        assert_eq!(error, None);
    }

    #[test]
    fn test_execution_error_wins_over_payload_error() {
        let mapper = mapper(&["t-1"], &[]);
        let change = ComponentStateChange {
            component_id: "t-1.e-1".to_string(),
            execution_state: ExecutionState {
                status: ExecutionStatus::Error,
                outputs: Some(json_map(
                    json!({"status": "error", "details": "payload says this"}),
                )),
                error: Some("backend exploded".to_string()),
                cost: None,
                timestamps: None,
                trace_id: None,
            },
        };

        let Some(EvaluationEvent::EvaluatorResult { result, .. }) =
            mapper.map_component_event(0, &change)
        else {
            panic!("expected evaluator_result");
        };
        assert_eq!(
            result,
            EvaluationResult::Error {
                error_type: "EvaluatorError".to_string(),
                details: "backend exploded".to_string(),
                traceback: Vec::new(),
            }
        );
    }

    #[test]
    fn test_payload_error_and_skipped() {
        let mapper = mapper(&["t-1"], &[]);
        let change = ComponentStateChange {
            component_id: "t-1.e-1".to_string(),
            execution_state: success_state(json!({
                "status": "error",
                "error_type": "RateLimitError",
                "details": "429 from provider",
                "traceback": ["line 1", "line 2"],
            })),
        };
        let Some(EvaluationEvent::EvaluatorResult { result, .. }) =
            mapper.map_component_event(0, &change)
        else {
            panic!("expected evaluator_result");
        };
        assert_eq!(
            result,
            EvaluationResult::Error {
                error_type: "RateLimitError".to_string(),
                details: "429 from provider".to_string(),
                traceback: vec!["line 1".to_string(), "line 2".to_string()],
            }
        );

        let skipped = ComponentStateChange {
            component_id: "t-1.e-1".to_string(),
            execution_state: success_state(json!({"status": "skipped"})),
        };
        let Some(EvaluationEvent::EvaluatorResult { result, .. }) =
            mapper.map_component_event(0, &skipped)
        else {
            panic!("expected evaluator_result");
        };
        assert_eq!(result, EvaluationResult::Skipped);
    }

    #[test]
    fn test_processed_coercion_and_strip() {
        let mapper = mapper(&["t-1"], &["e-strip"]);
        let state = success_state(json!({
            "score": "0.5",
            "passed": "True",
            "label": "match",
            "details": "close enough",
        }));

        let kept = ComponentStateChange {
            component_id: "t-1.e-keep".to_string(),
            execution_state: state.clone(),
        };
        let Some(EvaluationEvent::EvaluatorResult { result, .. }) =
            mapper.map_component_event(0, &kept)
        else {
            panic!("expected evaluator_result");
        };
        assert_eq!(
            result,
            EvaluationResult::Processed {
                score: Some(0.5),
                passed: Some(true),
                label: Some("match".to_string()),
                details: Some("close enough".to_string()),
                cost: None,
            }
        );

        let stripped = ComponentStateChange {
            component_id: "t-1.e-strip".to_string(),
            execution_state: state,
        };
        let Some(EvaluationEvent::EvaluatorResult { result, .. }) =
            mapper.map_component_event(0, &stripped)
        else {
            panic!("expected evaluator_result");
        };
        let EvaluationResult::Processed { score, passed, .. } = result else {
            panic!("expected processed");
        };
        assert_eq!(score, None);
        assert_eq!(passed, Some(true));
    }

    #[test]
    fn test_evaluator_as_target_routes_as_target() {
        // Dotless evaluator-as-target id is in the target set.
        let mapper = mapper(&["guard-1"], &[]);
        let change = ComponentStateChange {
            component_id: "guard-1".to_string(),
            execution_state: success_state(json!({"passed": false, "score": 0})),
        };
        let Some(EvaluationEvent::TargetResult { output, .. }) =
            mapper.map_component_event(0, &change)
        else {
            panic!("expected target_result");
        };
        assert_eq!(output, Some(json!({"passed": false, "score": 0})));
    }
}
