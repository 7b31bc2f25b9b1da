//! Data model for evaluation runs.
//!
//! Everything the orchestrator consumes arrives pre-resolved: the API layer
//! has already loaded prompts, agents and evaluator records, normalized
//! dataset column ids to names, and parsed JSON columns. The types here are
//! the contract between that layer and the core.

pub mod event;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// A JSON object, the shape of a dataset row and of component outputs.
pub type JsonMap = serde_json::Map<String, JsonValue>;

/// Synthetic field injected into every cell's dataset entry so downstream
/// consumers can tell which dataset the row came from.
pub const DATASET_ID_FIELD: &str = "_datasetId";

/// The caller-selected subset of cells to execute.
///
/// A cell is one (dataset row, target) pair; see [`ExecutionCell`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ExecutionScope {
    /// Every row × every target.
    Full,
    /// The given rows × every target, in the caller's row order.
    Rows { row_indices: Vec<usize> },
    /// Every row × one target.
    Target { target_id: String },
    /// A single cell.
    Cell { row_index: usize, target_id: String },
    /// A single evaluator rerun.
    ///
    /// When `target_output` is present the target is not re-executed; when
    /// `trace_id` is present the evaluator span appends to the existing
    /// trace instead of starting a new one.
    Evaluator {
        row_index: usize,
        target_id: String,
        evaluator_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_output: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
    },
}

/// A typed input or output field declared on a target or evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub identifier: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

impl FieldSpec {
    pub fn new(identifier: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            field_type: field_type.into(),
        }
    }
}

/// Where a mapped input draws its value from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    Dataset,
    Target,
}

/// A rule that populates one input field of a target or evaluator.
///
/// `source_field` always names a dataset column **by name** (the API layer
/// normalizes column ids to names before the core sees the data) or an
/// output field of an upstream target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Mapping {
    Source {
        source: MappingSource,
        source_id: String,
        source_field: String,
    },
    Value {
        value: JsonValue,
    },
}

/// Message role inside a prompt configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

/// LLM parameters for an inline or versioned prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// An inline prompt supplied directly on a target, bypassing the prompt
/// registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalPromptConfig {
    pub llm: LlmConfig,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub inputs: Vec<FieldSpec>,
    #[serde(default)]
    pub outputs: Vec<FieldSpec>,
}

/// A prompt resolved by the caller from `{promptId, promptVersionNumber?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionedPrompt {
    pub id: String,
    pub name: String,
    pub version_number: u32,
    pub llm: LlmConfig,
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
    #[serde(default)]
    pub inputs: Vec<FieldSpec>,
    #[serde(default)]
    pub outputs: Vec<FieldSpec>,
}

/// The kind of executable an agent target references.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Http,
    Signature,
    Code,
    Workflow,
}

/// What the target under evaluation actually is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TargetKind {
    /// An inline or referenced prompt.
    Prompt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_version_number: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        local_prompt_config: Option<LocalPromptConfig>,
    },
    /// A stored agent, loaded by the caller into [`ExecutionRequest::agents`].
    Agent {
        agent_type: AgentType,
        db_agent_id: String,
    },
    /// An evaluator used as the target; its verdict is the target's output.
    Evaluator {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_evaluator_id: Option<String>,
    },
}

/// One target of the evaluation grid.
///
/// `mappings` is keyed `datasetId → inputField → Mapping`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: TargetKind,
    #[serde(default)]
    pub inputs: Vec<FieldSpec>,
    #[serde(default)]
    pub outputs: Vec<FieldSpec>,
    #[serde(default)]
    pub mappings: HashMap<String, HashMap<String, Mapping>>,
}

/// A downstream judge attached to a target.
///
/// `mappings` is keyed `datasetId → targetId → inputField → Mapping`.
/// Settings are never taken from this config; they come from the loaded
/// [`EvaluatorRecord`] keyed by `db_evaluator_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorConfig {
    pub id: String,
    pub evaluator_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_evaluator_id: Option<String>,
    #[serde(default)]
    pub inputs: Vec<FieldSpec>,
    #[serde(default)]
    pub mappings: HashMap<String, HashMap<String, HashMap<String, Mapping>>>,
}

impl EvaluatorConfig {
    /// Whether this evaluator targets the given target on the given dataset.
    ///
    /// An evaluator with no mappings at all applies to every target.
    pub fn targets(&self, dataset_id: &str, target_id: &str) -> bool {
        if self.mappings.is_empty() {
            return true;
        }
        self.mappings
            .get(dataset_id)
            .is_some_and(|by_target| by_target.contains_key(target_id))
    }
}

/// A stored agent record, loaded by the caller.
///
/// `config` carries the agent-type-specific payload: url/method/headers for
/// `http`, `{llm, prompt, messages}` or a `parameters` array for
/// `signature`, and a `parameters` array for `code`/`workflow`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub config: JsonValue,
}

/// A stored evaluator record, loaded by the caller and keyed by its id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorRecord {
    pub id: String,
    pub name: String,
    pub evaluator_type: String,
    #[serde(default)]
    pub config: EvaluatorRecordConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorRecordConfig {
    #[serde(default)]
    pub settings: JsonMap,
}

/// Static information about a known evaluator type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorTypeInfo {
    pub name: String,
    #[serde(default)]
    pub is_guardrail: bool,
}

/// A dataset column, with both its opaque id and its display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetColumn {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
}

/// The dataset the grid runs over. Rows are keyed by column **name**.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSource {
    pub dataset_id: String,
    pub columns: Vec<DatasetColumn>,
    pub rows: Vec<JsonMap>,
}

impl DatasetSource {
    /// Resolves a column name to its id, falling back to treating the name
    /// as an id when no column carries that name.
    pub fn column_id(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| c.id == name))
            .map(|c| c.id.as_str())
    }
}

/// Everything one run needs, fully resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    /// Caller-supplied run id; a three-word slug is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub scope: ExecutionScope,
    pub dataset: DatasetSource,
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub evaluators: Vec<EvaluatorConfig>,
    /// Loaded prompts, keyed by prompt id.
    #[serde(default)]
    pub prompts: HashMap<String, VersionedPrompt>,
    /// Loaded agents, keyed by agent id.
    #[serde(default)]
    pub agents: HashMap<String, AgentRecord>,
    /// Loaded evaluator records, keyed by evaluator id.
    #[serde(default)]
    pub evaluator_records: HashMap<String, EvaluatorRecord>,
    /// Known evaluator types, keyed by type identifier.
    #[serde(default)]
    pub evaluator_catalog: HashMap<String, EvaluatorTypeInfo>,
}

impl ExecutionRequest {
    pub fn target(&self, target_id: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.id == target_id)
    }

    pub fn evaluator(&self, evaluator_id: &str) -> Option<&EvaluatorConfig> {
        self.evaluators.iter().find(|e| e.id == evaluator_id)
    }
}

/// One unit of execution: a dataset row paired with a target, plus the
/// evaluators that judge that target's output.
///
/// Cells are generated once at orchestration start and never mutated.
#[derive(Debug, Clone)]
pub struct ExecutionCell {
    pub row_index: usize,
    pub target: TargetConfig,
    pub evaluators: Vec<EvaluatorConfig>,
    /// The dataset row, keyed by column name, with the synthetic
    /// [`DATASET_ID_FIELD`] added.
    pub entry: JsonMap,
    /// Skip target execution and use `precomputed_target_output` instead.
    pub skip_target: bool,
    pub precomputed_target_output: Option<JsonValue>,
    /// Preset trace id for evaluator reruns appending to an existing trace.
    pub trace_id: Option<String>,
}

impl ExecutionCell {
    pub fn target_id(&self) -> &str {
        &self.target.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_serde_round_trip() {
        let scope = ExecutionScope::Evaluator {
            row_index: 1,
            target_id: "t-1".to_string(),
            evaluator_id: "e-1".to_string(),
            target_output: Some(json!({"output": "world"})),
            trace_id: None,
        };
        let value = serde_json::to_value(&scope).unwrap();
        assert_eq!(value["type"], "evaluator");
        assert_eq!(value["rowIndex"], 1);
        assert_eq!(value["targetOutput"]["output"], "world");

        let back: ExecutionScope = serde_json::from_value(value).unwrap();
        assert_eq!(back, scope);
    }

    #[test]
    fn test_mapping_serde_tags() {
        let mapping: Mapping = serde_json::from_value(json!({
            "type": "source",
            "source": "dataset",
            "sourceId": "ds-1",
            "sourceField": "question",
        }))
        .unwrap();
        assert_eq!(
            mapping,
            Mapping::Source {
                source: MappingSource::Dataset,
                source_id: "ds-1".to_string(),
                source_field: "question".to_string(),
            }
        );

        let literal: Mapping = serde_json::from_value(json!({
            "type": "value",
            "value": 42,
        }))
        .unwrap();
        assert_eq!(literal, Mapping::Value { value: json!(42) });
    }

    #[test]
    fn test_target_kind_flattened_tag() {
        let target: TargetConfig = serde_json::from_value(json!({
            "id": "t-1",
            "type": "agent",
            "agentType": "http",
            "dbAgentId": "agent-9",
        }))
        .unwrap();
        assert_eq!(
            target.kind,
            TargetKind::Agent {
                agent_type: AgentType::Http,
                db_agent_id: "agent-9".to_string(),
            }
        );
    }

    #[test]
    fn test_evaluator_targets() {
        let mut evaluator = EvaluatorConfig {
            id: "e-1".to_string(),
            evaluator_type: "langevals/exact_match".to_string(),
            db_evaluator_id: None,
            inputs: Vec::new(),
            mappings: HashMap::new(),
        };
        assert!(evaluator.targets("ds-1", "t-1"));

        let mut by_target = HashMap::new();
        by_target.insert("t-1".to_string(), HashMap::new());
        evaluator.mappings.insert("ds-1".to_string(), by_target);
        assert!(evaluator.targets("ds-1", "t-1"));
        assert!(!evaluator.targets("ds-1", "t-2"));
        assert!(!evaluator.targets("ds-2", "t-1"));
    }

    #[test]
    fn test_column_id_resolution() {
        let dataset = DatasetSource {
            dataset_id: "ds-1".to_string(),
            columns: vec![DatasetColumn {
                id: "col_1".to_string(),
                name: "question".to_string(),
                column_type: "str".to_string(),
            }],
            rows: Vec::new(),
        };
        assert_eq!(dataset.column_id("question"), Some("col_1"));
        assert_eq!(dataset.column_id("col_1"), Some("col_1"));
        assert_eq!(dataset.column_id("missing"), None);
    }
}
