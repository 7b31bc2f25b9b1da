//! Per-cell workflow synthesis.
//!
//! For one [`ExecutionCell`] the assembler produces an executable graph:
//! entry node → target node → evaluator nodes, with edges derived from the
//! cell's mappings and literal values baked into node inputs.

use crate::model::{
    AgentType, EvaluatorConfig, ExecutionCell, ExecutionRequest, FieldSpec, Mapping,
    MappingSource, MessageRole, PromptMessage, TargetConfig, TargetKind,
};
use crate::workflow::{
    AssembledWorkflow, ENTRY_NODE_ID, Edge, InlineDataset, Node, NodeField, NodeParameter,
    NodeType, Workflow,
};
use serde_json::{Value as JsonValue, json};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

/// Assembly-time failures: a reference the caller was required to resolve is
/// missing. Fatal for the cell; the orchestrator surfaces it as an `error`
/// event and counts the cell as failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("prompt {0} has not been loaded")]
    MissingPrompt(String),
    #[error("prompt target {0} carries neither an inline prompt config nor a prompt reference")]
    MissingPromptConfig(String),
    #[error("agent {0} has not been loaded")]
    MissingAgent(String),
    #[error("evaluator {0} has not been loaded")]
    MissingEvaluator(String),
    #[error("target {0} is an evaluator target but references no evaluator")]
    MissingTargetEvaluator(String),
}

/// Outputs every evaluator node exposes.
fn evaluator_outputs() -> Vec<NodeField> {
    vec![
        NodeField::new("passed", "bool"),
        NodeField::new("score", "float"),
        NodeField::new("label", "str"),
    ]
}

/// Synthesizes executable graphs for cells of one request.
pub struct WorkflowAssembler<'a> {
    request: &'a ExecutionRequest,
}

impl<'a> WorkflowAssembler<'a> {
    pub fn new(request: &'a ExecutionRequest) -> Self {
        Self { request }
    }

    /// Builds the graph for `cell`: one entry node, one target node and one
    /// evaluator node per attached evaluator, wired per the cell's mappings.
    pub fn assemble(&self, cell: &ExecutionCell) -> Result<AssembledWorkflow, ConfigError> {
        let target_node = self.target_node(&cell.target)?;
        let target_node_id = target_node.id.clone();

        let mut nodes = vec![self.entry_node(cell), target_node];
        let mut edges = self.target_edges(&cell.target);

        let mut evaluator_node_ids = Vec::with_capacity(cell.evaluators.len());
        for evaluator in &cell.evaluators {
            let node = self.evaluator_node(&cell.target, evaluator)?;
            evaluator_node_ids.push(node.id.clone());
            edges.extend(self.evaluator_edges(&cell.target, evaluator));
            nodes.push(node);
        }

        Ok(AssembledWorkflow {
            workflow: Workflow {
                workflow_id: format!("cell-{}-{}", cell.row_index, cell.target.id),
                nodes,
                edges,
            },
            target_node_id,
            evaluator_node_ids,
        })
    }

    /// Entry node: outputs mirror the dataset column schema, values come
    /// from the cell's entry keyed by column name with a column-id fallback,
    /// and the single-row dataset is inlined for the backend.
    fn entry_node(&self, cell: &ExecutionCell) -> Node {
        let dataset = &self.request.dataset;
        let mut node = Node::new(ENTRY_NODE_ID, NodeType::Entry);
        node.outputs = dataset
            .columns
            .iter()
            .map(|column| {
                let mut field = NodeField::new(&column.id, &column.column_type);
                if let Some(value) = cell
                    .entry
                    .get(&column.name)
                    .or_else(|| cell.entry.get(&column.id))
                {
                    field = field.with_value(value.clone());
                }
                field
            })
            .collect();
        node.dataset = Some(InlineDataset {
            dataset_id: dataset.dataset_id.clone(),
            columns: dataset.columns.clone(),
            rows: vec![cell.entry.clone()],
        });
        node
    }

    fn target_node(&self, target: &TargetConfig) -> Result<Node, ConfigError> {
        match &target.kind {
            TargetKind::Prompt {
                prompt_id,
                local_prompt_config,
                ..
            } => {
                if let Some(local) = local_prompt_config {
                    Ok(self.signature_node(
                        target,
                        &local.llm.model,
                        local.llm.temperature,
                        local.llm.max_tokens,
                        &local.messages,
                        &local.inputs,
                        &local.outputs,
                    ))
                } else if let Some(prompt_id) = prompt_id {
                    let prompt = self
                        .request
                        .prompts
                        .get(prompt_id)
                        .ok_or_else(|| ConfigError::MissingPrompt(prompt_id.clone()))?;
                    Ok(self.signature_node(
                        target,
                        &prompt.llm.model,
                        prompt.llm.temperature,
                        prompt.llm.max_tokens,
                        &prompt.messages,
                        &prompt.inputs,
                        &prompt.outputs,
                    ))
                } else {
                    Err(ConfigError::MissingPromptConfig(target.id.clone()))
                }
            }
            TargetKind::Agent {
                agent_type,
                db_agent_id,
            } => {
                let agent = self
                    .request
                    .agents
                    .get(db_agent_id)
                    .ok_or_else(|| ConfigError::MissingAgent(db_agent_id.clone()))?;
                match agent_type {
                    AgentType::Http => Ok(self.http_node(target, &agent.config)),
                    AgentType::Signature => Ok(self.agent_signature_node(target, &agent.config)),
                    AgentType::Code | AgentType::Workflow => {
                        Ok(self.code_node(target, &agent.config))
                    }
                }
            }
            TargetKind::Evaluator {
                target_evaluator_id,
            } => {
                let evaluator_id = target_evaluator_id
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingTargetEvaluator(target.id.clone()))?;
                // Evaluator-as-target is the one evaluator node with a
                // dotless id: it *is* the target.
                let mut node = Node::new(&target.id, NodeType::Evaluator);
                node.evaluator = Some(format!("evaluators/{evaluator_id}"));
                node.inputs = self.resolve_input_values(&target.inputs, &self.target_values(target));
                node.outputs = evaluator_outputs();
                if let Some(record) = self.request.evaluator_records.get(evaluator_id) {
                    node.parameters = settings_parameters(&record.config.settings);
                }
                Ok(node)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn signature_node(
        &self,
        target: &TargetConfig,
        model: &str,
        temperature: Option<f64>,
        max_tokens: Option<u32>,
        messages: &[PromptMessage],
        fallback_inputs: &[FieldSpec],
        fallback_outputs: &[FieldSpec],
    ) -> Node {
        let inputs = if target.inputs.is_empty() {
            fallback_inputs
        } else {
            &target.inputs
        };
        let outputs = if target.outputs.is_empty() {
            fallback_outputs
        } else {
            &target.outputs
        };

        let mut llm = serde_json::Map::new();
        llm.insert("model".to_string(), json!(model));
        if let Some(temperature) = temperature {
            llm.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = max_tokens {
            llm.insert("max_tokens".to_string(), json!(max_tokens));
        }

        let instructions = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let chat_messages: Vec<JsonValue> = messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut node = Node::new(&target.id, NodeType::Signature);
        node.inputs = self.resolve_input_values(inputs, &self.target_values(target));
        node.outputs = fields_to_node_fields(outputs);
        node.parameters = vec![
            NodeParameter::new("llm", JsonValue::Object(llm)),
            NodeParameter::new("instructions", json!(instructions)),
            NodeParameter::new("messages", JsonValue::Array(chat_messages)),
        ];
        node
    }

    /// HTTP agents get a fixed input set plus any custom inputs declared on
    /// the target, and their transport configuration as parameters.
    fn http_node(&self, target: &TargetConfig, config: &JsonValue) -> Node {
        let mut node = Node::new(&target.id, NodeType::Http);

        let mut inputs = vec![
            NodeField::new("threadId", "str"),
            NodeField::new("messages", "list"),
            NodeField::new("input", "str"),
        ];
        for field in &target.inputs {
            if inputs.iter().all(|f| f.identifier != field.identifier) {
                inputs.push(NodeField::new(&field.identifier, &field.field_type));
            }
        }
        node.inputs = self.resolve_values_in_place(inputs, &self.target_values(target));
        node.outputs = if target.outputs.is_empty() {
            vec![NodeField::new("output", "str")]
        } else {
            fields_to_node_fields(&target.outputs)
        };

        let mut parameters = vec![
            NodeParameter::new("url", config.get("url").cloned().unwrap_or(JsonValue::Null)),
            NodeParameter::new(
                "method",
                config.get("method").cloned().unwrap_or_else(|| json!("POST")),
            ),
            NodeParameter::new(
                "body_template",
                config.get("body_template").cloned().unwrap_or(JsonValue::Null),
            ),
            NodeParameter::new(
                "output_path",
                config.get("output_path").cloned().unwrap_or(JsonValue::Null),
            ),
            NodeParameter::new(
                "headers",
                config.get("headers").cloned().unwrap_or_else(|| json!({})),
            ),
            NodeParameter::new(
                "timeout_ms",
                config.get("timeout_ms").cloned().unwrap_or(JsonValue::Null),
            ),
        ];
        parameters.extend(auth_parameters(config.get("auth")));
        node.parameters = parameters;
        node
    }

    /// Signature agents keep their stored parameters, but older records
    /// carry `llm`/`prompt`/`messages` at the top level of the config;
    /// normalize those into the parameters array without duplicating ones
    /// that are already there.
    fn agent_signature_node(&self, target: &TargetConfig, config: &JsonValue) -> Node {
        let mut parameters = config_parameters(config);
        for key in ["llm", "prompt", "messages"] {
            if let Some(value) = config.get(key) {
                if parameters.iter().all(|p| p.identifier != key) {
                    parameters.push(NodeParameter::new(key, value.clone()));
                }
            }
        }

        let mut node = Node::new(&target.id, NodeType::Signature);
        node.inputs = self.resolve_input_values(&target.inputs, &self.target_values(target));
        node.outputs = fields_to_node_fields(&target.outputs);
        node.parameters = parameters;
        node
    }

    fn code_node(&self, target: &TargetConfig, config: &JsonValue) -> Node {
        let mut node = Node::new(&target.id, NodeType::Code);
        node.inputs = self.resolve_input_values(&target.inputs, &self.target_values(target));
        node.outputs = fields_to_node_fields(&target.outputs);
        node.parameters = config_parameters(config);
        node
    }

    fn evaluator_node(
        &self,
        target: &TargetConfig,
        evaluator: &EvaluatorConfig,
    ) -> Result<Node, ConfigError> {
        let mut node = Node::new(
            format!("{}.{}", target.id, evaluator.id),
            NodeType::Evaluator,
        );

        match &evaluator.db_evaluator_id {
            Some(db_evaluator_id) => {
                let record = self
                    .request
                    .evaluator_records
                    .get(db_evaluator_id)
                    .ok_or_else(|| ConfigError::MissingEvaluator(db_evaluator_id.clone()))?;
                node.evaluator = Some(format!("evaluators/{db_evaluator_id}"));
                node.parameters = settings_parameters(&record.config.settings);
            }
            None => {
                node.evaluator = Some(evaluator.evaluator_type.clone());
            }
        }

        node.inputs =
            self.resolve_input_values(&evaluator.inputs, &self.evaluator_values(target, evaluator));
        node.outputs = evaluator_outputs();
        Ok(node)
    }

    /// Literal values for the target node's inputs, from `value` mappings.
    fn target_values(&self, target: &TargetConfig) -> HashMap<String, JsonValue> {
        let mut values = HashMap::new();
        if let Some(by_field) = target.mappings.get(&self.request.dataset.dataset_id) {
            for (field, mapping) in by_field {
                if let Mapping::Value { value } = mapping {
                    values.insert(field.clone(), value.clone());
                }
            }
        }
        values
    }

    /// Literal values for an evaluator node's inputs.
    fn evaluator_values(
        &self,
        target: &TargetConfig,
        evaluator: &EvaluatorConfig,
    ) -> HashMap<String, JsonValue> {
        let mut values = HashMap::new();
        if let Some(by_field) = evaluator
            .mappings
            .get(&self.request.dataset.dataset_id)
            .and_then(|by_target| by_target.get(&target.id))
        {
            for (field, mapping) in by_field {
                if let Mapping::Value { value } = mapping {
                    values.insert(field.clone(), value.clone());
                }
            }
        }
        values
    }

    fn resolve_input_values(
        &self,
        fields: &[FieldSpec],
        values: &HashMap<String, JsonValue>,
    ) -> Vec<NodeField> {
        self.resolve_values_in_place(fields_to_node_fields(fields), values)
    }

    fn resolve_values_in_place(
        &self,
        mut fields: Vec<NodeField>,
        values: &HashMap<String, JsonValue>,
    ) -> Vec<NodeField> {
        for field in &mut fields {
            if field.value.is_none() {
                if let Some(value) = values.get(&field.identifier) {
                    field.value = Some(value.clone());
                }
            }
        }
        fields
    }

    /// Edges feeding the target node from the entry node.
    fn target_edges(&self, target: &TargetConfig) -> Vec<Edge> {
        let Some(by_field) = target.mappings.get(&self.request.dataset.dataset_id) else {
            return Vec::new();
        };

        let mut entries: Vec<_> = by_field.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut edges = Vec::new();
        for (field, mapping) in entries {
            let Mapping::Source {
                source: MappingSource::Dataset,
                source_field,
                ..
            } = mapping
            else {
                continue;
            };
            match self.request.dataset.column_id(source_field) {
                Some(column_id) => edges.push(Edge::new(
                    ENTRY_NODE_ID,
                    format!("outputs.{column_id}"),
                    &target.id,
                    format!("inputs.{field}"),
                )),
                None => warn!(
                    target_id = %target.id,
                    column = %source_field,
                    "dataset mapping references an unknown column"
                ),
            }
        }
        edges
    }

    /// Edges feeding an evaluator node, from the entry node or the target.
    fn evaluator_edges(&self, target: &TargetConfig, evaluator: &EvaluatorConfig) -> Vec<Edge> {
        let Some(by_field) = evaluator
            .mappings
            .get(&self.request.dataset.dataset_id)
            .and_then(|by_target| by_target.get(&target.id))
        else {
            return Vec::new();
        };

        let node_id = format!("{}.{}", target.id, evaluator.id);
        let mut entries: Vec<_> = by_field.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut edges = Vec::new();
        for (field, mapping) in entries {
            match mapping {
                Mapping::Source {
                    source: MappingSource::Dataset,
                    source_field,
                    ..
                } => match self.request.dataset.column_id(source_field) {
                    Some(column_id) => edges.push(Edge::new(
                        ENTRY_NODE_ID,
                        format!("outputs.{column_id}"),
                        &node_id,
                        format!("inputs.{field}"),
                    )),
                    None => warn!(
                        evaluator_id = %evaluator.id,
                        column = %source_field,
                        "dataset mapping references an unknown column"
                    ),
                },
                Mapping::Source {
                    source: MappingSource::Target,
                    source_id,
                    source_field,
                } => {
                    if source_id == &target.id {
                        edges.push(Edge::new(
                            &target.id,
                            format!("outputs.{source_field}"),
                            &node_id,
                            format!("inputs.{field}"),
                        ));
                    } else {
                        warn!(
                            evaluator_id = %evaluator.id,
                            source_id = %source_id,
                            "target mapping references a target outside this cell"
                        );
                    }
                }
                Mapping::Value { .. } => {}
            }
        }
        edges
    }
}

fn fields_to_node_fields(fields: &[FieldSpec]) -> Vec<NodeField> {
    fields
        .iter()
        .map(|f| NodeField::new(&f.identifier, &f.field_type))
        .collect()
}

/// Reads a `parameters` array (`[{identifier, value}, ...]`) from an agent
/// config, tolerating its absence.
fn config_parameters(config: &JsonValue) -> Vec<NodeParameter> {
    config
        .get("parameters")
        .and_then(JsonValue::as_array)
        .map(|parameters| {
            parameters
                .iter()
                .filter_map(|p| {
                    let identifier = p.get("identifier")?.as_str()?;
                    Some(NodeParameter::new(
                        identifier,
                        p.get("value").cloned().unwrap_or(JsonValue::Null),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Materializes evaluator settings as parameters, sorted for determinism.
fn settings_parameters(settings: &serde_json::Map<String, JsonValue>) -> Vec<NodeParameter> {
    let mut parameters: Vec<NodeParameter> = settings
        .iter()
        .map(|(key, value)| NodeParameter::new(key, value.clone()))
        .collect();
    parameters.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    parameters
}

/// Authentication parameters keyed off `auth.type`.
fn auth_parameters(auth: Option<&JsonValue>) -> Vec<NodeParameter> {
    let auth_type = auth
        .and_then(|a| a.get("type"))
        .and_then(JsonValue::as_str)
        .unwrap_or("none");
    let field = |name: &str| {
        auth.and_then(|a| a.get(name))
            .cloned()
            .unwrap_or(JsonValue::Null)
    };

    match auth_type {
        "bearer" => vec![
            NodeParameter::new("auth_type", json!("bearer")),
            NodeParameter::new("auth_token", field("token")),
        ],
        "api_key" => vec![
            NodeParameter::new("auth_type", json!("api_key")),
            NodeParameter::new("auth_header_name", field("header_name")),
            NodeParameter::new("auth_api_key", field("key")),
        ],
        "basic" => vec![
            NodeParameter::new("auth_type", json!("basic")),
            NodeParameter::new("auth_username", field("username")),
            NodeParameter::new("auth_password", field("password")),
        ],
        _ => vec![NodeParameter::new("auth_type", json!("none"))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DatasetColumn, DatasetSource, EvaluatorRecord, EvaluatorRecordConfig, ExecutionScope,
        LlmConfig, LocalPromptConfig,
    };
    use serde_json::json;
    use std::collections::HashMap;

    fn dataset() -> DatasetSource {
        DatasetSource {
            dataset_id: "ds-1".to_string(),
            columns: vec![
                DatasetColumn {
                    id: "col_q".to_string(),
                    name: "question".to_string(),
                    column_type: "str".to_string(),
                },
                DatasetColumn {
                    id: "col_e".to_string(),
                    name: "expected".to_string(),
                    column_type: "str".to_string(),
                },
            ],
            rows: vec![],
        }
    }

    fn base_request(target: TargetConfig) -> ExecutionRequest {
        ExecutionRequest {
            project_id: "proj".to_string(),
            experiment_id: None,
            run_id: None,
            scope: ExecutionScope::Full,
            dataset: dataset(),
            targets: vec![target],
            evaluators: Vec::new(),
            prompts: HashMap::new(),
            agents: HashMap::new(),
            evaluator_records: HashMap::new(),
            evaluator_catalog: HashMap::new(),
        }
    }

    fn cell_for(request: &ExecutionRequest) -> ExecutionCell {
        let mut entry = serde_json::Map::new();
        entry.insert("question".to_string(), json!("hi"));
        entry.insert("expected".to_string(), json!("hi"));
        entry.insert("_datasetId".to_string(), json!("ds-1"));
        ExecutionCell {
            row_index: 0,
            target: request.targets[0].clone(),
            evaluators: request.evaluators.clone(),
            entry,
            skip_target: false,
            precomputed_target_output: None,
            trace_id: None,
        }
    }

    fn prompt_target(id: &str) -> TargetConfig {
        let mut mappings = HashMap::new();
        let mut by_field = HashMap::new();
        by_field.insert(
            "input".to_string(),
            Mapping::Source {
                source: MappingSource::Dataset,
                source_id: "ds-1".to_string(),
                source_field: "question".to_string(),
            },
        );
        mappings.insert("ds-1".to_string(), by_field);

        TargetConfig {
            id: id.to_string(),
            kind: TargetKind::Prompt {
                prompt_id: None,
                prompt_version_number: None,
                local_prompt_config: Some(LocalPromptConfig {
                    llm: LlmConfig {
                        model: "gpt-5-mini".to_string(),
                        temperature: Some(0.0),
                        max_tokens: None,
                    },
                    messages: vec![
                        PromptMessage {
                            role: MessageRole::System,
                            content: "You echo the input.".to_string(),
                        },
                        PromptMessage {
                            role: MessageRole::User,
                            content: "{{input}}".to_string(),
                        },
                    ],
                    inputs: vec![FieldSpec::new("input", "str")],
                    outputs: vec![FieldSpec::new("output", "str")],
                }),
            },
            inputs: vec![FieldSpec::new("input", "str")],
            outputs: vec![FieldSpec::new("output", "str")],
            mappings,
        }
    }

    #[test]
    fn test_entry_node_mirrors_schema_with_name_fallback() {
        let request = base_request(prompt_target("t-1"));
        let mut cell = cell_for(&request);
        // Second column keyed by id instead of name.
        cell.entry.remove("expected");
        cell.entry.insert("col_e".to_string(), json!("by-id"));

        let assembled = WorkflowAssembler::new(&request).assemble(&cell).unwrap();
        let entry = assembled.workflow.node(ENTRY_NODE_ID).unwrap();

        assert_eq!(entry.outputs.len(), 2);
        assert_eq!(entry.outputs[0].identifier, "col_q");
        assert_eq!(entry.outputs[0].value, Some(json!("hi")));
        assert_eq!(entry.outputs[1].value, Some(json!("by-id")));

        let inline = entry.dataset.as_ref().unwrap();
        assert_eq!(inline.rows.len(), 1);
        assert_eq!(inline.dataset_id, "ds-1");
    }

    #[test]
    fn test_local_prompt_becomes_signature_node() {
        let request = base_request(prompt_target("t-1"));
        let cell = cell_for(&request);
        let assembled = WorkflowAssembler::new(&request).assemble(&cell).unwrap();

        assert_eq!(assembled.target_node_id, "t-1");
        let node = assembled.workflow.node("t-1").unwrap();
        assert_eq!(node.node_type, NodeType::Signature);
        assert_eq!(
            node.parameter("llm").unwrap().value["model"],
            "gpt-5-mini"
        );
        assert_eq!(
            node.parameter("instructions").unwrap().value,
            json!("You echo the input.")
        );
        // Non-system messages only.
        let messages = node.parameter("messages").unwrap().value.as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");

        // The dataset mapping produced an edge with the column id resolved.
        let edge = &assembled.workflow.edges[0];
        assert_eq!(edge.source, "entry");
        assert_eq!(edge.source_handle, "outputs.col_q");
        assert_eq!(edge.target, "t-1");
        assert_eq!(edge.target_handle, "inputs.input");
    }

    #[test]
    fn test_missing_prompt_reference_fails() {
        let mut target = prompt_target("t-1");
        target.kind = TargetKind::Prompt {
            prompt_id: Some("p-404".to_string()),
            prompt_version_number: None,
            local_prompt_config: None,
        };
        let request = base_request(target);
        let cell = cell_for(&request);

        let err = WorkflowAssembler::new(&request).assemble(&cell).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPrompt(id) if id == "p-404"));
    }

    #[test]
    fn test_http_agent_node_fixed_inputs_and_auth() {
        let mut target = prompt_target("t-1");
        target.kind = TargetKind::Agent {
            agent_type: AgentType::Http,
            db_agent_id: "agent-1".to_string(),
        };
        target.inputs = vec![FieldSpec::new("input", "str"), FieldSpec::new("locale", "str")];
        let mut request = base_request(target);
        request.agents.insert(
            "agent-1".to_string(),
            crate::model::AgentRecord {
                id: "agent-1".to_string(),
                name: "Support bot".to_string(),
                agent_type: AgentType::Http,
                config: json!({
                    "url": "https://bot.example.com/chat",
                    "method": "POST",
                    "headers": {"x-team": "evals"},
                    "timeout_ms": 30000,
                    "auth": {"type": "bearer", "token": "secret"},
                }),
            },
        );
        let cell = cell_for(&request);
        let assembled = WorkflowAssembler::new(&request).assemble(&cell).unwrap();
        let node = assembled.workflow.node("t-1").unwrap();

        assert_eq!(node.node_type, NodeType::Http);
        let identifiers: Vec<&str> = node.inputs.iter().map(|f| f.identifier.as_str()).collect();
        // Fixed inputs first, then custom ones, no duplicate `input`.
        assert_eq!(identifiers, vec!["threadId", "messages", "input", "locale"]);
        assert_eq!(
            node.parameter("url").unwrap().value,
            json!("https://bot.example.com/chat")
        );
        assert_eq!(node.parameter("timeout_ms").unwrap().value, json!(30000));
        assert_eq!(node.parameter("auth_type").unwrap().value, json!("bearer"));
        assert_eq!(node.parameter("auth_token").unwrap().value, json!("secret"));
    }

    #[test]
    fn test_signature_agent_normalizes_without_duplicates() {
        let mut target = prompt_target("t-1");
        target.kind = TargetKind::Agent {
            agent_type: AgentType::Signature,
            db_agent_id: "agent-2".to_string(),
        };
        let mut request = base_request(target);
        request.agents.insert(
            "agent-2".to_string(),
            crate::model::AgentRecord {
                id: "agent-2".to_string(),
                name: "Classifier".to_string(),
                agent_type: AgentType::Signature,
                config: json!({
                    "parameters": [
                        {"identifier": "llm", "value": {"model": "claude-sonnet-4-5"}},
                    ],
                    "llm": {"model": "should-not-win"},
                    "prompt": "Classify the input.",
                }),
            },
        );
        let cell = cell_for(&request);
        let assembled = WorkflowAssembler::new(&request).assemble(&cell).unwrap();
        let node = assembled.workflow.node("t-1").unwrap();

        let llm_params: Vec<_> = node
            .parameters
            .iter()
            .filter(|p| p.identifier == "llm")
            .collect();
        assert_eq!(llm_params.len(), 1);
        assert_eq!(llm_params[0].value["model"], "claude-sonnet-4-5");
        assert_eq!(
            node.parameter("prompt").unwrap().value,
            json!("Classify the input.")
        );
    }

    #[test]
    fn test_evaluator_as_target_requires_reference() {
        let mut target = prompt_target("t-1");
        target.kind = TargetKind::Evaluator {
            target_evaluator_id: None,
        };
        let request = base_request(target);
        let cell = cell_for(&request);

        let err = WorkflowAssembler::new(&request).assemble(&cell).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTargetEvaluator(id) if id == "t-1"));
    }

    #[test]
    fn test_evaluator_as_target_keeps_dotless_id() {
        let mut target = prompt_target("t-1");
        target.kind = TargetKind::Evaluator {
            target_evaluator_id: Some("ev-db-1".to_string()),
        };
        let mut request = base_request(target);
        request.evaluator_records.insert(
            "ev-db-1".to_string(),
            EvaluatorRecord {
                id: "ev-db-1".to_string(),
                name: "Exact match".to_string(),
                evaluator_type: "langevals/exact_match".to_string(),
                config: EvaluatorRecordConfig {
                    settings: serde_json::from_value(json!({"case_sensitive": false})).unwrap(),
                },
            },
        );
        let cell = cell_for(&request);
        let assembled = WorkflowAssembler::new(&request).assemble(&cell).unwrap();
        let node = assembled.workflow.node("t-1").unwrap();

        assert_eq!(node.node_type, NodeType::Evaluator);
        assert!(!node.id.contains('.'));
        assert_eq!(node.evaluator.as_deref(), Some("evaluators/ev-db-1"));
        assert_eq!(node.parameter("case_sensitive").unwrap().value, json!(false));
        let outputs: Vec<&str> = node.outputs.iter().map(|f| f.identifier.as_str()).collect();
        assert_eq!(outputs, vec!["passed", "score", "label"]);
    }

    fn evaluator_config(id: &str, target_id: &str) -> EvaluatorConfig {
        let mut by_field = HashMap::new();
        by_field.insert(
            "output".to_string(),
            Mapping::Source {
                source: MappingSource::Target,
                source_id: target_id.to_string(),
                source_field: "output".to_string(),
            },
        );
        by_field.insert(
            "expected_output".to_string(),
            Mapping::Source {
                source: MappingSource::Dataset,
                source_id: "ds-1".to_string(),
                source_field: "expected".to_string(),
            },
        );
        by_field.insert(
            "threshold".to_string(),
            Mapping::Value { value: json!(0.8) },
        );
        let mut by_target = HashMap::new();
        by_target.insert(target_id.to_string(), by_field);
        let mut mappings = HashMap::new();
        mappings.insert("ds-1".to_string(), by_target);

        EvaluatorConfig {
            id: id.to_string(),
            evaluator_type: "langevals/exact_match".to_string(),
            db_evaluator_id: None,
            inputs: vec![
                FieldSpec::new("output", "str"),
                FieldSpec::new("expected_output", "str"),
                FieldSpec::new("threshold", "float"),
            ],
            mappings,
        }
    }

    #[test]
    fn test_evaluator_node_composite_id_and_edges() {
        let target = prompt_target("t-1");
        let mut request = base_request(target);
        request.evaluators = vec![evaluator_config("e-1", "t-1")];
        let cell = cell_for(&request);
        let assembled = WorkflowAssembler::new(&request).assemble(&cell).unwrap();

        assert_eq!(assembled.evaluator_node_ids, vec!["t-1.e-1"]);
        let node = assembled.workflow.node("t-1.e-1").unwrap();
        // No db record: the bare type is the evaluator path.
        assert_eq!(node.evaluator.as_deref(), Some("langevals/exact_match"));
        // The literal mapping is baked into the input, not an edge.
        assert_eq!(node.input("threshold").unwrap().value, Some(json!(0.8)));

        let evaluator_edges: Vec<&Edge> = assembled
            .workflow
            .edges
            .iter()
            .filter(|e| e.target == "t-1.e-1")
            .collect();
        assert_eq!(evaluator_edges.len(), 2);
        assert!(evaluator_edges.iter().any(|e| {
            e.source == "entry"
                && e.source_handle == "outputs.col_e"
                && e.target_handle == "inputs.expected_output"
        }));
        assert!(evaluator_edges.iter().any(|e| {
            e.source == "t-1"
                && e.source_handle == "outputs.output"
                && e.target_handle == "inputs.output"
        }));
    }

    #[test]
    fn test_evaluator_with_missing_record_fails() {
        let target = prompt_target("t-1");
        let mut request = base_request(target);
        let mut evaluator = evaluator_config("e-1", "t-1");
        evaluator.db_evaluator_id = Some("ev-404".to_string());
        request.evaluators = vec![evaluator];
        let cell = cell_for(&request);

        let err = WorkflowAssembler::new(&request).assemble(&cell).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEvaluator(id) if id == "ev-404"));
    }
}
