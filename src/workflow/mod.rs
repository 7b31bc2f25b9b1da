//! Executable workflow graphs submitted to the execution backend.
//!
//! A cell's workflow always has one `entry` node mirroring the dataset
//! schema, one target node, and one evaluator node per attached evaluator.
//! Node and handle identifiers follow the backend's wire format: target
//! nodes use the raw target id (which never contains a dot), evaluator
//! nodes use `"{targetId}.{evaluatorId}"`.

pub mod assembler;

pub use assembler::{ConfigError, WorkflowAssembler};

use crate::model::{DatasetColumn, JsonMap};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Node id of the entry node in every assembled workflow.
pub const ENTRY_NODE_ID: &str = "entry";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Entry,
    Signature,
    Http,
    Code,
    Evaluator,
}

/// A typed input or output slot on a node.
///
/// `value` is set when a literal mapping bakes the value into the node;
/// otherwise an edge supplies it at execution time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeField {
    pub identifier: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

impl NodeField {
    pub fn new(identifier: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            field_type: field_type.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: JsonValue) -> Self {
        self.value = Some(value);
        self
    }
}

/// A named configuration parameter on a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeParameter {
    pub identifier: String,
    pub value: JsonValue,
}

impl NodeParameter {
    pub fn new(identifier: impl Into<String>, value: JsonValue) -> Self {
        Self {
            identifier: identifier.into(),
            value,
        }
    }
}

/// A single-row dataset inlined into the entry node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineDataset {
    pub dataset_id: String,
    pub columns: Vec<DatasetColumn>,
    pub rows: Vec<JsonMap>,
}

/// One node of an executable workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub inputs: Vec<NodeField>,
    #[serde(default)]
    pub outputs: Vec<NodeField>,
    #[serde(default)]
    pub parameters: Vec<NodeParameter>,
    /// Evaluator path, `"evaluators/{id}"` or a bare evaluator type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluator: Option<String>,
    /// Present only on the entry node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<InlineDataset>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: Vec::new(),
            evaluator: None,
            dataset: None,
        }
    }

    pub fn input(&self, identifier: &str) -> Option<&NodeField> {
        self.inputs.iter().find(|f| f.identifier == identifier)
    }

    pub fn parameter(&self, identifier: &str) -> Option<&NodeParameter> {
        self.parameters.iter().find(|p| p.identifier == identifier)
    }
}

/// A directed edge wiring one node's output handle to another's input handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub source_handle: String,
    pub target: String,
    pub target_handle: String,
}

impl Edge {
    pub fn new(
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let source_handle = source_handle.into();
        let target = target.into();
        let target_handle = target_handle.into();
        Self {
            id: format!("{source}-to-{target}-{target_handle}"),
            source,
            source_handle,
            target,
            target_handle,
        }
    }
}

/// An executable graph for one cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub workflow_id: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Workflow {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// The assembler's product: the graph plus the node ids the orchestrator
/// drives and routes events by.
#[derive(Debug, Clone)]
pub struct AssembledWorkflow {
    pub workflow: Workflow,
    pub target_node_id: String,
    pub evaluator_node_ids: Vec<String>,
}
