//! Persistent run documents.
//!
//! The production store is a search engine; the core talks to it through
//! [`RunStore`]. Writes are idempotent per `(projectId, experimentId,
//! runId)`: dataset entries merge by `(index, target_id)` and evaluations by
//! `(index, evaluator, target_id)`, so re-drives of a partially-written run
//! are safe. Remote implementations are expected to use scripted upserts
//! with `retry_on_conflict >= 3`; [`MemoryRunStore`] gets the same semantics
//! from a mutex.

pub mod writer;

pub use writer::StoreWriter;

use crate::model::JsonMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Run-store failures. Logged by the orchestrator, never propagated into
/// the event stream.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run store write failed: {0}")]
    Write(String),
    #[error("run {0} not found")]
    NotFound(String),
}

/// Identity of one run document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunKey {
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    pub run_id: String,
}

/// Display metadata for one configured target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TargetMetadata {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A target's output as persisted. Present whenever the target produced any
/// output, falsy values included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Predicted {
    pub output: JsonValue,
}

/// One (row, target) result in the run document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct DatasetEntryDoc {
    pub index: usize,
    pub target_id: String,
    pub entry: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted: Option<Predicted>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// One evaluator verdict in the run document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EvaluationDoc {
    pub evaluator: String,
    pub name: String,
    pub target_id: String,
    pub index: usize,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// The persisted run document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RunDocument {
    pub run_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetMetadata>,
    #[serde(default)]
    pub dataset: Vec<DatasetEntryDoc>,
    #[serde(default)]
    pub evaluations: Vec<EvaluationDoc>,
    pub progress: usize,
    pub total: usize,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<u64>,
}

impl RunDocument {
    pub fn key(&self) -> RunKey {
        RunKey {
            project_id: self.project_id.clone(),
            experiment_id: self.experiment_id.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

/// A batch of incremental results to merge into a run document.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub dataset: Vec<DatasetEntryDoc>,
    pub evaluations: Vec<EvaluationDoc>,
    /// Coalesced `(progress, total)` as of this batch.
    pub progress: Option<(usize, usize)>,
}

impl RunUpdate {
    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty() && self.evaluations.is_empty() && self.progress.is_none()
    }
}

/// How a run ended, stamping the matching document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCompletion {
    Finished { finished_at: u64 },
    Stopped { stopped_at: u64 },
}

/// Repository interface for run documents.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates the run document. Idempotent: an existing document for the
    /// same key is left in place.
    async fn create(&self, document: RunDocument) -> Result<(), StoreError>;

    /// Merges a batch of results into the document.
    async fn upsert_results(&self, key: &RunKey, update: RunUpdate) -> Result<(), StoreError>;

    /// Stamps the document finished or stopped.
    async fn mark_complete(&self, key: &RunKey, completion: RunCompletion)
    -> Result<(), StoreError>;

    async fn get_by_run_id(&self, key: &RunKey) -> Result<Option<RunDocument>, StoreError>;

    async fn list_by_experiment(
        &self,
        project_id: &str,
        experiment_id: &str,
    ) -> Result<Vec<RunDocument>, StoreError>;
}

/// In-process [`RunStore`] with the full merge semantics.
#[derive(Default)]
pub struct MemoryRunStore {
    documents: Mutex<HashMap<RunKey, RunDocument>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create(&self, document: RunDocument) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().await;
        documents.entry(document.key()).or_insert(document);
        Ok(())
    }

    async fn upsert_results(&self, key: &RunKey, update: RunUpdate) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().await;
        let document = documents
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.run_id.clone()))?;

        for entry in update.dataset {
            match document
                .dataset
                .iter_mut()
                .find(|e| e.index == entry.index && e.target_id == entry.target_id)
            {
                Some(existing) => *existing = entry,
                None => document.dataset.push(entry),
            }
        }
        for evaluation in update.evaluations {
            match document.evaluations.iter_mut().find(|e| {
                e.index == evaluation.index
                    && e.evaluator == evaluation.evaluator
                    && e.target_id == evaluation.target_id
            }) {
                Some(existing) => *existing = evaluation,
                None => document.evaluations.push(evaluation),
            }
        }
        if let Some((progress, total)) = update.progress {
            document.progress = progress;
            document.total = total;
        }
        document.updated_at = now_ms();
        Ok(())
    }

    async fn mark_complete(
        &self,
        key: &RunKey,
        completion: RunCompletion,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().await;
        let document = documents
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.run_id.clone()))?;
        match completion {
            RunCompletion::Finished { finished_at } => document.finished_at = Some(finished_at),
            RunCompletion::Stopped { stopped_at } => document.stopped_at = Some(stopped_at),
        }
        document.updated_at = now_ms();
        Ok(())
    }

    async fn get_by_run_id(&self, key: &RunKey) -> Result<Option<RunDocument>, StoreError> {
        Ok(self.documents.lock().await.get(key).cloned())
    }

    async fn list_by_experiment(
        &self,
        project_id: &str,
        experiment_id: &str,
    ) -> Result<Vec<RunDocument>, StoreError> {
        let documents = self.documents.lock().await;
        let mut runs: Vec<RunDocument> = documents
            .values()
            .filter(|d| {
                d.project_id == project_id && d.experiment_id.as_deref() == Some(experiment_id)
            })
            .cloned()
            .collect();
        runs.sort_by_key(|d| d.created_at);
        Ok(runs)
    }
}
