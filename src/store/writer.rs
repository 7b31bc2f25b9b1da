//! Batched, non-blocking writes to the run store.
//!
//! Results accumulate in memory and flush when the batch is large enough or
//! old enough; progress updates are coalesced into whichever flush carries
//! them. Store failures are logged and dropped so the run never stalls on
//! persistence.

use crate::model::JsonMap;
use crate::model::event::{EvaluationEvent, EvaluationResult};
use crate::store::{
    DatasetEntryDoc, EvaluationDoc, Predicted, RunCompletion, RunKey, RunStore, RunUpdate,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Flush once this many results are pending.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 10;
/// Flush when the oldest pending result is this old.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

struct Pending {
    update: RunUpdate,
    last_flush: Instant,
}

/// Accumulates run results and flushes them to a [`RunStore`] in batches.
pub struct StoreWriter {
    store: Arc<dyn RunStore>,
    key: RunKey,
    rows: Arc<Vec<JsonMap>>,
    evaluator_names: HashMap<String, String>,
    flush_threshold: usize,
    flush_interval: Duration,
    pending: Mutex<Pending>,
}

impl StoreWriter {
    pub fn new(
        store: Arc<dyn RunStore>,
        key: RunKey,
        rows: Arc<Vec<JsonMap>>,
        evaluator_names: HashMap<String, String>,
        flush_threshold: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            key,
            rows,
            evaluator_names,
            flush_threshold,
            flush_interval,
            pending: Mutex::new(Pending {
                update: RunUpdate::default(),
                last_flush: Instant::now(),
            }),
        }
    }

    fn entry_for(&self, row_index: usize) -> JsonMap {
        self.rows.get(row_index).cloned().unwrap_or_default()
    }

    /// Records one public event, flushing when the batch is due.
    pub async fn record(&self, event: &EvaluationEvent) {
        let mut pending = self.pending.lock().await;
        match event {
            EvaluationEvent::TargetResult {
                row_index,
                target_id,
                output,
                cost,
                duration,
                trace_id,
                error,
            } => {
                pending.update.dataset.push(DatasetEntryDoc {
                    index: *row_index,
                    target_id: target_id.clone(),
                    entry: self.entry_for(*row_index),
                    // Falsy outputs are still outputs; only absence drops
                    // the predicted field.
                    predicted: output.clone().map(|output| Predicted { output }),
                    cost: cost.as_ref().map(|c| c.amount),
                    duration: *duration,
                    error: error.clone(),
                    trace_id: trace_id.clone(),
                });
            }
            EvaluationEvent::EvaluatorResult {
                row_index,
                target_id,
                evaluator_id,
                result,
            } => {
                pending.update.evaluations.push(self.evaluation_doc(
                    *row_index,
                    target_id,
                    evaluator_id,
                    result,
                ));
            }
            EvaluationEvent::Error {
                message,
                row_index: Some(row_index),
                target_id: Some(target_id),
                ..
            } => {
                pending.update.dataset.push(DatasetEntryDoc {
                    index: *row_index,
                    target_id: target_id.clone(),
                    entry: self.entry_for(*row_index),
                    predicted: None,
                    cost: None,
                    duration: None,
                    error: Some(message.clone()),
                    trace_id: None,
                });
            }
            EvaluationEvent::Progress { completed, total } => {
                pending.update.progress = Some((*completed, *total));
            }
            _ => return,
        }

        let item_count =
            pending.update.dataset.len() + pending.update.evaluations.len();
        if item_count >= self.flush_threshold
            || pending.last_flush.elapsed() >= self.flush_interval
        {
            self.flush_locked(&mut pending).await;
        }
    }

    fn evaluation_doc(
        &self,
        index: usize,
        target_id: &str,
        evaluator_id: &str,
        result: &EvaluationResult,
    ) -> EvaluationDoc {
        let name = self
            .evaluator_names
            .get(evaluator_id)
            .cloned()
            .unwrap_or_else(|| evaluator_id.to_string());
        let mut doc = EvaluationDoc {
            evaluator: evaluator_id.to_string(),
            name,
            target_id: target_id.to_string(),
            index,
            status: "processed".to_string(),
            score: None,
            label: None,
            passed: None,
            details: None,
            cost: None,
        };
        match result {
            EvaluationResult::Processed {
                score,
                passed,
                label,
                details,
                cost,
            } => {
                doc.score = *score;
                doc.passed = *passed;
                doc.label = label.clone();
                doc.details = details.clone();
                doc.cost = cost.as_ref().map(|c| c.amount);
            }
            EvaluationResult::Error { details, .. } => {
                doc.status = "error".to_string();
                doc.details = Some(details.clone());
            }
            EvaluationResult::Skipped => {
                doc.status = "skipped".to_string();
            }
        }
        doc
    }

    /// Flushes whatever is pending, regardless of thresholds.
    pub async fn flush(&self) {
        let mut pending = self.pending.lock().await;
        self.flush_locked(&mut pending).await;
    }

    async fn flush_locked(&self, pending: &mut Pending) {
        pending.last_flush = Instant::now();
        if pending.update.is_empty() {
            return;
        }
        let update = std::mem::take(&mut pending.update);
        let items = update.dataset.len() + update.evaluations.len();
        if let Err(e) = self.store.upsert_results(&self.key, update).await {
            warn!(run_id = %self.key.run_id, error = %e, "dropping run store batch");
        } else {
            debug!(run_id = %self.key.run_id, items, "flushed run store batch");
        }
    }

    /// Final flush plus completion stamp.
    pub async fn finish(&self, completion: RunCompletion) {
        self.flush().await;
        if let Err(e) = self.store.mark_complete(&self.key, completion).await {
            warn!(run_id = %self.key.run_id, error = %e, "failed to mark run complete");
        }
    }
}
