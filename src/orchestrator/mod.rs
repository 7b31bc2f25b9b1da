//! The evaluation orchestrator.
//!
//! One run enumerates the cells its scope selects, drives them in parallel
//! under a FIFO semaphore, watches the shared abort flag between every
//! suspension point, and publishes a single ordered stream of
//! [`EvaluationEvent`]s while incrementally upserting results into the run
//! store.
//!
//! # Example
//!
//! ```ignore
//! use evalgrid::orchestrator::Orchestrator;
//! use futures::StreamExt;
//!
//! let orchestrator = Orchestrator::new(backend, kv).with_store(store);
//! let mut handle = orchestrator.execute(request);
//! while let Some(event) = handle.events.next().await {
//!     println!("{}", event.event_type());
//! }
//! ```

pub mod cells;
pub mod config;
pub mod state;

pub use cells::{generate_cells, is_empty_row};
pub use config::OrchestratorConfig;
pub use state::{RunState, RunStateTracker, RunStatus};

use crate::abort::{AbortCoordinator, AbortSignal};
use crate::backend::{BackendClient, BackendEvent, ComponentRequest, ExecutionStatus};
use crate::ids::{generate_run_id, generate_trace_id};
use crate::kv::KvStore;
use crate::mapper::{ResultMapper, compute_strip_set};
use crate::model::event::{
    EvaluationEvent, EvaluationResult, RunSummary, RunTimestamps, StopReason,
};
use crate::model::{
    EvaluatorConfig, ExecutionCell, ExecutionRequest, JsonMap, Mapping, MappingSource,
    TargetConfig, TargetKind,
};
use crate::sink::EventSink;
use crate::store::{RunCompletion, RunDocument, RunKey, RunStore, StoreWriter, TargetMetadata};
use crate::sync::Semaphore;
use crate::workflow::WorkflowAssembler;
use futures::{Stream, StreamExt};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, mpsc};
use tracing::{Instrument, debug, info, info_span, warn};

/// Current system time in milliseconds since the UNIX epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The public event sequence of one run.
///
/// Backed by a channel the run driver closes on termination, so the stream
/// ends right after the terminal `done`/`stopped` event.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EvaluationEvent>,
}

impl EventStream {
    /// Awaits the next event; `None` once the run has terminated.
    pub async fn next_event(&mut self) -> Option<EvaluationEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = EvaluationEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// A started run: its resolved id plus the live event stream.
pub struct ExecutionHandle {
    pub run_id: String,
    pub events: EventStream,
}

impl ExecutionHandle {
    pub fn into_stream(self) -> EventStream {
        self.events
    }
}

/// Runs evaluation grids against a component-execution backend.
pub struct Orchestrator {
    backend: Arc<dyn BackendClient>,
    kv: Arc<dyn KvStore>,
    store: Option<Arc<dyn RunStore>>,
    sink: Option<Arc<dyn EventSink>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn BackendClient>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            backend,
            kv,
            store: None,
            sink: None,
            config: OrchestratorConfig::default(),
        }
    }

    /// Enables persistence of run documents.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enables the auxiliary event sink (analytics dual-write).
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// An abort coordinator over the same key-value store, for callers that
    /// want to cancel or observe runs.
    pub fn abort_coordinator(&self) -> AbortCoordinator {
        AbortCoordinator::new(Arc::clone(&self.kv))
    }

    /// Starts a run and returns immediately with its event stream.
    ///
    /// Never fails: every problem surfaces as an event on the stream, and
    /// the stream always terminates with exactly one `done` or `stopped`.
    pub fn execute(&self, request: ExecutionRequest) -> ExecutionHandle {
        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(generate_run_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = RunDriver {
            run_id: run_id.clone(),
            request: Arc::new(request),
            backend: Arc::clone(&self.backend),
            kv: Arc::clone(&self.kv),
            abort: AbortCoordinator::new(Arc::clone(&self.kv)),
            store: self.store.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
            tx,
        };
        let span = info_span!("evaluation_run", run_id = %run_id);
        tokio::spawn(driver.run().instrument(span));

        ExecutionHandle {
            run_id,
            events: EventStream { rx },
        }
    }
}

/// Fan-in point for events: live stream, run state, run store, sink.
struct Emitter {
    run_id: String,
    tx: mpsc::UnboundedSender<EvaluationEvent>,
    tracker: RunStateTracker,
    writer: Option<StoreWriter>,
    sink: Option<Arc<dyn EventSink>>,
}

impl Emitter {
    async fn emit(&self, event: EvaluationEvent) {
        // The consumer may have dropped the stream; the run still finishes
        // and persists.
        let _ = self.tx.send(event.clone());
        self.tracker.record(&event, current_timestamp_ms()).await;
        if let Some(writer) = &self.writer {
            writer.record(&event).await;
        }
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.dispatch(&self.run_id, &event).await {
                warn!(run_id = %self.run_id, error = %e, "event sink dispatch failed");
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    completed: usize,
    failed: usize,
}

struct RunDriver {
    run_id: String,
    request: Arc<ExecutionRequest>,
    backend: Arc<dyn BackendClient>,
    kv: Arc<dyn KvStore>,
    abort: AbortCoordinator,
    store: Option<Arc<dyn RunStore>>,
    sink: Option<Arc<dyn EventSink>>,
    config: OrchestratorConfig,
    tx: mpsc::UnboundedSender<EvaluationEvent>,
}

impl RunDriver {
    async fn run(self) {
        let started_at = current_timestamp_ms();
        let cells = generate_cells(&self.request);
        let total = cells.len();
        info!(total, "starting evaluation run");

        self.abort.set_running(&self.run_id).await;

        let key = RunKey {
            project_id: self.request.project_id.clone(),
            experiment_id: self.request.experiment_id.clone(),
            run_id: self.run_id.clone(),
        };
        let writer = match &self.store {
            Some(store) => {
                let document = RunDocument {
                    run_id: self.run_id.clone(),
                    project_id: self.request.project_id.clone(),
                    experiment_id: self.request.experiment_id.clone(),
                    targets: build_target_metadata(&self.request),
                    dataset: Vec::new(),
                    evaluations: Vec::new(),
                    progress: 0,
                    total,
                    created_at: started_at,
                    updated_at: started_at,
                    finished_at: None,
                    stopped_at: None,
                };
                if let Err(e) = store.create(document).await {
                    warn!(run_id = %self.run_id, error = %e, "failed to create run document");
                }
                Some(StoreWriter::new(
                    Arc::clone(store),
                    key,
                    Arc::new(self.request.dataset.rows.clone()),
                    evaluator_names(&self.request),
                    self.config.store_flush_threshold,
                    self.config.store_flush_interval,
                ))
            }
            None => None,
        };

        let emitter = Arc::new(Emitter {
            run_id: self.run_id.clone(),
            tx: self.tx.clone(),
            tracker: RunStateTracker::new(
                Arc::clone(&self.kv),
                self.config.run_state_ttl,
                self.run_id.clone(),
                self.request.project_id.clone(),
                self.request.experiment_id.clone(),
                started_at,
            ),
            writer,
            sink: self.sink.clone(),
        });

        emitter
            .emit(EvaluationEvent::ExecutionStarted {
                run_id: self.run_id.clone(),
                total,
            })
            .await;

        let strip_set = Arc::new(compute_strip_set(
            &self.request.evaluators,
            &self.request.evaluator_catalog,
        ));
        let counters = Arc::new(Mutex::new(Counters::default()));
        let semaphore = Semaphore::new(self.config.max_concurrent_cells);

        let mut aborted = false;
        let mut handles = Vec::new();
        for cell in cells {
            if self.abort.is_aborted(&self.run_id).await {
                aborted = true;
                break;
            }
            let permit = semaphore.acquire().await;
            // The flag may have been raised while this slot was awaited.
            if self.abort.is_aborted(&self.run_id).await {
                aborted = true;
                break;
            }

            let context = CellContext {
                request: Arc::clone(&self.request),
                backend: Arc::clone(&self.backend),
                emitter: Arc::clone(&emitter),
                signal: self.abort.signal(&self.run_id),
                strip_set: Arc::clone(&strip_set),
                counters: Arc::clone(&counters),
                total,
            };
            let span = info_span!(
                "cell",
                row_index = cell.row_index,
                target_id = %cell.target.id,
            );
            handles.push(tokio::spawn(
                async move {
                    let _permit = permit;
                    context.run_cell(cell).await;
                }
                .instrument(span),
            ));
        }

        for handle in handles {
            let _ = handle.await;
        }
        if !aborted {
            aborted = self.abort.is_aborted(&self.run_id).await;
        }

        let finished_at = current_timestamp_ms();
        if aborted {
            info!(run_id = %self.run_id, "run stopped by abort request");
            emitter
                .emit(EvaluationEvent::Stopped {
                    reason: StopReason::User,
                })
                .await;
        } else {
            let counters = counters.lock().await;
            let summary = RunSummary {
                run_id: self.run_id.clone(),
                total_cells: total,
                completed_cells: counters.completed,
                failed_cells: counters.failed,
                duration: finished_at.saturating_sub(started_at),
                timestamps: RunTimestamps {
                    started_at,
                    finished_at,
                },
            };
            drop(counters);
            emitter.emit(EvaluationEvent::Done { summary }).await;
        }

        if let Some(writer) = &emitter.writer {
            let completion = if aborted {
                RunCompletion::Stopped {
                    stopped_at: finished_at,
                }
            } else {
                RunCompletion::Finished { finished_at }
            };
            writer.finish(completion).await;
        }
        self.abort.clear_abort(&self.run_id).await;
        self.abort.clear_running(&self.run_id).await;
        // Dropping the sender closes the public stream.
    }
}

/// How a cell's execution ended.
enum CellEnd {
    /// The cell's event loop ran to the end; it is accounted in progress.
    Finished { failed: bool },
    /// The cell observed the abort flag mid-flight and is not accounted.
    Aborted,
}

struct CellContext {
    request: Arc<ExecutionRequest>,
    backend: Arc<dyn BackendClient>,
    emitter: Arc<Emitter>,
    signal: AbortSignal,
    strip_set: Arc<HashSet<String>>,
    counters: Arc<Mutex<Counters>>,
    total: usize,
}

impl CellContext {
    async fn run_cell(&self, cell: ExecutionCell) {
        match self.execute_cell(&cell).await {
            CellEnd::Finished { failed } => {
                // Holding the counter lock across the emit keeps progress
                // monotonic across concurrently finishing cells.
                let mut counters = self.counters.lock().await;
                if failed {
                    counters.failed += 1;
                } else {
                    counters.completed += 1;
                }
                let completed = counters.completed + counters.failed;
                self.emitter
                    .emit(EvaluationEvent::Progress {
                        completed,
                        total: self.total,
                    })
                    .await;
            }
            CellEnd::Aborted => {
                debug!(row_index = cell.row_index, "cell aborted mid-flight");
            }
        }
    }

    async fn execute_cell(&self, cell: &ExecutionCell) -> CellEnd {
        let row_index = cell.row_index;
        let target_id = cell.target.id.clone();
        self.emitter
            .emit(EvaluationEvent::CellStarted {
                row_index,
                target_id: target_id.clone(),
            })
            .await;

        let assembled = match WorkflowAssembler::new(&self.request).assemble(cell) {
            Ok(assembled) => assembled,
            Err(e) => {
                self.emitter
                    .emit(EvaluationEvent::Error {
                        message: e.to_string(),
                        row_index: Some(row_index),
                        target_id: Some(target_id),
                        evaluator_id: None,
                    })
                    .await;
                return CellEnd::Finished { failed: true };
            }
        };

        let mapper = ResultMapper::new(
            HashSet::from([assembled.target_node_id.clone()]),
            (*self.strip_set).clone(),
        );
        let trace_id = cell.trace_id.clone().unwrap_or_else(generate_trace_id);

        let mut failed = false;
        let mut target_outputs: Option<JsonMap> = None;

        if let (true, Some(precomputed)) = (cell.skip_target, &cell.precomputed_target_output) {
            // Evaluator rerun against a known output: no target_result.
            target_outputs = Some(wrap_precomputed_output(&cell.target, precomputed.clone()));
        } else {
            let request = ComponentRequest {
                trace_id: trace_id.clone(),
                workflow: assembled.workflow.clone(),
                node_id: assembled.target_node_id.clone(),
                inputs: build_target_inputs(&self.request, cell),
            };
            match self
                .backend
                .execute_component(request, self.signal.clone())
                .await
            {
                Err(e) => {
                    self.emitter
                        .emit(EvaluationEvent::TargetResult {
                            row_index,
                            target_id: target_id.clone(),
                            output: None,
                            cost: None,
                            duration: None,
                            trace_id: Some(trace_id.clone()),
                            error: Some(e.to_string()),
                        })
                        .await;
                    failed = true;
                }
                Ok(mut stream) => {
                    while let Some(event) = stream.next().await {
                        if self.signal.is_aborted().await {
                            return CellEnd::Aborted;
                        }
                        let BackendEvent::ComponentStateChange(change) = &event else {
                            continue;
                        };
                        if mapper.is_target(&change.component_id) {
                            match change.execution_state.status {
                                ExecutionStatus::Success => {
                                    target_outputs = change.execution_state.outputs.clone();
                                }
                                ExecutionStatus::Error => failed = true,
                                _ => {}
                            }
                        }
                        if let Some(public) = mapper.map_component_event(row_index, change) {
                            self.emitter.emit(public).await;
                        }
                    }
                }
            }
        }

        if self.signal.is_aborted().await {
            return CellEnd::Aborted;
        }

        if !failed {
            if let Some(outputs) = &target_outputs {
                for evaluator in &cell.evaluators {
                    if self.signal.is_aborted().await {
                        return CellEnd::Aborted;
                    }
                    if self
                        .run_evaluator(cell, evaluator, outputs, &assembled, &mapper, &trace_id)
                        .await
                        .is_err()
                    {
                        return CellEnd::Aborted;
                    }
                }
            }
        }

        CellEnd::Finished { failed }
    }

    /// Runs one evaluator on the cell's trace. A submission failure yields a
    /// synthesized error verdict and does not fail the cell; `Err` means the
    /// abort flag was observed mid-stream.
    async fn run_evaluator(
        &self,
        cell: &ExecutionCell,
        evaluator: &EvaluatorConfig,
        target_outputs: &JsonMap,
        assembled: &crate::workflow::AssembledWorkflow,
        mapper: &ResultMapper,
        trace_id: &str,
    ) -> Result<(), Aborted> {
        let node_id = format!("{}.{}", cell.target.id, evaluator.id);
        let request = ComponentRequest {
            trace_id: trace_id.to_string(),
            workflow: assembled.workflow.clone(),
            node_id,
            inputs: build_evaluator_inputs(&self.request, cell, evaluator, target_outputs),
        };

        let mut stream = match self
            .backend
            .execute_component(request, self.signal.clone())
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.emitter
                    .emit(EvaluationEvent::EvaluatorResult {
                        row_index: cell.row_index,
                        target_id: cell.target.id.clone(),
                        evaluator_id: evaluator.id.clone(),
                        result: EvaluationResult::evaluator_error(e.to_string()),
                    })
                    .await;
                return Ok(());
            }
        };

        while let Some(event) = stream.next().await {
            if self.signal.is_aborted().await {
                return Err(Aborted);
            }
            let BackendEvent::ComponentStateChange(change) = &event else {
                continue;
            };
            if let Some(public) = mapper.map_component_event(cell.row_index, change) {
                self.emitter.emit(public).await;
            }
        }
        Ok(())
    }
}

/// Marker: the abort flag was observed inside an evaluator's event loop.
struct Aborted;

/// Wraps a precomputed target output so evaluators can read it by field
/// name: objects pass through, scalars are keyed under the target's first
/// output identifier (or `output`).
fn wrap_precomputed_output(target: &TargetConfig, value: JsonValue) -> JsonMap {
    match value {
        JsonValue::Object(map) => map,
        other => {
            let field = target
                .outputs
                .first()
                .map(|f| f.identifier.clone())
                .unwrap_or_else(|| "output".to_string());
            let mut map = JsonMap::new();
            map.insert(field, other);
            map
        }
    }
}

/// Input values for the target node, from its mappings over the cell's
/// dataset entry.
fn build_target_inputs(request: &ExecutionRequest, cell: &ExecutionCell) -> JsonMap {
    let mut inputs = JsonMap::new();
    let Some(by_field) = cell.target.mappings.get(&request.dataset.dataset_id) else {
        return inputs;
    };
    for (field, mapping) in by_field {
        match mapping {
            Mapping::Source {
                source: MappingSource::Dataset,
                source_field,
                ..
            } => {
                if let Some(value) = entry_value(request, &cell.entry, source_field) {
                    inputs.insert(field.clone(), value.clone());
                }
            }
            // A target has no upstream target inside its own cell.
            Mapping::Source { .. } => {}
            Mapping::Value { value } => {
                inputs.insert(field.clone(), value.clone());
            }
        }
    }
    inputs
}

/// Input values for one evaluator: dataset columns by name, target output
/// fields by identifier, literals verbatim.
fn build_evaluator_inputs(
    request: &ExecutionRequest,
    cell: &ExecutionCell,
    evaluator: &EvaluatorConfig,
    target_outputs: &JsonMap,
) -> JsonMap {
    let mut inputs = JsonMap::new();
    let Some(by_field) = evaluator
        .mappings
        .get(&request.dataset.dataset_id)
        .and_then(|by_target| by_target.get(&cell.target.id))
    else {
        return inputs;
    };
    for (field, mapping) in by_field {
        match mapping {
            Mapping::Source {
                source: MappingSource::Dataset,
                source_field,
                ..
            } => {
                if let Some(value) = entry_value(request, &cell.entry, source_field) {
                    inputs.insert(field.clone(), value.clone());
                }
            }
            Mapping::Source {
                source: MappingSource::Target,
                source_id,
                source_field,
            } => {
                if source_id == &cell.target.id {
                    if let Some(value) = target_outputs.get(source_field) {
                        inputs.insert(field.clone(), value.clone());
                    }
                }
            }
            Mapping::Value { value } => {
                inputs.insert(field.clone(), value.clone());
            }
        }
    }
    inputs
}

/// Reads a dataset entry field by column name, falling back to the column
/// id for rows that were keyed by id.
fn entry_value<'a>(
    request: &ExecutionRequest,
    entry: &'a JsonMap,
    column_name: &str,
) -> Option<&'a JsonValue> {
    entry.get(column_name).or_else(|| {
        request
            .dataset
            .column_id(column_name)
            .and_then(|id| entry.get(id))
    })
}

/// One metadata record per configured target, for the run document.
fn build_target_metadata(request: &ExecutionRequest) -> Vec<TargetMetadata> {
    request
        .targets
        .iter()
        .map(|target| {
            let (name, model) = match &target.kind {
                TargetKind::Prompt {
                    prompt_id,
                    local_prompt_config,
                    ..
                } => {
                    let prompt = prompt_id.as_ref().and_then(|id| request.prompts.get(id));
                    let name = prompt.map(|p| p.name.clone());
                    let model = local_prompt_config
                        .as_ref()
                        .map(|local| local.llm.model.clone())
                        .or_else(|| prompt.map(|p| p.llm.model.clone()));
                    (name, model)
                }
                TargetKind::Agent { db_agent_id, .. } => (
                    request.agents.get(db_agent_id).map(|a| a.name.clone()),
                    None,
                ),
                TargetKind::Evaluator {
                    target_evaluator_id,
                } => (
                    target_evaluator_id
                        .as_ref()
                        .and_then(|id| request.evaluator_records.get(id))
                        .map(|r| r.name.clone()),
                    None,
                ),
            };
            TargetMetadata {
                id: target.id.clone(),
                name: name.unwrap_or_else(|| target.id.clone()),
                model,
            }
        })
        .collect()
}

/// Display names for evaluators, for the run document's evaluation rows.
fn evaluator_names(request: &ExecutionRequest) -> HashMap<String, String> {
    request
        .evaluators
        .iter()
        .map(|evaluator| {
            let name = evaluator
                .db_evaluator_id
                .as_ref()
                .and_then(|id| request.evaluator_records.get(id))
                .map(|r| r.name.clone())
                .or_else(|| {
                    request
                        .evaluator_catalog
                        .get(&evaluator.evaluator_type)
                        .map(|info| info.name.clone())
                })
                .unwrap_or_else(|| evaluator.id.clone());
            (evaluator.id.clone(), name)
        })
        .collect()
}
