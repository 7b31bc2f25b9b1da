//! `evalgrid` - a parallel evaluation orchestrator for LLM applications.
//!
//! The core of this crate executes grids of (dataset row × target) cells
//! against a remote component-execution backend, collects per-cell target
//! outputs plus downstream evaluator verdicts, and streams a strictly
//! ordered event log to live consumers while incrementally persisting a run
//! document.
//!
//! The hard parts it takes care of:
//!
//! - **Bounded parallelism**: cells run concurrently under a FIFO counting
//!   [`Semaphore`](sync::Semaphore).
//! - **Cooperative cancellation**: abort flags live in a shared key-value
//!   store ([`AbortCoordinator`](abort::AbortCoordinator)) and are polled
//!   between every suspension point; the backend receives the same signal
//!   so it can stop streaming early.
//! - **Deterministic workflow assembly**: each cell becomes an executable
//!   graph (entry → target → evaluators) via
//!   [`WorkflowAssembler`](workflow::WorkflowAssembler).
//! - **Event multiplexing**: backend stream events are translated by
//!   [`ResultMapper`](mapper::ResultMapper) and fanned into one ordered
//!   async sequence, the run store, the run-state record and an optional
//!   analytics sink.
//! - **Idempotent persistence**: run documents merge by composite keys, so
//!   partial progress survives aborts and re-drives are safe.
//!
//! Dataset loading, the HTTP/SSE surface, the actual execution backend and
//! the concrete Redis/search-engine connections live outside this crate;
//! they are consumed through the [`BackendClient`](backend::BackendClient),
//! [`KvStore`](kv::KvStore), [`RunStore`](store::RunStore) and
//! [`EventSink`](sink::EventSink) seams.

pub mod abort;
pub mod backend;
pub mod ids;
pub mod kv;
pub mod mapper;
pub mod model;
pub mod orchestrator;
pub mod sink;
pub mod store;
pub mod sync;
pub mod workflow;

pub use abort::{AbortCoordinator, AbortSignal};
pub use backend::{
    BackendClient, BackendError, BackendEvent, BackendEventStream, ComponentRequest,
};
pub use kv::{KvError, KvStore, MemoryKvStore};
pub use mapper::{ResultMapper, coerce_passed, coerce_score, extract_target_output, parse_node_id};
pub use model::event::{Cost, EvaluationEvent, EvaluationResult, RunSummary, StopReason};
pub use model::{ExecutionRequest, ExecutionScope};
pub use orchestrator::{
    EventStream, ExecutionHandle, Orchestrator, OrchestratorConfig, RunState, RunStatus,
};
pub use sink::{EventSink, MemoryEventSink};
pub use store::{MemoryRunStore, RunStore, StoreError};
pub use sync::Semaphore;
pub use workflow::{ConfigError, WorkflowAssembler};
