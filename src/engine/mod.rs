//! Execution engine for workflow instances
//!
//! The engine is a deterministic state machine: it consumes exactly one
//! event at a time for an instance and returns the next state plus the
//! list of side effects the activity executor must run. It performs no
//! I/O of its own — the current time is an explicit input, so a
//! transition can be replayed and audited.
//!
//! # Architecture
//!
//! - **Signals**: tagged-variant commands from callers (one `Signal`
//!   enum, one dispatch site — no per-workflow-kind subclassing)
//! - **Timer events**: reminder firings routed through the same
//!   per-instance serialization as signals
//! - **Effects**: the engine's only output channel for side effects;
//!   classified critical (persist, audit) or non-critical (notify,
//!   subject-record updates)

pub mod effects;
pub mod signal;
pub mod state_machine;

pub use effects::Effect;
pub use signal::{Signal, SignalAck, WorkflowEvent};
pub use state_machine::{EngineOutcome, ExecutionEngine};
