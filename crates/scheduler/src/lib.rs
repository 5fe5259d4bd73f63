//! Cooperative, priority-driven routine scheduler.
//!
//! Routines are registered with [`Scheduler::submit`], run one step at a time
//! on a fixed pool of processor threads, and wait for data through
//! [`Scheduler::notify`]. Lower priority values run first.

pub mod error;
pub mod metrics;
pub mod policy;
pub mod processor;
pub mod ready_queue;
pub mod registry;
pub mod routine;
pub mod scheduler;
pub mod state;
pub mod trace;

pub use error::SchedError;
pub use metrics::SchedulerMetrics;
pub use policy::{NoopPolicy, OsThreadPolicy, ProcessorBinding, ThreadPolicy};
pub use routine::{
    Routine, RoutineBody, RoutineContext, RoutineInfo, RoutineState, RoutineStatus, DEFAULT_PRIO,
    MAX_PRIO,
};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use state::{SchedulerState, SharedSchedulerState};
pub use trace::{JsonLinesSink, LogSink, NullSink, RingSink, SchedEvent, SchedEventKind, TraceSink};
