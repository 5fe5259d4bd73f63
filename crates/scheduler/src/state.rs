use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rtsched_core::IdentityTable;

use crate::metrics::SchedulerMetrics;
use crate::ready_queue::{ReadyQueueSet, WakeSignal};
use crate::registry::Registry;
use crate::routine::Routine;
use crate::trace::{SchedEvent, SchedEventKind, TraceSink};

/// Everything the scheduler and its processors share.
///
/// One instance per [`Scheduler`](crate::Scheduler), handed to every
/// processor through [`SharedSchedulerState`]. There is no process-wide state.
pub struct SchedulerState {
    pub registry: Registry,
    pub queues: ReadyQueueSet,
    pub wake: WakeSignal,
    /// Set once by stop; never cleared.
    pub(crate) stopping: AtomicBool,
    /// Processors currently inside a routine step.
    pub(crate) busy: AtomicUsize,
    pub(crate) trace: Arc<dyn TraceSink>,
    pub(crate) metrics: Mutex<SchedulerMetrics>,
    /// Name claims of registered routines.
    pub(crate) identities: Arc<IdentityTable>,
}

/// Thread-safe handle to the shared scheduler state.
pub type SharedSchedulerState = Arc<SchedulerState>;

impl SchedulerState {
    pub fn new(stripes: usize, processors: usize, trace: Arc<dyn TraceSink>) -> Self {
        Self {
            registry: Registry::new(stripes),
            queues: ReadyQueueSet::new(),
            wake: WakeSignal::new(processors),
            stopping: AtomicBool::new(false),
            busy: AtomicUsize::new(0),
            trace,
            metrics: Mutex::new(SchedulerMetrics::default()),
            identities: Arc::new(IdentityTable::new()),
        }
    }

    /// Use a shared identity table instead of a private one.
    pub fn with_identities(mut self, identities: Arc<IdentityTable>) -> Self {
        self.identities = identities;
        self
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn busy_processors(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, kind: SchedEventKind, routine_id: u64, processor_id: Option<usize>) {
        self.trace.record(SchedEvent::now(kind, routine_id, processor_id));
    }

    /// Queue a READY routine and wake an idle processor.
    pub(crate) fn make_ready(&self, routine: &Arc<Routine>) -> bool {
        if self.queues.enqueue(routine) {
            self.wake.notify_one();
            true
        } else {
            false
        }
    }

    /// Deregister a routine that finished on its own.
    pub(crate) fn retire(&self, routine: &Arc<Routine>, processor_id: usize) {
        let deregistered = {
            let _stripe = self.registry.lock_id(routine.id());
            let removed = self.registry.remove_if_same(routine);
            if removed {
                self.identities.release(routine.id(), routine.name());
            }
            removed
        };
        routine.release();
        {
            let mut metrics = self.metrics.lock();
            metrics.finished += 1;
            if deregistered {
                metrics.forget(routine.name());
            }
        }
        self.emit(SchedEventKind::Finished, routine.id(), Some(processor_id));
    }
}
