use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use rtsched_core::{process_group, IdentityTable, ProcessorSettings, SchedulerConf};
use tracing::info;

use crate::metrics::SchedulerMetrics;
use crate::policy::{OsThreadPolicy, ProcessorBinding, ThreadPolicy};
use crate::processor::{self, Processor};
use crate::registry::DEFAULT_STRIPES;
use crate::routine::{RoutineInfo, MAX_PRIO};
use crate::state::{SchedulerState, SharedSchedulerState};
use crate::trace::{LogSink, TraceSink};

/// The routine scheduler. Multiplexes routines onto a fixed pool of
/// processor threads in strict priority order.
pub struct Scheduler {
    pub(super) conf: SchedulerConf,
    pub(super) settings: ProcessorSettings,
    /// Routine name → priority overrides from the config.
    pub(super) task_priorities: HashMap<String, u32>,
    pub(super) state: SharedSchedulerState,
    pub(super) policy: Arc<dyn ThreadPolicy>,
    pub(super) processors: Mutex<Vec<Processor>>,
    /// Set by the first start.
    pub(super) started: AtomicBool,
}

/// Builder for [`Scheduler`] with non-default collaborators.
pub struct SchedulerBuilder {
    conf: SchedulerConf,
    trace: Arc<dyn TraceSink>,
    policy: Arc<dyn ThreadPolicy>,
    identities: Arc<IdentityTable>,
    stripes: usize,
}

impl SchedulerBuilder {
    pub fn new(conf: SchedulerConf) -> Self {
        Self {
            conf,
            trace: Arc::new(LogSink),
            policy: Arc::new(OsThreadPolicy),
            identities: Arc::new(IdentityTable::new()),
            stripes: DEFAULT_STRIPES,
        }
    }

    /// Where scheduling events go (default: `tracing` at TRACE level).
    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    /// How processor bindings are applied (default: the host OS).
    pub fn thread_policy(mut self, policy: Arc<dyn ThreadPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Share an identity table with other components of the process.
    pub fn identities(mut self, identities: Arc<IdentityTable>) -> Self {
        self.identities = identities;
        self
    }

    /// Number of registry stripe locks (rounded up to a power of two).
    pub fn stripes(mut self, stripes: usize) -> Self {
        self.stripes = stripes;
        self
    }

    /// Build a scheduler whose processors are not yet running.
    pub fn build(self) -> Scheduler {
        let settings = self.conf.processor_settings();
        let task_priorities = self.conf.task_priorities();
        let processors = settings.processor_num.max(1) as usize;
        Scheduler {
            state: Arc::new(
                SchedulerState::new(self.stripes, processors, self.trace)
                    .with_identities(self.identities),
            ),
            conf: self.conf,
            settings,
            task_priorities,
            policy: self.policy,
            processors: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }
}

impl Scheduler {
    /// Create a scheduler with default collaborators. Processors are not started.
    pub fn new(conf: SchedulerConf) -> Self {
        SchedulerBuilder::new(conf).build()
    }

    pub fn builder(conf: SchedulerConf) -> SchedulerBuilder {
        SchedulerBuilder::new(conf)
    }

    /// Create a scheduler and start its processor pool.
    pub fn init(conf: SchedulerConf) -> Self {
        let scheduler = Self::new(conf);
        scheduler.start();
        scheduler
    }

    /// Load the config of the current process group (or defaults) and start.
    pub fn init_for_process_group() -> Self {
        let group = process_group();
        info!(process_group = %group, "initializing scheduler");
        Self::init(SchedulerConf::for_process_group(&group))
    }

    pub fn conf(&self) -> &SchedulerConf {
        &self.conf
    }

    pub fn processor_settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Number of processors the pool runs with.
    pub fn processor_count(&self) -> usize {
        self.settings.processor_num.max(1) as usize
    }

    /// Binding each processor gets, by processor id.
    pub fn bindings(&self) -> Vec<ProcessorBinding> {
        (0..self.processor_count())
            .map(|i| ProcessorBinding::for_processor(&self.settings, i))
            .collect()
    }

    /// Get a handle to the shared state.
    pub fn shared_state(&self) -> SharedSchedulerState {
        Arc::clone(&self.state)
    }

    /// Names claimed by the routines registered right now.
    pub fn identities(&self) -> Arc<IdentityTable> {
        Arc::clone(&self.state.identities)
    }

    /// Snapshot of a registered routine.
    pub fn routine(&self, id: u64) -> Option<RoutineInfo> {
        self.state.registry.get(id).map(|r| r.info())
    }

    pub fn registered_count(&self) -> usize {
        self.state.registry.len()
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.state.registry.contains(id)
    }

    /// Routines waiting at `priority`.
    pub fn ready_len(&self, priority: u32) -> usize {
        self.state.queues.len(priority)
    }

    /// Priority level whose queue currently holds `id`.
    pub fn queued_priority(&self, id: u64) -> Option<u32> {
        self.state.queues.find(id)
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        let mut snapshot = self.state.metrics.lock().clone();
        snapshot.ready_depth = self.state.queues.depths();
        snapshot.registered = self.state.registry.len();
        snapshot.processor_utilization =
            self.state.busy_processors() as f64 / self.processor_count() as f64;
        snapshot
    }

    /// Make one scheduling decision on the calling thread, as processor
    /// `processor_id`. Returns false if nothing was ready.
    ///
    /// Lets embedders and tests drive the scheduler without the thread pool.
    pub fn run_once(&self, processor_id: usize) -> bool {
        processor::run_once(&self.state, processor_id)
    }

    /// Run on the calling thread until no routine is ready.
    pub fn run_until_idle(&self, processor_id: usize) -> usize {
        let mut steps = 0;
        while self.run_once(processor_id) {
            steps += 1;
        }
        steps
    }

    /// Highest valid priority value plus one.
    pub fn max_priority(&self) -> u32 {
        MAX_PRIO
    }
}
