use std::sync::Arc;

use rtsched_core::hash_name;
use tracing::{debug, error, warn};

use super::Scheduler;
use crate::routine::{Routine, MAX_PRIO};
use crate::trace::SchedEventKind;

impl Scheduler {
    /// Register `routine` and make it ready to run.
    ///
    /// Returns false if a routine with the same id is already registered (the
    /// existing one is left untouched), if its id collides with a different
    /// name, or if the scheduler is stopping.
    pub fn submit(&self, routine: Routine) -> bool {
        if self.state.is_stopping() {
            warn!(routine = routine.name(), "scheduler is stopping, submit rejected");
            self.state.metrics.lock().rejected_submits += 1;
            return false;
        }

        let id = routine.id();
        let priority = self.effective_priority(&routine);
        routine.set_priority(priority);
        let routine = Arc::new(routine);

        {
            let _stripe = self.state.registry.lock_id(id);
            if let Err(e) = self.state.identities.claim(id, routine.name()) {
                error!(error = %e, "submit rejected");
                self.state.metrics.lock().rejected_submits += 1;
                return false;
            }
            if !self.state.registry.insert(Arc::clone(&routine)) {
                debug!(routine = routine.name(), id, "already registered");
                self.state.metrics.lock().rejected_submits += 1;
                return false;
            }
            // Lost a race with stop, which may already have drained the registry.
            if self.state.is_stopping() {
                self.state.registry.remove_if_same(&routine);
                self.state.identities.release(id, routine.name());
                routine.stop();
                routine.release();
                self.state.metrics.lock().rejected_submits += 1;
                return false;
            }
            self.state.queues.enqueue(&routine);
        }

        self.state.wake.notify_one();
        self.state.metrics.lock().submitted += 1;
        self.state.emit(SchedEventKind::Created, id, None);
        debug!(routine = routine.name(), id, priority, "routine submitted");
        true
    }

    /// Config override first, then clamp into `0..MAX_PRIO`.
    fn effective_priority(&self, routine: &Routine) -> u32 {
        let requested = self
            .task_priorities
            .get(routine.name())
            .copied()
            .unwrap_or_else(|| routine.priority());
        if requested < MAX_PRIO {
            return requested;
        }
        warn!(
            routine = routine.name(),
            requested,
            max = MAX_PRIO - 1,
            "priority out of range, clamping"
        );
        self.state.metrics.lock().clamped_priorities += 1;
        MAX_PRIO - 1
    }

    /// Tell routine `id` that new data is available.
    ///
    /// A routine waiting for data is made ready again; a notify that arrives
    /// while the routine is running is remembered and picked up when it
    /// blocks. Returns true for any registered id, false otherwise. While the
    /// scheduler is stopping this returns true without doing anything.
    pub fn notify(&self, id: u64) -> bool {
        if self.state.is_stopping() {
            return true;
        }
        let Some(routine) = self.state.registry.get(id) else {
            return false;
        };

        self.state.metrics.lock().notifies += 1;
        if routine.wake() && self.state.make_ready(&routine) {
            self.state.metrics.lock().wakeups += 1;
            self.state.emit(SchedEventKind::NotifyIn, id, routine.processor_id());
        }
        true
    }

    pub fn remove_by_name(&self, name: &str) -> bool {
        self.remove_by_id(hash_name(name))
    }

    /// Stop and deregister routine `id`. Returns false if it is not registered.
    ///
    /// A routine that is running right now keeps its body until its current
    /// step returns; the processor releases it then.
    pub fn remove_by_id(&self, id: u64) -> bool {
        let routine = {
            let _stripe = self.state.registry.lock_id(id);
            let Some(routine) = self.state.registry.get(id) else {
                return false;
            };
            routine.stop();
            self.state.registry.remove(id);
            self.state.queues.remove(id, routine.priority());
            self.state.identities.release(id, routine.name());
            routine
        };

        if !routine.release() {
            debug!(routine = routine.name(), "removed while running, processor will release it");
        }
        {
            let mut metrics = self.state.metrics.lock();
            metrics.removals += 1;
            metrics.forget(routine.name());
        }
        self.state.emit(SchedEventKind::Removed, id, routine.processor_id());
        debug!(routine = routine.name(), id, "routine removed");
        true
    }
}
