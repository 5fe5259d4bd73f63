//! Processors: OS threads that drain the ready queues in priority order.
//!
//! Each processor applies its [`ProcessorBinding`] once at startup, then
//! loops: pop the highest-priority ready routine, run one step, and file the
//! routine according to the step's outcome. With nothing ready it blocks on
//! the scheduler's wake signal instead of spinning.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::SchedError;
use crate::policy::{ProcessorBinding, ThreadPolicy};
use crate::routine::{Park, RoutineStatus};
use crate::state::SharedSchedulerState;
use crate::trace::SchedEventKind;

/// Upper bound on an idle wait; the loop re-checks the stop flag after it.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Handle to a running processor thread.
pub struct Processor {
    binding: ProcessorBinding,
    handle: Option<JoinHandle<()>>,
}

impl Processor {
    /// Spawn the processor thread.
    pub fn spawn(
        binding: ProcessorBinding,
        state: SharedSchedulerState,
        policy: Arc<dyn ThreadPolicy>,
    ) -> Result<Self, SchedError> {
        let thread_binding = binding.clone();
        let handle = thread::Builder::new()
            .name(format!("processor-{}", binding.processor_id))
            .spawn(move || {
                if let Err(e) = policy.apply(&thread_binding) {
                    warn!(
                        processor = thread_binding.processor_id,
                        error = %e,
                        "failed to apply thread policy, running unbound"
                    );
                }
                run_loop(&state, thread_binding.processor_id);
            })?;
        Ok(Self {
            binding,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> usize {
        self.binding.processor_id
    }

    pub fn binding(&self) -> &ProcessorBinding {
        &self.binding
    }

    /// True when called from this processor's own thread.
    pub fn is_current_thread(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }

    /// Wait for the thread to exit. The caller must have raised the stop flag.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(processor = self.id(), "processor thread panicked");
            }
        }
    }
}

fn run_loop(state: &SharedSchedulerState, processor_id: usize) {
    info!(processor = processor_id, "processor started");
    while !state.is_stopping() {
        if !run_once(state, processor_id) {
            state.wake.wait(IDLE_WAIT);
        }
    }
    info!(processor = processor_id, "processor stopped");
}

/// Make one scheduling decision. Returns false if nothing was ready.
pub(crate) fn run_once(state: &SharedSchedulerState, processor_id: usize) -> bool {
    let Some(routine) = state.queues.pop_next() else {
        return false;
    };

    if !routine.try_resume() {
        // Stopped after it was queued.
        routine.release();
        return true;
    }

    state.busy.fetch_add(1, Ordering::Relaxed);
    state.emit(SchedEventKind::SwapIn, routine.id(), Some(processor_id));

    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| routine.run_step(processor_id)));
    let elapsed = started.elapsed();

    state.busy.fetch_sub(1, Ordering::Relaxed);
    {
        let mut metrics = state.metrics.lock();
        if state.registry.holds(&routine) {
            metrics.record_step(routine.name(), elapsed);
        } else {
            // Removed mid-step; its per-routine entries are already gone.
            metrics.steps_total += 1;
        }
    }
    state.emit(SchedEventKind::SwapOut, routine.id(), Some(processor_id));

    let status = match outcome {
        Ok(status) => status,
        Err(_) => {
            error!(routine = routine.name(), "routine panicked, retiring it");
            Some(RoutineStatus::Done)
        }
    };

    match status {
        // Body released by a concurrent remove.
        None => {}
        Some(RoutineStatus::Ready) => {
            if !routine.yield_ready() || !state.queues.enqueue(&routine) {
                routine.release();
            }
        }
        Some(RoutineStatus::Blocked) => match routine.park() {
            Park::Parked => {
                debug!(routine = routine.name(), "waiting for data");
            }
            Park::Woken => {
                state.make_ready(&routine);
            }
            Park::Stopped => {
                routine.release();
            }
        },
        Some(RoutineStatus::Done) => {
            if routine.finish() {
                state.retire(&routine, processor_id);
            } else {
                routine.release();
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::routine::{Routine, RoutineContext, RoutineState};
    use crate::state::SchedulerState;
    use crate::trace::NullSink;

    fn shared_state() -> SharedSchedulerState {
        Arc::new(SchedulerState::new(16, 1, Arc::new(NullSink)))
    }

    fn register(state: &SharedSchedulerState, routine: Routine) -> Arc<Routine> {
        let routine = Arc::new(routine);
        state.registry.insert(Arc::clone(&routine));
        state.queues.enqueue(&routine);
        routine
    }

    #[test]
    fn idle_when_nothing_ready() {
        let state = shared_state();
        assert!(!run_once(&state, 0));
    }

    #[test]
    fn done_routine_is_retired() {
        let state = shared_state();
        let r = register(&state, Routine::new("once", |_: &RoutineContext<'_>| RoutineStatus::Done));

        assert!(run_once(&state, 0));
        assert_eq!(r.state(), RoutineState::Finished);
        assert!(r.is_released());
        assert!(state.registry.is_empty());
        assert!(state.queues.is_empty());
        assert_eq!(state.metrics.lock().finished, 1);
    }

    #[test]
    fn ready_routine_goes_to_tail() {
        let state = shared_state();
        let a = register(&state, Routine::new("a", |_: &RoutineContext<'_>| RoutineStatus::Ready).with_priority(2));
        let b = register(&state, Routine::new("b", |_: &RoutineContext<'_>| RoutineStatus::Ready).with_priority(2));

        run_once(&state, 0);
        assert_eq!(a.state(), RoutineState::Ready);
        assert_eq!(a.processor_id(), Some(0));
        let next = state.queues.pop_next().unwrap();
        assert!(Arc::ptr_eq(&next, &b), "b should now be at the head");
    }

    #[test]
    fn blocked_routine_leaves_queues() {
        let state = shared_state();
        let r = register(&state, Routine::new("wait", |_: &RoutineContext<'_>| RoutineStatus::Blocked));

        run_once(&state, 0);
        assert_eq!(r.state(), RoutineState::DataWait);
        assert!(state.queues.is_empty());
        assert!(state.registry.contains(r.id()));
    }

    #[test]
    fn stopped_while_queued_is_discarded() {
        let state = shared_state();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let r = register(
            &state,
            Routine::new("doomed", move |_: &RoutineContext<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                RoutineStatus::Ready
            }),
        );
        r.stop();

        assert!(run_once(&state, 0));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(r.is_released());
        assert!(state.queues.is_empty());
    }

    #[test]
    fn panicking_routine_is_retired() {
        let state = shared_state();
        let r = register(
            &state,
            Routine::new("boom", |_: &RoutineContext<'_>| -> RoutineStatus { panic!("boom") }),
        );

        assert!(run_once(&state, 0));
        assert_eq!(r.state(), RoutineState::Finished);
        assert!(state.registry.is_empty());
    }
}
