use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::Scheduler;
use crate::processor::Processor;

impl Scheduler {
    /// Spawn the processor pool. Returns false if it is already running, if
    /// the scheduler was stopped, or if no processor could be spawned.
    pub fn start(&self) -> bool {
        if self.state.is_stopping() {
            warn!("scheduler was stopped, refusing to start");
            return false;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.conf.log_summary();
        let mut processors = self.processors.lock();
        for binding in self.bindings() {
            let id = binding.processor_id;
            match Processor::spawn(binding, Arc::clone(&self.state), Arc::clone(&self.policy)) {
                Ok(processor) => processors.push(processor),
                Err(e) => error!(processor = id, error = %e, "failed to spawn processor"),
            }
        }

        if processors.is_empty() {
            error!("no processor could be started");
            self.started.store(false, Ordering::Release);
            return false;
        }
        info!(processors = processors.len(), "scheduler started");
        true
    }

    /// Stop every processor and reclaim every routine. Idempotent.
    ///
    /// Returns once all processor threads have exited. Running routines get
    /// to finish their current step first. Called from inside a routine step,
    /// the calling processor is not waited for; it exits after that step.
    pub fn stop(&self) {
        if self.state.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping scheduler");
        self.state.wake.close();

        let mut processors = std::mem::take(&mut *self.processors.lock());
        for processor in &mut processors {
            if processor.is_current_thread() {
                debug!(processor = processor.id(), "stop called from this processor, not joining it");
                continue;
            }
            processor.join();
        }

        self.state.queues.drain();
        let routines = self.state.registry.drain();
        let reclaimed = routines.len();
        for routine in routines {
            self.state.identities.release(routine.id(), routine.name());
            routine.stop();
            routine.release();
        }
        info!(reclaimed, "scheduler stopped");
    }

    /// True between a successful start and stop.
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.state.is_stopping()
    }

    pub fn is_stopping(&self) -> bool {
        self.state.is_stopping()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
