//! Priority-indexed ready queues shared by every processor.
//!
//! One FIFO deque per priority level, each behind its own `RwLock`; there is
//! no lock covering more than one level. Level 0 is the highest priority.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::routine::{Routine, RoutineState, MAX_PRIO};

/// The set of `MAX_PRIO` ready queues.
pub struct ReadyQueueSet {
    levels: Vec<RwLock<VecDeque<Arc<Routine>>>>,
}

impl Default for ReadyQueueSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueueSet {
    pub fn new() -> Self {
        Self {
            levels: (0..MAX_PRIO).map(|_| RwLock::new(VecDeque::new())).collect(),
        }
    }

    fn level(&self, priority: u32) -> &RwLock<VecDeque<Arc<Routine>>> {
        // Priorities are clamped at submit; the min only guards direct callers.
        let idx = priority.min(MAX_PRIO - 1) as usize;
        &self.levels[idx]
    }

    /// Append `routine` to the tail of its level.
    ///
    /// The state is checked under the level lock, so a routine stopped by a
    /// concurrent remove is never queued. Returns false if it was not queued.
    pub fn enqueue(&self, routine: &Arc<Routine>) -> bool {
        let mut queue = self.level(routine.priority()).write();
        if routine.state() != RoutineState::Ready {
            return false;
        }
        queue.push_back(Arc::clone(routine));
        true
    }

    /// Pop the head of the highest-priority non-empty level.
    pub fn pop_next(&self) -> Option<Arc<Routine>> {
        for level in &self.levels {
            if level.read().is_empty() {
                continue;
            }
            if let Some(routine) = level.write().pop_front() {
                return Some(routine);
            }
        }
        None
    }

    /// Remove the routine with `id` from level `priority`.
    pub fn remove(&self, id: u64, priority: u32) -> Option<Arc<Routine>> {
        let mut queue = self.level(priority).write();
        let pos = queue.iter().position(|r| r.id() == id)?;
        queue.remove(pos)
    }

    /// Level currently holding `id`, if any.
    pub fn find(&self, id: u64) -> Option<u32> {
        self.levels
            .iter()
            .position(|level| level.read().iter().any(|r| r.id() == id))
            .map(|idx| idx as u32)
    }

    pub fn len(&self, priority: u32) -> usize {
        self.level(priority).read().len()
    }

    pub fn total_len(&self) -> usize {
        self.levels.iter().map(|l| l.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|l| l.read().is_empty())
    }

    /// Queue depth per level, highest priority first.
    pub fn depths(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.read().len()).collect()
    }

    /// Empty every level.
    pub fn drain(&self) -> Vec<Arc<Routine>> {
        let mut drained = Vec::new();
        for level in &self.levels {
            drained.extend(level.write().drain(..));
        }
        drained
    }
}

// ── Wake signal ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct WakeState {
    pending: usize,
    closed: bool,
}

/// Condition idle processors block on; raised by submit and notify.
///
/// Wakeups are counted, so a signal raised between a processor finding the
/// queues empty and going to sleep is not lost. The count saturates at
/// `max_pending`.
#[derive(Debug)]
pub struct WakeSignal {
    state: Mutex<WakeState>,
    cv: Condvar,
    max_pending: usize,
}

impl WakeSignal {
    pub fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(WakeState::default()),
            cv: Condvar::new(),
            max_pending: max_pending.max(1),
        }
    }

    /// Wake one idle processor.
    pub fn notify_one(&self) {
        let mut state = self.state.lock();
        if state.pending < self.max_pending {
            state.pending += 1;
        }
        self.cv.notify_one();
    }

    /// Wake every waiter for good; later waits return immediately.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cv.notify_all();
    }

    /// Block until signalled, closed, or `timeout` elapses. True if signalled or closed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let _ = self
            .cv
            .wait_while_for(&mut state, |s| s.pending == 0 && !s.closed, timeout);
        if state.closed {
            return true;
        }
        if state.pending > 0 {
            state.pending -= 1;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::routine::{RoutineContext, RoutineStatus};

    fn routine(name: &str, priority: u32) -> Arc<Routine> {
        Arc::new(
            Routine::new(name, |_: &RoutineContext<'_>| RoutineStatus::Done).with_priority(priority),
        )
    }

    #[test]
    fn pops_highest_priority_first() {
        let rq = ReadyQueueSet::new();
        rq.enqueue(&routine("low", 15));
        rq.enqueue(&routine("high", 1));
        rq.enqueue(&routine("mid", 7));

        let order: Vec<String> = std::iter::from_fn(|| rq.pop_next())
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
        assert!(rq.is_empty());
    }

    #[test]
    fn fifo_within_level() {
        let rq = ReadyQueueSet::new();
        for i in 0..5 {
            rq.enqueue(&routine(&format!("r{i}"), 3));
        }
        for i in 0..5 {
            assert_eq!(rq.pop_next().unwrap().name(), format!("r{i}"));
        }
    }

    #[test]
    fn enqueue_rejects_non_ready() {
        let rq = ReadyQueueSet::new();
        let r = routine("stopped", 2);
        r.stop();
        assert!(!rq.enqueue(&r));
        assert_eq!(rq.total_len(), 0);
    }

    #[test]
    fn remove_by_id() {
        let rq = ReadyQueueSet::new();
        let a = routine("a", 4);
        let b = routine("b", 4);
        rq.enqueue(&a);
        rq.enqueue(&b);

        assert_eq!(rq.find(a.id()), Some(4));
        let removed = rq.remove(a.id(), 4).unwrap();
        assert_eq!(removed.name(), "a");
        assert_eq!(rq.find(a.id()), None);
        assert!(rq.remove(a.id(), 4).is_none());
        assert_eq!(rq.len(4), 1);
    }

    #[test]
    fn depths_and_drain() {
        let rq = ReadyQueueSet::new();
        rq.enqueue(&routine("a", 0));
        rq.enqueue(&routine("b", 0));
        rq.enqueue(&routine("c", MAX_PRIO - 1));

        let depths = rq.depths();
        assert_eq!(depths.len(), MAX_PRIO as usize);
        assert_eq!(depths[0], 2);
        assert_eq!(depths[(MAX_PRIO - 1) as usize], 1);

        assert_eq!(rq.drain().len(), 3);
        assert!(rq.is_empty());
    }

    #[test]
    fn wake_signal_counts_early_notifies() {
        let wake = WakeSignal::new(4);
        wake.notify_one();
        assert!(wake.wait(Duration::from_millis(10)));
        assert!(!wake.wait(Duration::from_millis(10)));
    }

    #[test]
    fn wake_signal_saturates() {
        let wake = WakeSignal::new(2);
        for _ in 0..10 {
            wake.notify_one();
        }
        assert_eq!(wake.pending(), 2);
    }

    #[test]
    fn wake_signal_close_releases_waiters() {
        let wake = Arc::new(WakeSignal::new(1));
        let w = Arc::clone(&wake);
        let start = Instant::now();
        let handle = thread::spawn(move || w.wait(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        wake.close();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
