//! Routines: schedulable units of work with an explicit state machine.
//!
//! A routine never runs on a user-level stack. Its body exposes a single
//! [`RoutineBody::step`] that runs until the next suspension point and
//! reports what should happen next:
//!
//! - [`RoutineStatus::Ready`]: more work, re-enqueue at the tail of its level
//! - [`RoutineStatus::Blocked`]: nothing to do until [`notify`](crate::Scheduler::notify)
//! - [`RoutineStatus::Done`]: finished, drop it
//!
//! State transitions are CAS-guarded so that a routine is never queued and
//! running at the same time, and a stopped routine never comes back.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rtsched_core::hash_name;
use serde::Serialize;

/// Number of priority levels. Valid priorities are `0..MAX_PRIO`.
pub const MAX_PRIO: u32 = 20;

/// Priority given to routines that neither set one nor match an override.
pub const DEFAULT_PRIO: u32 = MAX_PRIO / 2;

const NO_PROCESSOR: usize = usize::MAX;

/// Lifecycle state of a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum RoutineState {
    Ready = 0,
    Running = 1,
    /// Blocked until new data arrives.
    DataWait = 2,
    Finished = 3,
    /// Forcibly terminated, pending reclamation.
    Stopped = 4,
}

impl RoutineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::DataWait,
            3 => Self::Finished,
            _ => Self::Stopped,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped)
    }
}

/// Outcome of one [`RoutineBody::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineStatus {
    Ready,
    Blocked,
    Done,
}

/// What happened when a processor parked a routine after a `Blocked` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Park {
    /// Now in `DataWait`.
    Parked,
    /// A notify raced with the step; the routine is `Ready` again.
    Woken,
    /// Removed while running.
    Stopped,
}

/// View handed to a routine body while it runs.
pub struct RoutineContext<'a> {
    routine: &'a Routine,
    processor_id: usize,
}

impl RoutineContext<'_> {
    pub fn id(&self) -> u64 {
        self.routine.id
    }

    pub fn name(&self) -> &str {
        &self.routine.name
    }

    pub fn processor_id(&self) -> usize {
        self.processor_id
    }

    /// True once the routine was removed; the body should unwind and return `Done`.
    pub fn is_stopped(&self) -> bool {
        self.routine.state() == RoutineState::Stopped
    }
}

/// The work carried by a routine.
pub trait RoutineBody: Send {
    /// Run until the next suspension point.
    fn step(&mut self, ctx: &RoutineContext<'_>) -> RoutineStatus;
}

impl<F> RoutineBody for F
where
    F: FnMut(&RoutineContext<'_>) -> RoutineStatus + Send,
{
    fn step(&mut self, ctx: &RoutineContext<'_>) -> RoutineStatus {
        self(ctx)
    }
}

/// A schedulable unit of work.
///
/// Created by a producer, handed to [`Scheduler::submit`](crate::Scheduler::submit)
/// and owned by the scheduler from then on.
pub struct Routine {
    id: u64,
    name: String,
    priority: AtomicU32,
    state: AtomicU8,
    /// Set by notify; consumed when the routine is resumed or parked.
    update_flag: AtomicBool,
    processor_id: AtomicUsize,
    /// `None` once released.
    body: Mutex<Option<Box<dyn RoutineBody>>>,
}

impl Routine {
    /// Create a routine whose id is the hash of `name`.
    pub fn new(name: impl Into<String>, body: impl RoutineBody + 'static) -> Self {
        let name = name.into();
        Self {
            id: hash_name(&name),
            name,
            priority: AtomicU32::new(DEFAULT_PRIO),
            state: AtomicU8::new(RoutineState::Ready as u8),
            update_flag: AtomicBool::new(false),
            processor_id: AtomicUsize::new(NO_PROCESSOR),
            body: Mutex::new(Some(Box::new(body))),
        }
    }

    /// Requested priority. Out-of-range values are clamped at submit time.
    pub fn with_priority(self, priority: u32) -> Self {
        self.priority.store(priority, Ordering::Relaxed);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RoutineState {
        RoutineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Last processor that ran this routine.
    pub fn processor_id(&self) -> Option<usize> {
        match self.processor_id.load(Ordering::Relaxed) {
            NO_PROCESSOR => None,
            id => Some(id),
        }
    }

    pub fn update_flag(&self) -> bool {
        self.update_flag.load(Ordering::SeqCst)
    }

    /// True once the body has been dropped.
    pub fn is_released(&self) -> bool {
        self.body.lock().is_none()
    }

    pub fn info(&self) -> RoutineInfo {
        RoutineInfo {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority(),
            state: self.state(),
            processor_id: self.processor_id(),
        }
    }

    // ── Scheduler-side transitions ──────────────────────────────────

    /// Only valid before the routine is shared.
    pub(crate) fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Release);
    }

    fn transition(&self, from: RoutineState, to: RoutineState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// READY → RUNNING. Clears the update flag: the step about to run sees all
    /// data delivered so far.
    pub(crate) fn try_resume(&self) -> bool {
        if self.transition(RoutineState::Ready, RoutineState::Running) {
            self.update_flag.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Run one step on `processor_id`. `None` if the body was already released.
    pub(crate) fn run_step(&self, processor_id: usize) -> Option<RoutineStatus> {
        self.processor_id.store(processor_id, Ordering::Relaxed);
        let mut body = self.body.lock();
        let body = body.as_mut()?;
        let ctx = RoutineContext {
            routine: self,
            processor_id,
        };
        Some(body.step(&ctx))
    }

    /// RUNNING → READY.
    pub(crate) fn yield_ready(&self) -> bool {
        self.transition(RoutineState::Running, RoutineState::Ready)
    }

    /// RUNNING → FINISHED.
    pub(crate) fn finish(&self) -> bool {
        self.transition(RoutineState::Running, RoutineState::Finished)
    }

    /// RUNNING → DATA_WAIT, then pick up a notify that arrived during the step.
    pub(crate) fn park(&self) -> Park {
        if !self.transition(RoutineState::Running, RoutineState::DataWait) {
            return Park::Stopped;
        }
        if self.update_flag.swap(false, Ordering::SeqCst)
            && self.transition(RoutineState::DataWait, RoutineState::Ready)
        {
            return Park::Woken;
        }
        Park::Parked
    }

    /// Record new data. Returns true if this call moved the routine
    /// DATA_WAIT → READY, in which case the caller must enqueue it.
    pub(crate) fn wake(&self) -> bool {
        self.update_flag.store(true, Ordering::SeqCst);
        if self.transition(RoutineState::DataWait, RoutineState::Ready) {
            // Cleared before the routine can be queued, so no stale flag survives.
            self.update_flag.store(false, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Force the terminal STOPPED state from any state.
    pub(crate) fn stop(&self) {
        self.state.store(RoutineState::Stopped as u8, Ordering::SeqCst);
    }

    /// Drop the body unless a processor is running it right now.
    pub(crate) fn release(&self) -> bool {
        match self.body.try_lock() {
            Some(mut body) => {
                body.take();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority())
            .field("state", &self.state())
            .field("processor_id", &self.processor_id())
            .finish()
    }
}

/// Point-in-time snapshot of a routine for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutineInfo {
    pub id: u64,
    pub name: String,
    pub priority: u32,
    pub state: RoutineState,
    pub processor_id: Option<usize>,
}
