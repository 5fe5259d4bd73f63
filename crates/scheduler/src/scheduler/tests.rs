use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rtsched_core::{hash_name, GroupConf, IdentityTable, SchedulerConf, TaskConf};

use super::Scheduler;
use crate::policy::NoopPolicy;
use crate::routine::{Routine, RoutineContext, RoutineState, RoutineStatus, DEFAULT_PRIO, MAX_PRIO};
use crate::trace::{RingSink, SchedEventKind};

fn one_processor() -> SchedulerConf {
    SchedulerConf {
        default_proc_num: 1,
        ..SchedulerConf::default()
    }
}

/// Scheduler with a ring trace and no OS binding, processors not started.
fn scheduler_with(conf: SchedulerConf) -> (Scheduler, Arc<RingSink>) {
    let ring = Arc::new(RingSink::new(256));
    let scheduler = Scheduler::builder(conf)
        .trace_sink(ring.clone())
        .thread_policy(Arc::new(NoopPolicy))
        .stripes(16)
        .build();
    (scheduler, ring)
}

fn idle_scheduler() -> (Scheduler, Arc<RingSink>) {
    scheduler_with(one_processor())
}

fn returning(name: &str, status: RoutineStatus) -> Routine {
    Routine::new(name, move |_: &RoutineContext<'_>| status)
}

/// Blocks on every step and counts how often it ran.
fn counting_waiter(name: &str) -> (Routine, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let routine = Routine::new(name, move |_: &RoutineContext<'_>| {
        counter.fetch_add(1, Ordering::SeqCst);
        RoutineStatus::Blocked
    });
    (routine, runs)
}

#[test]
fn submit_registers_and_queues() {
    let (s, ring) = idle_scheduler();
    assert!(s.submit(returning("lidar", RoutineStatus::Ready).with_priority(5)));

    let id = hash_name("lidar");
    let info = s.routine(id).unwrap();
    assert_eq!(info.priority, 5);
    assert_eq!(info.state, RoutineState::Ready);
    assert_eq!(s.queued_priority(id), Some(5));
    assert_eq!(s.registered_count(), 1);
    assert_eq!(ring.count(SchedEventKind::Created), 1);
    assert_eq!(s.metrics().submitted, 1);
}

#[test]
fn default_priority_applies() {
    let (s, _) = idle_scheduler();
    s.submit(returning("plain", RoutineStatus::Ready));
    assert_eq!(s.routine(hash_name("plain")).unwrap().priority, DEFAULT_PRIO);
}

#[test]
fn duplicate_submit_keeps_first_registration() {
    let (s, ring) = idle_scheduler();
    assert!(s.submit(returning("A", RoutineStatus::Ready).with_priority(5)));
    assert!(!s.submit(returning("A", RoutineStatus::Done).with_priority(1)));

    let info = s.routine(hash_name("A")).unwrap();
    assert_eq!(info.priority, 5);
    assert_eq!(info.state, RoutineState::Ready);
    assert_eq!(s.registered_count(), 1);
    assert_eq!(s.ready_len(5), 1);
    assert_eq!(s.ready_len(1), 0);
    assert_eq!(ring.count(SchedEventKind::Created), 1);
    assert_eq!(s.metrics().rejected_submits, 1);
}

#[test]
fn out_of_range_priority_is_clamped() {
    let (s, _) = idle_scheduler();
    assert!(s.submit(returning("B", RoutineStatus::Ready).with_priority(MAX_PRIO)));
    assert!(s.submit(returning("C", RoutineStatus::Ready).with_priority(u32::MAX)));

    assert_eq!(s.routine(hash_name("B")).unwrap().priority, MAX_PRIO - 1);
    assert_eq!(s.routine(hash_name("C")).unwrap().priority, MAX_PRIO - 1);
    assert_eq!(s.ready_len(MAX_PRIO - 1), 2);
    assert_eq!(s.metrics().clamped_priorities, 2);
}

#[test]
fn config_override_wins_over_requested() {
    let conf = SchedulerConf {
        classic: rtsched_core::ClassicConf {
            groups: vec![GroupConf {
                processor_num: 1,
                tasks: vec![
                    TaskConf { name: "planning".into(), prio: 2 },
                    TaskConf { name: "greedy".into(), prio: 99 },
                ],
                ..GroupConf::default()
            }],
        },
        ..SchedulerConf::default()
    };
    let (s, _) = scheduler_with(conf);

    s.submit(returning("planning", RoutineStatus::Ready).with_priority(15));
    s.submit(returning("greedy", RoutineStatus::Ready).with_priority(1));
    s.submit(returning("other", RoutineStatus::Ready).with_priority(7));

    assert_eq!(s.routine(hash_name("planning")).unwrap().priority, 2);
    // Overrides are clamped like any other priority.
    assert_eq!(s.routine(hash_name("greedy")).unwrap().priority, MAX_PRIO - 1);
    assert_eq!(s.routine(hash_name("other")).unwrap().priority, 7);
}

#[test]
fn id_collision_is_rejected() {
    let identities = Arc::new(IdentityTable::new());
    identities.claim(hash_name("camera"), "impostor").unwrap();
    let s = Scheduler::builder(one_processor())
        .thread_policy(Arc::new(NoopPolicy))
        .identities(identities)
        .build();

    assert!(!s.submit(returning("camera", RoutineStatus::Ready)));
    assert_eq!(s.registered_count(), 0);
    assert_eq!(s.metrics().rejected_submits, 1);
    assert_eq!(s.identities().name_of(hash_name("camera")).as_deref(), Some("impostor"));
}

#[test]
fn deregistration_releases_name_claims() {
    let (s, _) = idle_scheduler();
    s.submit(returning("removed", RoutineStatus::Ready).with_priority(5));
    s.submit(returning("finished", RoutineStatus::Done).with_priority(0));
    let (waiter, _) = counting_waiter("drained");
    s.submit(waiter.with_priority(9));
    assert_eq!(s.identities().len(), 3);

    assert!(s.remove_by_name("removed"));
    assert_eq!(s.identities().len(), 2);

    assert!(s.run_once(0));
    assert!(!s.is_registered(hash_name("finished")));
    assert_eq!(s.identities().len(), 1);

    s.stop();
    assert!(s.identities().is_empty());
}

#[test]
fn duplicate_submit_keeps_name_claim() {
    let (s, _) = idle_scheduler();
    assert!(s.submit(returning("twice", RoutineStatus::Ready)));
    assert!(!s.submit(returning("twice", RoutineStatus::Ready)));
    assert_eq!(s.identities().name_of(hash_name("twice")).as_deref(), Some("twice"));
}

#[test]
fn strict_priority_then_fifo() {
    let (s, _) = idle_scheduler();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for (name, prio) in [("low", 9), ("high-1", 1), ("mid", 4), ("high-2", 1)] {
        let order = Arc::clone(&order);
        s.submit(
            Routine::new(name, move |ctx: &RoutineContext<'_>| {
                order.lock().push(ctx.name().to_string());
                RoutineStatus::Done
            })
            .with_priority(prio),
        );
    }

    assert_eq!(s.run_until_idle(0), 4);
    assert_eq!(*order.lock(), vec!["high-1", "high-2", "mid", "low"]);
    assert_eq!(s.registered_count(), 0);
}

#[test]
fn ready_routines_round_robin_within_level() {
    let (s, _) = idle_scheduler();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for name in ["a", "b"] {
        let order = Arc::clone(&order);
        let mut left = 2;
        s.submit(
            Routine::new(name, move |ctx: &RoutineContext<'_>| {
                order.lock().push(ctx.name().to_string());
                left -= 1;
                if left == 0 {
                    RoutineStatus::Done
                } else {
                    RoutineStatus::Ready
                }
            })
            .with_priority(3),
        );
    }

    s.run_until_idle(0);
    assert_eq!(*order.lock(), vec!["a", "b", "a", "b"]);
}

#[test]
fn notify_requeues_waiting_routine() {
    let (s, ring) = idle_scheduler();
    let (routine, runs) = counting_waiter("sensor");
    s.submit(routine.with_priority(6));
    let id = hash_name("sensor");

    assert!(s.run_once(0));
    assert_eq!(s.routine(id).unwrap().state, RoutineState::DataWait);
    assert_eq!(s.queued_priority(id), None);
    assert!(!s.run_once(0), "waiting routine must not be scheduled");

    assert!(s.notify(id));
    assert_eq!(s.routine(id).unwrap().state, RoutineState::Ready);
    assert_eq!(s.queued_priority(id), Some(6));

    assert!(s.run_once(0));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(ring.count(SchedEventKind::NotifyIn), 1);
    let m = s.metrics();
    assert_eq!(m.notifies, 1);
    assert_eq!(m.wakeups, 1);
}

#[test]
fn notify_while_ready_does_not_double_queue() {
    let (s, _) = idle_scheduler();
    let (routine, runs) = counting_waiter("twice");
    s.submit(routine);
    let id = hash_name("twice");

    assert!(s.notify(id));
    assert!(s.notify(id));
    assert_eq!(s.ready_len(DEFAULT_PRIO), 1);

    s.run_until_idle(0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(s.metrics().wakeups, 0);
}

#[test]
fn notify_during_step_is_not_lost() {
    let (s, _) = idle_scheduler();
    let s = Arc::new(s);
    let id = hash_name("racy");
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let handle = Arc::downgrade(&s);
    s.submit(Routine::new("racy", move |_: &RoutineContext<'_>| {
        // Data arrives while the step is still running.
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            if let Some(s) = handle.upgrade() {
                assert!(s.notify(id));
            }
        }
        RoutineStatus::Blocked
    }));

    s.run_until_idle(0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(s.routine(id).unwrap().state, RoutineState::DataWait);
}

#[test]
fn notify_unknown_is_false() {
    let (s, _) = idle_scheduler();
    assert!(!s.notify(42));
    assert_eq!(s.metrics().notifies, 0);
}

#[test]
fn remove_unknown_is_false() {
    let (s, _) = idle_scheduler();
    s.submit(returning("keep", RoutineStatus::Ready));
    assert!(!s.remove_by_id(0xdead_beef));
    assert!(!s.remove_by_name("missing"));
    assert_eq!(s.registered_count(), 1);
}

#[test]
fn removed_routine_is_unreachable() {
    let (s, ring) = idle_scheduler();
    s.submit(returning("gone", RoutineStatus::Ready).with_priority(3));
    let id = hash_name("gone");

    assert!(s.remove_by_id(id));
    assert!(!s.notify(id));
    assert!(!s.remove_by_id(id));
    assert_eq!(s.ready_len(3), 0);
    assert!(!s.run_once(0));
    assert_eq!(ring.count(SchedEventKind::Removed), 1);
    assert_eq!(s.metrics().removals, 1);
}

#[test]
fn remove_by_name_hits_waiting_routine() {
    let (s, _) = idle_scheduler();
    let (routine, _) = counting_waiter("parked");
    s.submit(routine);
    s.run_once(0);

    assert!(s.remove_by_name("parked"));
    assert!(!s.is_registered(hash_name("parked")));
}

#[test]
fn resubmit_after_remove() {
    let (s, _) = idle_scheduler();
    s.submit(returning("again", RoutineStatus::Ready).with_priority(2));
    assert!(s.remove_by_name("again"));
    assert!(s.submit(returning("again", RoutineStatus::Ready).with_priority(8)));
    assert_eq!(s.routine(hash_name("again")).unwrap().priority, 8);
    assert_eq!(s.queued_priority(hash_name("again")), Some(8));
}

#[test]
fn removed_while_running_is_released_after_step() {
    let (s, _) = idle_scheduler();
    let s = Arc::new(s);
    let handle = Arc::downgrade(&s);
    s.submit(Routine::new("self-remove", move |ctx: &RoutineContext<'_>| {
        if let Some(s) = handle.upgrade() {
            assert!(s.remove_by_id(ctx.id()));
        }
        assert!(ctx.is_stopped());
        RoutineStatus::Ready
    }));

    assert!(s.run_once(0));
    assert_eq!(s.registered_count(), 0);
    assert!(s.state.queues.is_empty());

    let m = s.metrics();
    assert_eq!(m.total_steps(), 1);
    assert!(!m.steps_executed.contains_key("self-remove"));
}

#[test]
fn deregistration_prunes_per_routine_metrics() {
    let (s, _) = idle_scheduler();
    let (waiter, _) = counting_waiter("short-lived");
    s.submit(waiter.with_priority(1));
    s.submit(returning("one-shot", RoutineStatus::Done).with_priority(2));
    let (keeper, _) = counting_waiter("keeper");
    s.submit(keeper.with_priority(3));
    s.run_until_idle(0);

    let before = s.metrics();
    assert_eq!(before.steps_executed.get("short-lived"), Some(&1));
    assert!(!before.steps_executed.contains_key("one-shot"));
    assert_eq!(before.total_steps(), 3);

    assert!(s.remove_by_name("short-lived"));
    let after = s.metrics();
    assert!(!after.steps_executed.contains_key("short-lived"));
    assert!(!after.avg_step_duration.contains_key("short-lived"));
    assert!(!after.last_run.contains_key("short-lived"));
    assert_eq!(after.steps_executed.get("keeper"), Some(&1));
    assert_eq!(after.total_steps(), 3);
}

#[test]
fn finished_routine_traces_lifecycle() {
    let (s, ring) = idle_scheduler();
    s.submit(returning("once", RoutineStatus::Done));
    s.run_until_idle(0);

    let kinds: Vec<_> = ring.events().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SchedEventKind::Created,
            SchedEventKind::SwapIn,
            SchedEventKind::SwapOut,
            SchedEventKind::Finished,
        ]
    );
    assert_eq!(s.metrics().finished, 1);
}

#[test]
fn stop_rejects_submit_and_short_circuits_notify() {
    let (s, _) = idle_scheduler();
    let (routine, _) = counting_waiter("w");
    s.submit(routine);
    s.stop();

    assert!(s.is_stopping());
    assert!(!s.submit(returning("late", RoutineStatus::Ready)));
    assert!(s.notify(hash_name("w")));
    assert!(s.notify(12345));
    assert_eq!(s.registered_count(), 0);
    assert!(!s.remove_by_name("w"));
}

#[test]
fn stop_is_idempotent() {
    let (s, _) = idle_scheduler();
    s.submit(returning("x", RoutineStatus::Ready));
    s.stop();
    s.stop();
    assert!(!s.start(), "a stopped scheduler cannot restart");
    assert!(!s.is_running());
}

#[test]
fn priorities_stay_in_range() {
    let (s, _) = idle_scheduler();
    for (i, prio) in [0, 1, MAX_PRIO - 1, MAX_PRIO, MAX_PRIO + 1, 1000].into_iter().enumerate() {
        s.submit(returning(&format!("r{i}"), RoutineStatus::Ready).with_priority(prio));
    }
    for routine in s.state.registry.routines() {
        assert!(routine.priority() < MAX_PRIO);
    }
}

#[test]
fn metrics_snapshot_reports_gauges() {
    let (s, _) = idle_scheduler();
    s.submit(returning("g1", RoutineStatus::Ready).with_priority(0));
    s.submit(returning("g2", RoutineStatus::Ready).with_priority(0));
    let m = s.metrics();
    assert_eq!(m.registered, 2);
    assert_eq!(m.ready_depth.len(), MAX_PRIO as usize);
    assert_eq!(m.ready_depth[0], 2);
    assert_eq!(m.processor_utilization, 0.0);
}
