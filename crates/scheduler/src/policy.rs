//! Binding processor threads to CPUs and OS scheduling policies.
//!
//! The scheduler only decides *what* each processor should be bound to
//! ([`ProcessorBinding`]); applying it goes through a [`ThreadPolicy`] so the
//! OS calls stay behind one seam. A failed application is logged by the
//! processor and never stops it.

use rtsched_core::{AffinityMode, ProcessorSettings, SchedPolicy};
use serde::Serialize;
use tracing::debug;

use crate::error::SchedError;

/// What a single processor thread should be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorBinding {
    pub processor_id: usize,
    /// Allowed CPUs; empty means leave the inherited mask alone.
    pub cpus: Vec<usize>,
    pub policy: SchedPolicy,
    pub os_priority: i32,
}

impl ProcessorBinding {
    /// Binding for processor `index` under `settings`.
    ///
    /// `range` gives every processor the whole CPU set; `1to1` pins processor
    /// `i` to the `i`-th CPU and leaves processors beyond the set unpinned.
    pub fn for_processor(settings: &ProcessorSettings, index: usize) -> Self {
        let cpus = match settings.affinity {
            AffinityMode::Range => settings.cpus.clone(),
            AffinityMode::OneToOne => settings.cpus.get(index).map(|&c| vec![c]).unwrap_or_default(),
        };
        Self {
            processor_id: index,
            cpus,
            policy: settings.policy,
            os_priority: settings.os_priority,
        }
    }
}

/// Applies a binding to the calling thread.
pub trait ThreadPolicy: Send + Sync {
    fn apply(&self, binding: &ProcessorBinding) -> Result<(), SchedError>;
}

/// Leaves threads as the OS created them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPolicy;

impl ThreadPolicy for NoopPolicy {
    fn apply(&self, binding: &ProcessorBinding) -> Result<(), SchedError> {
        debug!(processor = binding.processor_id, "thread policy disabled");
        Ok(())
    }
}

/// Applies affinity and scheduling policy through the host OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreadPolicy;

impl ThreadPolicy for OsThreadPolicy {
    fn apply(&self, binding: &ProcessorBinding) -> Result<(), SchedError> {
        os::set_affinity(&binding.cpus)?;
        os::set_sched_policy(binding.policy, binding.os_priority)?;
        debug!(
            processor = binding.processor_id,
            cpus = ?binding.cpus,
            policy = %binding.policy,
            prio = binding.os_priority,
            "thread policy applied"
        );
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod os {
    use std::io;
    use std::mem;

    use rtsched_core::SchedPolicy;

    use crate::error::SchedError;

    fn last_error(call: &str) -> SchedError {
        SchedError::Policy(format!("{call}: {}", io::Error::last_os_error()))
    }

    pub(super) fn set_affinity(cpus: &[usize]) -> Result<(), SchedError> {
        if cpus.is_empty() {
            return Ok(());
        }
        let max = libc::CPU_SETSIZE as usize;
        if let Some(&cpu) = cpus.iter().find(|&&c| c >= max) {
            return Err(SchedError::Policy(format!("cpu {cpu} exceeds CPU_SETSIZE {max}")));
        }
        // SAFETY: cpu_set_t is plain data; every index was checked against CPU_SETSIZE
        // and pid 0 targets the calling thread.
        let rc = unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut set);
            for &cpu in cpus {
                libc::CPU_SET(cpu, &mut set);
            }
            libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(last_error("sched_setaffinity"));
        }
        Ok(())
    }

    pub(super) fn set_sched_policy(policy: SchedPolicy, prio: i32) -> Result<(), SchedError> {
        match policy {
            SchedPolicy::Other => {
                // SAFETY: plain syscalls on the calling thread's own tid.
                let rc = unsafe {
                    let tid = libc::syscall(libc::SYS_gettid) as libc::id_t;
                    libc::setpriority(libc::PRIO_PROCESS, tid, prio)
                };
                if rc != 0 {
                    return Err(last_error("setpriority"));
                }
            }
            SchedPolicy::Fifo | SchedPolicy::RoundRobin => {
                let native = if policy == SchedPolicy::Fifo {
                    libc::SCHED_FIFO
                } else {
                    libc::SCHED_RR
                };
                let param = libc::sched_param {
                    sched_priority: prio,
                };
                // SAFETY: `param` outlives the call; pid 0 targets the calling thread.
                let rc = unsafe { libc::sched_setscheduler(0, native, &param) };
                if rc != 0 {
                    return Err(last_error("sched_setscheduler"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod os {
    use rtsched_core::SchedPolicy;
    use tracing::warn;

    use crate::error::SchedError;

    pub(super) fn set_affinity(cpus: &[usize]) -> Result<(), SchedError> {
        if !cpus.is_empty() {
            warn!("cpu affinity is not supported on this platform");
        }
        Ok(())
    }

    pub(super) fn set_sched_policy(policy: SchedPolicy, _prio: i32) -> Result<(), SchedError> {
        if policy.is_realtime() {
            warn!(%policy, "realtime scheduling policy is not supported on this platform");
        }
        Ok(())
    }
}
