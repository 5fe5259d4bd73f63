use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CoreError;

/// Env var pointing at the directory that holds `conf/`.
pub const WORK_ROOT_ENV: &str = "RTSCHED_WORK_ROOT";

/// Largest processor pool a config may ask for.
const MAX_PROCESSORS: u32 = 1024;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Root directory for config lookups (`RTSCHED_WORK_ROOT`, default `.`).
pub fn work_root() -> PathBuf {
    env::var(WORK_ROOT_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Config file path for a process group: `<work_root>/conf/<group>.toml`.
pub fn conf_path(work_root: &Path, process_group: &str) -> PathBuf {
    work_root.join("conf").join(format!("{process_group}.toml"))
}

// ── Enums ───────────────────────────────────────────────────────────

/// How processors are pinned onto the configured CPU set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AffinityMode {
    /// Every processor may run on any CPU of the set.
    #[default]
    #[serde(rename = "range")]
    Range,
    /// Processor `i` is pinned to the `i`-th CPU of the set.
    #[serde(rename = "1to1")]
    OneToOne,
}

impl FromStr for AffinityMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "range" => Ok(Self::Range),
            "1to1" => Ok(Self::OneToOne),
            other => Err(CoreError::Config(format!(
                "invalid affinity '{other}', expected 'range' or '1to1'"
            ))),
        }
    }
}

impl fmt::Display for AffinityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Range => f.write_str("range"),
            Self::OneToOne => f.write_str("1to1"),
        }
    }
}

/// OS scheduling policy applied to processor threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedPolicy {
    #[default]
    #[serde(rename = "SCHED_OTHER")]
    Other,
    #[serde(rename = "SCHED_FIFO")]
    Fifo,
    #[serde(rename = "SCHED_RR")]
    RoundRobin,
}

impl SchedPolicy {
    /// Valid OS priority range for this policy (nice values for `SCHED_OTHER`).
    pub fn priority_range(self) -> (i32, i32) {
        match self {
            Self::Other => (-20, 19),
            Self::Fifo | Self::RoundRobin => (1, 99),
        }
    }

    pub fn is_realtime(self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl FromStr for SchedPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "SCHED_OTHER" => Ok(Self::Other),
            "SCHED_FIFO" => Ok(Self::Fifo),
            "SCHED_RR" => Ok(Self::RoundRobin),
            other => Err(CoreError::Config(format!(
                "invalid processor policy '{other}', expected SCHED_OTHER, SCHED_FIFO or SCHED_RR"
            ))),
        }
    }
}

impl fmt::Display for SchedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other => f.write_str("SCHED_OTHER"),
            Self::Fifo => f.write_str("SCHED_FIFO"),
            Self::RoundRobin => f.write_str("SCHED_RR"),
        }
    }
}

// ── Top-level config ────────────────────────────────────────────────

/// Scheduler configuration for one process group.
///
/// Parsed from `conf/<process_group>.toml`. The first group supplies the
/// processor pool settings; task priority overrides are merged across all
/// groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConf {
    /// Processor count used when no group is configured.
    #[serde(default = "default_proc_num")]
    pub default_proc_num: u32,

    #[serde(default)]
    pub classic: ClassicConf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassicConf {
    #[serde(default)]
    pub groups: Vec<GroupConf>,
}

/// A processor group: pool size, CPU binding and the tasks it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConf {
    #[serde(default = "default_group_name")]
    pub name: String,

    #[serde(default = "default_proc_num")]
    pub processor_num: u32,

    /// CPU list such as `"0-3,6"`. Empty means no pinning.
    #[serde(default)]
    pub cpuset: String,

    #[serde(default)]
    pub affinity: AffinityMode,

    #[serde(default)]
    pub processor_policy: SchedPolicy,

    #[serde(default)]
    pub processor_prio: i32,

    #[serde(default)]
    pub tasks: Vec<TaskConf>,
}

/// Per-routine priority override, matched by routine name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConf {
    pub name: String,
    pub prio: u32,
}

fn default_proc_num() -> u32 {
    2
}

fn default_group_name() -> String {
    "default".into()
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self {
            default_proc_num: default_proc_num(),
            classic: ClassicConf::default(),
        }
    }
}

impl Default for GroupConf {
    fn default() -> Self {
        Self {
            name: default_group_name(),
            processor_num: default_proc_num(),
            cpuset: String::new(),
            affinity: AffinityMode::default(),
            processor_policy: SchedPolicy::default(),
            processor_prio: 0,
            tasks: Vec::new(),
        }
    }
}

/// Processor pool settings resolved from the first group (or defaults).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorSettings {
    pub processor_num: u32,
    pub cpus: Vec<usize>,
    pub affinity: AffinityMode,
    pub policy: SchedPolicy,
    pub os_priority: i32,
}

// ── Loading & Validation ────────────────────────────────────────────

impl SchedulerConf {
    /// Parse config from a TOML string, apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut conf: Self = toml::from_str(toml_str)?;
        conf.apply_overrides(|key| env::var(key).ok());
        conf.validate()?;
        Ok(conf)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Load from `path`, falling back to defaults when the file is missing or broken.
    pub fn resolve(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no scheduler config, using defaults");
            return Self::defaults_with_overrides(|key| env::var(key).ok());
        }
        match Self::from_file(path) {
            Ok(conf) => {
                info!(path = %path.display(), "loaded scheduler config");
                conf
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to load scheduler config, using defaults"
                );
                Self::defaults_with_overrides(|key| env::var(key).ok())
            }
        }
    }

    /// Defaults with overrides from `lookup` applied. Overrides that fail
    /// validation are dropped as a whole.
    pub fn defaults_with_overrides(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut conf = Self::default();
        conf.apply_overrides(lookup);
        match conf.validate() {
            Ok(()) => conf,
            Err(e) => {
                warn!(error = %e, "ignoring invalid overrides");
                Self::default()
            }
        }
    }

    /// Resolve the config of `process_group` under the work root.
    pub fn for_process_group(process_group: &str) -> Self {
        Self::resolve(conf_path(&work_root(), process_group))
    }

    /// Apply overrides from `lookup` (normally the process environment).
    ///
    /// - `RTSCHED_PROC_NUM` → first group's `processor_num` (or `default_proc_num`)
    /// - `RTSCHED_CPUSET` → first group's `cpuset`
    /// - `RTSCHED_AFFINITY` → first group's `affinity`
    /// - `RTSCHED_PROCESSOR_POLICY` → first group's `processor_policy`
    /// - `RTSCHED_PROCESSOR_PRIO` → first group's `processor_prio`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(n) = lookup("RTSCHED_PROC_NUM").and_then(|v| v.parse::<u32>().ok()) {
            match self.classic.groups.first_mut() {
                Some(group) => group.processor_num = n,
                None => self.default_proc_num = n,
            }
        }

        let Some(group) = self.classic.groups.first_mut() else {
            return;
        };
        if let Some(v) = lookup("RTSCHED_CPUSET") {
            group.cpuset = v;
        }
        if let Some(v) = lookup("RTSCHED_AFFINITY") {
            match v.parse() {
                Ok(mode) => group.affinity = mode,
                Err(e) => warn!(error = %e, "ignoring RTSCHED_AFFINITY"),
            }
        }
        if let Some(v) = lookup("RTSCHED_PROCESSOR_POLICY") {
            match v.parse() {
                Ok(policy) => group.processor_policy = policy,
                Err(e) => warn!(error = %e, "ignoring RTSCHED_PROCESSOR_POLICY"),
            }
        }
        if let Some(prio) = lookup("RTSCHED_PROCESSOR_PRIO").and_then(|v| v.parse::<i32>().ok()) {
            group.processor_prio = prio;
        }
    }

    /// Validate processor counts and OS priorities.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_proc_num("default_proc_num", self.default_proc_num)?;
        for group in &self.classic.groups {
            validate_proc_num(&format!("group '{}' processor_num", group.name), group.processor_num)?;
            let (lo, hi) = group.processor_policy.priority_range();
            if group.processor_prio < lo || group.processor_prio > hi {
                return Err(CoreError::Config(format!(
                    "group '{}': processor_prio {} out of range [{lo}, {hi}] for {}",
                    group.name, group.processor_prio, group.processor_policy
                )));
            }
        }
        Ok(())
    }

    // ── Resolved views ──────────────────────────────────────────────

    /// Processor pool settings: the first group, or `default_proc_num` unpinned.
    pub fn processor_settings(&self) -> ProcessorSettings {
        match self.classic.groups.first() {
            Some(group) => ProcessorSettings {
                processor_num: group.processor_num,
                cpus: parse_cpuset(&group.cpuset),
                affinity: group.affinity,
                policy: group.processor_policy,
                os_priority: group.processor_prio,
            },
            None => ProcessorSettings {
                processor_num: self.default_proc_num,
                cpus: Vec::new(),
                affinity: AffinityMode::default(),
                policy: SchedPolicy::default(),
                os_priority: 0,
            },
        }
    }

    /// Routine name → priority overrides merged across all groups (later groups win).
    pub fn task_priorities(&self) -> HashMap<String, u32> {
        self.classic
            .groups
            .iter()
            .flat_map(|g| g.tasks.iter())
            .map(|t| (t.name.clone(), t.prio))
            .collect()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let settings = self.processor_settings();
        info!("Scheduler config:");
        info!("  processors:  {}", settings.processor_num);
        info!("  cpuset:      {:?} ({})", settings.cpus, settings.affinity);
        info!("  policy:      {} prio={}", settings.policy, settings.os_priority);
        info!("  overrides:   {} tasks", self.task_priorities().len());
    }
}

fn validate_proc_num(what: &str, n: u32) -> Result<(), CoreError> {
    if n == 0 || n > MAX_PROCESSORS {
        return Err(CoreError::Config(format!(
            "{what} must be in [1, {MAX_PROCESSORS}], got {n}"
        )));
    }
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse a CPU list like `"0-3,6,8-9"` into sorted, de-duplicated CPU indices.
///
/// Malformed fragments are skipped with a warning.
pub fn parse_cpuset(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parsed = match part.split_once('-') {
            Some((lo, hi)) => match (lo.trim().parse::<usize>(), hi.trim().parse::<usize>()) {
                (Ok(lo), Ok(hi)) if lo <= hi => Some(lo..=hi),
                _ => None,
            },
            None => part.parse::<usize>().ok().map(|cpu| cpu..=cpu),
        };
        match parsed {
            Some(range) => cpus.extend(range),
            None => warn!(fragment = part, "skipping malformed cpuset fragment"),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    cpus
}
