//! sched-demo: runs a handful of routines on the scheduler and prints metrics.
//!
//! Routines:
//! - `heartbeat`: woken by a ticker thread every `--tick-ms`
//! - `sensor-fusion`: drains samples pushed by a producer thread via notify
//! - `warmup`: a finite routine that yields a few times and finishes
//!
//! After `--duration-secs` the long-lived routines are removed by name, the
//! scheduler is stopped, and the metrics snapshot is printed as JSON.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, warn};

use rtsched_core::config::load_dotenv;
use rtsched_core::{hash_name, process_group, SchedulerConf};
use rtsched_scheduler::{
    JsonLinesSink, LogSink, NoopPolicy, OsThreadPolicy, Routine, RoutineContext, RoutineStatus,
    Scheduler, ThreadPolicy, TraceSink,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Demo driver for the routine scheduler.
#[derive(Parser, Debug)]
#[command(name = "sched-demo", version, about)]
struct Cli {
    /// Scheduler config file. Defaults to `conf/<process group>.toml` under the work root.
    #[arg(long, env = "RTSCHED_CONFIG")]
    config: Option<PathBuf>,

    /// Process group whose config is loaded when `--config` is absent.
    #[arg(long, env = "RTSCHED_PROCESS_GROUP")]
    process_group: Option<String>,

    /// How long to run before shutting down.
    #[arg(long, env = "SCHED_DEMO_DURATION_SECS", default_value_t = 3)]
    duration_secs: u64,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Append trace events as JSON lines to this file.
    #[arg(long)]
    trace_file: Option<PathBuf>,

    /// Skip CPU pinning and OS scheduling policy.
    #[arg(long)]
    no_pin: bool,
}

fn load_conf(cli: &Cli) -> SchedulerConf {
    if let Some(path) = &cli.config {
        return match SchedulerConf::from_file(path) {
            Ok(conf) => {
                info!(path = %path.display(), "loaded scheduler config");
                conf
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load config, using defaults");
                SchedulerConf::default()
            }
        };
    }
    let group = cli.process_group.clone().unwrap_or_else(process_group);
    info!(process_group = %group, "resolving scheduler config");
    SchedulerConf::for_process_group(&group)
}

// ── Routines ────────────────────────────────────────────────────────

fn heartbeat(beats: Arc<AtomicU64>) -> Routine {
    Routine::new("heartbeat", move |ctx: &RoutineContext<'_>| {
        if ctx.is_stopped() {
            return RoutineStatus::Done;
        }
        let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 10 == 0 {
            info!(beats = n, processor = ctx.processor_id(), "heartbeat");
        }
        RoutineStatus::Blocked
    })
    .with_priority(1)
}

fn sensor_fusion(samples: Arc<Mutex<VecDeque<f64>>>, fused: Arc<AtomicU64>) -> Routine {
    Routine::new("sensor-fusion", move |ctx: &RoutineContext<'_>| {
        let batch: Vec<f64> = samples.lock().drain(..).collect();
        if !batch.is_empty() {
            let mean = batch.iter().sum::<f64>() / batch.len() as f64;
            fused.fetch_add(batch.len() as u64, Ordering::Relaxed);
            tracing::debug!(samples = batch.len(), mean, processor = ctx.processor_id(), "fused batch");
        }
        RoutineStatus::Blocked
    })
    .with_priority(5)
}

fn warmup(steps: u32) -> Routine {
    let mut left = steps;
    Routine::new("warmup", move |_: &RoutineContext<'_>| {
        left = left.saturating_sub(1);
        if left == 0 {
            info!("warmup finished");
            RoutineStatus::Done
        } else {
            RoutineStatus::Ready
        }
    })
    .with_priority(12)
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let conf = load_conf(&cli);

    let trace: Arc<dyn TraceSink> = match &cli.trace_file {
        Some(path) => Arc::new(JsonLinesSink::create(path)?),
        None => Arc::new(LogSink),
    };
    let policy: Arc<dyn ThreadPolicy> = if cli.no_pin {
        Arc::new(NoopPolicy)
    } else {
        Arc::new(OsThreadPolicy)
    };

    let scheduler = Arc::new(
        Scheduler::builder(conf)
            .trace_sink(trace)
            .thread_policy(policy)
            .build(),
    );
    if !scheduler.start() {
        anyhow::bail!("scheduler failed to start");
    }

    let beats = Arc::new(AtomicU64::new(0));
    let fused = Arc::new(AtomicU64::new(0));
    let samples = Arc::new(Mutex::new(VecDeque::new()));

    scheduler.submit(heartbeat(Arc::clone(&beats)));
    scheduler.submit(sensor_fusion(Arc::clone(&samples), Arc::clone(&fused)));
    scheduler.submit(warmup(5));

    let running = Arc::new(AtomicBool::new(true));

    let ticker = {
        let scheduler = Arc::clone(&scheduler);
        let running = Arc::clone(&running);
        let tick = Duration::from_millis(cli.tick_ms.max(1));
        let id = hash_name("heartbeat");
        thread::Builder::new().name("ticker".into()).spawn(move || {
            while running.load(Ordering::Relaxed) {
                thread::sleep(tick);
                if !scheduler.notify(id) {
                    break;
                }
            }
        })?
    };

    let producer = {
        let scheduler = Arc::clone(&scheduler);
        let running = Arc::clone(&running);
        let samples = Arc::clone(&samples);
        let id = hash_name("sensor-fusion");
        thread::Builder::new().name("producer".into()).spawn(move || {
            let mut t = 0u64;
            while running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(7));
                t += 1;
                samples.lock().push_back((t as f64 * 0.1).sin());
                if !scheduler.notify(id) {
                    break;
                }
            }
        })?
    };

    info!(secs = cli.duration_secs, "running");
    thread::sleep(Duration::from_secs(cli.duration_secs));

    running.store(false, Ordering::Relaxed);
    let before_removal = scheduler.metrics();
    for (routine, steps) in &before_removal.steps_executed {
        info!(routine = %routine, steps, "routine steps");
    }
    for name in ["heartbeat", "sensor-fusion"] {
        if !scheduler.remove_by_name(name) {
            warn!(routine = name, "routine was not registered");
        }
    }
    if ticker.join().is_err() || producer.join().is_err() {
        warn!("a feeder thread panicked");
    }

    scheduler.stop();
    info!(
        beats = beats.load(Ordering::Relaxed),
        fused = fused.load(Ordering::Relaxed),
        "demo finished"
    );

    println!("{}", serde_json::to_string_pretty(&scheduler.metrics())?);
    Ok(())
}
