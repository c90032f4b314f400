pub mod attribution;
pub mod collectors;
pub mod config;
pub mod csv_sink;
pub mod error;
pub mod lifecycle;
pub mod mechanism;
pub mod process;
pub mod prometheus;
pub mod query;
pub mod schedule;
pub mod timing;

#[cfg(test)]
mod testing;

pub use config::{CollectionConfig, ConfigOverrides};
pub use error::{CollectError, Result};
pub use mechanism::{parse_mechanism_list, Mechanism};
pub use process::{CommandRunner, SystemCommandRunner};
pub use prometheus::{MetricsBackend, PrometheusClient};

use chrono::{DateTime, Utc};
use collectors::{MaxRssRunner, PerfRunner, TimingRunner};
use csv_sink::{field_names, write_rows, MissingMetricPolicy};
use lifecycle::Lifecycle;
use query::{CPU_FIELD_NAMES, MAX_RSS_FIELD_NAME, MEMORY_FIELD_NAMES};
use rand::Rng;
use schedule::{build_schedule, RetryPolicy, ScheduleOutcome, Scheduler};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use timing::WALL_TIME_FIELD_NAME;
use tracing::{info, warn};

/// One kind of measurement, written to its own results file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollectionKind {
    Perf,
    Time,
    MaxRss,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 3] = [
        CollectionKind::Perf,
        CollectionKind::Time,
        CollectionKind::MaxRss,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CollectionKind::Perf => "perf",
            CollectionKind::Time => "time",
            CollectionKind::MaxRss => "max-rss",
        }
    }

    pub fn results_filename(self) -> &'static str {
        match self {
            CollectionKind::Perf => "perf_results.csv",
            CollectionKind::Time => "time_results.csv",
            CollectionKind::MaxRss => "max_rss_results.csv",
        }
    }

    /// Peak-RSS trials share the timing retry budget.
    pub fn retry_policy(self, config: &CollectionConfig) -> RetryPolicy {
        match self {
            CollectionKind::Perf => config.perf_retry,
            CollectionKind::Time | CollectionKind::MaxRss => config.time_retry,
        }
    }

    /// Metric columns, in order.
    pub fn metric_names(self, config: &CollectionConfig) -> Result<Vec<String>> {
        match self {
            CollectionKind::Perf => {
                let mut names = config.resolve_perf_events()?;
                names.extend(MEMORY_FIELD_NAMES.iter().map(|s| s.to_string()));
                names.extend(CPU_FIELD_NAMES.iter().map(|s| s.to_string()));
                Ok(names)
            }
            CollectionKind::Time => Ok(vec![WALL_TIME_FIELD_NAME.to_string()]),
            CollectionKind::MaxRss => Ok(vec![MAX_RSS_FIELD_NAME.to_string()]),
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionKind {
    type Err = CollectError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "perf" => Ok(CollectionKind::Perf),
            "time" => Ok(CollectionKind::Time),
            "max-rss" => Ok(CollectionKind::MaxRss),
            other => Err(CollectError::Config(format!(
                "unknown collection kind '{}' (expected perf, time, or max-rss)",
                other
            ))),
        }
    }
}

pub struct KindReport {
    pub kind: CollectionKind,
    pub path: PathBuf,
    pub rows: usize,
    pub completed: BTreeMap<Mechanism, u32>,
    pub skipped: Vec<Mechanism>,
}

pub struct CollectionReport {
    pub started: DateTime<Utc>,
    pub results: Vec<KindReport>,
}

pub fn run_collection(
    config: &CollectionConfig,
    kinds: &[CollectionKind],
    runner: &dyn CommandRunner,
    backend: &dyn MetricsBackend,
) -> Result<CollectionReport> {
    run_collection_with_rng(config, kinds, runner, backend, &mut rand::thread_rng())
}

/// Runs each kind's schedule in turn and writes one CSV per kind. Leftover
/// contexts are cleared first; the daemons are stopped at the end whether or
/// not the run succeeded.
pub fn run_collection_with_rng<R: Rng + ?Sized>(
    config: &CollectionConfig,
    kinds: &[CollectionKind],
    runner: &dyn CommandRunner,
    backend: &dyn MetricsBackend,
    rng: &mut R,
) -> Result<CollectionReport> {
    config.validate()?;
    if kinds.is_empty() {
        return Err(CollectError::config("no collection kinds requested"));
    }
    let started = Utc::now();
    let mut lifecycle = Lifecycle::new(config, runner, backend)?;
    if let Err(err) = lifecycle.teardown_all() {
        warn!(error = %err, "failed to clear leftovers from a previous run");
    }

    let collected = collect_kinds(config, kinds, &mut lifecycle, started, rng);
    let shutdown = lifecycle.shutdown();
    match (collected, shutdown) {
        (Ok(results), Ok(())) => Ok(CollectionReport { started, results }),
        (Ok(results), Err(err)) => {
            warn!(error = %err, "failed to stop monitoring daemons");
            Ok(CollectionReport { started, results })
        }
        (Err(err), shutdown) => {
            if let Err(stop) = shutdown {
                warn!(error = %stop, "failed to stop monitoring daemons after error");
            }
            Err(err)
        }
    }
}

fn collect_kinds<R: Rng + ?Sized>(
    config: &CollectionConfig,
    kinds: &[CollectionKind],
    lifecycle: &mut Lifecycle<'_>,
    started: DateTime<Utc>,
    rng: &mut R,
) -> Result<Vec<KindReport>> {
    let prefix = config.results_prefix(started);
    let missing = MissingMetricPolicy::new(config.possibly_absent_metrics.iter().cloned());
    let mut reports = Vec::with_capacity(kinds.len());
    for kind in kinds {
        let names = kind.metric_names(config)?;
        let schedule = build_schedule(config.trials, &config.mechanisms, rng);
        info!(kind = %kind, entries = schedule.len(), "collecting");
        let scheduler = Scheduler::new(kind.retry_policy(config), &names, &missing);
        let outcome: ScheduleOutcome = match kind {
            CollectionKind::Perf => scheduler.run(&schedule, &mut PerfRunner::new(lifecycle, config))?,
            CollectionKind::Time => {
                scheduler.run(&schedule, &mut TimingRunner::new(lifecycle, config))?
            }
            CollectionKind::MaxRss => {
                scheduler.run(&schedule, &mut MaxRssRunner::new(lifecycle, config))?
            }
        };
        let path = config
            .results_dir
            .join(format!("{}{}", prefix, kind.results_filename()));
        write_rows(&path, &field_names(&names), &outcome.rows)?;
        reports.push(KindReport {
            kind: *kind,
            path,
            rows: outcome.rows.len(),
            completed: outcome.completed,
            skipped: outcome.skipped,
        });
    }
    Ok(reports)
}

/// What `run_collection` would do, without running anything.
pub struct CollectionPlan {
    pub kinds: Vec<CollectionKind>,
    pub mechanisms: Vec<Mechanism>,
    pub trials_per_mechanism: u32,
    pub total_trials: usize,
    pub commands: BTreeMap<Mechanism, String>,
    pub metric_names: BTreeMap<CollectionKind, Vec<String>>,
    pub prometheus_url: String,
    pub results_dir: PathBuf,
}

pub fn describe(config: &CollectionConfig, kinds: &[CollectionKind]) -> Result<CollectionPlan> {
    config.validate()?;
    let mut commands = BTreeMap::new();
    for mechanism in &config.mechanisms {
        commands.insert(*mechanism, config.command_for(*mechanism)?.to_string());
    }
    let mut metric_names = BTreeMap::new();
    for kind in kinds {
        metric_names.insert(*kind, kind.metric_names(config)?);
    }
    let mechanisms: Vec<Mechanism> = commands.keys().copied().collect();
    Ok(CollectionPlan {
        kinds: kinds.to_vec(),
        total_trials: kinds.len() * mechanisms.len() * config.trials as usize,
        mechanisms,
        trials_per_mechanism: config.trials,
        commands,
        metric_names,
        prometheus_url: config.prometheus_url.clone(),
        results_dir: config.results_dir.clone(),
    })
}

/// Removes leftover isolation contexts and stops the daemons.
pub fn cleanup(
    config: &CollectionConfig,
    runner: &dyn CommandRunner,
    backend: &dyn MetricsBackend,
) -> Result<()> {
    let mut lifecycle = Lifecycle::new(config, runner, backend)?;
    lifecycle.teardown_all()
}
