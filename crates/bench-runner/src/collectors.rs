//! Per-kind trial runners plugged into the scheduler.
//!
//! Each runner drives the lifecycle for one trial and turns the result into
//! metric views; teardown is left to the scheduler's attempt loop.

use crate::attribution::{attribute, Baseline, MetricSample, MetricViews};
use crate::config::CollectionConfig;
use crate::error::{CollectError, Result};
use crate::lifecycle::Lifecycle;
use crate::mechanism::{IsolationKind, Mechanism};
use crate::prometheus::{parse_series, MetricsBackend};
use crate::query::{
    query_family, CounterMode, MetricKind, MetricQuery, Selector, Window, MAX_RSS_FIELD_NAME,
};
use crate::schedule::TrialRunner;
use crate::timing::{parse_time_report, timed_command, TimeReport, WALL_TIME_FIELD_NAME};
use chrono::Utc;
use std::thread;
use tracing::{debug, info};

/// Counter kinds and level kinds answered by one query family.
#[derive(Debug, Default)]
struct FamilyResult {
    counters: MetricSample,
    levels: MetricSample,
}

impl FamilyResult {
    fn merged(self) -> MetricSample {
        let mut all = self.counters;
        all.extend(self.levels);
        all
    }
}

fn run_family(backend: &dyn MetricsBackend, queries: &[MetricQuery]) -> Result<FamilyResult> {
    let mut result = FamilyResult::default();
    for query in queries {
        let expr = query.render();
        debug!(query = %expr, "querying metrics backend");
        let series = backend.query(&expr)?;
        let sample = parse_series(&series, query.label())?;
        if query.kind.is_counter() {
            result.counters.extend(sample);
        } else {
            result.levels.extend(sample);
        }
    }
    Ok(result)
}

/// Perf counters, memory, and CPU utilisation.
pub struct PerfRunner<'l, 'a> {
    lifecycle: &'l mut Lifecycle<'a>,
    config: &'l CollectionConfig,
    daemon: Selector,
    cores: usize,
}

impl<'l, 'a> PerfRunner<'l, 'a> {
    pub fn new(lifecycle: &'l mut Lifecycle<'a>, config: &'l CollectionConfig) -> Self {
        Self {
            lifecycle,
            config,
            daemon: Selector::Id(config.isolation.daemon_cgroup_id.clone()),
            cores: config.cores(),
        }
    }

    /// Idle daemon activity over the configured interval, before the
    /// container exists.
    fn measure_baseline(&self) -> Result<Baseline> {
        let start = Utc::now();
        thread::sleep(self.config.baseline_interval());
        let window = Window::between(start, Utc::now());
        let family = run_family(
            self.lifecycle.backend(),
            &query_family(&self.daemon, window, CounterMode::Rate, self.cores),
        )?;
        debug!(
            window_ms = window.duration_ms,
            rates = family.counters.len(),
            levels = family.levels.len(),
            "daemon baseline measured"
        );
        Ok(Baseline {
            rates: family.counters,
            levels: family.levels,
        })
    }

    fn run_container(&mut self) -> Result<MetricViews> {
        self.lifecycle.ensure_daemons_running()?;
        let baseline = self.measure_baseline()?;

        let launch = self.config.command_for(Mechanism::Container)?;
        let execution = self.lifecycle.start_container(&launch)?;
        let window = execution.window();
        let container = Selector::Id(self.lifecycle.container_cgroup_id()?);
        info!(
            duration_ms = window.duration_ms,
            container = %container,
            "container finished"
        );

        let backend = self.lifecycle.backend();
        let own = run_family(
            backend,
            &query_family(&container, window, CounterMode::Total, self.cores),
        )?
        .merged();
        let daemon = run_family(
            backend,
            &query_family(&self.daemon, window, CounterMode::Increase, self.cores),
        )?
        .merged();
        Ok(attribute(&own, &daemon, &baseline, window.duration_ms))
    }

    fn run_in_cgroup(&mut self, mechanism: Mechanism) -> Result<MetricViews> {
        self.lifecycle.ensure_daemons_running()?;
        let workload = self.config.command_for(mechanism)?;
        self.lifecycle.create_cgroup()?;
        let execution = self.lifecycle.exec_in_cgroup(&workload)?;
        let window = execution.window();
        info!(mechanism = %mechanism, duration_ms = window.duration_ms, "workload finished");
        let selector = self.lifecycle.cgroup().selector();
        let samples = run_family(
            self.lifecycle.backend(),
            &query_family(&selector, window, CounterMode::Total, self.cores),
        )?
        .merged();
        Ok(MetricViews::single(samples))
    }
}

impl TrialRunner for PerfRunner<'_, '_> {
    fn run_trial(&mut self, mechanism: Mechanism) -> Result<MetricViews> {
        match mechanism.isolation() {
            IsolationKind::Container => self.run_container(),
            IsolationKind::ControlGroup => self.run_in_cgroup(mechanism),
        }
    }

    fn teardown(&mut self, mechanism: Mechanism) -> Result<()> {
        self.lifecycle.teardown(mechanism.isolation())
    }
}

fn run_timed(
    lifecycle: &mut Lifecycle<'_>,
    config: &CollectionConfig,
    mechanism: Mechanism,
) -> Result<TimeReport> {
    let launch = config.command_for(mechanism)?;
    let output = match mechanism.isolation() {
        IsolationKind::Container => lifecycle.start_container_timed(&launch)?.output,
        IsolationKind::ControlGroup => {
            let cmd = timed_command(&launch);
            info!(mechanism = %mechanism, command = %cmd, "running timed workload");
            lifecycle.runner().run(&cmd)?
        }
    };
    parse_time_report(&output.stderr)
}

/// Wall-clock time, with the monitoring daemons stopped.
pub struct TimingRunner<'l, 'a> {
    lifecycle: &'l mut Lifecycle<'a>,
    config: &'l CollectionConfig,
}

impl<'l, 'a> TimingRunner<'l, 'a> {
    pub fn new(lifecycle: &'l mut Lifecycle<'a>, config: &'l CollectionConfig) -> Self {
        Self { lifecycle, config }
    }
}

impl TrialRunner for TimingRunner<'_, '_> {
    fn run_trial(&mut self, mechanism: Mechanism) -> Result<MetricViews> {
        self.lifecycle.ensure_daemons_stopped()?;
        let report = run_timed(self.lifecycle, self.config, mechanism)?;
        info!(mechanism = %mechanism, wall_seconds = report.wall_seconds, "timed run finished");
        Ok(MetricViews::single(MetricSample::from([(
            WALL_TIME_FIELD_NAME,
            report.wall_seconds,
        )])))
    }

    fn teardown(&mut self, mechanism: Mechanism) -> Result<()> {
        self.lifecycle.teardown(mechanism.isolation())
    }
}

/// Peak resident memory. A container's peak is the client process's RSS
/// plus the container's own recorded peak usage, so the collector must be
/// running for container trials.
pub struct MaxRssRunner<'l, 'a> {
    lifecycle: &'l mut Lifecycle<'a>,
    config: &'l CollectionConfig,
}

impl<'l, 'a> MaxRssRunner<'l, 'a> {
    pub fn new(lifecycle: &'l mut Lifecycle<'a>, config: &'l CollectionConfig) -> Self {
        Self { lifecycle, config }
    }

    fn container_peak(&self) -> Result<f64> {
        let query = MetricQuery {
            kind: MetricKind::PeakUsage,
            selector: self.lifecycle.container().selector(),
            window: Window::between(Utc::now(), Utc::now()),
            mode: CounterMode::Total,
            cores: 1,
        };
        let series = self.lifecycle.backend().query(&query.render())?;
        let sample = parse_series(&series, query.label())?;
        sample
            .get(MAX_RSS_FIELD_NAME)
            .ok_or_else(|| CollectError::MissingMetric {
                metric: MAX_RSS_FIELD_NAME.to_string(),
                context: format!("peak usage of {}", self.lifecycle.container().name()),
            })
    }
}

impl TrialRunner for MaxRssRunner<'_, '_> {
    fn run_trial(&mut self, mechanism: Mechanism) -> Result<MetricViews> {
        let bytes = match mechanism.isolation() {
            IsolationKind::Container => {
                self.lifecycle.ensure_daemons_running()?;
                let report = run_timed(self.lifecycle, self.config, mechanism)?;
                report.max_rss_bytes as f64 + self.container_peak()?
            }
            IsolationKind::ControlGroup => {
                self.lifecycle.ensure_daemons_stopped()?;
                run_timed(self.lifecycle, self.config, mechanism)?.max_rss_bytes as f64
            }
        };
        info!(mechanism = %mechanism, max_rss_bytes = bytes, "peak memory measured");
        Ok(MetricViews::single(MetricSample::from([(MAX_RSS_FIELD_NAME, bytes)])))
    }

    fn teardown(&mut self, mechanism: Mechanism) -> Result<()> {
        self.lifecycle.teardown(mechanism.isolation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::ViewSuffix;
    use crate::process::{CommandOutput, CommandRunner, CommandSpec, Privilege};
    use crate::testing::{FakeBackend, FakeRunner};
    use std::cell::RefCell;
    use std::path::PathBuf;

    const REPORT: &str = "\tElapsed (wall clock) time (h:mm:ss or m:ss): 0:01.50\n\tMaximum resident set size (kbytes): 1000\n";

    /// Notes how many backend queries had been issued when the container
    /// was launched.
    struct LaunchWatch<'a> {
        inner: &'a FakeRunner,
        backend: &'a FakeBackend,
        queries_at_launch: RefCell<Option<usize>>,
    }

    impl CommandRunner for LaunchWatch<'_> {
        fn run(&self, cmd: &CommandSpec) -> crate::error::Result<CommandOutput> {
            if cmd.to_string().starts_with("docker run") {
                *self.queries_at_launch.borrow_mut() = Some(self.backend.queries.borrow().len());
            }
            self.inner.run(cmd)
        }

        fn spawn_detached(&self, cmd: &CommandSpec) -> crate::error::Result<()> {
            self.inner.spawn_detached(cmd)
        }
    }

    fn config() -> CollectionConfig {
        let mut config = CollectionConfig::default();
        config.privilege = Privilege::none();
        config.daemons.warmup_ms = 0;
        config.baseline_interval_ms = 0;
        config.cores = Some(4);
        config.isolation.cgroup_root = PathBuf::from("/nonexistent/cgroup");
        config.workload.model = "resnet50.pt".to_string();
        config.workload.input = "cat.jpg".to_string();
        config
    }

    #[test]
    fn container_trial_splits_daemon_overhead() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        let watch = LaunchWatch {
            inner: &runner,
            backend: &backend,
            queries_at_launch: RefCell::new(None),
        };
        runner.respond("docker inspect", "abc\n", "");
        backend.answer(
            "rate(container_perf_events_total{id='/system.slice/docker.service'}",
            &[("instructions", 100.0)],
        );
        backend.answer(
            "increase(container_perf_events_total{id='/system.slice/docker.service'}",
            &[("instructions", 500.0)],
        );
        backend.answer("container_perf_events_total{id='/docker/abc'}", &[("instructions", 1000.0)]);

        let mut lifecycle = Lifecycle::new(&cfg, &watch, &backend).expect("lifecycle");
        let mut perf = PerfRunner::new(&mut lifecycle, &cfg);
        let views = perf.run_trial(Mechanism::Container).expect("trial");

        assert_eq!(views.len(), 3);
        let own = views.get(ViewSuffix::WorkloadOnly).expect("own view");
        let full = views.get(ViewSuffix::WithDaemon).expect("full view");
        let extra = views
            .get(ViewSuffix::WithDaemonExtraOverhead)
            .expect("extra view");
        assert_eq!(own.get("instructions"), Some(1000.0));
        assert_eq!(full.get("instructions"), Some(1500.0));
        let attributed = extra.get("instructions").expect("extra instructions");
        assert!(attributed > 1000.0 && attributed < 1500.0, "{}", attributed);

        let queries = backend.queries.borrow();
        let before_launch = (*watch.queries_at_launch.borrow()).expect("container launched");
        assert!(before_launch >= 1);
        assert!(queries[0].contains("rate(container_perf_events_total"));
        assert!(queries[..before_launch]
            .iter()
            .all(|q| q.contains("docker.service")));
        assert!(queries[before_launch..]
            .iter()
            .all(|q| !q.contains("rate(container_perf_events_total")));
        assert!(queries.iter().any(|q| q.contains("/ 4")));
        let commands = runner.commands.borrow();
        let run = commands.iter().position(|c| c.starts_with("docker run")).expect("run");
        let inspect = commands
            .iter()
            .position(|c| c.starts_with("docker inspect"))
            .expect("inspect");
        assert!(run < inspect);
        assert_eq!(runner.detached.borrow().len(), 2);
    }

    #[test]
    fn cgroup_trial_is_a_single_pass() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        backend.answer("container_perf_events_total{id='/custom'}", &[("instructions", 42.0)]);
        backend.answer("avg_over_time(container_memory_usage_bytes{id='/custom'}", &[("", 2048.0)]);

        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        let mut perf = PerfRunner::new(&mut lifecycle, &cfg);
        let views = perf.run_trial(Mechanism::Native).expect("trial");
        perf.teardown(Mechanism::Native).expect("teardown");

        assert_eq!(views.len(), 1);
        let samples = views.get(ViewSuffix::WorkloadOnly).expect("view");
        assert_eq!(samples.get("instructions"), Some(42.0));
        assert_eq!(samples.get("avg_memory_over_time"), Some(2048.0));
        assert_eq!(runner.ran("cgcreate -g memory:custom"), 1);
        assert_eq!(
            runner.ran("cgexec -g memory:custom native/torch_image_classification models/resnet50.pt"),
            1
        );
        assert!(backend.queries.borrow().iter().all(|q| !q.contains("docker.service")));
        assert_eq!(*backend.deletions.borrow(), vec!["{id='/custom'}"]);
    }

    #[test]
    fn backend_failure_fails_the_attempt() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        backend.fail_next_queries(1);
        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        let mut perf = PerfRunner::new(&mut lifecycle, &cfg);
        let err = perf.run_trial(Mechanism::WasmAot).expect_err("query fails");
        assert!(matches!(err, CollectError::Backend(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn timing_trial_stops_daemons_first() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        runner.respond("/usr/bin/time", "", REPORT);

        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        lifecycle.ensure_daemons_running().expect("start");
        let mut timing = TimingRunner::new(&mut lifecycle, &cfg);
        let views = timing.run_trial(Mechanism::WasmInterpreted).expect("trial");

        let samples = views.get(ViewSuffix::WorkloadOnly).expect("view");
        assert_eq!(samples.get(WALL_TIME_FIELD_NAME), Some(1.5));
        let commands = runner.commands.borrow();
        let stop = commands.iter().position(|c| c.starts_with("pkill")).expect("stop");
        let timed = commands
            .iter()
            .position(|c| c.starts_with("/usr/bin/time -v wasmedge"))
            .expect("timed run");
        assert!(stop < timed);
        assert_eq!(runner.ran("cgexec"), 0);
    }

    #[test]
    fn timing_container_trial_claims_the_container() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        runner.respond("/usr/bin/time", "", REPORT);
        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        {
            let mut timing = TimingRunner::new(&mut lifecycle, &cfg);
            timing.run_trial(Mechanism::Container).expect("trial");
        }
        assert_eq!(lifecycle.active(), Some(IsolationKind::Container));
        assert_eq!(runner.ran("/usr/bin/time -v docker run"), 1);
    }

    #[test]
    fn unparseable_time_output_is_retryable() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        runner.respond("/usr/bin/time", "", "segfault\n");
        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        let mut timing = TimingRunner::new(&mut lifecycle, &cfg);
        let err = timing.run_trial(Mechanism::Native).expect_err("no report");
        assert!(err.is_retryable());
    }

    #[test]
    fn container_max_rss_adds_recorded_peak() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        runner.respond("/usr/bin/time", "", REPORT);
        backend.answer(
            "max(container_memory_max_usage_bytes{name='benchmarked-container'})",
            &[("", 4096.0)],
        );
        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        let mut rss = MaxRssRunner::new(&mut lifecycle, &cfg);
        let views = rss.run_trial(Mechanism::Container).expect("trial");
        let samples = views.get(ViewSuffix::WorkloadOnly).expect("view");
        assert_eq!(samples.get(MAX_RSS_FIELD_NAME), Some(1000.0 * 1024.0 + 4096.0));
        assert_eq!(runner.detached.borrow().len(), 2);
    }

    #[test]
    fn container_max_rss_without_peak_is_missing_metric() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        runner.respond("/usr/bin/time", "", REPORT);
        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        let mut rss = MaxRssRunner::new(&mut lifecycle, &cfg);
        let err = rss.run_trial(Mechanism::Container).expect_err("no peak series");
        assert!(matches!(err, CollectError::MissingMetric { .. }));
    }

    #[test]
    fn native_max_rss_uses_time_report_only() {
        let cfg = config();
        let runner = FakeRunner::default();
        let backend = FakeBackend::default();
        runner.respond("/usr/bin/time", "", REPORT);
        let mut lifecycle = Lifecycle::new(&cfg, &runner, &backend).expect("lifecycle");
        let mut rss = MaxRssRunner::new(&mut lifecycle, &cfg);
        let views = rss.run_trial(Mechanism::Native).expect("trial");
        let samples = views.get(ViewSuffix::WorkloadOnly).expect("view");
        assert_eq!(samples.get(MAX_RSS_FIELD_NAME), Some(1024000.0));
        assert!(backend.queries.borrow().is_empty());
    }
}
