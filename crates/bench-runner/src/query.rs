//! Typed builder for the time-windowed metric queries run after each trial.
//!
//! Every windowed query looks back `duration_ms` from the trial's end
//! timestamp, so unrelated activity before or after the trial is excluded.

use chrono::{DateTime, Utc};
use std::fmt;

pub const MEMORY_FIELD_NAMES: [&str; 2] = ["avg_memory_over_time", "max_memory_over_time"];

pub const CPU_FIELD_NAMES: [&str; 3] = [
    "cpu_total_utilization",
    "cpu_user_utilization",
    "cpu_system_utilization",
];

pub const MAX_RSS_FIELD_NAME: &str = "max-rss-bytes";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    /// Hardware/software perf counters, one series per event.
    PerfEvents,
    AvgMemory,
    MaxMemory,
    CpuTotal,
    CpuUser,
    CpuSystem,
    /// Peak memory usage recorded over a context's lifetime.
    PeakUsage,
}

impl MetricKind {
    /// The queries run for a performance trial, in column order.
    pub const PERFORMANCE: [MetricKind; 6] = [
        MetricKind::PerfEvents,
        MetricKind::AvgMemory,
        MetricKind::MaxMemory,
        MetricKind::CpuTotal,
        MetricKind::CpuUser,
        MetricKind::CpuSystem,
    ];

    /// Column name for single-valued kinds. Perf counters are keyed by their
    /// `event` label instead.
    pub fn label(self) -> Option<&'static str> {
        match self {
            MetricKind::PerfEvents => None,
            MetricKind::AvgMemory => Some(MEMORY_FIELD_NAMES[0]),
            MetricKind::MaxMemory => Some(MEMORY_FIELD_NAMES[1]),
            MetricKind::CpuTotal => Some(CPU_FIELD_NAMES[0]),
            MetricKind::CpuUser => Some(CPU_FIELD_NAMES[1]),
            MetricKind::CpuSystem => Some(CPU_FIELD_NAMES[2]),
            MetricKind::PeakUsage => Some(MAX_RSS_FIELD_NAME),
        }
    }

    /// Counter kinds accumulate with time; the rest are levels.
    pub fn is_counter(self) -> bool {
        matches!(self, MetricKind::PerfEvents)
    }
}

/// Identifies an isolation context in label-matcher form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    /// Container name, as labelled by the collector.
    Name(String),
    /// Cgroup path.
    Id(String),
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Name(name) => write!(f, "{{name='{}'}}", name),
            Selector::Id(id) => write!(f, "{{id='{}'}}", id),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub duration_ms: u64,
    pub end: DateTime<Utc>,
}

impl Window {
    /// `round((end - start) * 1000)` milliseconds, at least one.
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let micros = (end - start).num_microseconds().unwrap_or(i64::MAX).max(0);
        let duration_ms = ((micros as f64) / 1000.0).round() as u64;
        Self {
            duration_ms: duration_ms.max(1),
            end,
        }
    }

    /// `[<ms>ms] @ <end>`
    pub fn range(&self) -> String {
        format!(
            "[{}ms] @ {:.3}",
            self.duration_ms,
            self.end.timestamp_millis() as f64 / 1000.0
        )
    }
}

/// How perf counters are windowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterMode {
    /// Cumulative total. Only valid for contexts created for this trial,
    /// whose accounting starts at creation.
    Total,
    /// Delta over the window, for long-lived contexts.
    Increase,
    /// Per-second rate over the window.
    Rate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricQuery {
    pub kind: MetricKind,
    pub selector: Selector,
    pub window: Window,
    pub mode: CounterMode,
    pub cores: usize,
}

impl MetricQuery {
    pub fn label(&self) -> Option<&'static str> {
        self.kind.label()
    }

    pub fn render(&self) -> String {
        let sel = &self.selector;
        let range = self.window.range();
        let cores = self.cores.max(1);
        match self.kind {
            MetricKind::PerfEvents => match self.mode {
                CounterMode::Total => {
                    format!("sum by (event) (container_perf_events_total{})", sel)
                }
                CounterMode::Increase => format!(
                    "sum by (event) (increase(container_perf_events_total{}{}))",
                    sel, range
                ),
                CounterMode::Rate => format!(
                    "sum by (event) (rate(container_perf_events_total{}{}))",
                    sel, range
                ),
            },
            MetricKind::AvgMemory => {
                format!("sum(avg_over_time(container_memory_usage_bytes{}{}))", sel, range)
            }
            MetricKind::MaxMemory => {
                format!("sum(max_over_time(container_memory_usage_bytes{}{}))", sel, range)
            }
            MetricKind::CpuTotal => cpu_query("container_cpu_usage_seconds_total", sel, &range, cores),
            MetricKind::CpuUser => cpu_query("container_cpu_user_seconds_total", sel, &range, cores),
            MetricKind::CpuSystem => {
                cpu_query("container_cpu_system_seconds_total", sel, &range, cores)
            }
            MetricKind::PeakUsage => format!("max(container_memory_max_usage_bytes{})", sel),
        }
    }
}

fn cpu_query(metric: &str, sel: &Selector, range: &str, cores: usize) -> String {
    format!("100 * sum(rate({}{}{})) / {}", metric, sel, range, cores)
}

/// The six performance queries for one context and window, in column order.
pub fn query_family(
    selector: &Selector,
    window: Window,
    mode: CounterMode,
    cores: usize,
) -> Vec<MetricQuery> {
    MetricKind::PERFORMANCE
        .iter()
        .map(|kind| MetricQuery {
            kind: *kind,
            selector: selector.clone(),
            window,
            mode,
            cores,
        })
        .collect()
}
