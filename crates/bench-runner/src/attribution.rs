//! Separates a container's own resource use from the activity of the daemon
//! supervising it.
//!
//! For each containerized trial the daemon's steady-state activity is measured
//! before the container starts (the baseline), then its activity during the
//! container's run is compared against that baseline scaled to the run's
//! length. Only the excess is attributed to the container.

use serde::Serialize;
use std::collections::BTreeMap;

/// Metric name to value.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricSample(BTreeMap<String, f64>);

impl MetricSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Merges `other` into `self`, overwriting existing names.
    pub fn extend(&mut self, other: MetricSample) {
        self.0.extend(other.0);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Per-metric sum over the names present in `self`; names missing from
    /// `other` contribute zero.
    pub fn plus(&self, other: &MetricSample) -> MetricSample {
        self.iter()
            .map(|(k, v)| (k.to_string(), v + other.get(k).unwrap_or(0.0)))
            .collect()
    }
}

impl FromIterator<(String, f64)> for MetricSample {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        MetricSample(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, f64); N]> for MetricSample {
    fn from(pairs: [(&str, f64); N]) -> Self {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewSuffix {
    WorkloadOnly,
    WithDaemon,
    WithDaemonExtraOverhead,
}

impl ViewSuffix {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewSuffix::WorkloadOnly => "",
            ViewSuffix::WithDaemon => "_with_daemon",
            ViewSuffix::WithDaemonExtraOverhead => "_with_daemon_extra_overhead",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricView {
    pub suffix: ViewSuffix,
    pub samples: MetricSample,
}

/// The views produced by one trial, each serialized as its own row.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricViews(Vec<MetricView>);

impl MetricViews {
    /// A trial whose isolation context accounts for everything it used.
    pub fn single(samples: MetricSample) -> Self {
        MetricViews(vec![MetricView {
            suffix: ViewSuffix::WorkloadOnly,
            samples,
        }])
    }

    pub fn get(&self, suffix: ViewSuffix) -> Option<&MetricSample> {
        self.0
            .iter()
            .find(|v| v.suffix == suffix)
            .map(|v| &v.samples)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MetricView> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a MetricViews {
    type Item = &'a MetricView;
    type IntoIter = std::slice::Iter<'a, MetricView>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Daemon activity measured while no trial workload was running.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Baseline {
    /// Per-second rates of counter metrics.
    pub rates: MetricSample,
    /// Level metrics (memory, CPU percentages), independent of window length.
    pub levels: MetricSample,
}

impl Baseline {
    /// Expected idle-daemon activity over a window of `duration_ms`.
    pub fn extrapolate(&self, duration_ms: u64) -> MetricSample {
        let seconds = duration_ms as f64 / 1000.0;
        let mut expected: MetricSample = self
            .rates
            .iter()
            .map(|(k, rate)| (k.to_string(), rate * seconds))
            .collect();
        for (k, v) in self.levels.iter() {
            expected.insert(k, v);
        }
        expected
    }
}

/// `max(0, daemon - expected)` for every metric the daemon reported. Metrics
/// without a baseline are attributed in full.
pub fn extra_overhead(daemon: &MetricSample, expected: &MetricSample) -> MetricSample {
    daemon
        .iter()
        .map(|(k, v)| {
            let idle = expected.get(k).unwrap_or(0.0);
            (k.to_string(), (v - idle).max(0.0))
        })
        .collect()
}

/// Builds the container-only, full-daemon, and extra-overhead views.
pub fn attribute(
    container: &MetricSample,
    daemon: &MetricSample,
    baseline: &Baseline,
    duration_ms: u64,
) -> MetricViews {
    let expected = baseline.extrapolate(duration_ms);
    let extra = extra_overhead(daemon, &expected);
    MetricViews(vec![
        MetricView {
            suffix: ViewSuffix::WorkloadOnly,
            samples: container.clone(),
        },
        MetricView {
            suffix: ViewSuffix::WithDaemon,
            samples: container.plus(daemon),
        },
        MetricView {
            suffix: ViewSuffix::WithDaemonExtraOverhead,
            samples: container.plus(&extra),
        },
    ])
}
