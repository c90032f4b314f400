//! Trial ordering and the per-trial attempt loop.

use crate::attribution::MetricViews;
use crate::csv_sink::{prepare_rows, CsvRow, MissingMetricPolicy};
use crate::error::{CollectError, Result};
use crate::mechanism::Mechanism;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// What happens once a trial has used up its attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Fail the whole collection run. Keeps per-mechanism sample sizes equal.
    Abort,
    /// Drop this schedule entry and continue.
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub on_exhausted: ExhaustedAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trial {
    pub mechanism: Mechanism,
    pub number: u32,
    pub start_time: DateTime<Utc>,
    pub attempt: u32,
}

/// `n` entries per enabled mechanism, uniformly shuffled so that slow drift
/// on the host (thermal, background load) does not line up with any one
/// mechanism.
pub fn build_schedule<R: Rng + ?Sized>(n: u32, mechanisms: &[Mechanism], rng: &mut R) -> Vec<Mechanism> {
    let mut enabled: Vec<Mechanism> = Vec::new();
    for m in mechanisms {
        if !enabled.contains(m) {
            enabled.push(*m);
        }
    }
    let mut schedule: Vec<Mechanism> = enabled
        .iter()
        .flat_map(|m| std::iter::repeat(*m).take(n as usize))
        .collect();
    schedule.shuffle(rng);
    schedule
}

/// Per-mechanism trial numbers. A number is only consumed by a success.
#[derive(Clone, Debug, Default)]
pub struct TrialCounters {
    completed: BTreeMap<Mechanism, u32>,
}

impl TrialCounters {
    /// The number the next successful trial of `mechanism` will receive.
    pub fn next(&self, mechanism: Mechanism) -> u32 {
        self.completed.get(&mechanism).copied().unwrap_or(0) + 1
    }

    pub fn commit(&mut self, mechanism: Mechanism) -> u32 {
        let entry = self.completed.entry(mechanism).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn completed(&self) -> &BTreeMap<Mechanism, u32> {
        &self.completed
    }
}

/// Runs one mechanism's workload and releases whatever it set up.
pub trait TrialRunner {
    fn run_trial(&mut self, mechanism: Mechanism) -> Result<MetricViews>;

    /// Destroys the trial's isolation context. Must succeed when there is
    /// nothing left to destroy.
    fn teardown(&mut self, mechanism: Mechanism) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    pub rows: Vec<CsvRow>,
    pub completed: BTreeMap<Mechanism, u32>,
    /// Entries dropped under `ExhaustedAction::Skip`.
    pub skipped: Vec<Mechanism>,
}

pub struct Scheduler<'a> {
    policy: RetryPolicy,
    metric_names: &'a [String],
    missing: &'a MissingMetricPolicy,
    counters: TrialCounters,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        policy: RetryPolicy,
        metric_names: &'a [String],
        missing: &'a MissingMetricPolicy,
    ) -> Self {
        Self {
            policy,
            metric_names,
            missing,
            counters: TrialCounters::default(),
        }
    }

    pub fn run<R: TrialRunner + ?Sized>(
        mut self,
        schedule: &[Mechanism],
        runner: &mut R,
    ) -> Result<ScheduleOutcome> {
        let mut outcome = ScheduleOutcome::default();
        for (index, mechanism) in schedule.iter().enumerate() {
            info!(
                mechanism = %mechanism,
                entry = index + 1,
                total = schedule.len(),
                "starting experiment"
            );
            match self.run_entry(*mechanism, runner)? {
                Some(rows) => outcome.rows.extend(rows),
                None => outcome.skipped.push(*mechanism),
            }
        }
        outcome.completed = self.counters.completed().clone();
        Ok(outcome)
    }

    fn run_entry<R: TrialRunner + ?Sized>(
        &mut self,
        mechanism: Mechanism,
        runner: &mut R,
    ) -> Result<Option<Vec<CsvRow>>> {
        let number = self.counters.next(mechanism);
        let start_time = Utc::now();
        let mut last_error = None;
        for attempt in 1..=self.policy.max_attempts {
            let trial = Trial {
                mechanism,
                number,
                start_time,
                attempt,
            };
            info!(mechanism = %mechanism, trial = number, attempt, "running trial");
            match self.attempt(&trial, runner) {
                Ok(rows) => {
                    self.counters.commit(mechanism);
                    return Ok(Some(rows));
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        mechanism = %mechanism,
                        trial = number,
                        attempt,
                        error = %err,
                        "trial attempt failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        let source = last_error
            .unwrap_or_else(|| CollectError::config("retry policy allows no attempts"));
        match self.policy.on_exhausted {
            ExhaustedAction::Abort => Err(CollectError::RetriesExhausted {
                mechanism: mechanism.to_string(),
                trial: number,
                attempts: self.policy.max_attempts,
                source: Box::new(source),
            }),
            ExhaustedAction::Skip => {
                warn!(
                    mechanism = %mechanism,
                    trial = number,
                    error = %source,
                    "skipping trial after exhausting attempts"
                );
                Ok(None)
            }
        }
    }

    /// One attempt. Teardown always runs; its failure never replaces the
    /// attempt's own error.
    fn attempt<R: TrialRunner + ?Sized>(&self, trial: &Trial, runner: &mut R) -> Result<Vec<CsvRow>> {
        let result = runner.run_trial(trial.mechanism);
        let teardown = runner.teardown(trial.mechanism);
        match (result, teardown) {
            (Ok(views), Ok(())) => prepare_rows(trial, &views, self.metric_names, self.missing),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(cleanup)) => {
                warn!(
                    mechanism = %trial.mechanism,
                    trial = trial.number,
                    attempt = trial.attempt,
                    error = %cleanup,
                    "cleanup after failed attempt also failed"
                );
                Err(err)
            }
        }
    }
}
