use crate::attribution::{MetricSample, MetricViews};
use crate::error::{CollectError, Result};
use crate::schedule::Trial;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Columns present in every results file, ahead of the metric columns.
pub const IDENTITY_FIELDS: [&str; 3] = ["experiment_type", "trial_number", "start_time"];

#[derive(Clone, Debug, PartialEq)]
pub struct CsvRow {
    /// Mechanism name plus the view suffix, e.g. `container_with_daemon`.
    pub experiment_type: String,
    pub trial_number: u32,
    pub start_time: String,
    pub metrics: MetricSample,
}

/// Metric names a row may omit without failing the trial.
#[derive(Clone, Debug, Default)]
pub struct MissingMetricPolicy {
    possibly_absent: BTreeSet<String>,
}

impl MissingMetricPolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            possibly_absent: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.possibly_absent.contains(name)
    }
}

/// Header for a results file reporting `metric_names`.
pub fn field_names(metric_names: &[String]) -> Vec<String> {
    IDENTITY_FIELDS
        .iter()
        .map(|s| s.to_string())
        .chain(metric_names.iter().cloned())
        .collect()
}

/// One row per view. A metric absent from a view is an error unless the
/// policy allows it.
pub fn prepare_rows(
    trial: &Trial,
    views: &MetricViews,
    metric_names: &[String],
    policy: &MissingMetricPolicy,
) -> Result<Vec<CsvRow>> {
    let start_time = trial.start_time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
    let mut rows = Vec::with_capacity(views.len());
    for view in views {
        let experiment_type = format!("{}{}", trial.mechanism, view.suffix.as_str());
        let mut metrics = MetricSample::new();
        for name in metric_names {
            match view.samples.get(name) {
                Some(value) => metrics.insert(name.clone(), value),
                None if policy.allows(name) => {
                    debug!(metric = %name, experiment_type = %experiment_type, "omitting absent metric");
                }
                None => {
                    return Err(CollectError::MissingMetric {
                        metric: name.clone(),
                        context: format!(
                            "{} trial {} attempt {}",
                            experiment_type, trial.number, trial.attempt
                        ),
                    })
                }
            }
        }
        rows.push(CsvRow {
            experiment_type,
            trial_number: trial.number,
            start_time: start_time.clone(),
            metrics,
        });
    }
    Ok(rows)
}

/// Writes `rows` under a header of `field_names`. Metric cells a row does not
/// carry are left empty.
pub fn write_rows(path: &Path, field_names: &[String], rows: &[CsvRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    info!(path = %path.display(), rows = rows.len(), "writing results");
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(field_names)?;
    for row in rows {
        let record: Vec<String> = field_names
            .iter()
            .map(|field| match field.as_str() {
                "experiment_type" => row.experiment_type.clone(),
                "trial_number" => row.trial_number.to_string(),
                "start_time" => row.start_time.clone(),
                metric => row
                    .metrics
                    .get(metric)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            })
            .collect();
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
