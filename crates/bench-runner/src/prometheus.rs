//! Client for the time-series metrics backend (Prometheus HTTP API).

use crate::attribution::MetricSample;
use crate::error::{CollectError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// One element of an instant or range vector.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Series {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub value: Option<(f64, String)>,
    #[serde(default)]
    pub values: Option<Vec<(f64, String)>>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Series>,
}

pub trait MetricsBackend {
    fn query(&self, expr: &str) -> Result<Vec<Series>>;

    /// Deletes every series matching `selector`, e.g. `{name='x'}`.
    fn delete_series(&self, selector: &str) -> Result<()>;
}

pub struct PrometheusClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl PrometheusClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl MetricsBackend for PrometheusClient {
    fn query(&self, expr: &str) -> Result<Vec<Series>> {
        debug!(query = %expr, "querying metrics backend");
        let response: QueryResponse = self
            .http
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", expr)])
            .send()?
            .json()?;
        decode_query_response(response, expr)
    }

    fn delete_series(&self, selector: &str) -> Result<()> {
        debug!(selector = %selector, "deleting series");
        let response = self
            .http
            .post(format!("{}/api/v1/admin/tsdb/delete_series", self.base_url))
            .query(&[("match[]", selector)])
            .send()?;
        if response.status().as_u16() != 204 {
            return Err(CollectError::Backend(format!(
                "series deletion for {} returned HTTP {}",
                selector,
                response.status()
            )));
        }
        Ok(())
    }
}

fn decode_query_response(response: QueryResponse, expr: &str) -> Result<Vec<Series>> {
    if response.status != "success" {
        return Err(CollectError::Backend(format!(
            "query `{}` returned status '{}': {}",
            expr,
            response.status,
            response.error.unwrap_or_default()
        )));
    }
    Ok(response.data.map(|d| d.result).unwrap_or_default())
}

/// Flattens query results into a sample. Each series is keyed by its `event`
/// label, else its `__name__`, else `label`.
pub fn parse_series(series: &[Series], label: Option<&str>) -> Result<MetricSample> {
    let mut sample = MetricSample::new();
    for entry in series {
        let key = entry
            .metric
            .get("event")
            .or_else(|| entry.metric.get("__name__"))
            .map(|s| s.as_str())
            .or(label)
            .unwrap_or("unknown_metric");
        let raw = match (&entry.value, &entry.values) {
            (Some((_, v)), _) => v,
            (None, Some(values)) => match values.last() {
                Some((_, v)) => v,
                None => continue,
            },
            (None, None) => continue,
        };
        let value: f64 = raw
            .parse()
            .map_err(|_| CollectError::parse("metrics backend value", format!("'{}'", raw)))?;
        sample.insert(key, round2(value));
    }
    Ok(sample)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
