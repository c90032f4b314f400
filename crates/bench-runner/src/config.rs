use crate::error::{CollectError, Result};
use crate::mechanism::Mechanism;
use crate::process::{CommandSpec, Privilege};
use crate::schedule::{ExhaustedAction, RetryPolicy};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a collection run needs. Every field has a default, so an empty
/// YAML document is a valid configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectionConfig {
    pub prometheus_url: String,
    pub http_timeout_secs: u64,
    /// Trials per mechanism.
    pub trials: u32,
    pub mechanisms: Vec<Mechanism>,
    pub perf_retry: RetryPolicy,
    pub time_retry: RetryPolicy,
    pub daemons: DaemonConfig,
    /// How long the supervising daemon is observed before each container
    /// trial to estimate its idle activity.
    pub baseline_interval_ms: u64,
    pub isolation: IsolationConfig,
    pub privilege: Privilege,
    pub workload: WorkloadConfig,
    /// Explicit perf events; when empty they are read from
    /// `perf_events_config`.
    pub perf_events: Vec<String>,
    pub perf_events_config: Option<PathBuf>,
    /// Metrics a host may legitimately not report (missing hardware
    /// counters, virtualised CPUs). Rows omit them instead of failing.
    pub possibly_absent_metrics: Vec<String>,
    pub cores: Option<usize>,
    pub results_dir: PathBuf,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            prometheus_url: "http://localhost:9090".to_string(),
            http_timeout_secs: 30,
            trials: 10,
            mechanisms: Mechanism::ALL.to_vec(),
            perf_retry: RetryPolicy {
                max_attempts: 20,
                on_exhausted: ExhaustedAction::Abort,
            },
            time_retry: RetryPolicy {
                max_attempts: 5,
                on_exhausted: ExhaustedAction::Abort,
            },
            daemons: DaemonConfig::default(),
            baseline_interval_ms: 5_000,
            isolation: IsolationConfig::default(),
            privilege: Privilege::default(),
            workload: WorkloadConfig::default(),
            perf_events: Vec::new(),
            perf_events_config: Some(PathBuf::from("cadvisor/perf_config.json")),
            possibly_absent_metrics: Vec::new(),
            cores: None,
            results_dir: PathBuf::from("."),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// The agent scraping per-cgroup counters (cAdvisor).
    pub collector: DaemonCommands,
    /// The time-series store the queries run against. `None` when it is
    /// managed outside this tool.
    pub query: Option<DaemonCommands>,
    /// Blocking wait after start so the first scrape lands before any query.
    pub warmup_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            collector: DaemonCommands {
                start: "cadvisor/cadvisor -perf_events_config=cadvisor/perf_config.json"
                    .to_string(),
                stop: "pkill -f cadvisor/cadvisor".to_string(),
            },
            query: Some(DaemonCommands {
                start: "prometheus --config.file=prometheus/prometheus.yml --web.enable-admin-api"
                    .to_string(),
                stop: "pkill -f prometheus/prometheus.yml".to_string(),
            }),
            warmup_ms: 3_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonCommands {
    pub start: String,
    pub stop: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationConfig {
    pub container_name: String,
    pub cgroup_name: String,
    pub cgroup_controller: String,
    /// Mount point of the cgroup filesystem.
    pub cgroup_root: PathBuf,
    /// Cgroup of the daemon supervising containers.
    pub daemon_cgroup_id: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            container_name: "benchmarked-container".to_string(),
            cgroup_name: "custom".to_string(),
            cgroup_controller: "memory".to_string(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            daemon_cgroup_id: "/system.slice/docker.service".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    pub model: String,
    pub input: String,
    /// Image architecture tag.
    pub arch: String,
    pub commands: CommandTemplates,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            input: String::new(),
            arch: "amd64".to_string(),
            commands: CommandTemplates::default(),
        }
    }
}

/// Launch command per mechanism. Placeholders: `{model}`, `{input}`,
/// `{arch}`, `{container_name}`, `{aot_ext}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandTemplates {
    pub container: String,
    pub wasm_interpreted: String,
    pub wasm_aot: String,
    pub native: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            container: "docker run --privileged --name {container_name} image-classification:{arch} ./torch_image_classification models/{model} inputs/{input}".to_string(),
            wasm_interpreted: "wasmedge --dir .:. wasm/interpreted.wasm models/{model} inputs/{input}".to_string(),
            wasm_aot: "wasmedge --dir .:. wasm/aot.{aot_ext} models/{model} inputs/{input}".to_string(),
            native: "native/torch_image_classification models/{model} inputs/{input}".to_string(),
        }
    }
}

/// CLI-level overrides applied on top of the file.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub trials: Option<u32>,
    pub mechanisms: Option<Vec<Mechanism>>,
    pub model: Option<String>,
    pub input: Option<String>,
    pub arch: Option<String>,
    pub results_dir: Option<PathBuf>,
    pub prometheus_url: Option<String>,
}

impl CollectionConfig {
    /// Reads a YAML file, or returns the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                if raw.trim().is_empty() {
                    return Ok(Self::default());
                }
                let config: CollectionConfig = serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?;
                Ok(config)
            }
        }
    }

    pub fn apply(&mut self, overrides: ConfigOverrides) {
        if let Some(trials) = overrides.trials {
            self.trials = trials;
        }
        if let Some(mechanisms) = overrides.mechanisms {
            self.mechanisms = mechanisms;
        }
        if let Some(model) = overrides.model {
            self.workload.model = model;
        }
        if let Some(input) = overrides.input {
            self.workload.input = input;
        }
        if let Some(arch) = overrides.arch {
            self.workload.arch = arch;
        }
        if let Some(dir) = overrides.results_dir {
            self.results_dir = dir;
        }
        if let Some(url) = overrides.prometheus_url {
            self.prometheus_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.trials == 0 {
            return Err(CollectError::config("trials must be at least 1"));
        }
        if self.mechanisms.is_empty() {
            return Err(CollectError::config("no mechanisms enabled"));
        }
        for (name, policy) in [("perf_retry", &self.perf_retry), ("time_retry", &self.time_retry)] {
            if policy.max_attempts == 0 {
                return Err(CollectError::config(format!(
                    "{}.max_attempts must be at least 1",
                    name
                )));
            }
        }
        if self.isolation.container_name.trim().is_empty()
            || self.isolation.cgroup_name.trim().is_empty()
        {
            return Err(CollectError::config(
                "container_name and cgroup_name must be non-empty",
            ));
        }
        for (name, value) in [
            ("model", &self.workload.model),
            ("input", &self.workload.input),
            ("arch", &self.workload.arch),
        ] {
            if value.trim().is_empty() {
                return Err(CollectError::config(format!("workload.{} must be set", name)));
            }
        }
        for mechanism in &self.mechanisms {
            self.command_for(*mechanism)?;
        }
        Ok(())
    }

    pub fn cores(&self) -> usize {
        self.cores.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.daemons.warmup_ms)
    }

    pub fn baseline_interval(&self) -> Duration {
        Duration::from_millis(self.baseline_interval_ms)
    }

    /// Renders the launch command for `mechanism`.
    pub fn command_for(&self, mechanism: Mechanism) -> Result<CommandSpec> {
        let templates = &self.workload.commands;
        let template = match mechanism {
            Mechanism::Container => &templates.container,
            Mechanism::WasmInterpreted => &templates.wasm_interpreted,
            Mechanism::WasmAot => &templates.wasm_aot,
            Mechanism::Native => &templates.native,
        };
        let rendered = template
            .replace("{model}", &self.workload.model)
            .replace("{input}", &self.workload.input)
            .replace("{arch}", &self.workload.arch)
            .replace("{container_name}", &self.isolation.container_name)
            .replace("{aot_ext}", aot_extension());
        if let Some(start) = rendered.find('{') {
            if rendered[start..].contains('}') {
                return Err(CollectError::config(format!(
                    "unknown placeholder in {} command template: {}",
                    mechanism, template
                )));
            }
        }
        CommandSpec::from_line(&rendered).map_err(|_| {
            CollectError::config(format!("{} command template is empty", mechanism))
        })
    }

    /// Perf events to report, in column order.
    pub fn resolve_perf_events(&self) -> Result<Vec<String>> {
        if !self.perf_events.is_empty() {
            return Ok(self.perf_events.clone());
        }
        match &self.perf_events_config {
            Some(path) => read_perf_events(path),
            None => Ok(Vec::new()),
        }
    }

    /// `<timestamp>_<model>_<input>_`, prepended to every results file.
    pub fn results_prefix(&self, started: DateTime<Utc>) -> String {
        format!(
            "{}_{}_{}_",
            started.format("%Y%m%dT%H%M%S"),
            sanitize(&self.workload.model),
            sanitize(&self.workload.input)
        )
    }
}

/// macOS loads ahead-of-time compiled modules as shared objects.
fn aot_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "so"
    } else {
        "wasm"
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Reads `core.events` from the collector's perf-events config. Grouped
/// events (nested arrays) are flattened.
pub fn read_perf_events(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        CollectError::config(format!("reading perf config {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|e| {
        CollectError::config(format!("parsing perf config {}: {}", path.display(), e))
    })?;
    let events = value
        .pointer("/core/events")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            CollectError::config(format!("{} has no core.events list", path.display()))
        })?;
    let mut out = Vec::new();
    for entry in events {
        match entry {
            Value::String(s) => out.push(s.clone()),
            Value::Array(group) => {
                out.extend(group.iter().filter_map(|v| v.as_str().map(str::to_string)))
            }
            other => {
                return Err(CollectError::config(format!(
                    "unexpected perf event entry {} in {}",
                    other,
                    path.display()
                )))
            }
        }
    }
    Ok(out)
}
