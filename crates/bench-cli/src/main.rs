use anyhow::Result;
use bench_runner::{
    CollectError, CollectionConfig, CollectionKind, ConfigOverrides, PrometheusClient,
    SystemCommandRunner,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "bench",
    version = "0.3.0",
    about = "Collect performance, timing, and memory data across deployment mechanisms"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    #[value(name = "perf")]
    Perf,
    #[value(name = "time")]
    Time,
    #[value(name = "max-rss")]
    MaxRss,
    #[value(name = "all")]
    All,
}

impl KindArg {
    fn kinds(self) -> Vec<CollectionKind> {
        match self {
            KindArg::Perf => vec![CollectionKind::Perf],
            KindArg::Time => vec![CollectionKind::Time],
            KindArg::MaxRss => vec![CollectionKind::MaxRss],
            KindArg::All => CollectionKind::ALL.to_vec(),
        }
    }
}

#[derive(Args, Clone, Debug, Default)]
struct OverrideArgs {
    /// YAML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    trials: Option<u32>,
    /// Comma-separated, e.g. `container,native`.
    #[arg(long)]
    mechanisms: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    input: Option<String>,
    #[arg(long)]
    arch: Option<String>,
    #[arg(long)]
    results_dir: Option<PathBuf>,
    #[arg(long)]
    prometheus_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    Collect {
        #[arg(long, value_enum, default_value = "all")]
        kind: KindArg,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    Describe {
        #[arg(long, value_enum, default_value = "all")]
        kind: KindArg,
        #[command(flatten)]
        overrides: OverrideArgs,
        #[arg(long)]
        json: bool,
    },
    /// Remove a leftover container and cgroup and stop the monitoring daemons.
    Cleanup {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr; stdout carries results and `--json` payloads.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bench_runner=info,bench=info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn load_config(args: OverrideArgs) -> Result<CollectionConfig> {
    let mut config = CollectionConfig::load(args.config.as_deref())?;
    let mechanisms = match args.mechanisms.as_deref() {
        Some(raw) => Some(bench_runner::parse_mechanism_list(raw)?),
        None => None,
    };
    config.apply(ConfigOverrides {
        trials: args.trials,
        mechanisms,
        model: args.model,
        input: args.input,
        arch: args.arch,
        results_dir: args.results_dir,
        prometheus_url: args.prometheus_url,
    });
    tracing::debug!(
        trials = config.trials,
        mechanisms = config.mechanisms.len(),
        results_dir = %config.results_dir.display(),
        "configuration loaded"
    );
    Ok(config)
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Collect {
            kind,
            overrides,
            json,
        } => {
            let config = load_config(overrides)?;
            let kinds = kind.kinds();
            let backend = PrometheusClient::new(&config.prometheus_url, config.http_timeout())?;
            let report =
                bench_runner::run_collection(&config, &kinds, &SystemCommandRunner, &backend)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "collect",
                    "report": report_to_json(&report)
                })));
            }
            println!("started: {}", report.started.to_rfc3339());
            for result in &report.results {
                println!(
                    "{}: {} rows -> {}",
                    result.kind,
                    result.rows,
                    result.path.display()
                );
                if !result.skipped.is_empty() {
                    let skipped: Vec<&str> = result.skipped.iter().map(|m| m.as_str()).collect();
                    println!("  skipped: {}", skipped.join(", "));
                }
            }
        }
        Commands::Describe {
            kind,
            overrides,
            json,
        } => {
            let config = load_config(overrides)?;
            let plan = bench_runner::describe(&config, &kind.kinds())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "plan": plan_to_json(&plan)
                })));
            }
            print_plan(&plan);
        }
        Commands::Cleanup { config, json } => {
            let config = CollectionConfig::load(config.as_deref())?;
            let backend = PrometheusClient::new(&config.prometheus_url, config.http_timeout())?;
            bench_runner::cleanup(&config, &SystemCommandRunner, &backend)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "cleanup",
                    "container": config.isolation.container_name,
                    "cgroup": config.isolation.cgroup_name
                })));
            }
            println!("removed container: {}", config.isolation.container_name);
            println!("removed cgroup: {}", config.isolation.cgroup_name);
            println!("monitoring daemons stopped");
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<CollectError>() {
        Some(CollectError::Config(_)) => "invalid_config",
        Some(CollectError::RetriesExhausted { .. }) => "retries_exhausted",
        Some(CollectError::Cleanup { .. }) => "cleanup_failed",
        Some(CollectError::Csv(_)) | Some(CollectError::Io(_)) => "write_failed",
        _ => "command_failed",
    }
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<CollectError>() {
        Some(CollectError::RetriesExhausted {
            mechanism,
            trial,
            attempts,
            source,
        }) => json!({
            "mechanism": mechanism,
            "trial": trial,
            "attempts": attempts,
            "last_error": source.to_string()
        }),
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Collect { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Cleanup { json, .. } => *json,
    }
}

fn report_to_json(report: &bench_runner::CollectionReport) -> Value {
    let results: Vec<Value> = report
        .results
        .iter()
        .map(|r| {
            json!({
                "kind": r.kind.as_str(),
                "path": r.path.display().to_string(),
                "rows": r.rows,
                "completed": r
                    .completed
                    .iter()
                    .map(|(m, n)| (m.as_str().to_string(), json!(n)))
                    .collect::<serde_json::Map<String, Value>>(),
                "skipped": r.skipped.iter().map(|m| m.as_str()).collect::<Vec<_>>()
            })
        })
        .collect();
    json!({
        "started": report.started.to_rfc3339(),
        "results": results
    })
}

fn plan_to_json(plan: &bench_runner::CollectionPlan) -> Value {
    json!({
        "kinds": plan.kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        "mechanisms": plan.mechanisms.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
        "trials_per_mechanism": plan.trials_per_mechanism,
        "total_trials": plan.total_trials,
        "commands": plan
            .commands
            .iter()
            .map(|(m, c)| (m.as_str().to_string(), json!(c)))
            .collect::<serde_json::Map<String, Value>>(),
        "metric_names": plan
            .metric_names
            .iter()
            .map(|(k, names)| (k.as_str().to_string(), json!(names)))
            .collect::<serde_json::Map<String, Value>>(),
        "prometheus_url": plan.prometheus_url,
        "results_dir": plan.results_dir.display().to_string()
    })
}

fn print_plan(plan: &bench_runner::CollectionPlan) {
    let kinds: Vec<&str> = plan.kinds.iter().map(|k| k.as_str()).collect();
    println!("kinds: {}", kinds.join(", "));
    println!("trials_per_mechanism: {}", plan.trials_per_mechanism);
    println!("total_trials: {}", plan.total_trials);
    for (mechanism, command) in &plan.commands {
        println!("{}: {}", mechanism, command);
    }
    for (kind, names) in &plan.metric_names {
        println!("{} columns: {}", kind, names.join(", "));
    }
    println!("prometheus: {}", plan.prometheus_url);
    println!("results_dir: {}", plan.results_dir.display());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_expands_to_every_kind() {
        assert_eq!(KindArg::All.kinds(), CollectionKind::ALL.to_vec());
        assert_eq!(KindArg::MaxRss.kinds(), vec![CollectionKind::MaxRss]);
    }

    #[test]
    fn collect_flags_parse_into_overrides() {
        let cli = Cli::try_parse_from([
            "bench",
            "collect",
            "--kind",
            "max-rss",
            "--trials",
            "3",
            "--mechanisms",
            "docker,native",
            "--json",
        ])
        .expect("parse");
        let Commands::Collect {
            kind,
            overrides,
            json,
        } = cli.command
        else {
            panic!("expected collect");
        };
        assert!(json);
        assert!(matches!(kind, KindArg::MaxRss));
        let config = load_config(overrides).expect("config");
        assert_eq!(config.trials, 3);
        assert_eq!(
            config.mechanisms,
            vec![bench_runner::Mechanism::Container, bench_runner::Mechanism::Native]
        );
    }

    #[test]
    fn unknown_mechanism_is_rejected() {
        let args = OverrideArgs {
            mechanisms: Some("docker,vm".to_string()),
            ..Default::default()
        };
        assert!(load_config(args).is_err());
    }

    #[test]
    fn config_errors_get_their_own_code() {
        let err = anyhow::Error::from(CollectError::Config("trials must be at least 1".into()));
        assert_eq!(error_code(&err), "invalid_config");
        let payload = json_error(error_code(&err), err.to_string(), error_details(&err));
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("invalid_config"));
    }
}
