//! testrig CLI - concurrent test unit scheduler.

mod logs;
mod suite;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use testrig_core::{RunSummary, StatusRecord};
use testrig_dispatch::{CommandExecutor, DeviceSet, RetryPolicy, ShellExecutor};
use testrig_execution::{ExecutionEngine, ExecutionError, ExecutionMode, RunConfig};
use testrig_storage::{JsonStatusSink, StatusSink, StatusStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use logs::DirLogRouter;
use suite::{SuiteFile, DEFAULT_OPERATION, LOCAL_DEVICE};

#[derive(Parser)]
#[command(name = "testrig")]
#[command(about = "Concurrent test unit scheduler", long_about = None)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a suite
    Run {
        /// Suite file
        suite: PathBuf,
        /// Run configuration (engine settings and devices)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Directory for status records
        #[arg(long, default_value = ".testrig")]
        records: PathBuf,
        /// Directory for per-unit logs
        #[arg(long)]
        logs: Option<PathBuf>,
        /// Run units one at a time
        #[arg(long)]
        serial: bool,
        /// Abort the run on the first failure
        #[arg(long)]
        stop_on_error: bool,
        /// Cap on concurrently running units
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Validate a suite without running it
    Check {
        /// Suite file
        suite: PathBuf,
        /// Run configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Summarize the records of a previous run
    Report {
        /// Directory holding status records
        #[arg(long, default_value = ".testrig")]
        records: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Run {
            suite,
            config,
            records,
            logs,
            serial,
            stop_on_error,
            max_concurrent,
        } => {
            let mut run_config = load_config(config.as_deref())?;
            if serial {
                run_config.engine.mode = ExecutionMode::Serial;
            }
            if stop_on_error {
                run_config.engine.stop_on_error = true;
            }
            if max_concurrent.is_some() {
                run_config.engine.max_concurrent = max_concurrent;
            }
            let suite = SuiteFile::load(&suite)?;

            let sink = JsonStatusSink::new(&records)
                .await
                .with_context(|| format!("opening records under {}", records.display()))?;
            let store = Arc::new(StatusStore::with_sink(Arc::new(sink)));
            let logs = match logs {
                Some(dir) => Some(Arc::new(
                    DirLogRouter::new(&dir).with_context(|| format!("creating log directory {}", dir.display()))?,
                )),
                None => None,
            };

            let engine = build_engine(&suite, &run_config, store, logs)?;
            let summary = execute(&engine).await?;
            println!("{summary}");
            if !summary.is_clean() {
                anyhow::bail!("{} unit(s) failed, {} killed, {} incomplete", summary.failures(), summary.killed, summary.incomplete);
            }
        }
        Commands::Check { suite, config } => {
            let run_config = load_config(config.as_deref())?;
            let suite = SuiteFile::load(&suite)?;
            let engine = build_engine(&suite, &run_config, Arc::new(StatusStore::new()), None)?;
            println!("{}", check_report(&suite, &engine));
        }
        Commands::Report { records } => {
            let sink = JsonStatusSink::open(&records).await?;
            let records = sink.list().await?;
            for record in &records {
                println!("{}", format_record(record));
            }
            println!("{}", RunSummary::from_records(&records));
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(path) => Ok(RunConfig::load(path)?),
        None => Ok(RunConfig::default()),
    }
}

/// Configured devices plus a local shell device if none is configured.
fn build_devices(config: &RunConfig) -> Result<DeviceSet> {
    let mut devices = config.device_set()?;
    if devices.get(LOCAL_DEVICE).is_err() {
        let shell: Arc<dyn CommandExecutor> =
            Arc::new(ShellExecutor::new(LOCAL_DEVICE, vec![DEFAULT_OPERATION.to_string()]));
        devices.add_device(LOCAL_DEVICE, vec![shell], RetryPolicy::default());
    }
    Ok(devices)
}

/// Build an engine for `suite`, checking every unit can reach its device.
fn build_engine(
    suite: &SuiteFile,
    config: &RunConfig,
    store: Arc<StatusStore>,
    logs: Option<Arc<DirLogRouter>>,
) -> Result<ExecutionEngine> {
    let devices = build_devices(config)?;
    for unit in &suite.units {
        let device = devices
            .get(&unit.device)
            .with_context(|| format!("unit '{}'", unit.name))?;
        device
            .registry()
            .resolve(&unit.operation)
            .with_context(|| format!("unit '{}'", unit.name))?;
    }

    let mut engine = ExecutionEngine::new(store)
        .with_config(config.engine_config())
        .with_devices(devices);
    if let Some(router) = &logs {
        engine = engine.with_log_router(router.clone());
    }
    for template in suite.templates(logs) {
        let name = template.name().to_string();
        engine.add_unit(template).with_context(|| format!("unit '{name}'"))?;
    }
    Ok(engine)
}

/// Run the engine; Ctrl-C kills whatever is running and lets the run wind down.
async fn execute(engine: &ExecutionEngine) -> Result<RunSummary> {
    let handle = engine.handle();
    let run = engine.run();
    tokio::pin!(run);

    let finished = tokio::select! {
        outcome = &mut run => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            warn!("interrupted, killing running units");
            for run_id in handle.running() {
                if let Err(e) = handle.kill(&run_id.to_string()).await {
                    warn!(run = %run_id, error = %e, "kill failed");
                }
            }
            run.await
        }
    };

    match outcome {
        Ok(summary) => {
            info!(%summary, "run complete");
            Ok(summary)
        }
        Err(ExecutionError::StopOnError { unit, summary }) => {
            println!("{summary}");
            anyhow::bail!("run stopped after {unit} failed")
        }
        Err(e) => Err(e.into()),
    }
}

fn check_report(suite: &SuiteFile, engine: &ExecutionEngine) -> String {
    format!("{} unit(s) OK on {}", engine.units().len(), suite.devices().join(", "))
}

fn format_record(record: &StatusRecord) -> String {
    let mut line = format!("{:<32} {:<12}", record.run_id.to_string(), record.status.as_str());
    if let Some(post) = record.post_status {
        line.push_str(&format!(" post={post}"));
    }
    if let Some(duration) = record.duration {
        line.push_str(&format!(" {:.3}s", duration.as_secs_f64()));
    }
    if let Some(reason) = record.failure_reasons.last() {
        line.push_str(&format!(" ({reason})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use testrig_core::{RunId, UnitStatus};

    fn parse_suite(json: serde_json::Value) -> SuiteFile {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_local_device_added() {
        let devices = build_devices(&RunConfig::default()).unwrap();
        assert_eq!(devices.names(), vec![LOCAL_DEVICE]);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let suite = parse_suite(serde_json::json!({
            "units": [{"name": "a", "procedure": "true", "device": "dut9"}]
        }));
        let err = build_engine(&suite, &RunConfig::default(), Arc::new(StatusStore::new()), None)
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("dut9"));
    }

    #[test]
    fn test_unserved_operation_rejected() {
        let suite = parse_suite(serde_json::json!({
            "units": [{"name": "a", "procedure": "true", "operation": "reboot"}]
        }));
        assert!(build_engine(&suite, &RunConfig::default(), Arc::new(StatusStore::new()), None).is_err());
    }

    #[test]
    fn test_check_report_lists_devices() {
        let suite = parse_suite(serde_json::json!({
            "units": [
                {"name": "a", "procedure": "true"},
                {"name": "b", "procedure": "true"}
            ]
        }));
        let engine = build_engine(&suite, &RunConfig::default(), Arc::new(StatusStore::new()), None).unwrap();
        assert_eq!(check_report(&suite, &engine), "2 unit(s) OK on local");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shell_suite_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let suite = parse_suite(serde_json::json!({
            "units": [
                {"name": "setup", "procedure": "echo ready"},
                {
                    "name": "check",
                    "depends_on": [{"target": "setup", "required": "PASS"}],
                    "iterations": 2,
                    "procedure": "test \"$TESTRIG_RUN\" = check#1"
                },
                {"name": "broken", "procedure": "exit 4", "post": "echo cleaning"}
            ]
        }));
        let mut config = RunConfig::default();
        config.engine.poll_interval_ms = 10;

        let sink = Arc::new(JsonStatusSink::new(dir.path().join("records")).await.unwrap());
        let store = Arc::new(StatusStore::with_sink(sink.clone()));
        let router = Arc::new(DirLogRouter::new(dir.path().join("logs")).unwrap());
        let engine = build_engine(&suite, &config, store, Some(router.clone())).unwrap();

        let summary = execute(&engine).await.unwrap();
        assert_eq!(summary.pass, 2);
        assert_eq!(summary.failed, 1);

        let persisted = sink.list().await.unwrap();
        assert_eq!(persisted.len(), 3);
        let broken = persisted.iter().find(|r| r.template() == "broken").unwrap();
        assert_eq!(broken.status, UnitStatus::Failed);
        assert!(format_record(broken).starts_with("broken#1"));

        let log = std::fs::read_to_string(router.path(&RunId::first("broken"))).unwrap();
        assert!(log.contains("[post] $ echo cleaning"));
        assert!(log.contains("cleaning"));
    }
}
