use crate::error::{RecorderError, Result};
use crate::metrics::collector::Collector;
use crate::runner::{quick_run, LineRunner, RunOutcome};
use crate::timestamp::TimeFormat;
use fs_extra::dir::create_all;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// One-shot captures taken before the benchmark: (command, file name).
pub const SYSTEM_SNAPSHOT: &[(&str, &str)] = &[
    ("hostname", "hostname"),
    ("cat /proc/cpuinfo", "cpuinfo"),
    ("uname -a", "kernel"),
    ("env", "env"),
];

/// Metrics sampled for the whole run: (command, file name).
pub const SAMPLED_METRICS: &[(&str, &str)] = &[("sensors", "sensors"), ("free -m", "memory")];

pub const PRECOMMAND_FILE: &str = "precommand";
pub const INVOCATION_FILE: &str = "command";
pub const OUTPUT_FILE: &str = "output";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Benchmark command, already joined into one shell string.
    pub command: String,
    pub results: PathBuf,
    pub precommand: Option<String>,
    pub time_format: TimeFormat,
    pub interval: Duration,
    /// How this tool was launched, recorded verbatim.
    pub invocation: String,
}

/// Runs a full benchmarking session: snapshot, precommand, samplers around
/// the benchmark itself. The benchmark's own exit status is reported back
/// but never treated as an error.
pub async fn run_session(config: &SessionConfig) -> Result<RunOutcome> {
    prepare_results_dir(&config.results)?;
    info!(results = %config.results.display(), "results directory created");

    capture_system_snapshot(&config.results).await?;

    if let Some(precommand) = &config.precommand {
        info!(command = %precommand, "running precommand");
        quick_run(precommand, config.results.join(PRECOMMAND_FILE)).await?;
    }

    record_invocation(&config.results, &config.invocation).await?;

    let mut collector = Collector::new(config.interval, config.time_format.clone());
    for (command, file) in SAMPLED_METRICS {
        collector.add(command, config.results.join(file))?;
    }
    if let Err(e) = collector.start() {
        let _ = collector.stop().await;
        return Err(e);
    }
    info!(interval = ?config.interval, samplers = collector.len(), "sampling started");

    let benchmark = run_benchmark(config).await;
    let sampling = collector.stop().await;
    info!("sampling stopped");

    let outcome = benchmark?;
    sampling?;
    Ok(outcome)
}

/// Refuses to touch a results directory that already exists.
pub fn prepare_results_dir(results: &Path) -> Result<()> {
    if results.exists() {
        return Err(RecorderError::ResultsExist(results.to_path_buf()));
    }
    create_all(results, false).map_err(|source| RecorderError::ResultsDir {
        path: results.to_path_buf(),
        source,
    })
}

pub async fn capture_system_snapshot(results: &Path) -> Result<()> {
    for (command, file) in SYSTEM_SNAPSHOT {
        quick_run(command, results.join(file)).await?;
    }
    Ok(())
}

pub async fn record_invocation(results: &Path, invocation: &str) -> Result<()> {
    let path = results.join(INVOCATION_FILE);
    tokio::fs::write(&path, format!("{invocation}\n"))
        .await
        .map_err(|e| RecorderError::io(format!("failed to write {}", path.display()), e))
}

// Children sit in their own process groups, so Ctrl-C is relayed here as a
// stop of the benchmark runner; the session then winds down normally.
async fn run_benchmark(config: &SessionConfig) -> Result<RunOutcome> {
    let mut runner = LineRunner::new(
        config.command.as_str(),
        config.results.join(OUTPUT_FILE),
        config.time_format.clone(),
        true,
    );
    runner.start()?;
    info!(command = %config.command, "benchmark started");

    let stop = runner.stop_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping benchmark");
            stop.cancel();
        }
    });

    let outcome = runner.join().await;
    interrupt.abort();

    if let Ok(outcome) = &outcome {
        match outcome.status {
            Some(status) => info!(%status, lines = outcome.lines, "benchmark finished"),
            None => warn!(lines = outcome.lines, "benchmark stopped before it finished"),
        }
    }
    outcome
}
