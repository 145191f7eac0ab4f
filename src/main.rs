use std::process::ExitCode;

use anyhow::Context;
use bench_recorder::cli::Cli;
use bench_recorder::harness::run_session;
use bench_recorder::logging::init_logging;
use bench_recorder::RecorderError;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_logging("info");

    let argv: Vec<_> = std::env::args_os().collect();
    let invocation = argv
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    let cli = Cli::parse_invocation(argv);
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let config = cli.into_config(cwd, invocation);

    match run_session(&config).await {
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(e @ RecorderError::ResultsExist(_)) => {
            println!("{e}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e).context("benchmark session failed"),
    }
}
