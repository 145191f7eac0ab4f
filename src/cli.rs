use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::harness::SessionConfig;
use crate::timestamp::{TimeFormat, DEFAULT_TIME_FORMAT};

#[derive(Parser, Debug)]
#[command(
    name = "bench-recorder",
    version = env!("CARGO_PKG_VERSION"),
    about = "Run a benchmark while sampling system metrics into a results directory"
)]
pub struct Cli {
    /// A command to run once before the benchmark starts
    #[arg(long)]
    pub precommand: Option<String>,

    /// The directory in which to store the results; must not exist yet
    #[arg(long)]
    pub results: PathBuf,

    /// strftime format prefixed to every captured line
    #[arg(long, env = "BENCH_RECORDER_TIMEFORMAT", default_value = DEFAULT_TIME_FORMAT)]
    pub timeformat: TimeFormat,

    /// Seconds between metric samples
    #[arg(
        long,
        env = "BENCH_RECORDER_INTERVAL",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval: u64,

    /// The benchmark command and its arguments
    #[arg(long, required = true, num_args = 1.., allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Parses argv, letting `--command` take the rest of the line.
    pub fn parse_invocation<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Cli::parse_from(reorder_args(args.into_iter().map(Into::into).collect()))
    }

    pub fn into_config(self, cwd: PathBuf, invocation: String) -> SessionConfig {
        SessionConfig {
            command: self.command.join(" "),
            results: cwd.join(self.results),
            precommand: self.precommand,
            time_format: self.timeformat,
            interval: Duration::from_secs(self.interval),
            invocation,
        }
    }
}

const VALUE_OPTIONS: &[&str] = &["--results", "--precommand", "--timeformat", "--interval"];

/// Moves the words after `--command` to the end of argv so clap can take
/// them verbatim. Our own value options found among them are pulled back
/// out until a `--` is seen, after which every word is the command's. A `--`
/// directly after `--command` is only a marker and is dropped; any later
/// one is part of the command.
pub fn reorder_args(args: Vec<OsString>) -> Vec<OsString> {
    let mut args = args.into_iter();
    let mut tool = Vec::new();
    let mut command = Vec::new();
    let mut in_command = false;
    let mut verbatim = false;

    while let Some(arg) = args.next() {
        if !in_command {
            if arg == "--command" {
                in_command = true;
            } else {
                tool.push(arg);
            }
            continue;
        }
        if verbatim {
            command.push(arg);
            continue;
        }
        if arg == "--" {
            verbatim = true;
            if !command.is_empty() {
                command.push(arg);
            }
            continue;
        }
        let text = arg.to_string_lossy();
        if VALUE_OPTIONS.contains(&text.as_ref()) {
            tool.push(arg);
            if let Some(value) = args.next() {
                tool.push(value);
            }
        } else if VALUE_OPTIONS
            .iter()
            .any(|opt| text.starts_with(&format!("{opt}=")))
        {
            tool.push(arg);
        } else {
            command.push(arg);
        }
    }

    if in_command {
        tool.push("--command".into());
        tool.extend(command);
    }
    tool
}
