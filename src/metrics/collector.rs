use futures::future::join_all;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RecorderError, Result};
use crate::runner::LineRunner;
use crate::timestamp::TimeFormat;

/// Samples a fixed set of metric commands every `interval`, each into its
/// own file, until stopped.
pub struct Collector {
    interval: Duration,
    format: TimeFormat,
    samplers: Vec<LineRunner>,
    started: bool,
}

impl Collector {
    pub fn new(interval: Duration, format: TimeFormat) -> Self {
        Collector {
            interval,
            format,
            samplers: Vec::new(),
            started: false,
        }
    }

    pub fn add(&mut self, command: &str, output: impl Into<PathBuf>) -> Result<()> {
        if self.started {
            return Err(RecorderError::CollectorStarted);
        }
        let looped = sampling_loop(command, self.interval);
        self.samplers
            .push(LineRunner::new(looped, output, self.format.clone(), false));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Launches every sampler and returns without waiting on them. If one
    /// fails to launch, the ones already running are left for `stop`.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(RecorderError::CollectorStarted);
        }
        self.started = true;
        for sampler in self.samplers.iter_mut() {
            sampler.start()?;
        }
        debug!(samplers = self.samplers.len(), interval = ?self.interval, "collector started");
        Ok(())
    }

    /// Stops every sampler, then waits for all of them. Every runner is
    /// joined even if some fail; the first failure is returned.
    pub async fn stop(&mut self) -> Result<()> {
        for sampler in self.samplers.iter() {
            sampler.stop();
        }

        let results = join_all(self.samplers.iter_mut().map(|sampler| async move {
            let result = sampler.join().await;
            (sampler.command().to_string(), result)
        }))
        .await;

        let mut first_error = None;
        for (command, result) in results {
            match result {
                Ok(outcome) => debug!(command = %command, lines = outcome.lines, "sampler stopped"),
                Err(RecorderError::RunnerNotStarted(_)) => {}
                Err(e) => {
                    warn!(command = %command, error = %e, "sampler failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn sampling_loop(command: &str, interval: Duration) -> String {
    format!(
        "while true; do {command}; sleep {}; done",
        interval.as_secs()
    )
}
