use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RecorderError, Result};
use crate::timestamp::TimeFormat;

/// What a finished runner observed.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub lines: usize,
    /// `None` when the child was killed by `stop`.
    pub status: Option<ExitStatus>,
}

impl RunOutcome {
    pub fn stopped(&self) -> bool {
        self.status.is_none()
    }
}

/// Runs one shell command and writes its merged stdout/stderr to a file,
/// one timestamped line at a time.
pub struct LineRunner {
    command: String,
    output: PathBuf,
    format: TimeFormat,
    echo: bool,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<RunOutcome>>>,
    started: bool,
}

impl LineRunner {
    pub fn new(
        command: impl Into<String>,
        output: impl Into<PathBuf>,
        format: TimeFormat,
        echo: bool,
    ) -> Self {
        LineRunner {
            command: command.into(),
            output: output.into(),
            format,
            echo,
            cancel: CancellationToken::new(),
            handle: None,
            started: false,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Opens (truncates) the output file, spawns the command under `sh -c`
    /// and hands both to a background task. Must be called inside a tokio
    /// runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(RecorderError::RunnerStarted(self.command.clone()));
        }
        self.started = true;

        let file = std::fs::File::create(&self.output).map_err(|e| {
            RecorderError::io(format!("failed to create {}", self.output.display()), e)
        })?;
        let sink = LineSink {
            file: File::from_std(file),
            format: self.format.clone(),
            stdout: self.echo.then(tokio::io::stdout),
        };

        let (tx, rx) = pipe::pipe().map_err(|e| RecorderError::io("failed to create pipe", e))?;
        let write_end = tx
            .into_blocking_fd()
            .map_err(|e| RecorderError::io("failed to configure pipe", e))?;
        let child = spawn_shell(&self.command, write_end)?;
        debug!(command = %self.command, pid = ?child.id(), output = %self.output.display(), "runner started");

        let cancel = self.cancel.clone();
        let command = self.command.clone();
        self.handle = Some(tokio::spawn(async move {
            supervise(command, child, rx, sink, cancel).await
        }));
        Ok(())
    }

    /// Signals the runner to stop. A child still running is killed; this
    /// does not wait for that to happen.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// A token that stops this runner when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the runner task: child gone and output file closed.
    pub async fn join(&mut self) -> Result<RunOutcome> {
        match self.handle.take() {
            Some(handle) => handle.await?,
            None => Err(RecorderError::RunnerNotStarted(self.command.clone())),
        }
    }

    pub async fn run(mut self) -> Result<RunOutcome> {
        self.start()?;
        self.join().await
    }
}

/// One-shot capture: no prefix, no echo, runs to completion.
pub async fn quick_run(command: &str, output: impl Into<PathBuf>) -> Result<RunOutcome> {
    LineRunner::new(command, output, TimeFormat::empty(), false)
        .run()
        .await
}

// stdout and stderr share the pipe's write end so the stream keeps the
// order the process wrote it in. The Command (and its copies of the write
// end) is dropped when this returns, leaving the child as the only writer.
fn spawn_shell(command: &str, write_end: OwnedFd) -> Result<Child> {
    let stderr = write_end
        .try_clone()
        .map_err(|e| RecorderError::io("failed to duplicate pipe", e))?;

    let mut shell = std::process::Command::new("sh");
    shell
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(write_end)
        .stderr(stderr)
        .process_group(0);

    Command::from(shell)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| RecorderError::Spawn {
            command: command.to_string(),
            source,
        })
}

struct LineSink {
    file: File,
    format: TimeFormat,
    stdout: Option<Stdout>,
}

impl LineSink {
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        let mut entry = self.format.render().into_bytes();
        entry.extend_from_slice(line);
        if !entry.ends_with(b"\n") {
            entry.push(b'\n');
        }
        self.raw_write(&entry).await
    }

    async fn raw_write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await?;
        if let Some(stdout) = self.stdout.as_mut() {
            stdout.write_all(data).await?;
            stdout.flush().await?;
        }
        Ok(())
    }

    // trailing newline is written even when nothing was read
    async fn finish(mut self) -> std::io::Result<()> {
        self.raw_write(b"\n").await?;
        self.file.flush().await?;
        drop(self.file.into_std().await);
        Ok(())
    }
}

async fn supervise(
    command: String,
    mut child: Child,
    rx: pipe::Receiver,
    mut sink: LineSink,
    cancel: CancellationToken,
) -> Result<RunOutcome> {
    let mut outcome = RunOutcome::default();
    let pumped = pump(&mut child, rx, &mut sink, &cancel, &mut outcome).await;

    if outcome.status.is_none() {
        terminate(&mut child).await;
    }
    let finished = sink.finish().await;

    debug!(command = %command, lines = outcome.lines, status = ?outcome.status, stopped = outcome.stopped(), "runner finished");
    pumped?;
    finished.map_err(|e| RecorderError::io(format!("failed to close output of `{command}`"), e))?;
    Ok(outcome)
}

// Reads until the stream is exhausted and the child has exited, or until
// cancelled. Both the read and the wait are raced against the token.
async fn pump(
    child: &mut Child,
    rx: pipe::Receiver,
    sink: &mut LineSink,
    cancel: &CancellationToken,
    outcome: &mut RunOutcome,
) -> Result<()> {
    let mut reader = BufReader::new(rx);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_until(b'\n', &mut line) => read,
        };
        let read = read.map_err(|e| RecorderError::io("failed to read child output", e))?;
        if read == 0 {
            break;
        }
        sink.write_line(&line)
            .await
            .map_err(|e| RecorderError::io("failed to write output", e))?;
        outcome.lines += 1;
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        status = child.wait() => {
            let status = status.map_err(|e| RecorderError::io("failed to wait for child", e))?;
            outcome.status = Some(status);
        }
    }
    Ok(())
}

// SIGKILL to the whole process group, so a sampler's `sleep` dies with its
// shell. No graceful request is sent first.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %e, "killpg failed, killing shell only");
            let _ = child.start_kill();
        }
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn plain(command: &str, output: &Path) -> LineRunner {
        LineRunner::new(command, output, TimeFormat::new("ts ").unwrap(), false)
    }

    #[tokio::test]
    async fn prefixes_each_line_and_appends_blank_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");

        let outcome = plain("echo one; echo two", &path).run().await.unwrap();

        assert_eq!(outcome.lines, 2);
        assert!(!outcome.stopped());
        assert!(outcome.status.unwrap().success());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ts one\nts two\n\n");
    }

    #[tokio::test]
    async fn merges_stderr_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");

        plain("echo out; echo err >&2; echo out2", &path)
            .run()
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "ts out\nts err\nts out2\n\n"
        );
    }

    #[tokio::test]
    async fn failing_command_is_captured_not_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");

        let outcome = plain("no-such-binary-here; exit 3", &path)
            .run()
            .await
            .unwrap();

        assert_eq!(outcome.status.unwrap().code(), Some(3));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("no-such-binary-here"), "got {text:?}");
        assert!(text.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn silent_command_still_gets_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");

        let outcome = plain("true", &path).run().await.unwrap();

        assert_eq!(outcome.lines, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "\n");
    }

    #[tokio::test]
    async fn unterminated_last_line_is_completed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");

        plain("printf 'a\\nb'", &path).run().await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ts a\nts b\n\n");
    }

    #[tokio::test]
    async fn stop_kills_long_running_child() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");
        let mut runner = plain("echo started; sleep 30", &path);

        runner.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        runner.stop();
        let outcome = tokio::time::timeout(Duration::from_secs(5), runner.join())
            .await
            .expect("stopped runner should finish promptly")
            .unwrap();

        assert!(outcome.stopped());
        assert!(outcome.status.is_none());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ts started\n\n");
    }

    #[tokio::test]
    async fn waits_for_exit_after_output_closes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");

        let outcome = plain("echo a; exec >/dev/null 2>&1; sleep 1", &path)
            .run()
            .await
            .unwrap();

        assert!(outcome.status.unwrap().success());
        assert_eq!(outcome.lines, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ts a\n\n");
    }

    #[tokio::test]
    async fn stop_after_output_closes_kills_child() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");
        let mut runner = plain("exec >/dev/null 2>&1; sleep 30", &path);

        runner.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        runner.stop();
        let outcome = tokio::time::timeout(Duration::from_secs(5), runner.join())
            .await
            .expect("stopped runner should finish promptly")
            .unwrap();

        assert!(outcome.stopped());
        assert_eq!(outcome.lines, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "\n");
    }

    #[tokio::test]
    async fn output_is_truncated_on_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("output");
        std::fs::write(&path, "stale contents\n").unwrap();

        quick_run("echo fresh", &path).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n\n");
    }

    #[tokio::test]
    async fn join_without_start_is_an_error() {
        let dir = tempdir().unwrap();
        let mut runner = plain("true", &dir.path().join("output"));

        assert!(matches!(
            runner.join().await,
            Err(RecorderError::RunnerNotStarted(_))
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let mut runner = plain("true", &dir.path().join("output"));

        runner.start().unwrap();
        assert!(matches!(runner.start(), Err(RecorderError::RunnerStarted(_))));
        runner.join().await.unwrap();
    }
}
