//! Shell command execution.
//!
//! Each command runs through `sh -c` in the test directory with its stdio
//! redirected as the step's profile describes. Output limits are enforced by
//! pumping the child's pipes through a [`LimitingWriter`]; time limits wrap the
//! wait for exit in a single timeout, so a command either exits or is killed,
//! never both.

use crate::limit::LimitingWriter;
use crate::results::TestResult;
use crate::schema::Profile;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Interpreter used for every command.
const SHELL: &str = "sh";

/// How long to keep draining output pipes once the process is gone.
///
/// A killed shell can leave grandchildren holding the pipe open.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const PUMP_BUFFER_SIZE: usize = 8 * 1024;

/// Chunks queued between a pipe reader and its blocking writer.
const PUMP_QUEUE_DEPTH: usize = 16;

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The process exited on its own (or was killed by someone else).
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process was killed for exceeding its time limit.
    TimedOut,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited { code: Some(0), .. })
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited { code: Some(code), .. } => write!(f, "exit status {code}"),
            ExitOutcome::Exited {
                signal: Some(signal),
                ..
            } => write!(f, "killed by signal {signal}"),
            ExitOutcome::Exited { .. } => write!(f, "unknown exit status"),
            ExitOutcome::TimedOut => write!(f, "killed after time limit"),
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ExitOutcome::Exited {
            code: status.code(),
            signal,
        }
    }
}

/// Stdio and limits for the commands of one step.
#[derive(Debug, Clone, Copy)]
pub struct CommandIo<'a> {
    /// Working directory; redirection file names are relative to it.
    pub dir: &'a Path,
    /// Files concatenated into stdin. `None` inherits the harness's stdin.
    pub stdin: Option<&'a [String]>,
    /// File appended to with stdout. `None` inherits the harness's stdout.
    pub stdout: Option<&'a str>,
    /// File appended to with stderr. `None` inherits the harness's stderr.
    pub stderr: Option<&'a str>,
    /// Byte budget for each output stream.
    pub limit_output: Option<u64>,
    /// Deadline for each command.
    pub max_time: Option<Duration>,
}

impl<'a> CommandIo<'a> {
    /// Stdio configuration from a resolved step.
    ///
    /// Non-positive limits are ignored, as are time limits that do not fit in
    /// a [`Duration`].
    pub fn from_profile(dir: &'a Path, profile: &'a Profile) -> Self {
        Self {
            dir,
            stdin: profile.stdin.as_deref(),
            stdout: profile.stdout.as_deref(),
            stderr: profile.stderr.as_deref(),
            limit_output: profile
                .limit_output
                .filter(|&n| n > 0)
                .and_then(|n| u64::try_from(n).ok()),
            max_time: profile
                .max_time_per_command
                .filter(|secs| *secs > 0.0)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        }
    }
}

/// What happened to one command.
#[derive(Debug, Default)]
pub struct CommandReport {
    /// `None` when the process could not be started or waited for.
    pub outcome: Option<ExitOutcome>,
    pub limit_reached: bool,
    pub timed_out: bool,
}

/// Run `command` and wait for it to exit or be killed.
///
/// Problems are recorded on `result`: unopenable stdin files and spawn errors
/// are failures, unopenable output files are informational, hitting an output
/// limit is a warning. A killed command is appended to the result's
/// exceeded-time list.
pub async fn run_command(
    command: &str,
    setup: CommandIo<'_>,
    result: &mut TestResult,
) -> CommandReport {
    let mut report = CommandReport::default();
    tracing::info!(test = %result.name(), %command, "running command");

    let stdin_files = setup
        .stdin
        .map(|names| open_stdin_files(setup.dir, names, result));
    let stdout = Output::open(setup.dir, setup.stdout, HostStream::Stdout, result)
        .attach(setup.limit_output);
    let stderr = Output::open(setup.dir, setup.stderr, HostStream::Stderr, result)
        .attach(setup.limit_output);

    let mut cmd = Command::new(SHELL);
    cmd.arg("-c")
        .arg(command)
        .current_dir(setup.dir)
        .stdin(if stdin_files.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        })
        .stdout(stdout.stdio)
        .stderr(stderr.stdio)
        .kill_on_drop(true);
    // The shell leads its own group so a timeout reaches everything it started.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            result.fail(format!("Error running {command}: {e}"));
            return report;
        }
    };

    let stdin_task = child
        .stdin
        .take()
        .zip(stdin_files)
        .map(|(pipe, files)| tokio::spawn(feed_stdin(pipe, files)));
    let stdout_task = child
        .stdout
        .take()
        .zip(stdout.writer)
        .map(|(pipe, writer)| tokio::spawn(pump(pipe, writer)));
    let stderr_task = child
        .stderr
        .take()
        .zip(stderr.writer)
        .map(|(pipe, writer)| tokio::spawn(pump(pipe, writer)));

    match wait_with_deadline(&mut child, setup.max_time).await {
        Ok(Some(status)) => {
            let outcome = ExitOutcome::from(status);
            tracing::info!(test = %result.name(), %command, %outcome, "command finished");
            report.outcome = Some(outcome);
        }
        Ok(None) => {
            tracing::warn!(
                test = %result.name(),
                %command,
                "command exceeded its time limit; killed"
            );
            report.outcome = Some(ExitOutcome::TimedOut);
            report.timed_out = true;
            result.warn(format!("Command time limit reached: {command}"));
            result.exceeded_time_limit.push(command.to_string());
        }
        Err(e) => result.fail(format!("Error waiting for {command}: {e}")),
    }

    if let Some(task) = stdin_task {
        task.abort();
    }
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        drain(task, result.name()).await;
    }

    for flag in [stdout.reached, stderr.reached].into_iter().flatten() {
        if flag.load(Ordering::SeqCst) {
            report.limit_reached = true;
            result.warn("Output limit reached");
        }
    }
    if report.limit_reached {
        result.limit_reached = true;
    }

    report
}

/// Wait for the child, killing its whole process group if `deadline` passes first.
///
/// Returns `None` when the child was killed.
async fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Duration>,
) -> io::Result<Option<ExitStatus>> {
    let Some(limit) = deadline else {
        return child.wait().await.map(Some);
    };
    match timeout(limit, child.wait()).await {
        Ok(status) => status.map(Some),
        Err(_elapsed) => {
            kill_process_group(child);
            child.kill().await?;
            Ok(None)
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // A negative pid targets the group the child leads (`process_group(0)`).
    // SAFETY: `kill` takes no pointers; a stale group only yields ESRCH.
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, error = %io::Error::last_os_error(), "process group kill failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

fn open_stdin_files(
    dir: &Path,
    names: &[String],
    result: &mut TestResult,
) -> Vec<tokio::fs::File> {
    names
        .iter()
        .filter_map(|name| {
            let path = dir.join(name);
            match File::open(&path) {
                Ok(file) => Some(tokio::fs::File::from_std(file)),
                Err(e) => {
                    result.fail(format!("Unable to open file: {}: {e}", path.display()));
                    None
                }
            }
        })
        .collect()
}

/// Expose `files` as one continuous stream, read front to back.
fn concat(files: Vec<tokio::fs::File>) -> Box<dyn AsyncRead + Send + Unpin> {
    files.into_iter().fold(
        Box::new(tokio::io::empty()) as Box<dyn AsyncRead + Send + Unpin>,
        |stream, file| Box::new(stream.chain(file)),
    )
}

async fn feed_stdin(mut pipe: ChildStdin, files: Vec<tokio::fs::File>) {
    let mut stream = concat(files);
    // The child may exit without reading everything.
    let _ = tokio::io::copy(&mut stream, &mut pipe).await;
}

/// Copy a child's output pipe into a limited destination until either side gives out.
///
/// The destination is a blocking writer (a file or the host's stdio), so the
/// writes happen on the blocking pool and only the pipe reads stay on the runtime.
async fn pump<R>(mut pipe: R, writer: LimitingWriter<Box<dyn Write + Send>>)
where
    R: AsyncRead + Unpin,
{
    let (tx, rx) = mpsc::channel::<Vec<u8>>(PUMP_QUEUE_DEPTH);
    let sink = tokio::task::spawn_blocking(move || write_chunks(rx, writer));

    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if tx.send(buf[..n].to_vec()).await.is_err() {
            // The writer gave up, most likely on the output limit.
            break;
        }
    }
    drop(tx);
    let _ = sink.await;
}

fn write_chunks(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: LimitingWriter<Box<dyn Write + Send>>,
) {
    while let Some(chunk) = rx.blocking_recv() {
        if let Err(e) = writer.write_all(&chunk) {
            tracing::debug!(
                limit_reached = writer.limit_reached(),
                remaining = writer.remaining(),
                error = %e,
                "output stream closed"
            );
            break;
        }
    }
    let _ = writer.flush();
}

async fn drain(mut task: JoinHandle<()>, test: &str) {
    if timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
        tracing::debug!(%test, "output pipe still open after exit; abandoning it");
        task.abort();
    }
}

#[derive(Debug, Clone, Copy)]
enum HostStream {
    Stdout,
    Stderr,
}

/// Where one output stream of a command goes.
enum Output {
    Host(HostStream),
    File(File),
    Discard,
}

/// An output stream ready to hand to the child.
struct AttachedOutput {
    stdio: Stdio,
    /// Set when the stream goes through a pipe into a limiting writer.
    writer: Option<LimitingWriter<Box<dyn Write + Send>>>,
    reached: Option<Arc<AtomicBool>>,
}

impl Output {
    fn open(dir: &Path, name: Option<&str>, host: HostStream, result: &mut TestResult) -> Self {
        let Some(name) = name else {
            return Output::Host(host);
        };
        match OpenOptions::new()
            .append(true)
            .create(true)
            .open(dir.join(name))
        {
            Ok(file) => Output::File(file),
            Err(e) => {
                result.info(format!("Unable to open {name} for output: {e}"));
                Output::Discard
            }
        }
    }

    fn attach(self, limit: Option<u64>) -> AttachedOutput {
        match limit {
            Some(budget) => {
                let writer = LimitingWriter::new(self.into_writer(), budget);
                AttachedOutput {
                    stdio: Stdio::piped(),
                    reached: Some(writer.reached_flag()),
                    writer: Some(writer),
                }
            }
            None => AttachedOutput {
                stdio: match self {
                    Output::Host(_) => Stdio::inherit(),
                    Output::File(file) => Stdio::from(file),
                    Output::Discard => Stdio::null(),
                },
                writer: None,
                reached: None,
            },
        }
    }

    fn into_writer(self) -> Box<dyn Write + Send> {
        match self {
            Output::Host(HostStream::Stdout) => Box::new(io::stdout()),
            Output::Host(HostStream::Stderr) => Box::new(io::stderr()),
            Output::File(file) => Box::new(file),
            Output::Discard => Box::new(io::sink()),
        }
    }
}
