use std::{
    collections::VecDeque,
    fmt::Display,
    fs::{OpenOptions, create_dir_all},
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// How many lines of each output stream are kept around for diagnostics.
const CAPTURED_LINES_LIMIT: usize = 256;

/// How long to wait for the output readers to reach the end of the streams once the process has
/// exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A wrapper around a child process which drains its stdout and stderr in the background so that a
/// chatty process can never block on a full pipe.
///
/// The tail of both streams is kept in memory and, optionally, mirrored into log files. The child
/// is killed when the wrapper is dropped.
#[derive(Debug)]
pub struct Process {
    /// The handle of the child process.
    child: Child,

    /// The tail of the stdout and stderr streams.
    output: Arc<Mutex<OutputBuffer>>,

    /// The tasks reading stdout and stderr.
    readers: Vec<JoinHandle<()>>,
}

impl Process {
    /// Spawns the command built by `command_building_callback`.
    ///
    /// Must be called from within a tokio runtime. When a `logs_directory` is given the output is
    /// also written to `<prefix>_stdout.log` and `<prefix>_stderr.log` in it.
    pub fn new(
        log_file_prefix: impl Into<Option<&'static str>>,
        logs_directory: Option<&Path>,
        binary_path: impl AsRef<Path>,
        command_building_callback: impl FnOnce(&mut Command),
    ) -> io::Result<Self> {
        let (stdout_logs_file, stderr_logs_file) = match logs_directory {
            Some(logs_directory) => {
                let (stdout_file_name, stderr_file_name) = match log_file_prefix.into() {
                    Some(prefix) => (
                        format!("{prefix}_stdout.log"),
                        format!("{prefix}_stderr.log"),
                    ),
                    None => ("stdout.log".to_string(), "stderr.log".to_string()),
                };
                create_dir_all(logs_directory)?;
                (
                    Some(open_log_file(&logs_directory.join(stdout_file_name))?),
                    Some(open_log_file(&logs_directory.join(stderr_file_name))?),
                )
            }
            None => (None, None),
        };

        let mut command = Command::new(binary_path.as_ref());
        command_building_callback(&mut command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let output = Arc::new(Mutex::new(OutputBuffer::default()));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("The child's stdout is not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("The child's stderr is not piped"))?;

        let readers = vec![
            tokio::spawn(capture_stream(
                stdout,
                OutputStream::Stdout,
                output.clone(),
                stdout_logs_file,
            )),
            tokio::spawn(capture_stream(
                stderr,
                OutputStream::Stderr,
                output.clone(),
                stderr_logs_file,
            )),
        ];

        Ok(Self {
            child,
            output,
            readers,
        })
    }

    /// The OS identifier of the process; `None` once it has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Returns the exit status if the process has exited, without blocking.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Asks the process to exit with `SIGTERM`.
    #[cfg(unix)]
    pub fn terminate(&mut self) -> io::Result<()> {
        use nix::{
            sys::signal::{self, Signal},
            unistd::Pid,
        };

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }

    /// Asks the process to exit. There is no graceful signal outside of unix so this kills it.
    #[cfg(not(unix))]
    pub fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    /// Forcefully kills the process (`SIGKILL` on unix).
    pub fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    /// Stops the process: a graceful termination first and a kill if it's still around after the
    /// grace period. Never signals a process which has already exited and never fails; problems
    /// are logged.
    pub async fn shutdown(&mut self, grace_period: Duration) -> Option<ExitStatus> {
        match self.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "Process already exited");
                self.drain_output().await;
                return Some(status);
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "Failed to check whether the process is still running"),
        }

        if let Err(error) = self.terminate() {
            warn!(%error, "Failed to send the termination signal");
        }

        let status = match tokio::time::timeout(grace_period, self.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(error)) => {
                warn!(%error, "Failed to wait for the process to exit");
                self.kill_and_wait().await
            }
            Err(_) => {
                warn!(
                    ?grace_period,
                    "Process didn't exit within the grace period, killing it"
                );
                self.kill_and_wait().await
            }
        };

        self.drain_output().await;
        status
    }

    /// Kills the process and reaps it.
    pub async fn kill_and_wait(&mut self) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.try_wait() {
            return Some(status);
        }
        if let Err(error) = self.kill() {
            warn!(%error, "Failed to kill the process");
        }
        match self.wait().await {
            Ok(status) => Some(status),
            Err(error) => {
                warn!(%error, "Failed to reap the killed process");
                None
            }
        }
    }

    /// Waits a short while for the output readers to reach the end of the streams. Only useful
    /// once the process has exited.
    pub async fn drain_output(&mut self) {
        for reader in self.readers.iter_mut() {
            if reader.is_finished() {
                continue;
            }
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Output reader didn't finish in time");
            }
        }
    }

    /// A snapshot of the tail of the output captured so far.
    pub fn captured_output(&self) -> CapturedOutput {
        let output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        CapturedOutput {
            stdout: output.stdout.iter().cloned().collect(),
            stderr: output.stderr.iter().cloned().collect(),
        }
    }
}

/// The tail of the output of a process, attached to errors for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Whether any captured line contains `needle`, ignoring ASCII case.
    pub fn contains(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.stdout
            .iter()
            .chain(self.stderr.iter())
            .any(|line| line.to_ascii_lowercase().contains(&needle))
    }
}

impl Display for CapturedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("(no output captured)");
        }
        writeln!(f, "stdout:")?;
        for line in self.stdout.iter() {
            writeln!(f, "  {line}")?;
        }
        write!(f, "stderr:")?;
        for line in self.stderr.iter() {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct OutputBuffer {
    stdout: VecDeque<String>,
    stderr: VecDeque<String>,
}

impl OutputBuffer {
    fn push(&mut self, stream: OutputStream, line: String) {
        let lines = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        if lines.len() == CAPTURED_LINES_LIMIT {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

fn open_log_file(path: &Path) -> io::Result<tokio::fs::File> {
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(path)
        .map(tokio::fs::File::from_std)
}

async fn capture_stream(
    reader: impl AsyncRead + Unpin,
    stream: OutputStream,
    output: Arc<Mutex<OutputBuffer>>,
    mut logs_file: Option<tokio::fs::File>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                debug!(?stream, %error, "Stopped reading the process output");
                break;
            }
        };
        debug!(?stream, "{line}");

        if let Some(file) = logs_file.as_mut() {
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await
            };
            if let Err(error) = written.await {
                warn!(?stream, %error, "Failed to write to the logs file, no longer mirroring");
                logs_file = None;
            }
        }

        output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stream, line);
    }

    if let Some(mut file) = logs_file {
        let _ = file.flush().await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use temp_dir::TempDir;

    use super::*;

    fn shell(script: &'static str) -> io::Result<Process> {
        Process::new("test", None, "/bin/sh", |command| {
            command.arg("-c").arg(script);
        })
    }

    #[tokio::test]
    async fn output_of_both_streams_is_captured() {
        // Arrange
        let mut process = shell("echo out-line; echo err-line >&2").unwrap();

        // Act
        let status = process.wait().await.unwrap();
        process.drain_output().await;
        let output = process.captured_output();

        // Assert
        assert!(status.success());
        assert_eq!(output.stdout, vec!["out-line".to_string()]);
        assert_eq!(output.stderr, vec!["err-line".to_string()]);
        assert!(output.contains("ERR-LINE"));
    }

    #[tokio::test]
    async fn only_the_tail_of_a_chatty_process_is_kept() {
        // Arrange
        let mut process = shell("i=0; while [ $i -lt 1000 ]; do echo line-$i; i=$((i+1)); done")
            .unwrap();

        // Act
        process.wait().await.unwrap();
        process.drain_output().await;
        let output = process.captured_output();

        // Assert
        assert_eq!(output.stdout.len(), CAPTURED_LINES_LIMIT);
        assert_eq!(output.stdout.last().map(String::as_str), Some("line-999"));
    }

    #[tokio::test]
    async fn output_is_mirrored_into_log_files() {
        // Arrange
        let temp_dir = TempDir::new().unwrap();
        let logs_directory = temp_dir.path().join("logs");

        // Act
        let mut process = Process::new("ganache", Some(&logs_directory), "/bin/sh", |command| {
            command.arg("-c").arg("echo hello; echo oops >&2");
        })
        .unwrap();
        process.wait().await.unwrap();
        process.drain_output().await;

        // Assert
        let stdout = std::fs::read_to_string(logs_directory.join("ganache_stdout.log")).unwrap();
        let stderr = std::fs::read_to_string(logs_directory.join("ganache_stderr.log")).unwrap();
        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "oops\n");
    }

    #[tokio::test]
    async fn shutdown_terminates_gracefully() {
        // Arrange
        let mut process = shell("sleep 30").unwrap();

        // Act
        let status = process.shutdown(Duration::from_secs(5)).await;

        // Assert
        let status = status.expect("The process should have been reaped");
        assert!(!status.success());
        assert!(process.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn shutdown_kills_a_process_ignoring_the_termination_signal() {
        // Arrange
        let mut process = shell("trap '' TERM; echo trapped; while true; do sleep 1; done").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Act
        let status = process.shutdown(Duration::from_millis(300)).await;

        // Assert
        assert!(status.is_some());
        assert!(process.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn shutdown_of_an_exited_process_is_a_no_op() {
        // Arrange
        let mut process = shell("exit 3").unwrap();
        process.wait().await.unwrap();

        // Act
        let status = process.shutdown(Duration::from_secs(1)).await;

        // Assert
        assert_eq!(status.and_then(|status| status.code()), Some(3));
    }
}
