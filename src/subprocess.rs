//! External command wrapper utilities
//!
//! Transcoding (`ffmpeg`, `ffprobe`) and PDF encryption (`qpdf`) shell out to
//! system binaries. Each invocation is a child process owned by the caller until
//! it exits. A wall-clock timeout or a fired cancellation token kills it.
//!
//! Secrets never go on the command line. [`ExternalCommand::secret_args`]
//! writes them to a private `@argfile` that lives only as long as the command.

use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Diagnostic output kept per stream. Older bytes are dropped first.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0} not found in system PATH")]
    NotInstalled(String),

    #[error("{program} exited with {status}: {stderr}")]
    ExecutionFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a successful invocation.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct ExternalCommand {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
    success_codes: Vec<i32>,
    argfiles: Vec<TempPath>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            success_codes: vec![0],
            argfiles: Vec::new(),
        }
    }

    /// ffmpeg-style `-i <path>` input.
    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push("-i".into());
        self.args.push(path.as_ref().as_os_str().to_owned());
        self
    }

    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push(path.as_ref().as_os_str().to_owned());
        self
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(OsString::from));
        self
    }

    /// Pass `args` through an `@argfile` (one argument per line) created in `dir`.
    ///
    /// Only the file's path reaches argv and the logs. The file is owner-only
    /// and removed when the command is dropped.
    pub fn secret_args(mut self, dir: &Path, args: &[&str]) -> Result<Self, CommandError> {
        if args.iter().any(|a| a.contains(['\n', '\r'])) {
            return Err(CommandError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "argument file entries cannot contain line breaks",
            )));
        }
        let mut file = tempfile::Builder::new()
            .prefix(".args-")
            .tempfile_in(dir)?;
        for arg in args {
            writeln!(file, "{}", arg)?;
        }
        file.flush()?;

        let path = file.into_temp_path();
        let mut reference = OsString::from("@");
        reference.push(path.as_os_str());
        self.args.push(reference);
        self.argfiles.push(path);
        Ok(self)
    }

    /// Arguments as they appear in argv and in the debug log.
    pub fn logged_args(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    /// Extra exit codes that still count as success (qpdf exits 3 on warnings).
    pub fn success_codes(mut self, codes: &[i32]) -> Self {
        self.success_codes.extend_from_slice(codes);
        self
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Run to completion, killing the child on timeout or cancellation.
    pub async fn execute(self, cancel: &CancellationToken) -> Result<CommandOutput, CommandError> {
        let program = self.program_name();
        debug!(program = %program, args = ?self.logged_args(), "spawning external command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CommandError::NotInstalled(program.clone()),
                _ => CommandError::Io(e),
            })?;

        let stdout = tokio::spawn(drain(child.stdout.take()));
        let stderr = tokio::spawn(drain(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = tokio::time::sleep(self.timeout) => {
                terminate(&mut child, &program).await;
                return Err(CommandError::TimedOut { program, timeout: self.timeout });
            }
            _ = cancel.cancelled() => {
                terminate(&mut child, &program).await;
                return Err(CommandError::Cancelled { program });
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        let succeeded = status.code().is_some_and(|code| self.success_codes.contains(&code));
        if !succeeded {
            return Err(CommandError::ExecutionFailed {
                program,
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput { status, stdout, stderr })
    }
}

async fn terminate(child: &mut Child, program: &str) {
    // kill() also reaps the child
    if let Err(e) = child.kill().await {
        warn!(program = %program, error = %e, "failed to kill external command");
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                captured.extend_from_slice(&chunk[..n]);
                if captured.len() > MAX_CAPTURE_BYTES {
                    let excess = captured.len() - MAX_CAPTURE_BYTES;
                    captured.drain(..excess);
                }
            }
        }
    }
    captured
}

/// Check whether a binary can be launched (`<program> <version_flag>`).
pub fn is_installed(program: impl AsRef<OsStr>, version_flag: &str) -> bool {
    std::process::Command::new(program)
        .arg(version_flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_reports_not_installed() {
        let err = ExternalCommand::new("definitely-not-a-real-binary-xyz", Duration::from_secs(5))
            .execute(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NotInstalled(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_captures_stderr() {
        let err = ExternalCommand::new("sh", Duration::from_secs(5))
            .args(&["-c", "echo boom >&2; exit 3"])
            .execute(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CommandError::ExecutionFailed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_child() {
        let started = std::time::Instant::now();
        let err = ExternalCommand::new("sleep", Duration::from_millis(200))
            .arg("30")
            .execute(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_child() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = ExternalCommand::new("sleep", Duration::from_secs(30))
            .arg("30")
            .execute(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extra_success_codes_are_accepted() {
        let out = ExternalCommand::new("sh", Duration::from_secs(5))
            .args(&["-c", "exit 3"])
            .success_codes(&[3])
            .execute(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secret_args_stay_out_of_argv_and_logs() {
        let logs = LogBuffer::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let cmd = ExternalCommand::new("sh", Duration::from_secs(5))
            .args(&["-c", "cat \"${0#@}\""])
            .secret_args(dir.path(), &["--password=hunter2", "--decrypt"])
            .unwrap();
        assert!(cmd.logged_args().iter().all(|a| !a.contains("hunter2")));

        let out = cmd.execute(&CancellationToken::new()).await.unwrap();
        assert_eq!(out.stdout, b"--password=hunter2\n--decrypt\n");

        let logged = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("spawning external command"));
        assert!(!logged.contains("hunter2"));

        // the argument file goes away with the command
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn secret_args_reject_line_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let result = ExternalCommand::new("qpdf", Duration::from_secs(5)).secret_args(dir.path(), &["a\nb"]);
        assert!(matches!(result, Err(CommandError::Io(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_is_captured() {
        let out = ExternalCommand::new("sh", Duration::from_secs(5))
            .args(&["-c", "printf hello"])
            .execute(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, b"hello");
    }
}
