//! Child process runs with captured output.

use std::{error, fmt, io, path::PathBuf, process::Stdio, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
};

use crate::{
    fs::{DEFAULT_CAPACITY, TransferBuffer},
    log::debug,
    task::{Canceled, Task},
};

/// Default per-stream capture cap.
pub const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;

/// Descriptor for one process run.
#[derive(Debug, Clone)]
pub struct Run {
    program: String,
    args: Vec<String>,
    shell: bool,
    cwd: Option<PathBuf>,
    env: EnvVars,
    limit: Option<Duration>,
    max_output: usize,
}

/// Environment policy for a child process.
#[derive(Debug, Clone)]
pub enum EnvVars {
    /// Keep the parent environment as is.
    Inherit,
    /// Parent environment plus these entries.
    Extend(Vec<(String, String)>),
    /// Exactly these entries and nothing else.
    Replace(Vec<(String, String)>),
}

/// Captured output of a finished run, truncated at the configured cap.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub stdout: Bytes,
    pub stderr: Bytes,
}

impl Run {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shell: false,
            cwd: None,
            env: EnvVars::Inherit,
            limit: None,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, env: EnvVars) -> Self {
        self.env = env;
        self
    }

    /// Run through the platform shell instead of spawning the program
    /// directly.
    ///
    /// Program and arguments are joined with spaces into one command line;
    /// quoting is the caller's concern.
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    /// Kill the child and settle with [`Error::TimedOut`] after `limit`.
    pub fn limit(mut self, limit: Duration) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Per-stream capture cap, [`DEFAULT_MAX_OUTPUT`] unless set.
    pub fn max_output(mut self, max: usize) -> Self {
        self.max_output = max;
        self
    }
}

/// Run a child process to completion, capturing stdout and stderr.
///
/// Cancelling the returned task kills the child.
pub fn run(run: Run) -> Task<Output, Error> {
    Task::spawn(execute(run))
}

enum Waited {
    Exited(std::process::ExitStatus),
    TimedOut,
    Overflowed,
}

async fn execute(run: Run) -> Result<Output, Error> {
    debug!("run {} ({} args)", run.program, run.args.len());

    let mut command = if run.shell {
        let mut line = run.program.clone();
        for arg in &run.args {
            line.push(' ');
            line.push_str(arg);
        }
        let (sh, flag) = if cfg!(windows) { ("cmd", "/C") } else { ("/bin/sh", "-c") };
        let mut command = Command::new(sh);
        command.arg(flag).arg(line);
        command
    } else {
        let mut command = Command::new(&run.program);
        command.args(&run.args);
        command
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &run.cwd {
        command.current_dir(dir);
    }
    match &run.env {
        EnvVars::Inherit => {}
        EnvVars::Extend(pairs) => {
            command.envs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        EnvVars::Replace(pairs) => {
            command.env_clear();
            command.envs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
    }

    let mut child = command
        .spawn()
        .map_err(|err| Error::Spawn(err.to_string()))?;

    let cap = run.max_output;
    let out_read = read_capped(child.stdout.take(), cap);
    let err_read = read_capped(child.stderr.take(), cap);
    tokio::pin!(out_read, err_read);
    let mut out_done: Option<Captured> = None;
    let mut err_done: Option<Captured> = None;

    let limit = run.limit;
    let deadline = async move {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let waited = loop {
        tokio::select! {
            status = child.wait() => {
                break Waited::Exited(status.map_err(|err| Error::Unknown(err.to_string()))?);
            }
            () = &mut deadline => {
                debug!("run limit passed, killing child");
                reap(&mut child).await;
                break Waited::TimedOut;
            }
            captured = &mut out_read, if out_done.is_none() => {
                let captured = captured.map_err(|err| Error::Unknown(err.to_string()))?;
                let overflowed = captured.overflowed;
                out_done = Some(captured);
                if overflowed {
                    reap(&mut child).await;
                    break Waited::Overflowed;
                }
            }
            captured = &mut err_read, if err_done.is_none() => {
                let captured = captured.map_err(|err| Error::Unknown(err.to_string()))?;
                let overflowed = captured.overflowed;
                err_done = Some(captured);
                if overflowed {
                    reap(&mut child).await;
                    break Waited::Overflowed;
                }
            }
        }
    };

    // the child is gone either way, so the pipes drain to EOF
    let stdout = match out_done {
        Some(captured) => captured,
        None => out_read.await.map_err(|err| Error::Unknown(err.to_string()))?,
    };
    let stderr = match err_done {
        Some(captured) => captured,
        None => err_read.await.map_err(|err| Error::Unknown(err.to_string()))?,
    };

    let overflowed = stdout.overflowed || stderr.overflowed;
    let output = Output { stdout: stdout.data, stderr: stderr.data };
    match waited {
        Waited::TimedOut => Err(Error::TimedOut { output }),
        Waited::Overflowed => Err(Error::OutputOverflow { output }),
        Waited::Exited(_) if overflowed => Err(Error::OutputOverflow { output }),
        Waited::Exited(status) if status.success() => Ok(output),
        Waited::Exited(status) => Err(Error::Failed { code: status.code(), output }),
    }
}

async fn reap(child: &mut Child) {
    // start_kill fails when the child already exited, which is fine here
    let _ = child.start_kill();
    if let Err(_err) = child.wait().await {
        #[cfg(feature = "log")]
        log::error!("failed to reap child: {_err}");
    }
}

struct Captured {
    data: Bytes,
    overflowed: bool,
}

/// Read a pipe until EOF or until `cap` bytes are kept.
///
/// Returns as soon as the cap is known to be exceeded so the caller can
/// kill the writer.
async fn read_capped<R>(io: Option<R>, cap: usize) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let Some(mut io) = io else {
        return Ok(Captured { data: Bytes::new(), overflowed: false });
    };

    let mut buffer = TransferBuffer::with_capacity(cap.min(DEFAULT_CAPACITY));
    loop {
        if buffer.is_full() {
            if buffer.filled() >= cap {
                // one probe byte decides whether output was cut off
                let mut probe = [0u8; 1];
                let n = io.read(&mut probe).await?;
                return Ok(Captured { data: buffer.into_bytes(), overflowed: n > 0 });
            }
            buffer.grow_to(cap);
        }
        let n = io.read(buffer.unfilled()).await?;
        if n == 0 {
            return Ok(Captured { data: buffer.into_bytes(), overflowed: false });
        }
        buffer.advance(n);
    }
}

// ===== error =====

/// Ways a process run can fail.
#[derive(Debug)]
pub enum Error {
    /// The program could not be started at all.
    Spawn(String),
    /// Non-zero or signalled exit, with whatever output was captured.
    Failed { code: Option<i32>, output: Output },
    /// The run-duration limit passed and the child was killed.
    TimedOut { output: Output },
    /// An output stream passed the capture cap and the child was killed.
    OutputOverflow { output: Output },
    Unknown(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Spawn(detail) => write!(f, "failed to start process: {detail}"),
            Error::Failed { code: Some(code), .. } => {
                write!(f, "process exited with status {code}")
            }
            Error::Failed { code: None, .. } => f.write_str("process terminated by a signal"),
            Error::TimedOut { .. } => f.write_str("process run passed its time limit"),
            Error::OutputOverflow { .. } => f.write_str("process output passed the capture cap"),
            Error::Unknown(detail) => f.write_str(detail),
        }
    }
}

impl error::Error for Error {}

impl From<Canceled> for Error {
    fn from(_: Canceled) -> Self {
        Error::Unknown("process run canceled".into())
    }
}

#[cfg(all(test, unix))]
mod test {
    use super::*;

    #[tokio::test]
    async fn zero_exit_yields_captured_stdout() {
        let output = run(Run::new("/bin/sh").arg("-c").arg("echo hello"))
            .await
            .unwrap();
        assert_eq!(&output.stdout[..], b"hello\n");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed_with_code() {
        let result = run(Run::new("/bin/sh").arg("-c").arg("exit 3")).await;
        let Err(Error::Failed { code, .. }) = result else {
            panic!("expected failure")
        };
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn failure_keeps_stderr() {
        let result = run(Run::new("/bin/sh").args(["-c", "echo oops >&2; exit 1"])).await;
        let Err(Error::Failed { code, output }) = result else {
            panic!("expected failure")
        };
        assert_eq!(code, Some(1));
        assert_eq!(&output.stderr[..], b"oops\n");
        assert!(output.stdout.is_empty());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let result = run(Run::new("/definitely/not/a/real/binary")).await;
        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[tokio::test]
    async fn limit_kills_and_reports_timed_out() {
        let run = Run::new("sleep").arg("5").limit(Duration::from_millis(100));
        let result = super::run(run).await;
        assert!(matches!(result, Err(Error::TimedOut { .. })));
    }

    #[tokio::test]
    async fn output_past_the_cap_overflows() {
        let run = Run::new("/bin/sh")
            .args(["-c", "head -c 65536 /dev/zero"])
            .max_output(1024);
        let result = super::run(run).await;
        let Err(Error::OutputOverflow { output }) = result else {
            panic!("expected overflow")
        };
        assert_eq!(output.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn output_at_exactly_the_cap_is_complete() {
        let run = Run::new("/bin/sh")
            .args(["-c", "head -c 1024 /dev/zero"])
            .max_output(1024);
        let output = super::run(run).await.unwrap();
        assert_eq!(output.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn replaced_environment_is_exact() {
        let run = Run::new("/bin/sh")
            .args(["-c", "echo $MARK"])
            .env(EnvVars::Replace(vec![("MARK".into(), "set".into())]));
        let output = super::run(run).await.unwrap();
        assert_eq!(&output.stdout[..], b"set\n");
    }

    #[tokio::test]
    async fn extended_environment_adds_entries() {
        let run = Run::new("/bin/sh")
            .args(["-c", "echo $EXTRA"])
            .env(EnvVars::Extend(vec![("EXTRA".into(), "yes".into())]));
        let output = super::run(run).await.unwrap();
        assert_eq!(&output.stdout[..], b"yes\n");
    }

    #[tokio::test]
    async fn working_directory_override_applies() {
        let output = run(Run::new("/bin/sh").args(["-c", "pwd"]).current_dir("/"))
            .await
            .unwrap();
        assert_eq!(&output.stdout[..], b"/\n");
    }

    #[tokio::test]
    async fn shell_mode_joins_one_command_line() {
        // the pipe only means anything once a shell reads the line
        let run = Run::new("echo").args(["upper", "|", "tr", "a-z", "A-Z"]).shell(true);
        let output = super::run(run).await.unwrap();
        assert_eq!(&output.stdout[..], b"UPPER\n");
    }

    #[tokio::test]
    async fn cancel_kills_the_child() {
        let task = run(Run::new("sleep").arg("30"));
        task.cancel_handle().cancel();
        let result = task.await;
        assert!(matches!(result, Err(Error::Unknown(_))));
    }
}
