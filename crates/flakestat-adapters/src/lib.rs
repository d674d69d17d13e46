//! Std adapters for flakestat: spawning the test runner, storing trial
//! artifacts and loading harness results files.

mod fs;

pub use fs::{
    read_lines, ArtifactStore, FsArtifactStore, FsReportSource, LoadedReport, ReportSource,
};

use anyhow::Context;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,

    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub output_cap_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub wall_ms: u64,
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("command argv must not be empty")]
    EmptyArgv,

    #[error("timeout is not supported on this platform")]
    TimeoutUnsupported,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid file pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait ProcessRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError>;
}

#[derive(Debug, Default, Clone)]
pub struct StdProcessRunner;

impl ProcessRunner for StdProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<RunResult, AdapterError> {
        if spec.argv.is_empty() {
            return Err(AdapterError::EmptyArgv);
        }

        tracing::debug!(argv = ?spec.argv, timeout = ?spec.timeout, "spawning");

        #[cfg(unix)]
        {
            run_unix(spec)
        }

        #[cfg(not(unix))]
        {
            if spec.timeout.is_some() {
                return Err(AdapterError::TimeoutUnsupported);
            }
            run_portable(spec)
        }
    }
}

fn truncate(mut bytes: Vec<u8>, cap: usize) -> Vec<u8> {
    if bytes.len() > cap {
        bytes.truncate(cap);
    }
    bytes
}

fn build_command(spec: &CommandSpec) -> std::process::Command {
    let mut cmd = std::process::Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }
    cmd
}

#[cfg(not(unix))]
fn run_portable(spec: &CommandSpec) -> Result<RunResult, AdapterError> {
    let start = Instant::now();

    let out = build_command(spec)
        .output()
        .with_context(|| format!("failed to run {:?}", spec.argv))?;

    Ok(RunResult {
        wall_ms: start.elapsed().as_millis() as u64,
        exit_code: out.status.code().unwrap_or(-1),
        timed_out: false,
        stdout: truncate(out.stdout, spec.output_cap_bytes),
        stderr: truncate(out.stderr, spec.output_cap_bytes),
    })
}

#[cfg(unix)]
fn run_unix(spec: &CommandSpec) -> Result<RunResult, AdapterError> {
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::Stdio;
    use std::thread;

    let start = Instant::now();

    let mut cmd = build_command(spec);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Own process group, so a timeout also reaches whatever the runner forked.
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", spec.argv))?;

    let pid = child.id() as libc::pid_t;

    let stdout = child.stdout.take().context("stdout was not piped")?;
    let stderr = child.stderr.take().context("stderr was not piped")?;

    let cap = spec.output_cap_bytes;
    let out_handle = thread::spawn(move || read_with_cap(stdout, cap));
    let err_handle = thread::spawn(move || read_with_cap(stderr, cap));

    let (status_raw, timed_out) = waitpid_with_timeout(pid, spec.timeout)?;

    // The child is reaped by waitpid; dropping the handle does not wait again.
    drop(child);

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();

    let exit_status = std::process::ExitStatus::from_raw(status_raw);

    Ok(RunResult {
        wall_ms: start.elapsed().as_millis() as u64,
        exit_code: exit_status.code().unwrap_or(-1),
        timed_out,
        stdout,
        stderr,
    })
}

/// Drain `reader` to EOF, keeping at most `cap` bytes.
#[cfg(unix)]
fn read_with_cap<R: std::io::Read>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 8192];

    loop {
        match reader.read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => {
                let take = cap.saturating_sub(buf.len()).min(n);
                buf.extend_from_slice(&tmp[..take]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    buf
}

#[cfg(unix)]
fn waitpid_with_timeout(
    pid: libc::pid_t,
    timeout: Option<Duration>,
) -> Result<(libc::c_int, bool), AdapterError> {
    let start = Instant::now();
    let mut status: libc::c_int = 0;
    let options = if timeout.is_some() { libc::WNOHANG } else { 0 };

    loop {
        let res = unsafe { libc::waitpid(pid, &mut status, options) };

        if res == pid {
            return Ok((status, false));
        }

        if res == 0 {
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    // Negative pid: the whole group. Grandchildren would otherwise
                    // keep the output pipes open after the leader is gone.
                    unsafe {
                        libc::kill(-pid, libc::SIGKILL);
                    }
                    let res2 = unsafe { libc::waitpid(pid, &mut status, 0) };
                    if res2 != pid {
                        return Err(AdapterError::Other(anyhow::anyhow!(
                            "waitpid after kill failed: {}",
                            std::io::Error::last_os_error()
                        )));
                    }
                    return Ok((status, true));
                }
            }
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }

        if res == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(AdapterError::Other(anyhow::anyhow!("waitpid failed: {err}")));
        }

        return Err(AdapterError::Other(anyhow::anyhow!(
            "waitpid returned unexpected pid: {res}"
        )));
    }
}
