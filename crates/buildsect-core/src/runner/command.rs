//! Shell command build capability
//!
//! Runs a user-supplied shell line per candidate in its own process group,
//! so a timeout or cancellation kills the whole build tree. Dropping the
//! build future before the leader is reaped SIGKILLs the group as well.

use super::{BuildCapability, CancelToken, RawResult, Termination};
use crate::error::RunnerError;
use crate::types::CandidateDescriptor;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, trace, warn};

/// Default number of output lines kept per stream
pub const DEFAULT_TAIL_LINES: usize = 64;

/// Placeholder replaced by the candidate id
pub const CANDIDATE_PLACEHOLDER: &str = "{candidate}";

/// Placeholder replaced by the candidate position
pub const INDEX_PLACEHOLDER: &str = "{index}";

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// SIGKILLs the process group on drop unless disarmed
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!(pgid, "build abandoned; killing process group");
            kill_group(pgid, Signal::Kill);
        }
    }
}

/// Builds candidates by running a shell command
#[derive(Debug, Clone)]
pub struct CommandRunner {
    template: String,
    shell: PathBuf,
    workdir: Option<PathBuf>,
    env: Vec<(String, String)>,
    kill_grace: Duration,
    tail_lines: usize,
}

impl CommandRunner {
    /// Runner for a shell line such as `git checkout {candidate} && make`
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            shell: PathBuf::from("sh"),
            workdir: None,
            env: Vec::new(),
            kill_grace: Duration::from_secs(5),
            tail_lines: DEFAULT_TAIL_LINES,
        }
    }

    /// Run in `dir` instead of the current directory
    #[must_use]
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Time between SIGTERM and SIGKILL
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Lines kept from each output stream
    #[must_use]
    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines.max(1);
        self
    }

    /// Shell line for one candidate
    #[must_use]
    pub fn render(&self, descriptor: &CandidateDescriptor) -> String {
        self.template
            .replace(CANDIDATE_PLACEHOLDER, descriptor.id.as_str())
            .replace(INDEX_PLACEHOLDER, &descriptor.index.to_string())
    }

    fn command(&self, line: &str, descriptor: &CandidateDescriptor) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(line)
            .env("BUILDSECT_CANDIDATE", descriptor.id.as_str())
            .env("BUILDSECT_INDEX", descriptor.index.to_string())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// SIGTERM the group, then SIGKILL it once the grace period runs out
    async fn terminate(&self, child: &mut Child) -> std::io::Result<()> {
        let Some(pid) = child.id() else {
            // already reaped
            return Ok(());
        };
        signal_group(child, pid, Signal::Term);
        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_err() {
            debug!(pid, "build ignored SIGTERM; killing process group");
        }
        // sweep stragglers that outlived the group leader
        signal_group(child, pid, Signal::Kill);
        child.wait().await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl BuildCapability for CommandRunner {
    async fn invoke(
        &self,
        descriptor: &CandidateDescriptor,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RawResult, RunnerError> {
        let line = self.render(descriptor);
        debug!(candidate = %descriptor.id, command = %line, "starting build");

        let started = Instant::now();
        let mut child = self
            .command(&line, descriptor)
            .spawn()
            .map_err(|source| RunnerError::Unavailable {
                command: line.clone(),
                source,
            })?;
        let mut guard = GroupGuard { pgid: child.id() };

        let stdout = tokio::spawn(collect_tail(child.stdout.take(), self.tail_lines));
        let stderr = tokio::spawn(collect_tail(child.stderr.take(), self.tail_lines));

        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status),
            () = tokio::time::sleep(timeout) => Stop::TimedOut,
            () = cancel.cancelled() => Stop::Cancelled,
        };

        let termination = match stop {
            Stop::Exited(status) => termination_of(status?),
            Stop::TimedOut => {
                warn!(candidate = %descriptor.id, "build timed out after {:?}", timeout);
                self.terminate(&mut child).await?;
                Termination::TimedOut
            }
            Stop::Cancelled => {
                debug!(candidate = %descriptor.id, "build cancelled");
                self.terminate(&mut child).await?;
                Termination::Cancelled
            }
        };
        // leader reaped; its pgid may be reused from here on
        guard.disarm();

        let mut result = RawResult::new(termination).with_duration(started.elapsed());
        result.stdout_tail = self.join_tail(stdout).await;
        result.stderr_tail = self.join_tail(stderr).await;
        debug!(
            candidate = %descriptor.id,
            termination = ?result.termination,
            duration_ms = result.duration_ms,
            "build finished"
        );
        Ok(result)
    }
}

impl CommandRunner {
    /// Background children may hold a pipe open past the leader's exit
    async fn join_tail(&self, task: tokio::task::JoinHandle<Vec<String>>) -> Vec<String> {
        let abort = task.abort_handle();
        match tokio::time::timeout(self.kill_grace, task).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                warn!("output reader failed: {e}");
                Vec::new()
            }
            Err(_) => {
                abort.abort();
                Vec::new()
            }
        }
    }
}

async fn collect_tail<R>(reader: Option<R>, keep: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut tail = VecDeque::with_capacity(keep);
    while let Ok(Some(segment)) = segments.next_segment().await {
        let line = String::from_utf8_lossy(&segment).trim_end_matches('\r').to_string();
        trace!(target: "buildsect::build", "{line}");
        if tail.len() == keep {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}

fn termination_of(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Signaled(0)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pgid: u32, signal: Signal) {
    kill_group(pgid, signal);
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pgid: u32, signal: Signal) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg takes no pointers; a vanished group only yields ESRCH.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pgid: u32, _signal: Signal) {
    let _ = child.start_kill();
}

// kill_on_drop already covers the only process we started
#[cfg(not(unix))]
fn kill_group(_pgid: u32, _signal: Signal) {}
